//! Persistent settings (JSON file in the user config directory).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use voxrelay_core::SessionConfig;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:3000";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    /// Relay listen port.
    pub port: u16,
    /// Relay URL the talk client connects to.
    pub server_url: String,
    /// Upstream AI service URL, checked with a DNS preflight before each
    /// relay session. Unset means the built-in loopback session.
    pub service_url: Option<String>,
    pub api_key: Option<String>,
    /// Deliver loopback audio base64-encoded, as hosted services do.
    pub loopback_base64: bool,
    pub preferred_input_device: Option<String>,
    pub preferred_output_device: Option<String>,
    pub prebuffer_secs: f64,
    pub barge_in_enabled: bool,
    pub barge_in_sensitivity: f32,
    pub interruption_delay_ms: u64,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            server_url: DEFAULT_SERVER_URL.into(),
            service_url: None,
            api_key: None,
            loopback_base64: false,
            preferred_input_device: None,
            preferred_output_device: None,
            prebuffer_secs: 0.2,
            barge_in_enabled: true,
            barge_in_sensitivity: 0.02,
            interruption_delay_ms: 200,
        }
    }
}

/// What `voxrelay settings` prints: everything except the credential itself.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSettings {
    pub port: u16,
    pub server_url: String,
    pub service_url: Option<String>,
    pub has_api_key: bool,
    pub loopback_base64: bool,
    pub preferred_input_device: Option<String>,
    pub preferred_output_device: Option<String>,
    pub prebuffer_secs: f64,
    pub barge_in_enabled: bool,
    pub barge_in_sensitivity: f32,
    pub interruption_delay_ms: u64,
}

impl AppSettings {
    pub fn normalize(&mut self) {
        if self.port == 0 {
            self.port = DEFAULT_PORT;
        }
        self.server_url = normalize_server_url(&self.server_url);
        self.service_url = trimmed(self.service_url.take());
        self.api_key = trimmed(self.api_key.take());
        self.preferred_input_device = trimmed(self.preferred_input_device.take());
        self.preferred_output_device = trimmed(self.preferred_output_device.take());
        self.prebuffer_secs = if self.prebuffer_secs.is_finite() {
            self.prebuffer_secs.clamp(0.0, 2.0)
        } else {
            0.2
        };
        self.barge_in_sensitivity = if self.barge_in_sensitivity.is_finite() {
            self.barge_in_sensitivity.clamp(0.001, 1.0)
        } else {
            0.02
        };
        self.interruption_delay_ms = self.interruption_delay_ms.clamp(20, 2_000);
    }

    /// Environment wins over the file: `PORT`, `VOXRELAY_SERVER_URL`,
    /// `VOXRELAY_API_KEY`.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(port) = lookup("PORT").and_then(|p| p.trim().parse::<u16>().ok()) {
            self.port = port;
        }
        if let Some(url) = lookup("VOXRELAY_SERVER_URL") {
            self.server_url = url;
        }
        if let Some(key) = lookup("VOXRELAY_API_KEY") {
            self.api_key = Some(key);
        }
        self.normalize();
    }

    /// What `settings --save` writes: the effective settings, but with the
    /// credential as it was in the file. A key supplied only through the
    /// environment never lands on disk.
    pub fn persistable(&self, from_file: &AppSettings) -> AppSettings {
        AppSettings {
            api_key: from_file.api_key.clone(),
            ..self.clone()
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            prebuffer_secs: self.prebuffer_secs,
            barge_in_enabled: self.barge_in_enabled,
            barge_in_sensitivity: self.barge_in_sensitivity,
            interruption_delay: Duration::from_millis(self.interruption_delay_ms),
            ..SessionConfig::default()
        }
    }

    pub fn runtime_settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            port: self.port,
            server_url: self.server_url.clone(),
            service_url: self.service_url.clone(),
            has_api_key: self.api_key.is_some(),
            loopback_base64: self.loopback_base64,
            preferred_input_device: self.preferred_input_device.clone(),
            preferred_output_device: self.preferred_output_device.clone(),
            prebuffer_secs: self.prebuffer_secs,
            barge_in_enabled: self.barge_in_enabled,
            barge_in_sensitivity: self.barge_in_sensitivity,
            interruption_delay_ms: self.interruption_delay_ms,
        }
    }
}

fn trimmed(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

pub fn normalize_server_url(raw: &str) -> String {
    let url = raw.trim();
    if url.is_empty() {
        return DEFAULT_SERVER_URL.into();
    }
    if url.contains("://") {
        url.into()
    } else {
        format!("ws://{url}")
    }
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Lattice Labs")
            .join("voxrelay")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".config")
            })
            .join("voxrelay")
            .join("settings.json")
    }
}

pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_file_keeps_defaults() {
        let settings: AppSettings =
            serde_json::from_str(r#"{"port": 8080, "bargeInEnabled": false}"#).unwrap();
        assert_eq!(settings.port, 8080);
        assert!(!settings.barge_in_enabled);
        assert_eq!(settings.server_url, DEFAULT_SERVER_URL);
        assert_eq!(settings.interruption_delay_ms, 200);
    }

    #[test]
    fn normalize_clamps_and_trims() {
        let mut settings = AppSettings {
            port: 0,
            server_url: " relay.local:9000 ".into(),
            api_key: Some("   ".into()),
            prebuffer_secs: f64::NAN,
            barge_in_sensitivity: 5.0,
            interruption_delay_ms: 1,
            ..AppSettings::default()
        };
        settings.normalize();
        assert_eq!(settings.port, DEFAULT_PORT);
        assert_eq!(settings.server_url, "ws://relay.local:9000");
        assert_eq!(settings.api_key, None);
        assert_eq!(settings.prebuffer_secs, 0.2);
        assert_eq!(settings.barge_in_sensitivity, 1.0);
        assert_eq!(settings.interruption_delay_ms, 20);
    }

    #[test]
    fn environment_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            ("PORT", "4321"),
            ("VOXRELAY_SERVER_URL", "wss://voice.example.com/ws"),
            ("VOXRELAY_API_KEY", "sk-test"),
        ]
        .into_iter()
        .collect();
        let mut settings = AppSettings::default();
        settings.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(settings.port, 4321);
        assert_eq!(settings.server_url, "wss://voice.example.com/ws");
        assert!(settings.runtime_settings().has_api_key);
    }

    #[test]
    fn bad_port_in_environment_is_ignored() {
        let mut settings = AppSettings::default();
        settings.apply_overrides(|k| (k == "PORT").then(|| "http".to_string()));
        assert_eq!(settings.port, DEFAULT_PORT);
    }

    #[test]
    fn environment_key_is_not_persisted() {
        let from_file = AppSettings::default();
        let mut effective = from_file.clone();
        effective.apply_overrides(|k| match k {
            "VOXRELAY_API_KEY" => Some("sk-live-secret".to_string()),
            "PORT" => Some("4000".to_string()),
            _ => None,
        });

        let saved = effective.persistable(&from_file);
        assert_eq!(saved.api_key, None);
        assert_eq!(saved.port, 4000);
        assert!(!serde_json::to_string(&saved).unwrap().contains("sk-live-secret"));
    }

    #[test]
    fn key_from_the_file_is_kept() {
        let from_file = AppSettings {
            api_key: Some("sk-file".into()),
            ..AppSettings::default()
        };
        let mut effective = from_file.clone();
        effective.apply_overrides(|k| (k == "VOXRELAY_API_KEY").then(|| "sk-env".to_string()));
        assert_eq!(
            effective.persistable(&from_file).api_key.as_deref(),
            Some("sk-file")
        );
    }

    #[test]
    fn session_config_carries_tuning() {
        let settings = AppSettings {
            prebuffer_secs: 0.5,
            interruption_delay_ms: 300,
            ..AppSettings::default()
        };
        let config = settings.session_config();
        assert_eq!(config.prebuffer_secs, 0.5);
        assert_eq!(config.interruption_delay, Duration::from_millis(300));
        assert_eq!(config.buffer_size, 1024);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = std::env::temp_dir().join(format!("voxrelay-settings-{}", std::process::id()));
        let path = dir.join("settings.json");
        let settings = AppSettings {
            port: 9001,
            service_url: Some("wss://api.example.com/v1".into()),
            ..AppSettings::default()
        };
        save_settings(&path, &settings).unwrap();
        assert_eq!(load_settings(&path), settings);
        let _ = fs::remove_dir_all(dir);
    }
}
