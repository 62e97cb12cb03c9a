//! voxrelay command-line entry point.
//!
//! ```text
//! voxrelay relay [--port N]        # WebSocket relay server
//! voxrelay talk  [--url ws://...]  # talk to a relay with the local mic/speaker
//! voxrelay settings [--save]       # print (and optionally write) effective settings
//! ```

mod client;
mod relay_server;
mod settings;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use settings::{default_settings_path, load_settings, save_settings, AppSettings};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "voxrelay", version, about = "Real-time voice relay with barge-in")]
struct Cli {
    /// Settings file (defaults to the per-user config directory).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Accept talk clients and bridge them to the AI service.
    Relay {
        /// Listen port.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Hold a voice conversation through a relay.
    Talk {
        /// Relay WebSocket URL.
        #[arg(long)]
        url: Option<String>,
        /// Never interrupt playback when the microphone picks up speech.
        #[arg(long)]
        no_barge_in: bool,
    },
    /// Print the effective settings.
    Settings {
        /// Write them to the settings file.
        #[arg(long)]
        save: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("voxrelay_app=info,voxrelay_core=info")
            }),
        )
        .init();

    let cli = Cli::parse();
    let path = cli.config.clone().unwrap_or_else(default_settings_path);
    let from_file = load_settings(&path);
    let mut settings = from_file.clone();
    settings.apply_env_overrides();
    info!(path = %path.display(), "settings loaded");

    match cli.command {
        Command::Relay { port } => {
            if let Some(port) = port {
                settings.port = port;
            }
            settings.normalize();
            relay_server::serve(settings).await
        }
        Command::Talk { url, no_barge_in } => {
            if let Some(url) = url {
                settings.server_url = url;
            }
            if no_barge_in {
                settings.barge_in_enabled = false;
            }
            settings.normalize();
            client::talk(settings).await
        }
        Command::Settings { save } => {
            let to_save = save.then(|| settings.persistable(&from_file));
            print_settings(&path, &settings, to_save.as_ref())
        }
    }
}

fn print_settings(
    path: &Path,
    settings: &AppSettings,
    to_save: Option<&AppSettings>,
) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(&settings.runtime_settings())?;
    println!("{json}");
    if let Some(persisted) = to_save {
        save_settings(path, persisted)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!(path = %path.display(), "settings saved");
    }
    Ok(())
}
