//! DNS reachability check run before a remote session is attached.

use std::net::SocketAddr;

use tracing::{info, warn};

use crate::error::{Result, VoxError};

/// Host and port of a `ws://`, `wss://`, `http://` or `https://` URL.
///
/// Missing ports default by scheme (80 / 443).
pub fn host_and_port(url: &str) -> Option<(String, u16)> {
    let (scheme, rest) = url.split_once("://")?;
    let default_port = match scheme.to_ascii_lowercase().as_str() {
        "ws" | "http" => 80,
        "wss" | "https" => 443,
        _ => return None,
    };

    let authority = rest.split(['/', '?', '#']).next()?;
    let authority = authority.rsplit('@').next()?;
    if authority.is_empty() {
        return None;
    }

    // Bracketed IPv6 literal.
    if let Some(stripped) = authority.strip_prefix('[') {
        let (host, tail) = stripped.split_once(']')?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p.parse().ok()?,
            None => default_port,
        };
        return Some((host.to_string(), port));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) => Some((host.to_string(), port.parse().ok()?)),
        None => Some((authority.to_string(), default_port)),
    }
}

/// Resolve the upstream service host.
///
/// # Errors
/// `VoxError::Transport` if the URL has no usable host or resolution fails.
pub async fn resolve(url: &str) -> Result<SocketAddr> {
    let (host, port) = host_and_port(url)
        .ok_or_else(|| VoxError::Transport(format!("cannot parse service url '{url}'")))?;

    let mut addrs = tokio::net::lookup_host((host.as_str(), port))
        .await
        .map_err(|e| {
            warn!(host = host.as_str(), "DNS resolution failed: {e}");
            VoxError::Transport(format!("DNS resolution failed for {host}: {e}"))
        })?;

    let addr = addrs
        .next()
        .ok_or_else(|| VoxError::Transport(format!("no addresses for {host}")))?;
    info!(host = host.as_str(), %addr, "service host resolved");
    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hosts_and_default_ports() {
        assert_eq!(
            host_and_port("wss://api.example.com/v1/realtime?model=x"),
            Some(("api.example.com".into(), 443))
        );
        assert_eq!(
            host_and_port("ws://localhost:8080"),
            Some(("localhost".into(), 8080))
        );
        assert_eq!(
            host_and_port("http://user:pw@10.0.0.2/path"),
            Some(("10.0.0.2".into(), 80))
        );
        assert_eq!(host_and_port("ws://[::1]:9000/"), Some(("::1".into(), 9000)));
    }

    #[test]
    fn rejects_unusable_urls() {
        assert_eq!(host_and_port("localhost:8080"), None);
        assert_eq!(host_and_port("ftp://example.com"), None);
        assert_eq!(host_and_port("ws:///path"), None);
        assert_eq!(host_and_port("ws://host:notaport"), None);
    }

    #[tokio::test]
    async fn resolves_ip_literals_without_network() {
        let addr = resolve("ws://127.0.0.1:3000").await.unwrap();
        assert_eq!(addr, "127.0.0.1:3000".parse().unwrap());
    }
}
