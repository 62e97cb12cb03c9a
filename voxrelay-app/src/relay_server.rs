//! WebSocket relay: one task per client, each bridged to its own remote
//! session through a [`RelayHandler`].

use std::net::SocketAddr;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    accept_async,
    tungstenite::protocol::{frame::coding::CloseCode, CloseFrame, Message},
};
use tracing::{debug, info, warn};
use voxrelay_core::relay::{
    preflight, ClientFrame, CloseDirective, RelayAction, DNS_RESOLUTION_FAILED,
};
use voxrelay_core::{LoopbackSession, RelayHandler};

use crate::settings::AppSettings;

/// Accept clients until the process is stopped.
pub async fn serve(settings: AppSettings) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind relay on {addr}"))?;

    info!(%addr, "relay listening");
    if settings.api_key.is_some() {
        info!("service credential configured");
    }
    match settings.service_url.as_deref() {
        Some(url) => info!(url, "upstream service configured"),
        None => info!("no upstream service configured; using loopback sessions"),
    }

    loop {
        let (stream, peer) = listener.accept().await.context("accept failed")?;
        let settings = settings.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, peer, settings).await {
                warn!(%peer, "client connection ended with error: {e:#}");
            }
        });
    }
}

async fn handle_client(
    stream: TcpStream,
    peer: SocketAddr,
    settings: AppSettings,
) -> anyhow::Result<()> {
    let ws = accept_async(stream)
        .await
        .context("WebSocket handshake failed")?;
    let (mut write, mut read) = ws.split();
    info!(%peer, "client connected");

    if let Some(directive) = preflight_close(settings.service_url.as_deref()).await {
        write.send(close_message(directive)).await?;
        return Ok(());
    }

    let (remote, mut remote_events) = LoopbackSession::connect(settings.loopback_base64);
    let mut relay = RelayHandler::new(remote, voxrelay_core::protocol::wire::CONTROL_SNIFF_LIMIT);

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Binary(payload))) => {
                    relay.on_client_frame(ClientFrame::Binary(&payload));
                }
                Some(Ok(Message::Text(text))) => {
                    relay.on_client_frame(ClientFrame::Text(&text));
                }
                Some(Ok(Message::Close(_))) | None => {
                    relay.on_client_closed();
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(%peer, "client socket error: {e}");
                    relay.on_client_closed();
                    break;
                }
            },
            event = remote_events.recv() => {
                let Some(event) = event else { break };
                match relay.on_remote_event(event) {
                    RelayAction::Downlink(pcm) => write.send(Message::Binary(pcm)).await?,
                    RelayAction::Close(directive) => {
                        write.send(close_message(directive)).await?;
                        break;
                    }
                    RelayAction::Nothing => {}
                }
            }
        }
    }

    let stats = relay.diagnostics().snapshot();
    info!(
        %peer,
        forwarded = stats.audio_forwarded,
        dropped = stats.audio_dropped,
        interrupts = stats.interrupts_forwarded,
        malformed = stats.malformed_control,
        downlink = stats.downlink_chunks,
        "client disconnected"
    );
    Ok(())
}

/// Resolve the upstream host before attaching a session. Returns the close
/// to send the client when it cannot be reached.
async fn preflight_close(service_url: Option<&str>) -> Option<CloseDirective> {
    let url = service_url?;
    match preflight::resolve(url).await {
        Ok(addr) => {
            debug!(url, %addr, "upstream resolved");
            None
        }
        Err(e) => {
            warn!(url, "preflight failed: {e}");
            Some(DNS_RESOLUTION_FAILED)
        }
    }
}

fn close_message(directive: CloseDirective) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(directive.code),
        reason: directive.reason.into(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unresolvable_service_closes_with_dns_failure() {
        let url = "wss://upstream.voxrelay.invalid/v1/realtime";
        let directive = preflight_close(Some(url)).await;
        assert_eq!(directive, Some(DNS_RESOLUTION_FAILED));
        assert_eq!(directive.map(|d| d.code), Some(1011));
    }

    #[tokio::test]
    async fn reachable_service_passes_preflight() {
        assert_eq!(preflight_close(Some("ws://127.0.0.1:3000")).await, None);
    }

    #[tokio::test]
    async fn loopback_sessions_skip_preflight() {
        assert_eq!(preflight_close(None).await, None);
    }

    #[test]
    fn close_message_carries_code_and_reason() {
        match close_message(DNS_RESOLUTION_FAILED) {
            Message::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), 1011);
                assert_eq!(frame.reason, "DNS resolution failed");
            }
            other => panic!("expected a close frame, got {other:?}"),
        }
    }
}
