//! Talk client: microphone and speaker on this machine, conversation over a
//! WebSocket to the relay.

use std::sync::Arc;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, info, warn};
use voxrelay_core::{
    CloseReason, Conversation, CpalCapture, CpalPlayback, OutboundFrame, SessionEvent, SessionId,
    SessionState, Uplink,
};

use crate::settings::AppSettings;

/// Run one conversation until the user stops it or the relay goes away.
pub async fn talk(settings: AppSettings) -> anyhow::Result<()> {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<SessionEvent>();

    let ended_tx = events_tx.clone();
    let output_error_tx = events_tx.clone();
    let playback = CpalPlayback::open(
        settings.preferred_output_device.clone(),
        Arc::new(move |voice| {
            let _ = ended_tx.send(SessionEvent::PlaybackEnded(voice));
        }),
        Some(Arc::new(move |detail| {
            let _ = output_error_tx.send(SessionEvent::DeviceError { detail });
        })),
    )
    .context("failed to open the output device")?;
    info!(sample_rate = playback.sample_rate(), "speaker ready");

    let input_error_tx = events_tx.clone();
    let capture = CpalCapture::new()
        .with_device(settings.preferred_input_device.clone())
        .on_stream_error(Arc::new(move |detail| {
            let _ = input_error_tx.send(SessionEvent::DeviceError { detail });
        }));

    let mut conversation =
        Conversation::new(settings.session_config(), playback, capture, events_tx.clone());

    let mut status = conversation.subscribe_status();
    tokio::spawn(async move {
        while let Ok(event) = status.recv().await {
            info!("{}", event.display_line());
        }
    });

    let session = conversation.start()?;
    tokio::spawn(run_transport(
        settings.server_url.clone(),
        session,
        events_tx.clone(),
    ));

    let stop_tx = events_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("stop requested");
            let _ = stop_tx.send(SessionEvent::Stop);
        }
    });

    conversation.run(&mut events_rx).await;

    let stats = conversation.diagnostics_snapshot();
    info!(
        frames_sent = stats.frames_sent,
        chunks_received = stats.chunks_received,
        chunks_played = stats.chunks_played,
        interrupts = stats.interrupts,
        barge_ins = stats.barge_ins,
        "conversation finished"
    );

    if conversation.state() == SessionState::Error {
        anyhow::bail!("conversation ended with an error");
    }
    Ok(())
}

/// Own the WebSocket: drain the uplink into it and turn everything it
/// delivers into session events.
async fn run_transport(
    url: String,
    session: SessionId,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    info!(url = url.as_str(), "connecting to relay");
    let ws = match connect_async(url.as_str()).await {
        Ok((ws, _response)) => ws,
        Err(e) => {
            let _ = events.send(SessionEvent::TransportError {
                session,
                detail: e.to_string(),
            });
            return;
        }
    };

    let (mut write, mut read) = ws.split();
    let (uplink, mut outbound) = Uplink::channel();
    if events
        .send(SessionEvent::TransportOpened { session, uplink })
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let msg = match frame {
                    Some(OutboundFrame::Audio(pcm)) => Message::Binary(pcm),
                    Some(OutboundFrame::Control(json)) => Message::Text(json),
                    Some(OutboundFrame::Close) | None => {
                        let _ = write.send(Message::Close(None)).await;
                        debug!("transport closed locally");
                        return;
                    }
                };
                if let Err(e) = write.send(msg).await {
                    let _ = events.send(SessionEvent::TransportError {
                        session,
                        detail: e.to_string(),
                    });
                    return;
                }
            }
            msg = read.next() => match msg {
                Some(Ok(Message::Binary(payload))) => {
                    let _ = events.send(SessionEvent::Downlink { session, payload });
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| CloseReason::from_close_code(u16::from(f.code), &f.reason))
                        .unwrap_or(CloseReason::Normal);
                    let _ = events.send(SessionEvent::TransportClosed { session, reason });
                    return;
                }
                Some(Ok(Message::Text(text))) => {
                    warn!("unexpected text frame from relay: {text}");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = events.send(SessionEvent::TransportError {
                        session,
                        detail: e.to_string(),
                    });
                    return;
                }
                None => {
                    let _ = events.send(SessionEvent::TransportClosed {
                        session,
                        reason: CloseReason::Normal,
                    });
                    return;
                }
            },
        }
    }
}
