//! Server side of the wire protocol: one [`RelayHandler`] per client
//! connection, bridging it to a [`RemoteSession`].
//!
//! The handler is transport-agnostic. The host feeds it client frames and
//! remote events and carries out the [`RelayAction`]s it returns (write a
//! downlink frame, close the client with a code).

pub mod loopback;
pub mod preflight;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::{debug, info, warn};

use crate::{
    error::Result,
    protocol::wire::{classify_binary, classify_text, ControlMessage, InboundFrame},
};

pub use loopback::LoopbackSession;

/// Upstream conversational AI session.
///
/// Events flow back on a channel handed out when the session is created
/// (see [`LoopbackSession::connect`]).
pub trait RemoteSession: Send + 'static {
    /// Forward one uplink frame (16 kHz i16 LE).
    fn send_audio(&mut self, pcm: &[u8]) -> Result<()>;

    /// The client interrupted playback; stop generating.
    fn send_interrupt(&mut self) -> Result<()>;

    /// Close the session. Idempotent.
    fn close(&mut self);

    fn is_connected(&self) -> bool;
}

/// Something the remote session produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteEvent {
    /// Downlink PCM (24 kHz i16 LE).
    Audio(Vec<u8>),
    /// Downlink PCM, base64-encoded.
    AudioBase64(String),
    Error(String),
    Closed,
}

/// WebSocket close the host should send to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseDirective {
    pub code: u16,
    pub reason: &'static str,
}

pub const AI_SERVICE_FAILED: CloseDirective = CloseDirective {
    code: 1011,
    reason: "AI service connection failed.",
};

pub const AI_SESSION_ENDED: CloseDirective = CloseDirective {
    code: 1013,
    reason: "AI session ended. Please reconnect.",
};

pub const DNS_RESOLUTION_FAILED: CloseDirective = CloseDirective {
    code: 1011,
    reason: "DNS resolution failed",
};

/// One inbound WebSocket message from the client.
#[derive(Debug, Clone, Copy)]
pub enum ClientFrame<'a> {
    Binary(&'a [u8]),
    Text(&'a str),
}

/// What the host should do after a remote event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayAction {
    /// Send this binary frame to the client.
    Downlink(Vec<u8>),
    /// Close the client connection.
    Close(CloseDirective),
    Nothing,
}

/// Per-connection counters.
#[derive(Debug, Default)]
pub struct RelayDiagnostics {
    pub audio_forwarded: AtomicUsize,
    pub audio_dropped: AtomicUsize,
    pub interrupts_forwarded: AtomicUsize,
    pub malformed_control: AtomicUsize,
    pub downlink_chunks: AtomicUsize,
}

impl RelayDiagnostics {
    pub fn snapshot(&self) -> RelayDiagnosticsSnapshot {
        RelayDiagnosticsSnapshot {
            audio_forwarded: self.audio_forwarded.load(Ordering::Relaxed),
            audio_dropped: self.audio_dropped.load(Ordering::Relaxed),
            interrupts_forwarded: self.interrupts_forwarded.load(Ordering::Relaxed),
            malformed_control: self.malformed_control.load(Ordering::Relaxed),
            downlink_chunks: self.downlink_chunks.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RelayDiagnosticsSnapshot {
    pub audio_forwarded: usize,
    pub audio_dropped: usize,
    pub interrupts_forwarded: usize,
    pub malformed_control: usize,
    pub downlink_chunks: usize,
}

/// Bridges one client connection to one remote session.
pub struct RelayHandler<R: RemoteSession> {
    remote: R,
    sniff_limit: usize,
    diagnostics: Arc<RelayDiagnostics>,
    finished: bool,
}

impl<R: RemoteSession> RelayHandler<R> {
    pub fn new(remote: R, sniff_limit: usize) -> Self {
        Self {
            remote,
            sniff_limit,
            diagnostics: Arc::new(RelayDiagnostics::default()),
            finished: false,
        }
    }

    /// Route one client message to the remote session.
    pub fn on_client_frame(&mut self, frame: ClientFrame<'_>) {
        let inbound = match frame {
            ClientFrame::Binary(payload) => classify_binary(payload, self.sniff_limit),
            ClientFrame::Text(text) => classify_text(text),
        };

        match inbound {
            InboundFrame::Audio(pcm) => {
                if !self.remote.is_connected() {
                    self.diagnostics.audio_dropped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                match self.remote.send_audio(pcm) {
                    Ok(()) => {
                        self.diagnostics
                            .audio_forwarded
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        self.diagnostics.audio_dropped.fetch_add(1, Ordering::Relaxed);
                        debug!("remote refused audio: {e}");
                    }
                }
            }
            InboundFrame::Control(ControlMessage::Interrupt) => {
                info!("client interrupted playback");
                if !self.remote.is_connected() {
                    return;
                }
                match self.remote.send_interrupt() {
                    Ok(()) => {
                        self.diagnostics
                            .interrupts_forwarded
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => warn!("failed to forward interrupt: {e}"),
                }
            }
            InboundFrame::Malformed(reason) => {
                self.diagnostics
                    .malformed_control
                    .fetch_add(1, Ordering::Relaxed);
                warn!("dropping malformed control message: {reason}");
            }
        }
    }

    /// Turn one remote event into an action on the client connection.
    pub fn on_remote_event(&mut self, event: RemoteEvent) -> RelayAction {
        if self.finished {
            return RelayAction::Nothing;
        }

        match event {
            RemoteEvent::Audio(pcm) => self.downlink(pcm),
            RemoteEvent::AudioBase64(encoded) => match STANDARD.decode(encoded.as_bytes()) {
                Ok(pcm) => self.downlink(pcm),
                Err(e) => {
                    warn!("undecodable downlink payload dropped: {e}");
                    RelayAction::Nothing
                }
            },
            RemoteEvent::Error(detail) => {
                warn!("remote session error: {detail}");
                self.finish();
                RelayAction::Close(AI_SERVICE_FAILED)
            }
            RemoteEvent::Closed => {
                info!("remote session closed");
                self.finish();
                RelayAction::Close(AI_SESSION_ENDED)
            }
        }
    }

    /// Client went away (close frame or socket error).
    pub fn on_client_closed(&mut self) {
        if !self.finished {
            info!("client disconnected; closing remote session");
        }
        self.finish();
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn diagnostics(&self) -> Arc<RelayDiagnostics> {
        Arc::clone(&self.diagnostics)
    }

    fn downlink(&mut self, pcm: Vec<u8>) -> RelayAction {
        if pcm.is_empty() {
            return RelayAction::Nothing;
        }
        self.diagnostics
            .downlink_chunks
            .fetch_add(1, Ordering::Relaxed);
        RelayAction::Downlink(pcm)
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.remote.close();
        }
    }
}

impl<R: RemoteSession> Drop for RelayHandler<R> {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VoxError;
    use crate::protocol::wire::CONTROL_SNIFF_LIMIT;

    #[derive(Default)]
    struct RecordingRemote {
        connected: bool,
        audio: Vec<Vec<u8>>,
        interrupts: usize,
        closes: usize,
    }

    impl RemoteSession for RecordingRemote {
        fn send_audio(&mut self, pcm: &[u8]) -> Result<()> {
            self.audio.push(pcm.to_vec());
            Ok(())
        }
        fn send_interrupt(&mut self) -> Result<()> {
            self.interrupts += 1;
            Ok(())
        }
        fn close(&mut self) {
            self.closes += 1;
            self.connected = false;
        }
        fn is_connected(&self) -> bool {
            self.connected
        }
    }

    fn handler() -> RelayHandler<RecordingRemote> {
        let remote = RecordingRemote {
            connected: true,
            ..Default::default()
        };
        RelayHandler::new(remote, CONTROL_SNIFF_LIMIT)
    }

    #[test]
    fn audio_and_interrupt_are_forwarded() {
        let mut relay = handler();
        relay.on_client_frame(ClientFrame::Binary(&[0u8; 682]));
        relay.on_client_frame(ClientFrame::Text(r#"{"type":"interrupt"}"#));
        relay.on_client_frame(ClientFrame::Binary(br#"{"type":"interrupt"}"#));

        assert_eq!(relay.remote().audio.len(), 1);
        assert_eq!(relay.remote().interrupts, 2);
        assert_eq!(relay.diagnostics().snapshot().interrupts_forwarded, 2);
    }

    #[test]
    fn malformed_control_is_dropped_not_forwarded() {
        let mut relay = handler();
        relay.on_client_frame(ClientFrame::Binary(b"{oops"));
        relay.on_client_frame(ClientFrame::Text("not json at all"));
        assert!(relay.remote().audio.is_empty());
        assert_eq!(relay.remote().interrupts, 0);
        assert_eq!(relay.diagnostics().snapshot().malformed_control, 2);
    }

    #[test]
    fn audio_ignored_while_remote_disconnected() {
        let mut relay = RelayHandler::new(RecordingRemote::default(), CONTROL_SNIFF_LIMIT);
        relay.on_client_frame(ClientFrame::Binary(&[1u8; 682]));
        assert!(relay.remote().audio.is_empty());
        assert_eq!(relay.diagnostics().snapshot().audio_dropped, 1);
    }

    #[test]
    fn remote_failures_map_to_close_codes() {
        let mut relay = handler();
        assert_eq!(
            relay.on_remote_event(RemoteEvent::Error("socket hang up".into())),
            RelayAction::Close(AI_SERVICE_FAILED)
        );
        assert_eq!(relay.remote().closes, 1);
        // Nothing further once the session is over.
        assert_eq!(
            relay.on_remote_event(RemoteEvent::Closed),
            RelayAction::Nothing
        );

        let mut relay = handler();
        assert_eq!(
            relay.on_remote_event(RemoteEvent::Closed),
            RelayAction::Close(AI_SESSION_ENDED)
        );
    }

    #[test]
    fn base64_downlink_is_decoded() {
        let mut relay = handler();
        let encoded = STANDARD.encode([0x01u8, 0x00, 0xFE, 0xFF]);
        assert_eq!(
            relay.on_remote_event(RemoteEvent::AudioBase64(encoded)),
            RelayAction::Downlink(vec![0x01, 0x00, 0xFE, 0xFF])
        );
        assert_eq!(
            relay.on_remote_event(RemoteEvent::AudioBase64("***".into())),
            RelayAction::Nothing
        );
    }

    #[test]
    fn client_close_closes_remote_once() {
        let mut relay = handler();
        relay.on_client_closed();
        relay.on_client_closed();
        assert_eq!(relay.remote().closes, 1);
        assert!(relay.is_finished());
    }

    #[test]
    fn send_errors_count_as_dropped() {
        struct Refusing;
        impl RemoteSession for Refusing {
            fn send_audio(&mut self, _pcm: &[u8]) -> Result<()> {
                Err(VoxError::RemoteSession("not ready".into()))
            }
            fn send_interrupt(&mut self) -> Result<()> {
                Ok(())
            }
            fn close(&mut self) {}
            fn is_connected(&self) -> bool {
                true
            }
        }
        let mut relay = RelayHandler::new(Refusing, CONTROL_SNIFF_LIMIT);
        relay.on_client_frame(ClientFrame::Binary(&[0u8; 682]));
        assert_eq!(relay.diagnostics().snapshot().audio_dropped, 1);
    }
}
