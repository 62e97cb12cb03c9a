//! Status and activity events broadcast by the session controller.
//!
//! Hosts subscribe to these to drive a UI or logs; nothing in the engine
//! depends on anyone listening.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Lifecycle state of one conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Nothing started yet.
    Idle,
    /// Transport is being opened.
    Connecting,
    /// Transport ready, microphone streaming, no AI audio in flight.
    Listening,
    /// AI audio has arrived and is buffering or playing.
    Speaking,
    /// Torn down after a failure.
    Error,
    /// Torn down normally.
    Closed,
}

impl SessionState {
    /// Conversation is live: transport up and microphone streaming.
    pub fn is_connected(self) -> bool {
        matches!(self, SessionState::Listening | SessionState::Speaking)
    }

    /// Final state of a session; a new `start` is required.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Error | SessionState::Closed)
    }

    /// Short user-facing status line.
    pub fn label(self) -> &'static str {
        match self {
            SessionState::Idle | SessionState::Closed => "Click the button to start",
            SessionState::Connecting => "Connecting...",
            SessionState::Listening => "Listening...",
            SessionState::Speaking => "AI is speaking...",
            SessionState::Error => "Error",
        }
    }
}

/// Emitted whenever the session state changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusEvent {
    pub state: SessionState,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

impl SessionStatusEvent {
    /// Status line including the detail for errors, e.g. `"Error: service unavailable"`.
    pub fn display_line(&self) -> String {
        match (&self.state, &self.detail) {
            (SessionState::Error, Some(detail)) => format!("Error: {detail}"),
            (state, _) => state.label().to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Interruptions
// ---------------------------------------------------------------------------

/// Who asked for playback to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InterruptSource {
    /// Sustained microphone loudness during AI playback.
    BargeIn,
    /// Explicit user action (stop button, Ctrl-C).
    User,
    /// Flushing playback as part of teardown.
    Teardown,
}

/// Emitted once per interrupt, after playback has been cleared.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptEvent {
    pub source: InterruptSource,
    /// Queued chunks discarded without playing.
    pub dropped_chunks: usize,
    /// Whether a chunk was audibly cut off.
    pub stopped_playback: bool,
    /// Whether the remote side was told.
    pub signalled_remote: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_event_serializes_with_lowercase_state() {
        let event = SessionStatusEvent {
            state: SessionState::Speaking,
            detail: None,
        };
        let json = serde_json::to_value(&event).expect("serialize status event");
        assert_eq!(json["state"], "speaking");
        assert!(json["detail"].is_null());
    }

    #[test]
    fn error_display_includes_detail() {
        let event = SessionStatusEvent {
            state: SessionState::Error,
            detail: Some("service unavailable".into()),
        };
        assert_eq!(event.display_line(), "Error: service unavailable");
    }

    #[test]
    fn interrupt_event_uses_camel_case() {
        let event = InterruptEvent {
            source: InterruptSource::BargeIn,
            dropped_chunks: 5,
            stopped_playback: true,
            signalled_remote: true,
        };
        let json = serde_json::to_value(&event).expect("serialize interrupt event");
        assert_eq!(json["source"], "bargeIn");
        assert_eq!(json["droppedChunks"], 5);
        assert_eq!(json["stoppedPlayback"], true);
    }

    #[test]
    fn connected_states() {
        assert!(SessionState::Listening.is_connected());
        assert!(SessionState::Speaking.is_connected());
        assert!(!SessionState::Connecting.is_connected());
        assert!(SessionState::Closed.is_terminal());
        assert!(!SessionState::Idle.is_terminal());
    }
}
