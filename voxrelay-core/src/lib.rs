//! # voxrelay-core
//!
//! Real-time voice conversation engine: the client-side audio pipeline and
//! the relay-side message routing for talking to a streaming AI service.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → CaptureBackend → SPSC RingBuffer → capture pipeline thread
//!                                                   │            │
//!                                          AnalysisWindow   CaptureFramer (→ 16 kHz i16)
//!                                                   │            │
//!                                        barge-in loop         Uplink ──► transport
//!                                                   │
//!                                   SessionEvent::Interrupt
//!                                                   ▼
//! transport ──► SessionEvent::Downlink ──► Conversation ──► PlaybackScheduler ──► PlaybackSink
//!                                                   ▲                                  │
//!                                                   └──── SessionEvent::PlaybackEnded ◄┘
//! ```
//!
//! The audio callbacks never block. Everything that mutates the
//! scheduler runs on the task driving [`Conversation`].

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod bargein;
pub mod buffering;
pub mod error;
pub mod interrupt;
pub mod playback;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod uplink;

// Convenience re-exports for downstream crates
pub use audio::{framer::CaptureFramer, CaptureBackend, CpalCapture};
pub use error::{Result, VoxError};
pub use playback::{PlaybackScheduler, PlaybackSink, VoiceId};
pub use protocol::events::{InterruptEvent, InterruptSource, SessionState, SessionStatusEvent};
pub use relay::{LoopbackSession, RelayHandler, RemoteEvent, RemoteSession};
pub use session::{CloseReason, Conversation, SessionConfig, SessionEvent, SessionId};
pub use uplink::{OutboundFrame, Uplink};

#[cfg(feature = "audio-cpal")]
pub use audio::CpalPlayback;
