use thiserror::Error;

/// Errors surfaced by the voice engine and the relay routing.
///
/// Device and transport failures end the session; `AlreadyActive` and
/// `NotActive` report misuse of the session controller.
#[derive(Debug, Error)]
pub enum VoxError {
    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("no default output device found")]
    NoDefaultOutputDevice,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("remote session error: {0}")]
    RemoteSession(String),

    #[error("session is already active")]
    AlreadyActive,

    #[error("session is not active")]
    NotActive,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, VoxError>;
