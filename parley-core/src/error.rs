use thiserror::Error;

/// All errors produced by parley-core.
#[derive(Debug, Error)]
pub enum ParleyError {
    /// Microphone permission denied, no input device, or the device refused
    /// to open. Never retried internally.
    #[error("could not access microphone: {0}")]
    MediaAccess(String),

    /// Malformed base64, or a byte length that cannot form whole 16-bit samples.
    #[error("could not decode audio chunk: {0}")]
    Decode(String),

    #[error("already capturing")]
    AlreadyCapturing,

    #[error("playback engine has been disposed")]
    Disposed,

    #[error("audio output session is not open")]
    NotInitialized,

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    /// Raised by a sink when asked to stop a node that already finished.
    /// The playback engine treats it as a no-op.
    #[error("playback node {0} already stopped")]
    NodeAlreadyStopped(u64),

    #[error("playback service has shut down")]
    ServiceStopped,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ParleyError>;
