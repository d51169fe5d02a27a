//! Error types for trackmix-audio.

/// Result type alias for trackmix-audio.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for track, mixer and device operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The format, or the pipeline it would need, is not supported.
    /// The previously installed pipeline stays in place.
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// A non-blocking call found the buffer full (write) or empty (read).
    #[error("operation would block")]
    WouldBlock,

    /// No hardware progress within the wait bound.
    #[error("timed out waiting for hardware")]
    Timeout,

    /// The hardware failed or went away. Both directions are halted.
    #[error("device gone")]
    DeviceGone,

    /// A blocked call was woken by shutdown.
    #[error("cancelled by shutdown")]
    Cancelled,

    /// Unknown file id, or the file has no track in that direction.
    #[error("bad file: {0}")]
    BadFile(String),

    /// The driver cannot do what was asked (e.g. capture on an output-only
    /// device).
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A driver call failed outside of a mixing quantum.
    #[error("hardware error: {0}")]
    Hardware(String),

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}
