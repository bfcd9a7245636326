//! Error types for ShatpadLink

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// ShatpadLink error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transport failure: refused, reset, or closed by peer
    #[error("connection error: {0}")]
    Connection(String),

    /// Frame length field exceeds the configured bound; the remaining
    /// stream bytes can no longer be trusted
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge {
        /// Length announced by the frame header
        len: usize,
        /// Configured maximum frame length
        max: usize,
    },

    /// No bytes arrived within the deadline
    #[error("operation timed out")]
    Timeout,

    /// Call not allowed in the current lifecycle state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Malformed record
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(e: toml::ser::Error) -> Self {
        Error::Config(e.to_string())
    }
}
