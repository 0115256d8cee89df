//! Transport errors

use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Device cannot be opened (absent, busy or permission denied)
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Not open")]
    NotOpen,

    #[error("Already open")]
    AlreadyOpen,

    /// No bytes arrived within the timeout
    #[error("Link timeout after {timeout_ms} ms")]
    LinkTimeout { timeout_ms: u64 },

    /// Device went away mid-operation
    #[error("Link disconnected")]
    LinkDisconnected,

    /// Some bytes arrived, then the link went quiet
    #[error("Short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

impl Error {
    /// Check if the operation may succeed when attempted again
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LinkTimeout { .. })
    }

    pub(crate) fn timeout(timeout: std::time::Duration) -> Self {
        Self::LinkTimeout {
            timeout_ms: timeout.as_millis() as u64,
        }
    }
}
