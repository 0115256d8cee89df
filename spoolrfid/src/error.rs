//! High-level error types

use spoolrfid_core::CommandId;
use spoolrfid_types::FieldSet;

use crate::session::FailReason;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Core protocol error: {0}")]
    Core(#[from] spoolrfid_core::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] spoolrfid_transport::Error),

    #[error("Type error: {0}")]
    Types(#[from] spoolrfid_types::Error),

    /// Another session holds the reader
    #[error("Reader is busy")]
    DeviceBusy,

    /// No tag in the reader field
    #[error("No tag present")]
    NoTag,

    /// The tag left the field mid-session
    #[error("Tag removed during session")]
    TagRemoved,

    /// The reader reported a card that is not a Mifare Classic 1K
    #[error("Unsupported tag (SAK 0x{sak:02X})")]
    UnsupportedTag { sak: u8 },

    #[error("Authentication failed for sector {sector}")]
    AuthFailed { sector: u8 },

    #[error("Block S{sector}B{block} is write protected")]
    WriteProtected { sector: u8, block: u8 },

    /// The reader firmware does not implement the command
    #[error("Reader does not support {0}")]
    UnsupportedCommand(CommandId),

    /// Re-read after a write does not match what was written
    #[error("Verification failed for {0:?}")]
    VerifyFailed(FieldSet),

    #[error("Session cancelled")]
    Cancelled,

    #[error("Invalid session state: {0}")]
    InvalidSessionState(String),

    /// The session failed earlier and accepts no further operations
    #[error("Session failed: {0}")]
    Failed(FailReason),

    #[error("Device registry already initialised")]
    RegistryInitialized,
}

impl Error {
    /// Check if retrying the operation in a new session may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_retryable(),
            Self::Failed(FailReason::LinkTimeout) => true,
            _ => false,
        }
    }

    /// Check if the error was raised before anything was sent to the tag
    pub fn is_encoding_error(&self) -> bool {
        matches!(self, Self::Core(e) if e.is_encoding_error())
    }
}
