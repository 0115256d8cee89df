//! Error types for spoolrfid-core

use spoolrfid_types::SpoolField;

use crate::command::CommandId;

/// Result type alias for spoolrfid-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core protocol and codec errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Frame structure is invalid (start byte, length, shape)
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Frame checksum verification failed
    #[error("Frame checksum mismatch: expected 0x{expected:02X}, received 0x{received:02X}")]
    ChecksumMismatch {
        expected: u8,
        received: u8,
    },

    /// Unknown command identifier
    #[error("Unknown command id: 0x{0:02X}")]
    UnknownCommand(u8),

    /// Payload does not fit the one-byte length field
    #[error("Payload too large: {size} bytes (max: {max} bytes)")]
    PayloadTooLarge {
        size: usize,
        max: usize,
    },

    /// Response does not answer the outstanding command
    #[error("Sequence mismatch: expected {expected}, got {actual}")]
    SequenceMismatch {
        expected: u8,
        actual: u8,
    },

    /// Response carries a different command id than the request
    #[error("Unexpected response: expected {expected}, got {actual}")]
    UnexpectedResponse {
        expected: CommandId,
        actual: CommandId,
    },

    /// Sector trailer checksum does not cover the data blocks read
    #[error("Sector {sector} checksum mismatch: stored 0x{stored:02X}, computed 0x{computed:02X}")]
    SectorChecksumMismatch {
        sector: u8,
        stored: u8,
        computed: u8,
    },

    /// Field value cannot be encoded without loss
    #[error("Field {field} out of range: {reason}")]
    FieldOutOfRange {
        field: SpoolField,
        reason: String,
    },

    /// Field required for encoding is invalid/absent
    #[error("Field {0} is missing")]
    MissingField(SpoolField),

    /// Sector is not part of the spool layout
    #[error("Sector {0} is not part of the spool layout")]
    InvalidSector(u8),

    /// Key derivation failed
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    /// Type validation error
    #[error("Type error: {0}")]
    Types(#[from] spoolrfid_types::Error),
}

impl Error {
    /// Check if this error concerns a received frame
    ///
    /// The frame has been discarded; re-issuing the command may succeed.
    pub fn is_frame_error(&self) -> bool {
        matches!(
            self,
            Self::MalformedFrame(_)
                | Self::ChecksumMismatch { .. }
                | Self::SequenceMismatch { .. }
                | Self::UnexpectedResponse { .. }
        )
    }

    /// Check if this error rejects a record before any tag I/O
    pub fn is_encoding_error(&self) -> bool {
        matches!(self, Self::FieldOutOfRange { .. } | Self::MissingField(_))
    }
}
