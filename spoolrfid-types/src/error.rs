//! Errors raised when building tag and spool values

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A UID, key or block built from a slice of the wrong size
    #[error("{kind} must be {expected} bytes, got {actual}")]
    InvalidLength {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid hex {input:?}: {reason}")]
    InvalidHex { input: String, reason: String },

    /// Address outside the 16 x 4 block grid of a Classic 1K tag
    #[error("Block address out of range: sector {sector} block {block}")]
    InvalidAddress { sector: u8, block: u8 },

    #[error("Unknown key type 0x{0:02X}")]
    UnknownKeyType(u8),
}

impl Error {
    pub(crate) fn length(kind: &'static str, expected: usize, actual: usize) -> Self {
        Self::InvalidLength {
            kind,
            expected,
            actual,
        }
    }

    pub(crate) fn hex(input: &str, reason: impl ToString) -> Self {
        Self::InvalidHex {
            input: input.to_string(),
            reason: reason.to_string(),
        }
    }
}
