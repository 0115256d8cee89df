//! # spoolrfid-core
//!
//! Core protocol implementation for filament spool RFID readers.
//!
//! This crate provides the low-level primitives:
//! - Reader frame structure and encoding/decoding
//! - Frame and sector checksums
//! - Reader command/response definitions
//! - Per-tag sector key derivation
//! - Spool tag layout, decoder and encoder

pub mod checksum;
pub mod command;
pub mod constants;
pub mod error;
pub mod frame;
pub mod keys;
pub mod sequence;
pub mod tag;

pub use command::{CommandId, DetectedTag, ReaderCommand, ReaderResponse, Status};
pub use error::{Error, Result};
pub use frame::Frame;
pub use keys::{KeyDerivation, SectorKeys};
pub use sequence::SequenceCounter;
pub use tag::{TagImage, assemble, decode_image, decode_sector, encode_record, encode_sector};

/// Protocol version information
pub const PROTOCOL_VERSION: &str = "1.0";
