//! Spool tag codec
//!
//! Converts between the raw blocks of a tag's spool sectors and
//! [`SpoolFields`](spoolrfid_types::SpoolFields). Decoding verifies every
//! sector's checksum before any field is interpreted; a sector that fails
//! leaves its fields invalid without affecting the others.

mod decode;
mod encode;
mod image;
pub mod layout;

pub use decode::{assemble, decode_image, decode_sector};
pub use encode::{encode_record, encode_sector};
pub use image::TagImage;
pub use layout::trailer_block;
