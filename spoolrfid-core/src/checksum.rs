//! Checksum algorithms
//!
//! Two checksums are in play:
//! 1. The frame checksum, a single-byte XOR over every byte of a reader frame
//!    preceding it. XOR changes under any single-bit flip, so a flipped bit is
//!    always detected.
//! 2. The sector checksum, CRC-8/SMBUS over a sector's data blocks, stored in
//!    the sector trailer.

use crc::{CRC_8_SMBUS, Crc};
use spoolrfid_types::RawBlock;
use tracing::trace;

const SECTOR_CRC: Crc<u8> = Crc::<u8>::new(&CRC_8_SMBUS);

/// Calculate the frame checksum
///
/// # Examples
///
/// ```
/// use spoolrfid_core::checksum;
///
/// assert_eq!(checksum::xor(&[0xAB, 0x01, 0x00, 0x00]), 0xAA);
/// ```
pub fn xor(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, b| acc ^ b)
}

/// Verify a frame checksum
pub fn verify(data: &[u8], expected: u8) -> bool {
    xor(data) == expected
}

/// Calculate the checksum stored in a sector trailer
///
/// `data_blocks` are the sector's data blocks in address order.
pub fn sector(data_blocks: &[RawBlock]) -> u8 {
    let mut digest = SECTOR_CRC.digest();
    for block in data_blocks {
        digest.update(block.as_bytes());
    }
    let checksum = digest.finalize();

    trace!(
        blocks = data_blocks.len(),
        checksum = format!("0x{:02X}", checksum),
        "Calculated sector checksum"
    );

    checksum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xor_empty() {
        assert_eq!(xor(&[]), 0);
    }

    #[test]
    fn test_xor_verify() {
        let data = [0xAB, 0x03, 0x07, 0x02, 0x01, 0x01];
        let cs = xor(&data);
        assert!(verify(&data, cs));
        assert!(!verify(&data, cs ^ 0x01));
    }

    #[test]
    fn test_xor_detects_single_bit() {
        let data = [0x10, 0x20, 0x30, 0x40];
        let cs = xor(&data);
        for i in 0..data.len() {
            for bit in 0..8 {
                let mut flipped = data;
                flipped[i] ^= 1 << bit;
                assert_ne!(xor(&flipped), cs);
            }
        }
    }

    #[test]
    fn test_sector_checksum_consistent() {
        let blocks = [RawBlock::new([0x11; 16]), RawBlock::new([0x22; 16])];
        assert_eq!(sector(&blocks), sector(&blocks));
    }

    #[test]
    fn test_sector_checksum_detects_change() {
        let a = [RawBlock::new([0x11; 16]), RawBlock::new([0x22; 16])];
        let mut b = a;
        b[1].as_bytes_mut()[7] ^= 0x04;
        assert_ne!(sector(&a), sector(&b));
    }
}
