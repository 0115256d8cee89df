//! Where spool fields live on the tag
//!
//! ```text
//! Sector 0  B0 manufacturer (uid, bcc, sak, atqa)   read-only
//!           B1 variant id[8] | material id[8]
//!           B2 material type[16]
//! Sector 1  B0 material name[16]
//!           B1 color rgba[4] | spool weight u16 | filament diameter u16 x100
//!           B2 bed temp u16 | nozzle min u16 | nozzle max u16
//! Sector 2  B0 nozzle diameter u16 x100
//!           B1 lot[16]
//!           B2 remaining weight u32 x10 | remaining length u32 x10
//! Sector 3  B0 production timestamp "YYYY_MM_DD_HH_MM"
//!           B1 manufacturer checksum u16
//! Every     B3 key A[6] | access bits[3] | sector checksum | key B[6]
//! ```
//!
//! Integers are little-endian. Text is printable ASCII padded with NUL.

use std::ops::Range;

use spoolrfid_types::tag::BLOCKS_PER_SECTOR;
use spoolrfid_types::{FieldSet, RawBlock, SectorKey, TagUid};

use crate::{
    checksum,
    constants::{
        ACCESS_BITS,
        mifare::{ATQA_CLASSIC_1K, SAK_CLASSIC_1K},
    },
};

/// Sectors holding spool data
pub const SPOOL_SECTORS: [u8; 4] = [0, 1, 2, 3];

/// Block index of the sector trailer
pub const TRAILER_BLOCK: u8 = BLOCKS_PER_SECTOR - 1;

pub const KEY_A_RANGE: Range<usize> = 0..6;
pub const ACCESS_BITS_RANGE: Range<usize> = 6..9;
pub const CHECKSUM_OFFSET: usize = 9;
pub const KEY_B_RANGE: Range<usize> = 10..16;

/// Fixed-point scale of diameters (hundredths of a millimetre)
pub const DIAMETER_SCALE: f64 = 100.0;

/// Fixed-point scale of remaining weight and length (tenths)
pub const REMAINING_SCALE: f64 = 10.0;

/// Byte ranges of the individual fields within their block
pub mod field {
    use std::ops::Range;

    pub const VARIANT_ID: Range<usize> = 0..8;
    pub const MATERIAL_ID: Range<usize> = 8..16;
    pub const TEXT_BLOCK: Range<usize> = 0..16;

    pub const COLOR: Range<usize> = 0..4;
    pub const SPOOL_WEIGHT: Range<usize> = 4..6;
    pub const FILAMENT_DIAMETER: Range<usize> = 6..8;

    pub const BED_TEMP: Range<usize> = 0..2;
    pub const NOZZLE_TEMP_MIN: Range<usize> = 2..4;
    pub const NOZZLE_TEMP_MAX: Range<usize> = 4..6;

    pub const NOZZLE_DIAMETER: Range<usize> = 0..2;
    pub const REMAINING_WEIGHT: Range<usize> = 0..4;
    pub const REMAINING_LENGTH: Range<usize> = 4..8;

    pub const MANUFACTURER_CHECKSUM: Range<usize> = 0..2;
}

pub fn is_spool_sector(sector: u8) -> bool {
    SPOOL_SECTORS.contains(&sector)
}

/// Data blocks covered by the sector checksum
///
/// Sector 0 skips the manufacturer block.
pub fn checksummed_blocks(sector: u8) -> Range<usize> {
    if sector == 0 {
        1..TRAILER_BLOCK as usize
    } else {
        0..TRAILER_BLOCK as usize
    }
}

/// Data blocks a write touches
pub fn writable_blocks(sector: u8) -> impl Iterator<Item = u8> {
    checksummed_blocks(sector).map(|b| b as u8)
}

/// Checksum of a sector's data blocks
pub fn sector_checksum(sector: u8, blocks: &[RawBlock; 4]) -> u8 {
    checksum::sector(&blocks[checksummed_blocks(sector)])
}

/// Checksum stored in a trailer block
pub fn stored_checksum(trailer: &RawBlock) -> u8 {
    trailer.as_bytes()[CHECKSUM_OFFSET]
}

/// Fields stored in a sector
pub fn fields_in(sector: u8) -> FieldSet {
    match sector {
        0 => FieldSet::VARIANT_ID | FieldSet::MATERIAL_ID | FieldSet::MATERIAL_TYPE,
        1 => {
            FieldSet::MATERIAL_NAME
                | FieldSet::COLOR
                | FieldSet::SPOOL_WEIGHT
                | FieldSet::FILAMENT_DIAMETER
                | FieldSet::BED_TEMP
                | FieldSet::NOZZLE_TEMP_MIN
                | FieldSet::NOZZLE_TEMP_MAX
        }
        2 => {
            FieldSet::NOZZLE_DIAMETER
                | FieldSet::LOT
                | FieldSet::REMAINING_WEIGHT
                | FieldSet::REMAINING_LENGTH
        }
        3 => FieldSet::PRODUCED_AT | FieldSet::MANUFACTURER_CHECKSUM,
        _ => FieldSet::empty(),
    }
}

/// Build a sector trailer
pub fn trailer_block(key_a: &SectorKey, key_b: &SectorKey, checksum: u8) -> RawBlock {
    let mut block = RawBlock::ZERO;
    let bytes = block.as_bytes_mut();
    bytes[KEY_A_RANGE].copy_from_slice(key_a.as_bytes());
    bytes[ACCESS_BITS_RANGE].copy_from_slice(&ACCESS_BITS);
    bytes[CHECKSUM_OFFSET] = checksum;
    bytes[KEY_B_RANGE].copy_from_slice(key_b.as_bytes());
    block
}

/// Block 0 of sector 0 as programmed by the tag manufacturer
pub fn manufacturer_block(uid: &TagUid) -> RawBlock {
    let mut block = RawBlock::ZERO;
    let bytes = block.as_bytes_mut();
    bytes[0..4].copy_from_slice(uid.as_bytes());
    bytes[4] = uid.bcc();
    bytes[5] = SAK_CLASSIC_1K;
    bytes[6..8].copy_from_slice(&ATQA_CLASSIC_1K.to_le_bytes());
    block
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_checksummed_blocks() {
        assert_eq!(checksummed_blocks(0), 1..3);
        assert_eq!(checksummed_blocks(2), 0..3);
        assert_eq!(writable_blocks(0).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_trailer_layout() {
        let trailer = trailer_block(&SectorKey::new([1; 6]), &SectorKey::new([2; 6]), 0x5C);
        assert_eq!(
            trailer.as_bytes(),
            &[1, 1, 1, 1, 1, 1, 0xFF, 0x07, 0x80, 0x5C, 2, 2, 2, 2, 2, 2]
        );
        assert_eq!(stored_checksum(&trailer), 0x5C);
    }

    #[test]
    fn test_manufacturer_block() {
        let block = manufacturer_block(&TagUid::new([0x01, 0x02, 0x04, 0x08]));
        assert_eq!(&block.as_bytes()[..8], &[0x01, 0x02, 0x04, 0x08, 0x0F, 0x08, 0x04, 0x00]);
    }

    #[test]
    fn test_sectors_partition_fields() {
        let mut seen = FieldSet::empty();
        for sector in SPOOL_SECTORS {
            assert!(!seen.intersects(fields_in(sector)));
            seen |= fields_in(sector);
        }
        assert!(seen.is_all());
        assert!(fields_in(4).is_empty());
    }

    #[test]
    fn test_sector0_checksum_ignores_manufacturer_block() {
        let mut blocks = [RawBlock::new([0x33; 16]); 4];
        let before = sector_checksum(0, &blocks);
        blocks[0] = RawBlock::ZERO;
        assert_eq!(sector_checksum(0, &blocks), before);

        blocks[1].as_bytes_mut()[0] ^= 0x01;
        assert_ne!(sector_checksum(0, &blocks), before);
    }
}
