//! Tag-level primitives: UIDs, keys, blocks and addresses

use std::fmt;

use crate::error::{Error, Result};

/// Number of sectors on a Mifare Classic 1K tag
pub const SECTOR_COUNT: u8 = 16;

/// Blocks per sector (3 data blocks + 1 trailer)
pub const BLOCKS_PER_SECTOR: u8 = 4;

/// Size of a single block in bytes
pub const BLOCK_SIZE: usize = 16;

/// Unique identifier of a physical tag
///
/// Spool tags carry a 4-byte single-size UID. The UID is read once per
/// detection and is never modified afterwards.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TagUid([u8; 4]);

impl TagUid {
    /// UID length in bytes
    pub const LEN: usize = 4;

    pub const fn new(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Build a UID from a slice, rejecting any other length
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 4] = bytes
            .try_into()
            .map_err(|_| Error::length("UID", Self::LEN, bytes.len()))?;
        Ok(Self(arr))
    }

    /// Parse a UID from its hex representation (e.g. `"A1B2C3D4"`)
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| Error::hex(s, e))?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    /// Block check character (XOR of the UID bytes) stored in block 0
    pub fn bcc(&self) -> u8 {
        self.0.iter().fold(0, |acc, b| acc ^ b)
    }

    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }
}

impl fmt::Display for TagUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for TagUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TagUid({})", self.to_hex())
    }
}

/// 6-byte Mifare sector key
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SectorKey([u8; 6]);

impl SectorKey {
    pub const LEN: usize = 6;

    /// Factory default transport key
    pub const DEFAULT: SectorKey = SectorKey([0xFF; 6]);

    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 6] = bytes
            .try_into()
            .map_err(|_| Error::length("Key", Self::LEN, bytes.len()))?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

// Keys never show up in logs in full.
impl fmt::Debug for SectorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SectorKey({:02X}…)", self.0[0])
    }
}

/// Which of the two sector keys to authenticate with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum KeyType {
    A = 0x60,
    B = 0x61,
}

impl TryFrom<u8> for KeyType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x60 => Ok(Self::A),
            0x61 => Ok(Self::B),
            _ => Err(Error::UnknownKeyType(value)),
        }
    }
}

/// A 16-byte block, the atomic unit of tag read/write
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawBlock([u8; BLOCK_SIZE]);

impl RawBlock {
    pub const ZERO: RawBlock = RawBlock([0; BLOCK_SIZE]);

    pub const fn new(bytes: [u8; BLOCK_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; BLOCK_SIZE] = bytes
            .try_into()
            .map_err(|_| Error::length("Block", BLOCK_SIZE, bytes.len()))?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; BLOCK_SIZE] {
        &self.0
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8; BLOCK_SIZE] {
        &mut self.0
    }
}

impl Default for RawBlock {
    fn default() -> Self {
        Self::ZERO
    }
}

impl fmt::Debug for RawBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawBlock({})", hex::encode_upper(self.0))
    }
}

impl fmt::Display for RawBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, chunk) in self.0.chunks(4).enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            f.write_str(&hex::encode_upper(chunk))?;
        }
        Ok(())
    }
}

/// Address of a block as (sector, block-within-sector)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockAddress {
    pub sector: u8,
    pub block: u8,
}

impl BlockAddress {
    /// Create a validated address
    pub fn new(sector: u8, block: u8) -> Result<Self> {
        if sector >= SECTOR_COUNT || block >= BLOCKS_PER_SECTOR {
            return Err(Error::InvalidAddress { sector, block });
        }
        Ok(Self { sector, block })
    }

    /// Absolute block number on the tag
    pub fn absolute(&self) -> u8 {
        self.sector * BLOCKS_PER_SECTOR + self.block
    }

    pub fn is_trailer(&self) -> bool {
        self.block == BLOCKS_PER_SECTOR - 1
    }

    /// Block 0 of sector 0 holds the UID and cannot be written
    pub fn is_manufacturer_block(&self) -> bool {
        self.sector == 0 && self.block == 0
    }
}

impl fmt::Display for BlockAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}B{}", self.sector, self.block)
    }
}
