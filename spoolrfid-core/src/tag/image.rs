//! Raw sector dump of a tag

use std::collections::BTreeMap;
use std::fmt;

use spoolrfid_types::{BlockAddress, RawBlock, TagUid};

use super::layout::SPOOL_SECTORS;

/// Raw block contents of a tag's spool sectors
///
/// A sector is absent when it could not be authenticated or read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagImage {
    uid: TagUid,
    sectors: BTreeMap<u8, [RawBlock; 4]>,
}

impl TagImage {
    pub fn new(uid: TagUid) -> Self {
        Self {
            uid,
            sectors: BTreeMap::new(),
        }
    }

    pub fn uid(&self) -> TagUid {
        self.uid
    }

    pub fn insert_sector(&mut self, sector: u8, blocks: [RawBlock; 4]) {
        self.sectors.insert(sector, blocks);
    }

    pub fn sector(&self, sector: u8) -> Option<&[RawBlock; 4]> {
        self.sectors.get(&sector)
    }

    pub fn block(&self, address: BlockAddress) -> Option<&RawBlock> {
        self.sector(address.sector)
            .map(|blocks| &blocks[address.block as usize])
    }

    /// Readable sectors in ascending order
    pub fn sectors(&self) -> impl Iterator<Item = (u8, &[RawBlock; 4])> {
        self.sectors.iter().map(|(s, b)| (*s, b))
    }

    /// Whether every spool sector was read
    pub fn is_complete(&self) -> bool {
        SPOOL_SECTORS.iter().all(|s| self.sectors.contains_key(s))
    }
}

/// Hex dump, one block per line
impl fmt::Display for TagImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "UID {}", self.uid)?;
        for sector in SPOOL_SECTORS {
            match self.sector(sector) {
                Some(blocks) => {
                    for (block, data) in blocks.iter().enumerate() {
                        writeln!(f, "S{}B{}  {}", sector, block, data)?;
                    }
                }
                None => writeln!(f, "S{}    unreadable", sector)?,
            }
        }
        Ok(())
    }
}
