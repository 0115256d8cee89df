//! Per-tag sector key derivation
//!
//! Spool tags are keyed per UID: HKDF-SHA256 with the UID as input key
//! material and a master value as salt, expanded to 16 six-byte keys for each
//! key type. Keys are derived from the UID reported by every detection and are
//! never cached across tags.

use hkdf::Hkdf;
use sha2::Sha256;
use spoolrfid_types::tag::SECTOR_COUNT;
use spoolrfid_types::{KeyType, SectorKey, TagUid};
use tracing::trace;

use crate::{
    constants::kdf::{DEFAULT_MASTER_KEY, KEY_A_INFO, KEY_B_INFO},
    error::{Error, Result},
};

const KEY_MATERIAL_LEN: usize = SECTOR_COUNT as usize * SectorKey::LEN;

/// Key derivation parameters
#[derive(Clone, PartialEq, Eq)]
pub struct KeyDerivation {
    master_key: [u8; 16],
}

impl KeyDerivation {
    pub fn new(master_key: [u8; 16]) -> Self {
        Self { master_key }
    }

    /// Derive both key sets for a tag
    pub fn derive(&self, uid: &TagUid) -> Result<SectorKeys> {
        let hk = Hkdf::<Sha256>::new(Some(&self.master_key), uid.as_bytes());
        let key_a = expand(&hk, KEY_A_INFO)?;
        let key_b = expand(&hk, KEY_B_INFO)?;

        trace!(uid = %uid, "Derived sector keys");

        Ok(SectorKeys { key_a, key_b })
    }
}

impl Default for KeyDerivation {
    fn default() -> Self {
        Self::new(DEFAULT_MASTER_KEY)
    }
}

impl std::fmt::Debug for KeyDerivation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyDerivation")
            .field("master_key", &"<redacted>")
            .finish()
    }
}

fn expand(hk: &Hkdf<Sha256>, info: &[u8]) -> Result<[SectorKey; SECTOR_COUNT as usize]> {
    let mut okm = [0u8; KEY_MATERIAL_LEN];
    hk.expand(info, &mut okm)
        .map_err(|e| Error::KeyDerivation(e.to_string()))?;

    let mut keys = [SectorKey::DEFAULT; SECTOR_COUNT as usize];
    for (key, chunk) in keys.iter_mut().zip(okm.chunks_exact(SectorKey::LEN)) {
        *key = SectorKey::from_slice(chunk)?;
    }
    Ok(keys)
}

/// Key A and key B for every sector of one tag
#[derive(Clone, PartialEq, Eq)]
pub struct SectorKeys {
    key_a: [SectorKey; SECTOR_COUNT as usize],
    key_b: [SectorKey; SECTOR_COUNT as usize],
}

impl SectorKeys {
    pub fn key(&self, sector: u8, key_type: KeyType) -> Result<SectorKey> {
        let keys = match key_type {
            KeyType::A => &self.key_a,
            KeyType::B => &self.key_b,
        };
        keys.get(sector as usize)
            .copied()
            .ok_or(Error::InvalidSector(sector))
    }

    pub fn key_a(&self, sector: u8) -> Result<SectorKey> {
        self.key(sector, KeyType::A)
    }

    pub fn key_b(&self, sector: u8) -> Result<SectorKey> {
        self.key(sector, KeyType::B)
    }
}

impl std::fmt::Debug for SectorKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SectorKeys").finish_non_exhaustive()
    }
}
