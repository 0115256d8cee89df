//! Simulated reader with an emulated tag
//!
//! [`SimulatedReader`] answers reader frames the way the firmware does,
//! against a [`SimulatedTag`] held in its field. Faults (unplugging, silence,
//! corrupted responses, tag removal, refused authentication) can be injected
//! through any clone of the reader while a session owns another clone.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use spoolrfid_core::constants::mifare::{ATQA_CLASSIC_1K, SAK_CLASSIC_1K};
use spoolrfid_core::tag::layout::{self, KEY_A_RANGE, KEY_B_RANGE, SPOOL_SECTORS, TRAILER_BLOCK};
use spoolrfid_core::{
    CommandId, DetectedTag, Frame, KeyDerivation, ReaderCommand, ReaderResponse, Status, TagImage,
    encode_record,
};
use spoolrfid_types::tag::{BLOCKS_PER_SECTOR, SECTOR_COUNT};
use spoolrfid_types::{BlockAddress, FirmwareVersion, KeyType, RawBlock, SectorKey, SpoolRecord, TagUid};
use tracing::trace;

use crate::mock::{deliver, take_exact};
use crate::{Transport, error::*};

/// Emulated Mifare Classic 1K tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedTag {
    uid: TagUid,
    blocks: [[RawBlock; 4]; SECTOR_COUNT as usize],
}

impl SimulatedTag {
    /// Factory-fresh tag: empty data, default transport keys
    pub fn blank(uid: TagUid) -> Self {
        let trailer = layout::trailer_block(&SectorKey::DEFAULT, &SectorKey::DEFAULT, 0);
        let mut blocks = [[RawBlock::ZERO, RawBlock::ZERO, RawBlock::ZERO, trailer]; SECTOR_COUNT as usize];
        blocks[0][0] = layout::manufacturer_block(&uid);
        Self { uid, blocks }
    }

    /// Spool tag keyed for `uid` whose data blocks are still empty
    pub fn keyed(uid: TagUid, kdf: &KeyDerivation) -> spoolrfid_core::Result<Self> {
        let keys = kdf.derive(&uid)?;
        let mut tag = Self::blank(uid);
        for sector in 0..SECTOR_COUNT {
            let checksum = layout::stored_checksum(&tag.blocks[sector as usize][TRAILER_BLOCK as usize]);
            tag.blocks[sector as usize][TRAILER_BLOCK as usize] =
                layout::trailer_block(&keys.key_a(sector)?, &keys.key_b(sector)?, checksum);
        }
        Ok(tag)
    }

    /// Keyed spool tag holding `image`
    pub fn from_image(image: &TagImage, kdf: &KeyDerivation) -> spoolrfid_core::Result<Self> {
        let mut tag = Self::keyed(image.uid(), kdf)?;
        for (sector, blocks) in image.sectors() {
            let Some(slot) = tag.blocks.get_mut(sector as usize) else {
                continue;
            };
            for block in layout::writable_blocks(sector) {
                slot[block as usize] = blocks[block as usize];
            }
            let trailer = slot[TRAILER_BLOCK as usize].as_bytes_mut();
            trailer[layout::CHECKSUM_OFFSET] = layout::stored_checksum(&blocks[TRAILER_BLOCK as usize]);
        }
        Ok(tag)
    }

    /// Keyed spool tag holding `record`
    pub fn from_record(record: &SpoolRecord, kdf: &KeyDerivation) -> spoolrfid_core::Result<Self> {
        Self::from_image(&encode_record(record)?, kdf)
    }

    pub fn uid(&self) -> TagUid {
        self.uid
    }

    /// Stored block contents, keys included
    pub fn block(&self, address: BlockAddress) -> RawBlock {
        self.blocks[address.sector as usize][address.block as usize]
    }

    /// Flip the stored checksum of a sector
    pub fn corrupt_checksum(&mut self, sector: u8) {
        if let Some(blocks) = self.blocks.get_mut(sector as usize) {
            blocks[TRAILER_BLOCK as usize].as_bytes_mut()[layout::CHECKSUM_OFFSET] ^= 0xFF;
        }
    }

    /// Spool sectors as a host would read them
    pub fn image(&self) -> TagImage {
        let mut image = TagImage::new(self.uid);
        for sector in SPOOL_SECTORS {
            let mut blocks = [RawBlock::ZERO; 4];
            for block in 0..BLOCKS_PER_SECTOR {
                blocks[block as usize] = self.read(BlockAddress { sector, block });
            }
            image.insert_sector(sector, blocks);
        }
        image
    }

    fn key(&self, sector: u8, key_type: KeyType) -> SectorKey {
        let trailer = self.blocks[sector as usize][TRAILER_BLOCK as usize];
        let range = match key_type {
            KeyType::A => KEY_A_RANGE,
            KeyType::B => KEY_B_RANGE,
        };
        SectorKey::from_slice(&trailer.as_bytes()[range]).unwrap_or(SectorKey::DEFAULT)
    }

    /// Key A never reads back
    fn read(&self, address: BlockAddress) -> RawBlock {
        let mut block = self.block(address);
        if address.is_trailer() {
            block.as_bytes_mut()[KEY_A_RANGE].fill(0);
        }
        block
    }

    fn write(&mut self, address: BlockAddress, data: RawBlock) {
        self.blocks[address.sector as usize][address.block as usize] = data;
    }
}

#[derive(Debug)]
struct SimState {
    open: bool,
    tag: Option<SimulatedTag>,
    rx: VecDeque<u8>,
    selected: bool,
    authenticated: Option<u8>,
    firmware: FirmwareVersion,
    commands: Vec<ReaderCommand>,
    refuse_auth: BTreeSet<u8>,
    write_protected: BTreeSet<u8>,
    remove_after: Option<usize>,
    disconnected: bool,
    silent: bool,
    corrupt_next: bool,
}

/// Simulated reader, cheap to clone; clones share the same reader and tag
#[derive(Debug, Clone)]
pub struct SimulatedReader {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedReader {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                open: false,
                tag: None,
                rx: VecDeque::new(),
                selected: false,
                authenticated: None,
                firmware: FirmwareVersion {
                    ic: 0x32,
                    version: 1,
                    revision: 6,
                    support: 0x07,
                },
                commands: Vec::new(),
                refuse_auth: BTreeSet::new(),
                write_protected: BTreeSet::new(),
                remove_after: None,
                disconnected: false,
                silent: false,
                corrupt_next: false,
            })),
        }
    }

    /// Reader with `tag` already in the field
    pub fn with_tag(tag: SimulatedTag) -> Self {
        let reader = Self::new();
        reader.present(tag);
        reader
    }

    /// Place a tag in the field, replacing any other
    pub fn present(&self, tag: SimulatedTag) {
        let mut state = self.state.lock();
        state.tag = Some(tag);
        state.selected = false;
        state.authenticated = None;
    }

    /// Take the tag out of the field
    pub fn remove_tag(&self) -> Option<SimulatedTag> {
        let mut state = self.state.lock();
        state.selected = false;
        state.authenticated = None;
        state.tag.take()
    }

    /// Take the tag out of the field once `commands` more commands were answered
    pub fn remove_tag_after(&self, commands: usize) {
        self.state.lock().remove_after = Some(commands);
    }

    /// Current tag contents
    pub fn tag(&self) -> Option<SimulatedTag> {
        self.state.lock().tag.clone()
    }

    /// Reject authentication of `sector` regardless of key
    pub fn refuse_auth(&self, sector: u8) {
        self.state.lock().refuse_auth.insert(sector);
    }

    pub fn write_protect(&self, sector: u8) {
        self.state.lock().write_protected.insert(sector);
    }

    /// Simulate the reader being unplugged
    pub fn disconnect(&self) {
        self.state.lock().disconnected = true;
    }

    /// Stop answering commands
    pub fn set_silent(&self, silent: bool) {
        self.state.lock().silent = silent;
    }

    /// Damage the checksum of the next response
    pub fn corrupt_next_response(&self) {
        self.state.lock().corrupt_next = true;
    }

    /// Every command received so far
    pub fn commands(&self) -> Vec<ReaderCommand> {
        self.state.lock().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.state.lock().commands.clear();
    }

    /// Number of commands received with the given id
    pub fn count(&self, id: CommandId) -> usize {
        self.state.lock().commands.iter().filter(|c| c.id() == id).count()
    }
}

impl Default for SimulatedReader {
    fn default() -> Self {
        Self::new()
    }
}

impl SimState {
    fn handle(&mut self, bytes: &[u8]) {
        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                // Firmware drops frames it cannot parse
                trace!(error = %e, "Simulated reader dropped frame");
                return;
            }
        };

        let response = match ReaderCommand::from_frame(&frame) {
            Ok(command) => {
                let (status, data) = self.execute(&command);
                self.commands.push(command.clone());
                ReaderResponse::new(command.id(), frame.sequence(), status, data).encode()
            }
            Err(_) => Frame::new(
                frame.command() | spoolrfid_core::constants::RESPONSE_FLAG,
                frame.sequence(),
                vec![Status::UnknownCommand as u8],
            )
            .map(|f| f.encode()),
        };
        let Ok(mut response) = response else {
            return;
        };

        if let Some(remaining) = self.remove_after.as_mut() {
            if *remaining <= 1 {
                self.remove_after = None;
                self.tag = None;
                self.selected = false;
                self.authenticated = None;
            } else {
                *remaining -= 1;
            }
        }

        if self.silent {
            return;
        }
        if std::mem::take(&mut self.corrupt_next) {
            let last = response.len() - 1;
            response[last] ^= 0xFF;
        }
        self.rx.extend(response.iter());
    }

    fn execute(&mut self, command: &ReaderCommand) -> (Status, Bytes) {
        let tag = match self.tag.as_mut() {
            Some(tag) => tag,
            None if matches!(command, ReaderCommand::FirmwareVersion) => {
                return (Status::Ok, firmware_data(&self.firmware));
            }
            None => {
                self.selected = false;
                self.authenticated = None;
                return (Status::NoTag, Bytes::new());
            }
        };

        match command {
            ReaderCommand::Detect => {
                self.selected = true;
                self.authenticated = None;
                let detected = DetectedTag {
                    uid: tag.uid(),
                    atqa: ATQA_CLASSIC_1K,
                    sak: SAK_CLASSIC_1K,
                };
                (Status::Ok, detected.to_bytes())
            }
            ReaderCommand::Auth { sector, key_type, key } => {
                self.authenticated = None;
                let accepted = self.selected
                    && !self.refuse_auth.contains(sector)
                    && tag.key(*sector, *key_type) == *key;
                if !accepted {
                    // A failed authentication halts the tag until it is selected again
                    self.selected = false;
                    return (Status::AuthFailed, Bytes::new());
                }
                self.authenticated = Some(*sector);
                (Status::Ok, Bytes::new())
            }
            ReaderCommand::Read { address } => {
                if self.authenticated != Some(address.sector) {
                    return (Status::AuthFailed, Bytes::new());
                }
                (Status::Ok, Bytes::copy_from_slice(tag.read(*address).as_bytes()))
            }
            ReaderCommand::Write { address, data } => {
                if self.authenticated != Some(address.sector) {
                    return (Status::AuthFailed, Bytes::new());
                }
                if address.is_manufacturer_block() || self.write_protected.contains(&address.sector) {
                    return (Status::WriteProtected, Bytes::new());
                }
                tag.write(*address, *data);
                (Status::Ok, Bytes::new())
            }
            ReaderCommand::Halt => {
                self.selected = false;
                self.authenticated = None;
                (Status::Ok, Bytes::new())
            }
            ReaderCommand::FirmwareVersion => (Status::Ok, firmware_data(&self.firmware)),
        }
    }
}

fn firmware_data(fw: &FirmwareVersion) -> Bytes {
    Bytes::copy_from_slice(&[fw.ic, fw.version, fw.revision, fw.support])
}

#[async_trait]
impl Transport for SimulatedReader {
    async fn open(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        if state.disconnected {
            return Err(Error::DeviceUnavailable("simulated reader unplugged".into()));
        }
        if state.open {
            return Err(Error::AlreadyOpen);
        }
        state.open = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.open = false;
        state.rx.clear();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(Error::NotOpen);
        }
        if state.disconnected {
            return Err(Error::LinkDisconnected);
        }
        state.handle(data);
        Ok(())
    }

    async fn receive(&mut self, expected_len: usize, timeout: Duration) -> Result<BytesMut> {
        let outcome = {
            let mut state = self.state.lock();
            if !state.open {
                return Err(Error::NotOpen);
            }
            if state.disconnected {
                return Err(Error::LinkDisconnected);
            }
            take_exact(&mut state.rx, expected_len)
        };
        deliver(outcome, timeout).await
    }

    fn descriptor(&self) -> String {
        "simulated".into()
    }
}
