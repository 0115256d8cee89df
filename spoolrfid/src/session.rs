//! Spool sessions
//!
//! A [`SpoolSession`] is one exclusive detect-through-halt interaction with a
//! tag. It drives the reader through an explicit state machine:
//!
//! ```text
//! Idle ─► Detecting ─► Authenticating{s} ─► Reading{s,b} ─► Decoding ─► Ready
//!                            ▲                  │
//!                            └──── next sector ─┘
//!
//! Ready ─► WriteRequested ─► Writing{s,b} ─► Verifying ─► Ready
//!
//! any ─► Failed(reason)   (terminal)
//! ```
//!
//! Sectors still on the factory transport key are opened with it: a read
//! reports their fields invalid, and a write provisions them with the keys
//! derived for the tag. [`SpoolSession::erase_spool`] puts them back.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use spoolrfid_core::constants::mifare::SAK_CLASSIC_1K;
use spoolrfid_core::tag::layout::{self, SPOOL_SECTORS, TRAILER_BLOCK};
use spoolrfid_core::{
    DetectedTag, KeyDerivation, ReaderCommand, ReaderResponse, SectorKeys, Status,
    TagImage, decode_image, encode_record,
};
use spoolrfid_transport::Transport;
use spoolrfid_types::tag::BLOCKS_PER_SECTOR;
use spoolrfid_types::{
    BlockAddress, FieldSet, FirmwareVersion, KeyType, RawBlock, SectorKey, SpoolFields,
    SpoolRecord, TagUid,
};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::reader::ReaderLink;

/// Why a session failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailReason {
    LinkTimeout,
    LinkDisconnected,
    ShortRead,
    NoTag,
    TagRemoved,
    UnsupportedTag,
    AuthFailed,
    WriteProtected,
    VerifyFailed,
    Protocol(String),
    Cancelled,
}

impl FailReason {
    /// Terminal reason for an error, `None` if the session survives it
    pub fn from_error(error: &Error) -> Option<Self> {
        use spoolrfid_transport::Error as Link;

        let reason = match error {
            Error::Transport(Link::LinkTimeout { .. }) => Self::LinkTimeout,
            Error::Transport(Link::ShortRead { .. }) => Self::ShortRead,
            Error::Transport(_) => Self::LinkDisconnected,
            Error::Core(e) if e.is_encoding_error() => return None,
            Error::Core(e) => Self::Protocol(e.to_string()),
            Error::Types(e) => Self::Protocol(e.to_string()),
            Error::UnsupportedCommand(id) => Self::Protocol(format!("{} not supported", id)),
            Error::NoTag => Self::NoTag,
            Error::TagRemoved => Self::TagRemoved,
            Error::UnsupportedTag { .. } => Self::UnsupportedTag,
            Error::AuthFailed { .. } => Self::AuthFailed,
            Error::WriteProtected { .. } => Self::WriteProtected,
            Error::VerifyFailed(_) => Self::VerifyFailed,
            Error::Cancelled => Self::Cancelled,
            Error::Failed(reason) => reason.clone(),
            Error::DeviceBusy | Error::InvalidSessionState(_) | Error::RegistryInitialized => {
                return None;
            }
        };
        Some(reason)
    }

    /// The link itself is unusable
    fn is_link_failure(&self) -> bool {
        matches!(self, Self::LinkTimeout | Self::LinkDisconnected | Self::ShortRead)
    }
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LinkTimeout => f.write_str("reader did not respond"),
            Self::LinkDisconnected => f.write_str("reader disconnected"),
            Self::ShortRead => f.write_str("truncated response"),
            Self::NoTag => f.write_str("no tag present"),
            Self::TagRemoved => f.write_str("tag removed"),
            Self::UnsupportedTag => f.write_str("unsupported tag"),
            Self::AuthFailed => f.write_str("authentication failed"),
            Self::WriteProtected => f.write_str("write protected"),
            Self::VerifyFailed => f.write_str("verification failed"),
            Self::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Session state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Detecting,
    Authenticating { sector: u8 },
    Reading { sector: u8, block: u8 },
    Decoding,
    Ready,
    WriteRequested,
    Writing { sector: u8, block: u8 },
    Verifying,
    Failed(FailReason),
}

impl SessionState {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("Idle"),
            Self::Detecting => f.write_str("Detecting"),
            Self::Authenticating { sector } => write!(f, "Authenticating(S{})", sector),
            Self::Reading { sector, block } => write!(f, "Reading(S{}B{})", sector, block),
            Self::Decoding => f.write_str("Decoding"),
            Self::Ready => f.write_str("Ready"),
            Self::WriteRequested => f.write_str("WriteRequested"),
            Self::Writing { sector, block } => write!(f, "Writing(S{}B{})", sector, block),
            Self::Verifying => f.write_str("Verifying"),
            Self::Failed(reason) => write!(f, "Failed({})", reason),
        }
    }
}

/// Cooperative cancellation flag
///
/// Checked after every block read, and after each sector a write or erase
/// has finished, trailer included. The command in flight always completes
/// or times out first.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Observer for a running session, usable from other tasks
#[derive(Debug, Clone)]
pub struct SessionHandle {
    state: Arc<RwLock<SessionState>>,
    cancel: CancelToken,
}

impl SessionHandle {
    pub fn state(&self) -> SessionState {
        self.state.read().clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }
}

/// Exclusive session on a reader
///
/// Holds the reader until [`end`](Self::end) is called or the session is
/// dropped.
pub struct SpoolSession<T: Transport> {
    link: OwnedMutexGuard<ReaderLink<T>>,
    kdf: KeyDerivation,
    state: Arc<RwLock<SessionState>>,
    cancel: CancelToken,
    record: Option<SpoolRecord>,
    image: Option<TagImage>,
    ended: bool,
}

impl<T: Transport> SpoolSession<T> {
    pub(crate) fn new(link: OwnedMutexGuard<ReaderLink<T>>, kdf: KeyDerivation) -> Self {
        Self {
            link,
            kdf,
            state: Arc::new(RwLock::new(SessionState::Idle)),
            cancel: CancelToken::new(),
            record: None,
            image: None,
            ended: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state.read().clone()
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            state: Arc::clone(&self.state),
            cancel: self.cancel.clone(),
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Record produced by the last successful read or write
    pub fn record(&self) -> Option<&SpoolRecord> {
        self.record.as_ref()
    }

    /// Raw sectors behind [`record`](Self::record)
    pub fn last_image(&self) -> Option<&TagImage> {
        self.image.as_ref()
    }

    /// Read and decode the tag in the field
    ///
    /// Sectors that refuse authentication, fail their checksum or are still
    /// blank leave their fields invalid in the returned record. Allowed from
    /// `Idle` and `Ready`.
    pub async fn read_spool(&mut self) -> Result<SpoolRecord> {
        self.ensure_state(|s| matches!(s, SessionState::Idle | SessionState::Ready), "read")?;
        let result = self.run_read().await;
        self.settle(result)
    }

    /// Write `record` onto the tag that was last read, then verify it
    ///
    /// Blank sectors are keyed for the tag as they are written.
    ///
    /// Allowed from `Ready` only. Returns the record as re-read from the tag.
    ///
    /// # Errors
    ///
    /// - `Core(FieldOutOfRange | MissingField)` before anything is sent; the
    ///   session stays `Ready`
    /// - `VerifyFailed` if the re-read differs from `record`
    pub async fn write_spool(&mut self, record: &SpoolRecord) -> Result<SpoolRecord> {
        self.ensure_state(|s| matches!(s, SessionState::Ready), "write")?;
        let target = match &self.record {
            Some(last) => last.uid(),
            None => return Err(Error::InvalidSessionState("no tag read".into())),
        };

        self.transition(SessionState::WriteRequested);
        let image = match encode_record(record) {
            Ok(image) => image,
            Err(e) => {
                debug!(error = %e, "Record rejected before write");
                self.transition(SessionState::Ready);
                return Err(e.into());
            }
        };

        let result = self.run_write(target, &image, record).await;
        self.settle(result)
    }

    /// Return the tag that was last read to its factory state
    ///
    /// Zeroes the data blocks of the spool sectors and puts the transport key
    /// back in their trailers. Allowed from `Ready`; the session stays
    /// `Ready` with an empty record, so the tag can be written again at once.
    ///
    /// # Errors
    ///
    /// - `VerifyFailed` with the fields of every sector that did not read
    ///   back blank
    pub async fn erase_spool(&mut self) -> Result<SpoolRecord> {
        self.ensure_state(|s| matches!(s, SessionState::Ready), "erase")?;
        let target = match &self.record {
            Some(last) => last.uid(),
            None => return Err(Error::InvalidSessionState("no tag read".into())),
        };

        self.transition(SessionState::WriteRequested);
        let result = self.run_erase(target).await;
        self.settle(result)
    }

    /// Query the reader firmware version
    pub async fn firmware_version(&mut self) -> Result<FirmwareVersion> {
        self.ensure_state(|_| true, "query firmware")?;
        let result = self.query_firmware().await;
        self.settle(result)
    }

    /// Halt the tag and release the reader
    pub async fn end(mut self) -> Result<()> {
        self.ended = true;

        let skip_halt = matches!(self.state(), SessionState::Failed(reason) if reason.is_link_failure());
        if !skip_halt {
            if let Err(e) = self.link.execute(&ReaderCommand::Halt).await {
                debug!(error = %e, "Halt failed");
            }
        }

        if !self.state().is_failed() {
            self.transition(SessionState::Idle);
        }
        info!("Session ended");
        Ok(())
    }

    fn transition(&self, next: SessionState) {
        let mut state = self.state.write();
        debug!(from = %*state, to = %next, "Session state");
        *state = next;
    }

    fn ensure_state(&self, allowed: impl Fn(&SessionState) -> bool, operation: &str) -> Result<()> {
        let state = self.state();
        if let SessionState::Failed(reason) = state {
            return Err(Error::Failed(reason));
        }
        if !allowed(&state) {
            return Err(Error::InvalidSessionState(format!(
                "cannot {} while {}",
                operation, state
            )));
        }
        Ok(())
    }

    /// Move to `Failed` on a terminal error
    fn settle<R>(&mut self, result: Result<R>) -> Result<R> {
        if let Err(e) = &result {
            if let Some(reason) = FailReason::from_error(e) {
                warn!(error = %e, "Session failed");
                self.record = None;
                self.image = None;
                self.transition(SessionState::Failed(reason));
            }
        }
        result
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    async fn run_read(&mut self) -> Result<SpoolRecord> {
        self.transition(SessionState::Detecting);
        let tag = self.detect(Error::NoTag).await?;
        let keys = self.kdf.derive(&tag.uid)?;

        let mut image = TagImage::new(tag.uid);
        let mut opened = 0;
        for sector in SPOOL_SECTORS {
            self.transition(SessionState::Authenticating { sector });
            match self.open_sector(tag.uid, sector, &keys).await {
                Ok(SectorAccess::Spool) => opened += 1,
                Ok(SectorAccess::Blank) => {
                    debug!(uid = %tag.uid, sector, "Sector is blank, fields invalid");
                    opened += 1;
                    continue;
                }
                Err(Error::AuthFailed { sector }) => {
                    warn!(uid = %tag.uid, sector, "Sector refused authentication, fields invalid");
                    continue;
                }
                Err(e) => return Err(e),
            }

            let mut blocks = [RawBlock::ZERO; 4];
            for block in 0..BLOCKS_PER_SECTOR {
                self.transition(SessionState::Reading { sector, block });
                blocks[block as usize] = self.read_block(BlockAddress { sector, block }).await?;
                self.check_cancelled()?;
            }
            image.insert_sector(sector, blocks);
        }

        if opened == 0 {
            return Err(Error::Failed(FailReason::AuthFailed));
        }

        self.transition(SessionState::Decoding);
        let record = decode_image(&image);

        info!(
            uid = %record.uid(),
            valid = record.validity().bits().count_ones(),
            "Spool read"
        );

        self.image = Some(image);
        self.record = Some(record.clone());
        self.transition(SessionState::Ready);
        Ok(record)
    }

    async fn run_write(
        &mut self,
        target: TagUid,
        image: &TagImage,
        record: &SpoolRecord,
    ) -> Result<SpoolRecord> {
        self.select(target).await?;
        let keys = self.kdf.derive(&target)?;

        for (sector, blocks) in image.sectors() {
            if self.open_sector(target, sector, &keys).await? == SectorAccess::Blank {
                info!(uid = %target, sector, "Provisioning blank sector");
            }

            for block in layout::writable_blocks(sector) {
                self.transition(SessionState::Writing { sector, block });
                self.write_block(BlockAddress { sector, block }, blocks[block as usize]).await?;
            }

            let trailer = layout::trailer_block(
                &keys.key_a(sector)?,
                &keys.key_b(sector)?,
                layout::stored_checksum(&blocks[TRAILER_BLOCK as usize]),
            );
            self.transition(SessionState::Writing { sector, block: TRAILER_BLOCK });
            self.write_block(BlockAddress { sector, block: TRAILER_BLOCK }, trailer).await?;
            self.check_cancelled()?;
        }

        self.transition(SessionState::Verifying);
        let written = self.read_back(target, &keys).await?;
        let verified = decode_image(&written);

        let mismatched = verified.fields().differing(record.fields(), FieldSet::all());
        if !mismatched.is_empty() {
            warn!(uid = %target, fields = ?mismatched, "Tag does not hold what was written");
            return Err(Error::VerifyFailed(mismatched));
        }

        info!(uid = %target, "Spool written");

        self.image = Some(written);
        self.record = Some(verified.clone());
        self.transition(SessionState::Ready);
        Ok(verified)
    }

    async fn run_erase(&mut self, target: TagUid) -> Result<SpoolRecord> {
        self.select(target).await?;
        let keys = self.kdf.derive(&target)?;
        let blank_trailer = layout::trailer_block(&SectorKey::DEFAULT, &SectorKey::DEFAULT, 0);

        for sector in SPOOL_SECTORS {
            self.open_sector(target, sector, &keys).await?;

            for block in layout::writable_blocks(sector) {
                self.transition(SessionState::Writing { sector, block });
                self.write_block(BlockAddress { sector, block }, RawBlock::ZERO).await?;
            }
            self.transition(SessionState::Writing { sector, block: TRAILER_BLOCK });
            self.write_block(BlockAddress { sector, block: TRAILER_BLOCK }, blank_trailer).await?;
            self.check_cancelled()?;
        }

        self.transition(SessionState::Verifying);
        let mut residue = FieldSet::empty();
        for sector in SPOOL_SECTORS {
            match self.authenticate(sector, SectorKey::DEFAULT).await {
                Ok(()) => {}
                Err(Error::AuthFailed { .. }) => {
                    residue |= layout::fields_in(sector);
                    self.select(target).await?;
                    continue;
                }
                Err(e) => return Err(e),
            }
            for block in layout::writable_blocks(sector) {
                if self.read_block(BlockAddress { sector, block }).await? != RawBlock::ZERO {
                    residue |= layout::fields_in(sector);
                    break;
                }
            }
        }
        if !residue.is_empty() {
            warn!(uid = %target, fields = ?residue, "Tag did not read back blank");
            return Err(Error::VerifyFailed(residue));
        }

        info!(uid = %target, "Spool erased");

        let record = SpoolRecord::new(target, SpoolFields::default());
        self.image = Some(TagImage::new(target));
        self.record = Some(record.clone());
        self.transition(SessionState::Ready);
        Ok(record)
    }

    async fn read_back(&mut self, uid: TagUid, keys: &SectorKeys) -> Result<TagImage> {
        let mut image = TagImage::new(uid);
        for sector in SPOOL_SECTORS {
            self.authenticate(sector, keys.key_a(sector)?).await?;
            let mut blocks = [RawBlock::ZERO; 4];
            for block in 0..BLOCKS_PER_SECTOR {
                blocks[block as usize] = self.read_block(BlockAddress { sector, block }).await?;
            }
            image.insert_sector(sector, blocks);
        }
        Ok(image)
    }

    async fn query_firmware(&mut self) -> Result<FirmwareVersion> {
        let response = self.link.execute(&ReaderCommand::FirmwareVersion).await?;
        let response = expect_ok(response, None)?;
        Ok(response.firmware_version()?)
    }

    /// Detect the tag in the field; `absent` is returned when there is none
    async fn detect(&mut self, absent: Error) -> Result<DetectedTag> {
        let response = self.link.execute(&ReaderCommand::Detect).await?;
        if response.status == Status::NoTag {
            return Err(absent);
        }
        let tag = expect_ok(response, None)?.detected_tag()?;

        if tag.sak != SAK_CLASSIC_1K {
            return Err(Error::UnsupportedTag { sak: tag.sak });
        }
        debug!(uid = %tag.uid, "Tag detected");
        Ok(tag)
    }

    /// Detect again and make sure it is still `uid` in the field
    async fn select(&mut self, uid: TagUid) -> Result<()> {
        let tag = self.detect(Error::TagRemoved).await?;
        if tag.uid != uid {
            warn!(expected = %uid, found = %tag.uid, "Different tag in field");
            return Err(Error::TagRemoved);
        }
        Ok(())
    }

    /// Authenticate with the tag's derived key, then with the transport key
    ///
    /// A refused attempt halts the tag, so it is selected again after each
    /// one. `AuthFailed` means neither key opened the sector.
    async fn open_sector(
        &mut self,
        uid: TagUid,
        sector: u8,
        keys: &SectorKeys,
    ) -> Result<SectorAccess> {
        let attempts = [
            (keys.key_a(sector)?, SectorAccess::Spool),
            (SectorKey::DEFAULT, SectorAccess::Blank),
        ];
        for (key, access) in attempts {
            match self.authenticate(sector, key).await {
                Ok(()) => return Ok(access),
                Err(Error::AuthFailed { .. }) => self.select(uid).await?,
                Err(e) => return Err(e),
            }
        }
        Err(Error::AuthFailed { sector })
    }

    async fn authenticate(&mut self, sector: u8, key: SectorKey) -> Result<()> {
        let command = ReaderCommand::Auth {
            sector,
            key_type: KeyType::A,
            key,
        };
        let response = self.link.execute(&command).await?;
        expect_ok(response, Some(BlockAddress { sector, block: 0 }))?;
        Ok(())
    }

    async fn read_block(&mut self, address: BlockAddress) -> Result<RawBlock> {
        let response = self.link.execute(&ReaderCommand::Read { address }).await?;
        Ok(expect_ok(response, Some(address))?.block()?)
    }

    async fn write_block(&mut self, address: BlockAddress, data: RawBlock) -> Result<()> {
        let response = self.link.execute(&ReaderCommand::Write { address, data }).await?;
        expect_ok(response, Some(address))?;
        Ok(())
    }
}

/// Which key opened a sector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SectorAccess {
    /// Key derived for the tag
    Spool,
    /// Factory transport key
    Blank,
}

/// Turn a non-OK status into an error
///
/// `NoTag` here means the tag left the field after it was detected.
fn expect_ok(response: ReaderResponse, address: Option<BlockAddress>) -> Result<ReaderResponse> {
    let sector = address.map(|a| a.sector).unwrap_or_default();
    match response.status {
        Status::Ok => Ok(response),
        Status::NoTag => Err(Error::TagRemoved),
        Status::AuthFailed => Err(Error::AuthFailed { sector }),
        Status::WriteProtected => Err(Error::WriteProtected {
            sector,
            block: address.map(|a| a.block).unwrap_or_default(),
        }),
        Status::UnknownCommand => Err(Error::UnsupportedCommand(response.command)),
    }
}

impl<T: Transport> Drop for SpoolSession<T> {
    fn drop(&mut self) {
        if !self.ended {
            warn!(state = %self.state(), "Session dropped without end(), tag not halted");
        }
    }
}
