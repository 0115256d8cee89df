//! Reader command/response definitions
//!
//! Every request is a [`ReaderCommand`] variant with an explicit payload
//! shape. Every answer is a [`ReaderResponse`] carrying the request's command
//! id with [`RESPONSE_FLAG`] set, the request's sequence number, a
//! [`Status`] byte and an optional command-specific payload.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use spoolrfid_types::{BlockAddress, FirmwareVersion, KeyType, RawBlock, SectorKey, TagUid};
use spoolrfid_types::tag::{BLOCK_SIZE, SECTOR_COUNT};

use crate::{
    constants::RESPONSE_FLAG,
    error::{Error, Result},
    frame::Frame,
};

/// Command identifiers understood by the reader firmware
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandId {
    /// Poll for a tag in the field and select it
    Detect = 0x01,
    /// Authenticate a sector with a key
    Auth = 0x02,
    /// Read one block
    Read = 0x03,
    /// Write one block
    Write = 0x04,
    /// Put the selected tag to sleep
    Halt = 0x05,
    /// Query reader firmware version
    FirmwareVersion = 0x06,
}

impl CommandId {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Detect => "DETECT",
            Self::Auth => "AUTH",
            Self::Read => "READ",
            Self::Write => "WRITE",
            Self::Halt => "HALT",
            Self::FirmwareVersion => "FIRMWARE_VERSION",
        }
    }

    /// Command id used in the response frame
    pub fn response_code(&self) -> u8 {
        *self as u8 | RESPONSE_FLAG
    }

    /// Parse the command id of a response frame
    pub fn from_response_code(code: u8) -> Result<Self> {
        if code & RESPONSE_FLAG == 0 {
            return Err(Error::MalformedFrame(format!(
                "Command id 0x{:02X} is not a response",
                code
            )));
        }
        Self::try_from(code & !RESPONSE_FLAG)
            .map_err(|_| Error::MalformedFrame(format!("Unknown response id 0x{:02X}", code)))
    }
}

impl From<CommandId> for u8 {
    fn from(id: CommandId) -> u8 {
        id as u8
    }
}

impl TryFrom<u8> for CommandId {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Detect),
            0x02 => Ok(Self::Auth),
            0x03 => Ok(Self::Read),
            0x04 => Ok(Self::Write),
            0x05 => Ok(Self::Halt),
            0x06 => Ok(Self::FirmwareVersion),
            _ => Err(Error::UnknownCommand(value)),
        }
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(0x{:02X})", self.name(), *self as u8)
    }
}

/// Response status reported by the reader
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    Ok = 0x00,
    AuthFailed = 0x01,
    NoTag = 0x02,
    WriteProtected = 0x03,
    UnknownCommand = 0x04,
}

impl Status {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Ok)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::AuthFailed => "AUTH_FAILED",
            Self::NoTag => "NO_TAG",
            Self::WriteProtected => "WRITE_PROTECTED",
            Self::UnknownCommand => "UNKNOWN_COMMAND",
        }
    }
}

impl TryFrom<u8> for Status {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(Self::Ok),
            0x01 => Ok(Self::AuthFailed),
            0x02 => Ok(Self::NoTag),
            0x03 => Ok(Self::WriteProtected),
            0x04 => Ok(Self::UnknownCommand),
            _ => Err(Error::MalformedFrame(format!("Unknown status 0x{:02X}", value))),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A request to the reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderCommand {
    Detect,
    Auth {
        sector: u8,
        key_type: KeyType,
        key: SectorKey,
    },
    Read {
        address: BlockAddress,
    },
    Write {
        address: BlockAddress,
        data: RawBlock,
    },
    Halt,
    FirmwareVersion,
}

impl ReaderCommand {
    pub fn id(&self) -> CommandId {
        match self {
            Self::Detect => CommandId::Detect,
            Self::Auth { .. } => CommandId::Auth,
            Self::Read { .. } => CommandId::Read,
            Self::Write { .. } => CommandId::Write,
            Self::Halt => CommandId::Halt,
            Self::FirmwareVersion => CommandId::FirmwareVersion,
        }
    }

    /// Command payload
    ///
    /// - `Auth`: `sector, key type, key[6]`
    /// - `Read`: `sector, block`
    /// - `Write`: `sector, block, data[16]`
    /// - others: empty
    pub fn payload(&self) -> Bytes {
        match self {
            Self::Detect | Self::Halt | Self::FirmwareVersion => Bytes::new(),
            Self::Auth { sector, key_type, key } => {
                let mut buf = BytesMut::with_capacity(2 + SectorKey::LEN);
                buf.put_u8(*sector);
                buf.put_u8(*key_type as u8);
                buf.put_slice(key.as_bytes());
                buf.freeze()
            }
            Self::Read { address } => Bytes::copy_from_slice(&[address.sector, address.block]),
            Self::Write { address, data } => {
                let mut buf = BytesMut::with_capacity(2 + BLOCK_SIZE);
                buf.put_u8(address.sector);
                buf.put_u8(address.block);
                buf.put_slice(data.as_bytes());
                buf.freeze()
            }
        }
    }

    pub fn to_frame(&self, sequence: u8) -> Result<Frame> {
        Frame::new(self.id().into(), sequence, self.payload())
    }

    /// Encode as a wire frame with the given sequence number
    pub fn encode(&self, sequence: u8) -> Result<BytesMut> {
        Ok(self.to_frame(sequence)?.encode())
    }

    /// Parse a request frame (reader side)
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let id = CommandId::try_from(frame.command())?;
        let payload = frame.payload();

        let expect_len = |len: usize| {
            if payload.len() == len {
                Ok(())
            } else {
                Err(Error::MalformedFrame(format!(
                    "{} payload must be {} bytes, got {}",
                    id.name(),
                    len,
                    payload.len()
                )))
            }
        };

        match id {
            CommandId::Detect => expect_len(0).map(|_| Self::Detect),
            CommandId::Halt => expect_len(0).map(|_| Self::Halt),
            CommandId::FirmwareVersion => expect_len(0).map(|_| Self::FirmwareVersion),
            CommandId::Auth => {
                expect_len(2 + SectorKey::LEN)?;
                let sector = payload[0];
                if sector >= SECTOR_COUNT {
                    return Err(Error::MalformedFrame(format!("Sector {} out of range", sector)));
                }
                let key_type = KeyType::try_from(payload[1])
                    .map_err(|e| Error::MalformedFrame(e.to_string()))?;
                let key = SectorKey::from_slice(&payload[2..])?;
                Ok(Self::Auth { sector, key_type, key })
            }
            CommandId::Read => {
                expect_len(2)?;
                let address = BlockAddress::new(payload[0], payload[1])
                    .map_err(|e| Error::MalformedFrame(e.to_string()))?;
                Ok(Self::Read { address })
            }
            CommandId::Write => {
                expect_len(2 + BLOCK_SIZE)?;
                let address = BlockAddress::new(payload[0], payload[1])
                    .map_err(|e| Error::MalformedFrame(e.to_string()))?;
                let data = RawBlock::from_slice(&payload[2..])?;
                Ok(Self::Write { address, data })
            }
        }
    }
}

impl fmt::Display for ReaderCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auth { sector, key_type, .. } => write!(f, "AUTH(S{}, {:?})", sector, key_type),
            Self::Read { address } => write!(f, "READ({})", address),
            Self::Write { address, .. } => write!(f, "WRITE({})", address),
            other => f.write_str(other.id().name()),
        }
    }
}

/// Tag selected by a `Detect` command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectedTag {
    pub uid: TagUid,
    pub atqa: u16,
    pub sak: u8,
}

impl DetectedTag {
    /// Detect response data: `atqa[2] (BE), sak, uid_len, uid`
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + TagUid::LEN);
        buf.put_u16(self.atqa);
        buf.put_u8(self.sak);
        buf.put_u8(TagUid::LEN as u8);
        buf.put_slice(self.uid.as_bytes());
        buf.freeze()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::MalformedFrame(format!(
                "Detect data too short: {} bytes",
                data.len()
            )));
        }
        let uid_len = data[3] as usize;
        if data.len() != 4 + uid_len {
            return Err(Error::MalformedFrame(format!(
                "Detect data declares {}-byte UID, got {} bytes",
                uid_len,
                data.len() - 4
            )));
        }
        let uid = TagUid::from_slice(&data[4..])?;
        Ok(Self {
            uid,
            atqa: u16::from_be_bytes([data[0], data[1]]),
            sak: data[2],
        })
    }
}

/// A response from the reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderResponse {
    pub command: CommandId,
    pub sequence: u8,
    pub status: Status,
    pub data: Bytes,
}

impl ReaderResponse {
    pub fn new(command: CommandId, sequence: u8, status: Status, data: impl Into<Bytes>) -> Self {
        Self {
            command,
            sequence,
            status,
            data: data.into(),
        }
    }

    /// Response with a non-OK status and no data
    pub fn status_only(command: CommandId, sequence: u8, status: Status) -> Self {
        Self::new(command, sequence, status, Bytes::new())
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_success()
    }

    pub fn to_frame(&self) -> Result<Frame> {
        let mut payload = BytesMut::with_capacity(1 + self.data.len());
        payload.put_u8(self.status as u8);
        payload.put_slice(&self.data);
        Frame::new(self.command.response_code(), self.sequence, payload.freeze())
    }

    pub fn encode(&self) -> Result<BytesMut> {
        Ok(self.to_frame()?.encode())
    }

    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let command = CommandId::from_response_code(frame.command())?;
        let payload = frame.payload();
        let (&status, data) = payload
            .split_first()
            .ok_or_else(|| Error::MalformedFrame("Response without status byte".into()))?;

        Ok(Self {
            command,
            sequence: frame.sequence(),
            status: Status::try_from(status)?,
            data: Bytes::copy_from_slice(data),
        })
    }

    /// Decode a complete response frame
    pub fn decode(buf: &[u8]) -> Result<Self> {
        Self::from_frame(&Frame::decode(buf)?)
    }

    /// Check that this response answers `command` sent with `sequence`
    pub fn check_reply_to(&self, command: CommandId, sequence: u8) -> Result<()> {
        if self.sequence != sequence {
            return Err(Error::SequenceMismatch {
                expected: sequence,
                actual: self.sequence,
            });
        }
        if self.command != command {
            return Err(Error::UnexpectedResponse {
                expected: command,
                actual: self.command,
            });
        }
        Ok(())
    }

    /// Parse the data of a `Detect` response
    pub fn detected_tag(&self) -> Result<DetectedTag> {
        DetectedTag::from_bytes(&self.data)
    }

    /// Parse the data of a `Read` response
    pub fn block(&self) -> Result<RawBlock> {
        RawBlock::from_slice(&self.data).map_err(|_| {
            Error::MalformedFrame(format!(
                "Read data must be {} bytes, got {}",
                BLOCK_SIZE,
                self.data.len()
            ))
        })
    }

    /// Parse the data of a `FirmwareVersion` response
    pub fn firmware_version(&self) -> Result<FirmwareVersion> {
        match self.data.as_ref() {
            [ic, version, revision, support] => Ok(FirmwareVersion {
                ic: *ic,
                version: *version,
                revision: *revision,
                support: *support,
            }),
            other => Err(Error::MalformedFrame(format!(
                "Firmware version data must be 4 bytes, got {}",
                other.len()
            ))),
        }
    }
}

impl fmt::Display for ReaderResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Response[{}](seq={}, status={}, len={})",
            self.command.name(),
            self.sequence,
            self.status,
            self.data.len()
        )
    }
}
