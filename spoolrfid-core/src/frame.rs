//! Reader frame structure and encoding/decoding

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

use crate::{
    checksum,
    constants::FRAME_START,
    error::{Error, Result},
};

/// Reader protocol frame
///
/// # Frame Structure
///
/// ```text
/// ┌─────────┬────────────┬──────────┬─────────────┬───────────┬──────────┐
/// │  Start  │ Command ID │ Sequence │ Payload len │  Payload  │ Checksum │
/// │  0xAB   │   1 byte   │  1 byte  │   1 byte    │  N bytes  │  1 byte  │
/// └─────────┴────────────┴──────────┴─────────────┴───────────┴──────────┘
/// ```
///
/// The checksum is the XOR of every preceding byte, start byte included.
///
/// # Examples
///
/// ```
/// use spoolrfid_core::Frame;
///
/// let frame = Frame::new(0x03, 7, vec![1, 2]).unwrap();
/// let encoded = frame.encode();
///
/// let decoded = Frame::decode(&encoded).unwrap();
/// assert_eq!(frame, decoded);
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    command: u8,
    sequence: u8,
    payload: Bytes,
}

impl Frame {
    /// Header size in bytes (start, command, sequence, length)
    pub const HEADER_SIZE: usize = 4;

    /// Trailer size in bytes (checksum)
    pub const TRAILER_SIZE: usize = 1;

    /// Maximum payload size
    pub const MAX_PAYLOAD_SIZE: usize = u8::MAX as usize;

    /// Create a frame, rejecting payloads longer than 255 bytes
    pub fn new(command: u8, sequence: u8, payload: impl Into<Bytes>) -> Result<Self> {
        let payload = payload.into();
        if payload.len() > Self::MAX_PAYLOAD_SIZE {
            return Err(Error::PayloadTooLarge {
                size: payload.len(),
                max: Self::MAX_PAYLOAD_SIZE,
            });
        }
        Ok(Self {
            command,
            sequence,
            payload,
        })
    }

    pub fn command(&self) -> u8 {
        self.command
    }

    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.size());

        buf.put_u8(FRAME_START);
        buf.put_u8(self.command);
        buf.put_u8(self.sequence);
        buf.put_u8(self.payload.len() as u8);
        buf.put_slice(&self.payload);

        let cs = checksum::xor(&buf);
        buf.put_u8(cs);

        buf
    }

    /// Number of bytes that follow a header on the wire
    ///
    /// Used by readers of a byte stream: read [`Frame::HEADER_SIZE`] bytes,
    /// then this many more.
    pub fn remaining_len(header: &[u8]) -> Result<usize> {
        if header.len() < Self::HEADER_SIZE {
            return Err(Error::MalformedFrame(format!(
                "Header too short: {} bytes",
                header.len()
            )));
        }
        if header[0] != FRAME_START {
            return Err(Error::MalformedFrame(format!(
                "Bad start byte 0x{:02X}",
                header[0]
            )));
        }
        Ok(header[3] as usize + Self::TRAILER_SIZE)
    }

    /// Decode exactly one frame
    ///
    /// # Errors
    ///
    /// - `MalformedFrame` if the start byte is wrong, the buffer is shorter
    ///   than a header, or the declared length disagrees with the buffer
    /// - `ChecksumMismatch` if the trailing checksum is wrong
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let min = Self::HEADER_SIZE + Self::TRAILER_SIZE;
        if buf.len() < min {
            return Err(Error::MalformedFrame(format!(
                "Frame too short: expected at least {} bytes, got {}",
                min,
                buf.len()
            )));
        }

        let expected_total = Self::HEADER_SIZE + Self::remaining_len(buf)?;
        if buf.len() != expected_total {
            return Err(Error::MalformedFrame(format!(
                "Length mismatch: header declares {} bytes, got {}",
                expected_total,
                buf.len()
            )));
        }

        let (body, trailer) = buf.split_at(buf.len() - Self::TRAILER_SIZE);
        let received = trailer[0];
        let expected = checksum::xor(body);
        if expected != received {
            return Err(Error::ChecksumMismatch { expected, received });
        }

        Ok(Self {
            command: body[1],
            sequence: body[2],
            payload: Bytes::copy_from_slice(&body[Self::HEADER_SIZE..]),
        })
    }

    /// Get total encoded size
    pub fn size(&self) -> usize {
        Self::HEADER_SIZE + self.payload.len() + Self::TRAILER_SIZE
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("command", &format!("0x{:02X}", self.command))
            .field("sequence", &self.sequence)
            .field("payload", &hex::encode_upper(&self.payload))
            .finish()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Frame[0x{:02X}](seq={}, len={})",
            self.command,
            self.sequence,
            self.payload.len()
        )
    }
}
