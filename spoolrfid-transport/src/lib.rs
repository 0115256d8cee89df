//! Transport layer for spool RFID readers
//!
//! Moves raw bytes between the host and a reader. Framing is the protocol
//! layer's job: a transport makes no assumption about message boundaries.

pub mod error;
pub mod link;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod serial;
#[cfg(any(test, feature = "test-util"))]
pub mod sim;

pub use error::{Error, Result};
pub use link::{Link, LinkConfig};
#[cfg(any(test, feature = "test-util"))]
pub use mock::MockTransport;
pub use serial::{DeviceDescriptor, SerialTransport};
#[cfg(any(test, feature = "test-util"))]
pub use sim::{SimulatedReader, SimulatedTag};

use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;

/// Byte transport to a reader device
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the device
    ///
    /// Fails with [`Error::DeviceUnavailable`] if the device cannot be opened.
    async fn open(&mut self) -> Result<()>;

    /// Close the device, releasing the OS handle
    async fn close(&mut self) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Send raw bytes
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Receive exactly `expected_len` bytes
    ///
    /// Fails with `LinkTimeout` if nothing arrives within `timeout`, and with
    /// `ShortRead` if fewer than `expected_len` bytes arrive.
    async fn receive(&mut self, expected_len: usize, timeout: Duration) -> Result<BytesMut>;

    /// Human-readable device description (e.g. port path)
    fn descriptor(&self) -> String;
}
