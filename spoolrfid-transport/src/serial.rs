//! Serial transport for USB-attached readers
//!
//! Readers enumerate as a USB CDC/serial device and talk 115200 8N1. Port I/O
//! is blocking, so every call runs on tokio's blocking pool.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use serialport::{DataBits, FlowControl, Parity, SerialPort, SerialPortType, StopBits};
use spoolrfid_core::constants::{DEFAULT_BAUD_RATE, DEFAULT_READ_TIMEOUT};
use spoolrfid_types::DeviceInfo;
use tracing::{debug, trace, warn};

use crate::{Transport, error::*};

type SharedPort = Arc<Mutex<OpenPort>>;

/// An open port and the bytes read from it that no receive has taken yet
///
/// Reads land in `pending` first, so bytes read by a receive whose caller
/// gave up are still there for the next one.
struct OpenPort {
    port: Box<dyn SerialPort>,
    pending: BytesMut,
}

/// Where to find a reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub path: String,
    pub baud_rate: u32,
}

impl DeviceDescriptor {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }
}

impl From<&DeviceInfo> for DeviceDescriptor {
    fn from(info: &DeviceInfo) -> Self {
        Self::new(info.path.clone())
    }
}

/// List the serial ports present on this machine
pub fn enumerate() -> Result<Vec<DeviceInfo>> {
    let ports = serialport::available_ports()?;

    Ok(ports
        .into_iter()
        .map(|port| match port.port_type {
            SerialPortType::UsbPort(usb) => DeviceInfo {
                serial_number: usb.serial_number,
                manufacturer: usb.manufacturer,
                product: usb.product,
                ..DeviceInfo::new(port.port_name).with_usb_ids(usb.vid, usb.pid)
            },
            _ => DeviceInfo::new(port.port_name),
        })
        .collect())
}

/// Serial transport
pub struct SerialTransport {
    descriptor: DeviceDescriptor,
    port: Option<SharedPort>,
}

impl SerialTransport {
    pub fn new(descriptor: DeviceDescriptor) -> Self {
        Self {
            descriptor,
            port: None,
        }
    }

    fn port(&self) -> Result<SharedPort> {
        self.port.clone().ok_or(Error::NotOpen)
    }
}

/// Run blocking port I/O off the async runtime
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Io(io::Error::other(e)))?
}

fn map_io(e: io::Error, timeout: Duration) -> Error {
    match e.kind() {
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::NotConnected
        | io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset => Error::LinkDisconnected,
        io::ErrorKind::TimedOut => Error::timeout(timeout),
        _ => Error::Io(e),
    }
}

/// Read until `pending` holds `expected` bytes or the deadline passes
fn fill_within(open: &mut OpenPort, expected: usize, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let mut chunk = [0u8; 64];

    while open.pending.len() < expected {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        open.port.set_timeout(remaining)?;

        let want = (expected - open.pending.len()).min(chunk.len());
        match open.port.read(&mut chunk[..want]) {
            Ok(0) => return Err(Error::LinkDisconnected),
            Ok(n) => open.pending.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(map_io(e, timeout)),
        }
    }
    Ok(())
}

/// Split `expected` bytes off the front of `pending`
///
/// A partial buffer is discarded and reported as a short read.
fn take_pending(pending: &mut BytesMut, expected: usize, timeout: Duration) -> Result<BytesMut> {
    match pending.len() {
        0 => Err(Error::timeout(timeout)),
        n if n < expected => {
            pending.clear();
            Err(Error::ShortRead {
                expected,
                actual: n,
            })
        }
        _ => Ok(pending.split_to(expected)),
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(&mut self) -> Result<()> {
        if self.is_open() {
            return Err(Error::AlreadyOpen);
        }

        let DeviceDescriptor { path, baud_rate } = self.descriptor.clone();
        debug!("Opening {} at {} baud...", path, baud_rate);

        let port = blocking(move || {
            let port = serialport::new(&path, baud_rate)
                .data_bits(DataBits::Eight)
                .parity(Parity::None)
                .stop_bits(StopBits::One)
                .flow_control(FlowControl::None)
                .timeout(DEFAULT_READ_TIMEOUT)
                .open()
                .map_err(|e| Error::DeviceUnavailable(format!("{}: {}", path, e)))?;

            // Drop anything the reader sent before we were listening
            port.clear(serialport::ClearBuffer::All)?;
            Ok(port)
        })
        .await?;

        debug!("Opened {}", self.descriptor.path);

        self.port = Some(Arc::new(Mutex::new(OpenPort {
            port,
            pending: BytesMut::new(),
        })));
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.port.take().is_some() {
            debug!("Closed {}", self.descriptor.path);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let port = self.port()?;

        trace!("Sending {} bytes: {}", data.len(), hex::encode_upper(data));

        let data = data.to_vec();
        blocking(move || {
            let mut open = port.lock();
            open.port
                .write_all(&data)
                .and_then(|_| open.port.flush())
                .map_err(|e| map_io(e, DEFAULT_READ_TIMEOUT))
        })
        .await
    }

    async fn receive(&mut self, expected_len: usize, timeout: Duration) -> Result<BytesMut> {
        let port = self.port()?;

        let filler = Arc::clone(&port);
        let buf = blocking(move || fill_within(&mut filler.lock(), expected_len, timeout))
            .await
            .and_then(|_| take_pending(&mut port.lock().pending, expected_len, timeout))
            .inspect_err(|e| debug!("Receive failed: {}", e))?;

        trace!("Received {} bytes: {}", buf.len(), hex::encode_upper(&buf));

        Ok(buf)
    }

    fn descriptor(&self) -> String {
        self.descriptor.path.clone()
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        if self.is_open() {
            warn!("Serial transport {} dropped while still open", self.descriptor.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_defaults() {
        let descriptor = DeviceDescriptor::new("/dev/ttyUSB0");
        assert_eq!(descriptor.baud_rate, 115_200);
        assert_eq!(descriptor.with_baud_rate(9600).baud_rate, 9600);
    }

    #[test]
    fn test_descriptor_from_device_info() {
        let info = DeviceInfo::new("COM3").with_usb_ids(0x1A86, 0x7523);
        assert_eq!(DeviceDescriptor::from(&info).path, "COM3");
    }

    #[tokio::test]
    async fn test_serial_transport_create() {
        let transport = SerialTransport::new(DeviceDescriptor::new("/dev/ttyUSB0"));
        assert!(!transport.is_open());
        assert_eq!(transport.descriptor(), "/dev/ttyUSB0");
    }

    #[tokio::test]
    async fn test_serial_transport_not_open() {
        let mut transport = SerialTransport::new(DeviceDescriptor::new("/dev/ttyUSB0"));
        assert!(matches!(transport.send(&[0xAB]).await, Err(Error::NotOpen)));
        assert!(matches!(
            transport.receive(4, Duration::from_millis(10)).await,
            Err(Error::NotOpen)
        ));
    }

    #[tokio::test]
    async fn test_serial_transport_missing_device() {
        let mut transport =
            SerialTransport::new(DeviceDescriptor::new("/dev/spoolrfid-no-such-port"));

        let result = transport.open().await;
        assert!(matches!(result, Err(Error::DeviceUnavailable(_))));
        assert!(!transport.is_open());
    }

    #[test]
    fn test_take_pending_keeps_the_rest() {
        let timeout = Duration::from_millis(100);
        let mut pending = BytesMut::from(&[0xAB, 0x81, 0x00, 0x01, 0x00, 0x2B, 0xAB][..]);

        let head = take_pending(&mut pending, 4, timeout).unwrap();
        assert_eq!(&head[..], &[0xAB, 0x81, 0x00, 0x01]);
        assert_eq!(&pending[..], &[0x00, 0x2B, 0xAB]);

        let tail = take_pending(&mut pending, 2, timeout).unwrap();
        assert_eq!(&tail[..], &[0x00, 0x2B]);
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_take_pending_short_and_empty() {
        let timeout = Duration::from_millis(100);
        let mut pending = BytesMut::from(&[0xAB, 0x81][..]);

        assert!(matches!(
            take_pending(&mut pending, 4, timeout),
            Err(Error::ShortRead { expected: 4, actual: 2 })
        ));
        assert!(pending.is_empty());
        assert!(matches!(
            take_pending(&mut pending, 4, timeout),
            Err(Error::LinkTimeout { timeout_ms: 100 })
        ));
    }

    #[test]
    fn test_io_error_mapping() {
        let timeout = Duration::from_secs(1);
        assert!(matches!(
            map_io(io::Error::from(io::ErrorKind::BrokenPipe), timeout),
            Error::LinkDisconnected
        ));
        assert!(matches!(
            map_io(io::Error::from(io::ErrorKind::TimedOut), timeout),
            Error::LinkTimeout { timeout_ms: 1000 }
        ));
        assert!(matches!(
            map_io(io::Error::from(io::ErrorKind::PermissionDenied), timeout),
            Error::Io(_)
        ));
    }
}
