//! Reader device handle

use std::sync::Arc;
use std::time::Duration;

use spoolrfid_core::constants::MAX_LATE_RESPONSES;
use spoolrfid_core::sequence::precedes;
use spoolrfid_core::{Frame, KeyDerivation, ReaderCommand, ReaderResponse, SequenceCounter};
use spoolrfid_transport::{DeviceDescriptor, Link, LinkConfig, SerialTransport, Transport};
use tokio::sync::Mutex;
use tracing::{debug, info, trace};

use crate::error::{Error, Result};
use crate::session::SpoolSession;

/// What `start_session` does when another session holds the reader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcquirePolicy {
    /// Fail immediately with [`Error::DeviceBusy`]
    #[default]
    Reject,

    /// Wait up to the given time, then fail with [`Error::DeviceBusy`]
    Wait(Duration),
}

/// Link plus the sequence numbers of the commands sent over it
pub(crate) struct ReaderLink<T: Transport> {
    link: Link<T>,
    sequence: SequenceCounter,
}

impl<T: Transport> ReaderLink<T> {
    pub(crate) async fn open(&mut self) -> Result<()> {
        if !self.link.is_open() {
            debug!("Opening reader {}...", self.link.descriptor());
            self.link.open().await?;
            self.sequence.reset();
        }
        Ok(())
    }

    pub(crate) async fn close(&mut self) -> Result<()> {
        self.link.close().await?;
        Ok(())
    }

    /// Send one command and wait for its response
    ///
    /// The response must carry the command's sequence number and id; the
    /// status is left for the caller to interpret. Replies that arrive late
    /// for earlier commands, such as one whose receive timed out, are skipped.
    pub(crate) async fn execute(&mut self, command: &ReaderCommand) -> Result<ReaderResponse> {
        let sequence = self.sequence.next();
        let frame = command.encode(sequence)?;

        trace!(%command, sequence, "Sending command");
        self.link.send(&frame).await?;

        let mut skipped = 0;
        loop {
            let response = self.receive_response().await?;
            if skipped < MAX_LATE_RESPONSES && precedes(response.sequence, sequence) {
                skipped += 1;
                debug!(
                    expected = sequence,
                    actual = response.sequence,
                    "Skipping late response"
                );
                continue;
            }

            response.check_reply_to(command.id(), sequence)?;
            trace!(%response, "Received response");
            return Ok(response);
        }
    }

    async fn receive_response(&mut self) -> Result<ReaderResponse> {
        let mut buf = self.link.receive(Frame::HEADER_SIZE).await?;
        let remaining = Frame::remaining_len(&buf)?;
        let tail = self.link.receive(remaining).await?;
        buf.extend_from_slice(&tail);

        Ok(ReaderResponse::decode(&buf)?)
    }
}

/// Handle to one physical reader
///
/// Cheap to clone; clones refer to the same device. At most one
/// [`SpoolSession`] is active per reader at a time.
///
/// # Examples
///
/// ```no_run
/// use spoolrfid::{DeviceDescriptor, Reader};
///
/// #[tokio::main]
/// async fn main() -> spoolrfid::Result<()> {
///     let reader = Reader::serial(DeviceDescriptor::new("/dev/ttyUSB0"));
///
///     let mut session = reader.start_session().await?;
///     let record = session.read_spool().await?;
///     println!("{}", record);
///     session.end().await?;
///
///     Ok(())
/// }
/// ```
pub struct Reader<T: Transport> {
    inner: Arc<Mutex<ReaderLink<T>>>,
    kdf: KeyDerivation,
    policy: AcquirePolicy,
    descriptor: String,
}

impl<T: Transport> Clone for Reader<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            kdf: self.kdf.clone(),
            policy: self.policy,
            descriptor: self.descriptor.clone(),
        }
    }
}

impl Reader<SerialTransport> {
    /// Reader on a serial port
    pub fn serial(descriptor: DeviceDescriptor) -> Self {
        Self::new(SerialTransport::new(descriptor))
    }
}

impl<T: Transport> Reader<T> {
    pub fn new(transport: T) -> Self {
        Self::with_link_config(transport, LinkConfig::default())
    }

    pub fn with_link_config(transport: T, config: LinkConfig) -> Self {
        let descriptor = transport.descriptor();
        Self {
            inner: Arc::new(Mutex::new(ReaderLink {
                link: Link::with_config(transport, config),
                sequence: SequenceCounter::new(),
            })),
            kdf: KeyDerivation::default(),
            policy: AcquirePolicy::default(),
            descriptor,
        }
    }

    pub fn with_acquire_policy(mut self, policy: AcquirePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Use a different master value for sector key derivation
    pub fn with_master_key(mut self, master_key: [u8; 16]) -> Self {
        self.kdf = KeyDerivation::new(master_key);
        self
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    /// Whether a session currently holds the reader
    pub fn is_busy(&self) -> bool {
        self.inner.try_lock().is_err()
    }

    async fn acquire(&self) -> Result<tokio::sync::OwnedMutexGuard<ReaderLink<T>>> {
        let inner = Arc::clone(&self.inner);
        match self.policy {
            AcquirePolicy::Reject => inner.try_lock_owned().map_err(|_| Error::DeviceBusy),
            AcquirePolicy::Wait(limit) => tokio::time::timeout(limit, inner.lock_owned())
                .await
                .map_err(|_| Error::DeviceBusy),
        }
    }

    /// Start an exclusive session, opening the device if needed
    ///
    /// # Errors
    ///
    /// - `DeviceBusy` if another session holds the reader (see [`AcquirePolicy`])
    /// - `Transport(DeviceUnavailable)` if the device cannot be opened
    pub async fn start_session(&self) -> Result<SpoolSession<T>> {
        let mut link = self.acquire().await?;
        link.open().await?;

        info!("Session started on {}", self.descriptor);
        Ok(SpoolSession::new(link, self.kdf.clone()))
    }

    /// Close the device once no session holds it
    pub async fn close(&self) -> Result<()> {
        let mut link = self.acquire().await?;
        link.close().await?;
        debug!("Reader {} closed", self.descriptor);
        Ok(())
    }
}
