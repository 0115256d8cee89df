//! # spoolrfid
//!
//! Read and write the RFID tags on filament spools through a serial reader.
//!
//! ## Features
//!
//! - Async/await API using Tokio
//! - One exclusive session per reader, with cancellation
//! - Bounded waits on every reader exchange
//! - Per-sector validity: a damaged sector never hides the rest of the tag
//! - Factory-blank tags are keyed on their first write, and can be erased back
//!
//! ## Quick Start
//!
//! ```no_run
//! use spoolrfid::{DeviceDescriptor, Reader};
//!
//! #[tokio::main]
//! async fn main() -> spoolrfid::Result<()> {
//!     let reader = Reader::serial(DeviceDescriptor::new("/dev/ttyUSB0"));
//!
//!     let mut session = reader.start_session().await?;
//!     let record = session.read_spool().await?;
//!     println!("{}", record);
//!
//!     // Write the same filament data back with less remaining
//!     let uid = record.uid();
//!     let mut fields = record.into_fields();
//!     fields.remaining_weight_g = Some(640.0);
//!     let written = session
//!         .write_spool(&spoolrfid::SpoolRecord::new(uid, fields))
//!         .await?;
//!     println!("{}", written);
//!
//!     session.end().await?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod reader;
pub mod registry;
pub mod session;

// Re-exports
pub use error::{Error, Result};
pub use reader::{AcquirePolicy, Reader};
pub use registry::DeviceRegistry;
pub use session::{CancelToken, FailReason, SessionHandle, SessionState, SpoolSession};

// Re-export lower layers
pub use spoolrfid_core::{KeyDerivation, TagImage};
pub use spoolrfid_transport::{DeviceDescriptor, LinkConfig, SerialTransport, Transport};
#[cfg(feature = "test-util")]
pub use spoolrfid_transport::{SimulatedReader, SimulatedTag};
pub use spoolrfid_types::{
    DeviceInfo, FieldSet, FirmwareVersion, FlatSpoolRecord, Rgba, SpoolField, SpoolFields,
    SpoolRecord, TagUid,
};
