//! Type definitions for spoolrfid

pub mod device_info;
pub mod error;
pub mod spool;
pub mod tag;

pub use device_info::{DeviceInfo, FirmwareVersion};
pub use error::{Error, Result};
pub use spool::{FieldSet, FlatField, FlatSpoolRecord, Rgba, SpoolField, SpoolFields, SpoolRecord};
pub use tag::{BlockAddress, KeyType, RawBlock, SectorKey, TagUid};
