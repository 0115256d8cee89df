//! Process-wide list of reader devices

use std::sync::OnceLock;

use spoolrfid_transport::serial;
use spoolrfid_types::DeviceInfo;
use tracing::info;

use crate::error::{Error, Result};

static GLOBAL: DeviceRegistry = DeviceRegistry::new();

/// Reader devices known to the process
///
/// Initialised once, either explicitly or from serial-port enumeration, and
/// read-only afterwards.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: OnceLock<Vec<DeviceInfo>>,
}

impl DeviceRegistry {
    pub const fn new() -> Self {
        Self {
            devices: OnceLock::new(),
        }
    }

    /// The registry shared by the whole process
    pub fn global() -> &'static DeviceRegistry {
        &GLOBAL
    }

    /// Initialise with a known device list
    ///
    /// Fails with `RegistryInitialized` if the registry already holds a list.
    pub fn init(&self, devices: Vec<DeviceInfo>) -> Result<&[DeviceInfo]> {
        self.devices
            .set(devices)
            .map_err(|_| Error::RegistryInitialized)?;
        Ok(self.devices())
    }

    /// Initialise from the serial ports present, unless already initialised
    pub fn discover(&self) -> Result<&[DeviceInfo]> {
        if let Some(devices) = self.devices.get() {
            return Ok(devices);
        }
        let found = serial::enumerate()?;
        info!(count = found.len(), "Serial ports enumerated");

        // A concurrent init wins; its list is returned
        let _ = self.devices.set(found);
        Ok(self.devices())
    }

    /// Known devices, empty before initialisation
    pub fn devices(&self) -> &[DeviceInfo] {
        self.devices.get().map(Vec::as_slice).unwrap_or_default()
    }

    pub fn find(&self, path: &str) -> Option<&DeviceInfo> {
        self.devices().iter().find(|d| d.path == path)
    }

    pub fn is_initialized(&self) -> bool {
        self.devices.get().is_some()
    }
}
