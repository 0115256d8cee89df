//! Reader device information structures

use std::fmt;

/// An enumerated reader device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Serial port path (e.g. `/dev/ttyUSB0`, `COM3`)
    pub path: String,

    /// USB vendor ID, if the port is USB-attached
    pub vendor_id: Option<u16>,

    /// USB product ID, if the port is USB-attached
    pub product_id: Option<u16>,

    /// USB serial number
    pub serial_number: Option<String>,

    /// Manufacturer string
    pub manufacturer: Option<String>,

    /// Product string
    pub product: Option<String>,
}

impl DeviceInfo {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            vendor_id: None,
            product_id: None,
            serial_number: None,
            manufacturer: None,
            product: None,
        }
    }

    pub fn with_usb_ids(mut self, vendor_id: u16, product_id: u16) -> Self {
        self.vendor_id = Some(vendor_id);
        self.product_id = Some(product_id);
        self
    }

    pub fn is_usb(&self) -> bool {
        self.vendor_id.is_some()
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.vendor_id, self.product_id) {
            (Some(vid), Some(pid)) => write!(f, "Reader[{} {:04X}:{:04X}]", self.path, vid, pid),
            _ => write!(f, "Reader[{}]", self.path),
        }
    }
}

/// Reader firmware version as reported by the `FirmwareVersion` command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareVersion {
    /// Chip identifier
    pub ic: u8,
    pub version: u8,
    pub revision: u8,
    /// Bitmask of supported tag families
    pub support: u8,
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IC:{:02X} Ver:{}.{}", self.ic, self.version, self.revision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_info_display() {
        let info = DeviceInfo::new("/dev/ttyUSB0").with_usb_ids(0x1A86, 0x7523);
        assert!(info.is_usb());
        assert_eq!(info.to_string(), "Reader[/dev/ttyUSB0 1A86:7523]");
        assert_eq!(DeviceInfo::new("COM3").to_string(), "Reader[COM3]");
    }

    #[test]
    fn test_firmware_display() {
        let fw = FirmwareVersion { ic: 0x32, version: 1, revision: 6, support: 7 };
        assert_eq!(fw.to_string(), "IC:32 Ver:1.6");
    }
}
