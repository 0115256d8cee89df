//! Protocol constants

use std::time::Duration;

/// First byte of every reader frame
pub const FRAME_START: u8 = 0xAB;

/// Bit set in the command id of reader responses
pub const RESPONSE_FLAG: u8 = 0x80;

/// Default serial baud rate
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Default receive timeout (reader worst-case response latency)
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Default receive attempts before a timeout surfaces
pub const DEFAULT_RETRIES: u32 = 3;

/// Late replies to abandoned commands skipped while waiting for one response
pub const MAX_LATE_RESPONSES: usize = 4;

/// Sector trailer access bits (transport configuration)
pub const ACCESS_BITS: [u8; 3] = [0xFF, 0x07, 0x80];

/// Key derivation parameters
pub mod kdf {
    /// Master salt for spool tag key derivation
    pub const DEFAULT_MASTER_KEY: [u8; 16] = [
        0x9A, 0x75, 0x9C, 0xF2, 0xC4, 0xF7, 0xCA, 0xFF,
        0x22, 0x2C, 0xB9, 0x76, 0x9B, 0x41, 0xBC, 0x96,
    ];

    /// HKDF info string for key A
    pub const KEY_A_INFO: &[u8] = b"RFID-A\0";

    /// HKDF info string for key B
    pub const KEY_B_INFO: &[u8] = b"RFID-B\0";
}

/// Values reported in a detect response for Mifare Classic 1K
pub mod mifare {
    /// Select acknowledge
    pub const SAK_CLASSIC_1K: u8 = 0x08;

    /// Answer to request
    pub const ATQA_CLASSIC_1K: u16 = 0x0004;
}
