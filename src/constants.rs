use std::time::Duration;

/// Flash allocation/erase unit, shared by the SPI flash and the codeplug image.
pub const SECTOR_SIZE: usize = 0x1000;

/// Timeout for interactive commands in DFU and SPI/USB mode.
pub const INTERACTIVE_TIMEOUT: Duration = Duration::from_millis(3000);
/// Bootloader entry waits for the operator to power-cycle the radio.
pub const BOOTLOADER_TIMEOUT: Duration = Duration::from_millis(15000);

/// Default settings (codeplug) range, replaced by the device answer in DFU mode.
pub const DEFAULT_SETTINGS_RANGE: (u32, u32) = (0x001000, 0x0c8fff);

/// Size of the full external SPI flash.
pub const SPI_FLASH_SIZE: u32 = 0x100_0000;

/// Internal flash layout as seen through `G`/`S` uploads.
pub mod internal_flash {
    pub const CONFIG_ADDR: u32 = 0x0000;
    pub const CONFIG_SIZE: usize = 0x4000;
    pub const FIRMWARE_ADDR: u32 = 0x4000;
    pub const FIRMWARE_SIZE: usize = 0xf8000;
}

pub mod commands {
    /// Continuation between chunks, also the generic acknowledge byte.
    pub const NEXT: u8 = 0x06;
    pub const SPI_READ: u8 = b'R';
    pub const SPI_WRITE: u8 = b'W';
    pub const TIME: u8 = b'T';
    pub const FLASH_GET: u8 = b'G';
    pub const FLASH_SET: u8 = b'S';
    pub const VERIFY: u8 = b'V';
    pub const SEARCH: &[u8] = b"PSEARCH";
    pub const PASSWORD_STATUS: &[u8] = b"PASSSTA";
    pub const SYSTEM_INFO: &[u8] = b"SYSINFO";
    pub const TIME_SET_MODE: &[u8] = b"RTCITEM";
    pub const MODE_SELECT: [u8; 5] = [0xff, 0xff, 0xff, 0xff, 0x0c];
    pub const PC_MODE: u8 = 0x02;
}

pub mod status {
    pub const OK: &[u8] = &[0x06];
    pub const PASSWORD_NOT_SET: &[u8] = &[0x50, 0x00, 0x00];
    pub const PC_MODE_ACK: &[u8] = &[0xff; 8];
}

/// Bootloader (firmware upgrade) dialect.
pub mod loader {
    pub const READY: u8 = b'R';
    pub const MODEL: u8 = b'M';
    pub const ERASE: u8 = b'E';
    pub const ERASE_TYPE: u8 = b'1';
    pub const STAGE1: u8 = 0x01;
    pub const STAGE2: u8 = 0x02;
    pub const REBOOT: u8 = 0x04;

    pub const OK: &[u8] = &[0x06];
    pub const CONTINUE: &[u8] = b"C";
    pub const OK_CONTINUE: &[u8] = b"\x06C";
    pub const MODEL_REPLY: &[u8] = b"M\x01\x09";
    pub const VERSION_PREFIX: &[u8] = b"MD1702-V";
    pub const SUPPORTED_VERSIONS: &[u32] = &[1, 2];

    pub const BLOCK_SIZE: usize = 1024;
    pub const FILENAME_PACKET_SIZE: usize = 130;
}

/// Firmware image sanity bounds.
pub mod firmware {
    pub const MIN_SIZE: usize = 0x9ef00;
    pub const MAX_SIZE: usize = 0xf7000;
}
