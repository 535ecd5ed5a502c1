//! The underlying binary protocol of the MD1702 maintenance interface

use std::fmt;

use scroll::{LE, Pread};

use crate::constants::{commands, loader};
use crate::error::{Result, protocol_error};

/// Model-dependent frame layout, selected once at DFU mode entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameLayout {
    /// Length field is two bytes (little-endian) instead of one.
    pub wide_length: bool,
}

impl FrameLayout {
    pub const fn length_bytes(&self) -> usize {
        if self.wide_length { 2 } else { 1 }
    }
}

/// Fields readable through the single-shot "text verification" command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum InfoField {
    FwVersion = 1,
    DeviceId = 2,
    RefDate = 3,
    DataFormat = 4,
    GpsFormat = 5,
    Voices = 6,
    HzkFont = 7,
    Unknown = 8,
    Recordings = 9,
    Settings = 10,
    CpsFormat = 11,
    Custom = 13,
    Logo = 14,
    CsvContacts = 15,
}

impl InfoField {
    pub const fn id(self) -> u8 {
        self as u8
    }

    /// Fields whose reply is a pair of little-endian 32-bit bounds.
    pub const fn is_address_range(self) -> bool {
        matches!(
            self,
            InfoField::Voices
                | InfoField::HzkFont
                | InfoField::Unknown
                | InfoField::Recordings
                | InfoField::Settings
                | InfoField::Logo
                | InfoField::CsvContacts
        )
    }
}

/// MD1702 maintenance command
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    /// Model search. Replies `OK` followed by the model string.
    Search,
    /// Password status. `50 00 00` means no password is set.
    PasswordStatus,
    /// Enter system information mode.
    SystemInfo,
    /// Enter time set mode.
    TimeSetMode,
    /// Continuation between chunks. Also acknowledges bootloader replies and,
    /// sent on its own outside a transfer, reboots the radio.
    Next,
    /// SPI/USB mode select prefix, followed by [`Command::ModelName`].
    ModeSelect,
    ModelName(String),
    /// Page control byte after mode select, acked by eight `0xff`.
    PcMode,
    /// Text verification of a small fixed field.
    Verify { field: InfoField, len: u8, addr: u16 },
    /// Read internal flash.
    FlashRead { address: u32, len: u16 },
    /// Read external SPI flash.
    SpiRead { address: u32, len: u16 },
    /// Write external SPI flash.
    SpiWrite { address: u32, data: Vec<u8> },
    /// Set the real time clock: year(LE16), month, day, hour, minute, second.
    SetTime { time: [u8; 7] },
    /// Bootloader readiness probe.
    LoaderReady,
    /// Bootloader model query.
    LoaderModel,
    /// Bootloader erase request.
    LoaderErase,
    /// Bootloader erase type selection.
    LoaderEraseType,
    /// Enter filename stage.
    LoaderStage1,
    /// Announce the next firmware block.
    LoaderStage2,
    /// Leave the bootloader.
    LoaderReboot,
    /// Preformatted packet (filename packet, firmware block, checksum).
    Raw(Vec<u8>),
}

/// Internal flash address encoding: top nibble moved into the high byte.
pub fn flash_address(address: u32) -> [u8; 3] {
    [
        ((address & 0xf0000) >> 12) as u8,
        (address >> 8) as u8,
        address as u8,
    ]
}

/// SPI flash address encoding: 24-bit little-endian.
pub fn spi_address(address: u32) -> [u8; 3] {
    [address as u8, (address >> 8) as u8, (address >> 16) as u8]
}

fn data_frame(
    opcode: u8,
    address: [u8; 3],
    len: Option<u16>,
    layout: FrameLayout,
    payload: &[u8],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + layout.length_bytes() + payload.len());
    buf.push(opcode);
    buf.extend_from_slice(&address);
    if let Some(len) = len {
        buf.push(len as u8);
        if layout.wide_length {
            buf.push((len >> 8) as u8);
        }
    }
    buf.extend_from_slice(payload);
    buf
}

impl Command {
    pub fn verify(field: InfoField, len: u8, addr: u16) -> Self {
        Command::Verify { field, len, addr }
    }

    pub fn spi_read(address: u32, len: u16) -> Self {
        Command::SpiRead { address, len }
    }

    pub fn flash_read(address: u32, len: u16) -> Self {
        Command::FlashRead { address, len }
    }

    pub fn spi_write(address: u32, data: Vec<u8>) -> Self {
        Command::SpiWrite { address, data }
    }

    pub fn into_raw(self, layout: FrameLayout) -> Vec<u8> {
        match self {
            Command::Search => commands::SEARCH.to_vec(),
            Command::PasswordStatus => commands::PASSWORD_STATUS.to_vec(),
            Command::SystemInfo => commands::SYSTEM_INFO.to_vec(),
            Command::TimeSetMode => commands::TIME_SET_MODE.to_vec(),
            Command::Next => vec![commands::NEXT],
            Command::ModeSelect => commands::MODE_SELECT.to_vec(),
            Command::ModelName(name) => name.into_bytes(),
            Command::PcMode => vec![commands::PC_MODE],
            Command::Verify { field, len, addr } => vec![
                commands::VERIFY,
                (addr >> 8) as u8,
                addr as u8,
                len,
                field.id(),
            ],
            Command::FlashRead { address, len } => data_frame(
                commands::FLASH_GET,
                flash_address(address),
                Some(len),
                layout,
                &[],
            ),
            Command::SpiRead { address, len } => data_frame(
                commands::SPI_READ,
                spi_address(address),
                Some(len),
                layout,
                &[],
            ),
            Command::SpiWrite { address, data } => data_frame(
                commands::SPI_WRITE,
                spi_address(address),
                Some(data.len() as u16),
                layout,
                &data,
            ),
            Command::SetTime { time } => {
                data_frame(commands::TIME, [0; 3], Some(7), layout, &time)
            }
            Command::LoaderReady => vec![loader::READY],
            Command::LoaderModel => data_frame(loader::MODEL, [0; 3], Some(1), layout, &[]),
            Command::LoaderErase => data_frame(loader::ERASE, [0; 3], Some(0), layout, &[]),
            Command::LoaderEraseType => vec![loader::ERASE_TYPE],
            Command::LoaderStage1 => vec![loader::STAGE1],
            Command::LoaderStage2 => vec![loader::STAGE2],
            Command::LoaderReboot => vec![loader::REBOOT],
            Command::Raw(raw) => raw,
        }
    }
}

/// Reply framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// `[opcode, addr(3), lenLo, (lenHi), payload]`
    Data,
    /// `[opcode, ?, len, payload]`, address implicitly zero
    Verify,
}

impl FrameKind {
    pub const fn header_len(self, layout: FrameLayout) -> usize {
        match self {
            FrameKind::Data => 4 + layout.length_bytes(),
            FrameKind::Verify => 3,
        }
    }
}

/// A decoded reply frame.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: u8,
    pub address: [u8; 3],
    pub payload: Vec<u8>,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}[{}]",
            self.opcode as char,
            hex::encode(self.address),
            hex::encode(&self.payload)
        )
    }
}

impl Frame {
    /// Payload length announced by a reply whose header is complete.
    pub fn declared_len(raw: &[u8], kind: FrameKind, layout: FrameLayout) -> Result<usize> {
        if raw.len() < kind.header_len(layout) {
            return Err(protocol_error(format!(
                "reply header too short ({} bytes)",
                raw.len()
            )));
        }
        Ok(match kind {
            FrameKind::Verify => raw[2] as usize,
            FrameKind::Data if layout.wide_length => raw.pread_with::<u16>(4, LE)? as usize,
            FrameKind::Data => raw[4] as usize,
        })
    }

    pub fn from_raw(raw: &[u8], kind: FrameKind, layout: FrameLayout) -> Result<Self> {
        let len = Self::declared_len(raw, kind, layout)?;
        let header = kind.header_len(layout);
        let payload = &raw[header..];
        if payload.len() < len {
            return Err(protocol_error(format!(
                "reply payload too short: {} bytes, {} announced",
                payload.len(),
                len
            )));
        }
        let address = match kind {
            FrameKind::Data => [raw[1], raw[2], raw[3]],
            FrameKind::Verify => [0; 3],
        };
        Ok(Frame {
            opcode: raw[0],
            address,
            payload: payload[..len].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NARROW: FrameLayout = FrameLayout { wide_length: false };
    const WIDE: FrameLayout = FrameLayout { wide_length: true };

    #[test]
    fn test_address_encodings() {
        assert_eq!(spi_address(0x123456), [0x56, 0x34, 0x12]);
        assert_eq!(flash_address(0x4000), [0x00, 0x40, 0x00]);
        assert_eq!(flash_address(0x5a1b2), [0x50, 0xa1, 0xb2]);
    }

    #[test]
    fn test_spi_read_frame_width() {
        let narrow = Command::spi_read(0x001000, 40).into_raw(NARROW);
        assert_eq!(narrow, vec![b'R', 0x00, 0x10, 0x00, 40]);

        let wide = Command::spi_read(0x001000, 0x100).into_raw(WIDE);
        assert_eq!(wide, vec![b'R', 0x00, 0x10, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn test_verify_and_time_frames() {
        let verify = Command::verify(InfoField::Custom, 0x0a, 0x20).into_raw(WIDE);
        assert_eq!(verify, vec![b'V', 0x00, 0x20, 0x0a, 13]);

        let time = Command::SetTime {
            time: [0xe8, 0x07, 6, 15, 10, 30, 0],
        }
        .into_raw(NARROW);
        assert_eq!(time, vec![b'T', 0, 0, 0, 7, 0xe8, 0x07, 6, 15, 10, 30, 0]);
    }

    #[test]
    fn test_loader_frames_use_narrow_length() {
        assert_eq!(Command::LoaderModel.into_raw(NARROW), vec![b'M', 0, 0, 0, 1]);
        assert_eq!(Command::LoaderErase.into_raw(NARROW), vec![b'E', 0, 0, 0, 0]);
    }

    #[test]
    fn test_parse_data_frame() {
        let raw = [b'W', 0x00, 0x10, 0x00, 0x03, 0x00, 0xaa, 0xbb, 0xcc];
        let frame = Frame::from_raw(&raw, FrameKind::Data, WIDE).unwrap();
        assert_eq!(frame.opcode, b'W');
        assert_eq!(frame.address, [0x00, 0x10, 0x00]);
        assert_eq!(frame.payload, vec![0xaa, 0xbb, 0xcc]);

        // same bytes read narrow: length 3, payload starts one byte earlier
        let frame = Frame::from_raw(&raw, FrameKind::Data, NARROW).unwrap();
        assert_eq!(frame.payload, vec![0x00, 0xaa, 0xbb]);
    }

    #[test]
    fn test_parse_verify_frame() {
        let raw = [b'V', 0x00, 0x02, 0x31, 0x32, 0xff];
        let frame = Frame::from_raw(&raw, FrameKind::Verify, WIDE).unwrap();
        assert_eq!(frame.address, [0; 3]);
        assert_eq!(frame.payload, b"12".to_vec());
    }

    #[test]
    fn test_parse_short_frame() {
        assert!(Frame::from_raw(&[b'W', 0, 0], FrameKind::Data, NARROW).is_err());
        assert!(Frame::from_raw(&[b'W', 0, 0, 0, 4, 1], FrameKind::Data, NARROW).is_err());
    }

    #[test]
    fn test_info_field_ranges() {
        assert!(InfoField::Settings.is_address_range());
        assert!(InfoField::CsvContacts.is_address_range());
        assert!(!InfoField::FwVersion.is_address_range());
        assert!(!InfoField::Custom.is_address_range());
    }
}
