//! Maintenance session logic: mode entry, chunked transfers, firmware flashing.

use std::thread::sleep;
use std::time::Duration;

use chrono::{Datelike, Local, NaiveDateTime, Timelike};
use indicatif::{ProgressBar, ProgressStyle};
use scroll::{LE, Pread};

use crate::constants::{
    self, BOOTLOADER_TIMEOUT, DEFAULT_SETTINGS_RANGE, INTERACTIVE_TIMEOUT, SECTOR_SIZE,
    commands, internal_flash, loader, status,
};
use crate::crc::crc16_xmodem;
use crate::device::{Model, ModelDB};
use crate::error::{Error, Result, protocol_error};
use crate::format;
use crate::protocol::{Command, FrameKind, InfoField};
use crate::transport::{Transport, UsbTransport};

/// Session mode of the radio as last negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Idle,
    Dfu,
    SpiUsb,
    Bootloader,
}

/// Which flash a chunked read goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Memory {
    Internal,
    Spi,
}

pub struct Dfu<T: Transport> {
    transport: T,
    models: ModelDB,
    model: Model,
    mode: Mode,
    /// Codeplug bounds (inclusive), reported by the device in DFU mode
    settings_range: (u32, u32),
    loader_version: Option<u32>,
    progress: bool,
}

impl Dfu<UsbTransport> {
    /// Open the radio and enter DFU mode, the starting point of every
    /// maintenance command except time setting and firmware upgrades.
    pub fn new_from_usb() -> Result<Self> {
        let mut dfu = Dfu::new(UsbTransport::open_any()?)?;
        dfu.enter_dfu_mode().map_err(|e| match e {
            Error::Usb(rusb::Error::Pipe) => Error::Protocol(
                "failed to enter DFU mode, is the device running in normal mode?".to_string(),
            ),
            e => e,
        })?;
        Ok(dfu)
    }

    /// Open the radio without any handshake; used before bootloader entry
    /// and time setting.
    pub fn open_usb() -> Result<Self> {
        Dfu::new(UsbTransport::open_any()?)
    }
}

impl<T: Transport> Dfu<T> {
    pub fn new(mut transport: T) -> Result<Self> {
        let models = ModelDB::load()?;
        let model = models.default_model()?.clone();
        transport.set_timeout(INTERACTIVE_TIMEOUT);
        Ok(Dfu {
            transport,
            models,
            model,
            mode: Mode::Idle,
            settings_range: DEFAULT_SETTINGS_RANGE,
            loader_version: None,
            progress: false,
        })
    }

    /// Show progress bars on long transfers.
    pub fn set_progress(&mut self, enabled: bool) {
        self.progress = enabled;
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.transport.set_timeout(timeout);
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn settings_range(&self) -> (u32, u32) {
        self.settings_range
    }

    pub fn loader_version(&self) -> Option<u32> {
        self.loader_version
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    fn send(&mut self, cmd: Command) -> Result<()> {
        self.transport.send(cmd, self.model.layout())
    }

    /// Send `cmd` and require the reply to be exactly `expected`.
    fn transact(&mut self, cmd: Command, expected: &[u8], stage: &str) -> Result<()> {
        self.send(cmd)?;
        self.expect_reply(expected, stage)
    }

    fn expect_reply(&mut self, expected: &[u8], stage: &str) -> Result<()> {
        let resp = self.transport.recv_reply()?;
        if resp != expected {
            return Err(protocol_error(format!(
                "{} failed (reply {})",
                stage,
                hex::encode(&resp)
            )));
        }
        Ok(())
    }

    fn next_cmd(&mut self) -> Result<()> {
        self.transact(Command::Next, status::OK, "next command selection")
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(len as u64);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner} [{elapsed_precise}] [{bar:40}] {bytes}/{total_bytes} ({eta})",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
        );
        bar
    }

    /// Identify the radio, reject password protected devices and read the
    /// codeplug address range.
    pub fn enter_dfu_mode(&mut self) -> Result<()> {
        self.send(Command::Search)?;
        let resp = self.transport.recv_reply()?;
        let ident = resp.get(1..).unwrap_or_default();
        match (resp.first(), self.models.find_model(ident)) {
            (Some(&commands::NEXT), Some(model)) => {
                self.model = model.clone();
                log::info!("Found radio model {}", self.model);
            }
            _ => {
                return Err(protocol_error(format!(
                    "device detection error (status {:?}, device string {:?})",
                    resp.first(),
                    String::from_utf8_lossy(ident)
                )));
            }
        }

        self.send(Command::PasswordStatus)?;
        if self.transport.recv_reply()? != status::PASSWORD_NOT_SET {
            return Err(Error::Auth);
        }

        self.transact(Command::SystemInfo, status::OK, "system information mode setup")?;
        self.mode = Mode::Dfu;

        self.settings_range = self.verify_addrs(InfoField::Settings)?;
        log::debug!(
            "Codeplug range: 0x{:06x} - 0x{:06x}",
            self.settings_range.0,
            self.settings_range.1
        );

        self.verify(InfoField::Custom, 0x0a, 0x10)?;
        let block = self.verify(InfoField::Custom, 0x0a, 0x20)?;
        if block.get(1) != Some(&0xff) {
            return Err(protocol_error("verification of second datablock failed"));
        }
        Ok(())
    }

    /// Switch to SPI/USB mode, exposing the external flash.
    pub fn enter_spi_usb_mode(&mut self) -> Result<()> {
        self.send(Command::ModeSelect)?;
        self.transact(
            Command::ModelName(self.model.name.clone()),
            status::OK,
            "device check",
        )?;
        self.transact(Command::PcMode, status::PC_MODE_ACK, "PC mode selection")?;
        self.next_cmd()?;
        self.mode = Mode::SpiUsb;
        log::debug!("Entered SPI/USB mode");
        Ok(())
    }

    /// Handshake with a radio powered on into the bootloader.
    pub fn enter_bootloader_mode(&mut self) -> Result<()> {
        self.transport.set_timeout(BOOTLOADER_TIMEOUT);
        self.send(Command::LoaderReady)?;
        if self.transport.recv_reply()? != loader::OK {
            return Err(protocol_error(
                "device not booted into bootloader mode (hold the key while powering on)",
            ));
        }
        self.transport.set_timeout(INTERACTIVE_TIMEOUT);

        self.transact(Command::LoaderModel, loader::MODEL_REPLY, "model verification")?;

        self.send(Command::Next)?;
        let resp = self.transport.recv_reply()?;
        let version = String::from_utf8_lossy(&resp).into_owned();
        let Some(number) = resp.strip_prefix(loader::VERSION_PREFIX) else {
            return Err(protocol_error(format!("unknown bootloader version {:?}", version)));
        };
        log::info!("Bootloader (model) version: {}", version);
        let number = std::str::from_utf8(number)
            .ok()
            .and_then(|n| n.trim_end_matches('\0').trim().parse::<u32>().ok())
            .filter(|n| loader::SUPPORTED_VERSIONS.contains(n))
            .ok_or(Error::UnsupportedVersion(version))?;

        self.loader_version = Some(number);
        self.mode = Mode::Bootloader;
        Ok(())
    }

    /// Single-shot text verification of a small field.
    pub fn verify(&mut self, field: InfoField, len: u8, addr: u16) -> Result<Vec<u8>> {
        self.send(Command::verify(field, len, addr))?;
        let frame = self
            .transport
            .recv_frame(FrameKind::Verify, self.model.layout())?;
        if frame.opcode != commands::VERIFY {
            return Err(protocol_error(format!("invalid reply to VERIFY: {:?}", frame)));
        }
        self.next_cmd()?;
        Ok(frame.payload)
    }

    pub fn verify_text(&mut self, field: InfoField) -> Result<String> {
        let mut raw = self.verify(field, 0, 0)?;
        while let Some(0x00 | 0xff) = raw.last() {
            raw.pop();
        }
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    /// Read an address pair `(start, end)` for a ranged field.
    pub fn verify_addrs(&mut self, field: InfoField) -> Result<(u32, u32)> {
        if !field.is_address_range() {
            return Err(Error::Validation(format!(
                "{:?} is a text entry, not an address range",
                field
            )));
        }
        let resp = self.verify(field, 0, 0)?;
        if resp.len() != 8 {
            return Err(protocol_error(format!(
                "verification of {:?} addresses returned {} bytes",
                field,
                resp.len()
            )));
        }
        let start = resp.pread_with::<u32>(0, LE)?;
        let end = resp.pread_with::<u32>(4, LE)?;
        log::debug!("Addresses {:?}: 0x{:06x} - 0x{:06x}", field, start, end);
        Ok((start, end))
    }

    /// Firmware revision number, the last dot separated part of FWVersion.
    pub fn firmware_revision(&mut self) -> Result<u32> {
        let version = self.verify_text(InfoField::FwVersion)?;
        version
            .rsplit('.')
            .next()
            .and_then(|n| n.trim().parse().ok())
            .ok_or_else(|| protocol_error(format!("unparsable firmware version {:?}", version)))
    }

    fn read_chunks(&mut self, memory: Memory, address: u32, length: usize) -> Result<Vec<u8>> {
        let (request, reply): (fn(u32, u16) -> Command, u8) = match memory {
            Memory::Internal => (Command::flash_read, commands::FLASH_SET),
            Memory::Spi => (Command::spi_read, commands::SPI_WRITE),
        };
        log::debug!(
            "Fetching {} bytes from {:?} flash at 0x{:06x}",
            length,
            memory,
            address
        );

        let bar = self.progress_bar(length);
        let mut data = Vec::with_capacity(length);
        let end = address as usize + length;
        let mut cursor = address as usize;
        while cursor < end {
            let len = self.model.delta.min(end - cursor);
            self.send(request(cursor as u32, len as u16))?;
            let frame = self
                .transport
                .recv_frame(FrameKind::Data, self.model.layout())?;
            if frame.opcode != reply || frame.payload.len() != len {
                return Err(protocol_error(format!(
                    "invalid reply for upload at 0x{:06x}: {:?}, len={} (asked {})",
                    cursor,
                    frame.opcode as char,
                    frame.payload.len(),
                    len
                )));
            }
            data.extend_from_slice(&frame.payload);
            cursor += len;
            bar.inc(len as u64);
            self.next_cmd()?;
        }
        bar.finish_and_clear();
        Ok(data)
    }

    /// Read internal flash, trailing erased bytes trimmed.
    pub fn upload(&mut self, address: u32, length: usize) -> Result<Vec<u8>> {
        let data = self.read_chunks(Memory::Internal, address, length)?;
        Ok(format::trim_erased(data))
    }

    /// Read SPI flash, trailing erased bytes trimmed.
    pub fn upload_spi(&mut self, address: u32, length: usize) -> Result<Vec<u8>> {
        let data = self.read_chunks(Memory::Spi, address, length)?;
        Ok(format::trim_erased(data))
    }

    /// Read SPI flash exactly as stored.
    pub fn upload_spi_raw(&mut self, address: u32, length: usize) -> Result<Vec<u8>> {
        self.read_chunks(Memory::Spi, address, length)
    }

    /// Write SPI flash in chunks, each acknowledged by the device.
    pub fn download_spi(
        &mut self,
        address: u32,
        data: &[u8],
        max_length: Option<usize>,
    ) -> Result<()> {
        if let Some(max) = max_length {
            if data.len() > max {
                return Err(Error::Size {
                    size: data.len(),
                    max,
                });
            }
        }
        log::debug!("Writing {} bytes to SPI flash at 0x{:06x}", data.len(), address);

        let bar = self.progress_bar(data.len());
        let delta = self.model.delta;
        for (i, chunk) in data.chunks(delta).enumerate() {
            let cursor = address + (i * delta) as u32;
            self.send(Command::spi_write(cursor, chunk.to_vec()))?;
            let resp = self.transport.recv_reply()?;
            if resp != status::OK {
                return Err(protocol_error(format!(
                    "invalid reply for SPI download at 0x{:06x}: {}, len={}",
                    cursor,
                    hex::encode(&resp),
                    chunk.len()
                )));
            }
            bar.inc(chunk.len() as u64);
        }
        bar.finish_and_clear();
        Ok(())
    }

    /// Flash a firmware image through the bootloader, then reboot it.
    pub fn download_firmware(&mut self, image: &[u8], name: &str) -> Result<()> {
        format::check_firmware(image)?;
        if self.mode != Mode::Bootloader {
            return Err(Error::InvalidMode {
                expected: Mode::Bootloader,
                actual: self.mode,
            });
        }

        let packet = filename_packet(name, image.len());

        self.transact(Command::LoaderErase, loader::OK, "erase command")?;
        self.transact(Command::LoaderEraseType, loader::CONTINUE, "erase mode selection")?;
        self.transact(Command::LoaderStage1, loader::CONTINUE, "entering update stage 1")?;
        let crc = crc16_xmodem(&packet[2..], 0);
        self.send(Command::Raw(packet))?;
        self.send(Command::Raw(crc.to_be_bytes().to_vec()))?;
        sleep(Duration::from_millis(100));
        self.expect_reply(loader::OK_CONTINUE, "sending file name")?;
        log::info!("Sending file name succeeded, starting upgrade");

        let padded = pad_to_sector(image);
        let bar = self.progress_bar(padded.len());
        for (i, block) in padded.chunks(loader::BLOCK_SIZE).enumerate() {
            let block_id = (i + 1) as u8;
            self.transact(Command::LoaderStage2, loader::CONTINUE, "update stage 2")?;

            let mut packet = Vec::with_capacity(2 + block.len());
            packet.push(block_id);
            packet.push(!block_id);
            packet.extend_from_slice(block);
            self.send(Command::Raw(packet))?;
            self.send(Command::Raw(crc16_xmodem(block, 0).to_be_bytes().to_vec()))?;
            self.expect_reply(loader::OK, &format!("sending block {}", i + 1))?;
            bar.inc(block.len() as u64);
        }
        bar.finish_and_clear();

        self.reboot_firmware()?;
        log::info!("Upgrade finished, turn the device off and on normally");
        Ok(())
    }

    fn reboot_firmware(&mut self) -> Result<()> {
        self.transact(Command::LoaderReboot, loader::CONTINUE, "bootloader reboot")?;
        self.mode = Mode::Idle;
        Ok(())
    }

    /// Set the radio clock, to `time` or the current local time.
    pub fn set_time(&mut self, time: Option<NaiveDateTime>) -> Result<()> {
        let t = time.unwrap_or_else(|| Local::now().naive_local());
        let year = t.year() as u16;
        let time = [
            year as u8,
            (year >> 8) as u8,
            t.month() as u8,
            t.day() as u8,
            t.hour() as u8,
            t.minute() as u8,
            t.second() as u8,
        ];
        self.transact(Command::TimeSetMode, status::OK, "time settings mode setup")?;
        self.transact(Command::SetTime { time }, status::OK, "time setting")?;
        log::info!("Time set to {}", t);
        Ok(())
    }

    /// End the session; the radio restarts into normal operation.
    pub fn reboot(&mut self) -> Result<()> {
        self.send(Command::Next)?;
        self.mode = Mode::Idle;
        log::info!("Device reboot requested");
        Ok(())
    }

    pub fn dump_info(&mut self) -> Result<()> {
        for field in [
            InfoField::FwVersion,
            InfoField::RefDate,
            InfoField::DataFormat,
            InfoField::GpsFormat,
            InfoField::CpsFormat,
        ] {
            let text = self.verify_text(field)?;
            log::info!("{:<12}= {}", format!("{:?}", field), text);
        }
        for field in [
            InfoField::Voices,
            InfoField::HzkFont,
            InfoField::Recordings,
            InfoField::Settings,
            InfoField::Logo,
            InfoField::Unknown,
        ] {
            let (start, end) = self.verify_addrs(field)?;
            log::info!("{:<12}= 0x{:06x} - 0x{:06x}", format!("{:?}", field), start, end);
        }
        self.enter_spi_usb_mode()?;
        let id = self.verify(InfoField::DeviceId, 0, 0)?;
        log::info!("{:<12}= 0x{}", "DeviceId", hex::encode(id));
        Ok(())
    }

    /// Read the internal configuration block.
    pub fn read_config(&mut self) -> Result<Vec<u8>> {
        self.upload(internal_flash::CONFIG_ADDR, internal_flash::CONFIG_SIZE)
    }

    /// Read the firmware from internal flash.
    pub fn read_firmware(&mut self) -> Result<Vec<u8>> {
        self.upload(internal_flash::FIRMWARE_ADDR, internal_flash::FIRMWARE_SIZE)
    }

    /// Read the raw codeplug (device-native sector layout).
    pub fn read_codeplug(&mut self) -> Result<Vec<u8>> {
        let (start, end) = self.settings_range;
        let len = device_span(InfoField::Settings, start, end)?;
        self.ensure_spi_mode()?;
        self.upload_spi(start, len)
    }

    pub fn write_codeplug(&mut self, image: &[u8]) -> Result<()> {
        format::check_codeplug(image)?;
        let (start, end) = self.settings_range;
        let max = device_span(InfoField::Settings, start, end)?;
        self.ensure_spi_mode()?;
        self.download_spi(start, image, Some(max))
    }

    /// Read a ranged region (voice, font, logo...) of the SPI flash.
    ///
    /// The range is queried first, some fields are not answered in SPI/USB mode.
    pub fn read_region(&mut self, field: InfoField, trim: bool) -> Result<Vec<u8>> {
        let (start, end) = self.verify_addrs(field)?;
        let len = device_span(field, start, end)?;
        self.ensure_spi_mode()?;
        if trim {
            self.upload_spi(start, len)
        } else {
            self.upload_spi_raw(start, len)
        }
    }

    pub fn write_region(&mut self, field: InfoField, data: &[u8]) -> Result<()> {
        let (start, end) = self.verify_addrs(field)?;
        let max = device_span(field, start, end)?;
        self.ensure_spi_mode()?;
        self.download_spi(start, data, Some(max))
    }

    /// Dump `[start, end]` of the SPI flash, by default the whole chip.
    pub fn read_spi(&mut self, start: u32, end: Option<u32>, trim: bool) -> Result<Vec<u8>> {
        let end = end.unwrap_or(constants::SPI_FLASH_SIZE - 1);
        let len = span(start, end).ok_or_else(|| {
            Error::Validation(format!("invalid SPI range 0x{:06x} - 0x{:06x}", start, end))
        })?;
        self.ensure_spi_mode()?;
        if trim {
            self.upload_spi(start, len)
        } else {
            self.upload_spi_raw(start, len)
        }
    }

    fn ensure_spi_mode(&mut self) -> Result<()> {
        match self.mode {
            Mode::SpiUsb => Ok(()),
            Mode::Dfu => self.enter_spi_usb_mode(),
            actual => Err(Error::InvalidMode {
                expected: Mode::Dfu,
                actual,
            }),
        }
    }
}

/// `00 ff <name> 00 <decimal size>`, zero padded to the fixed packet size.
/// Byte count of the inclusive range `[start, end]`.
fn span(start: u32, end: u32) -> Option<usize> {
    end.checked_sub(start)?.checked_add(1).map(|n| n as usize)
}

fn device_span(field: InfoField, start: u32, end: u32) -> Result<usize> {
    span(start, end).ok_or_else(|| {
        protocol_error(format!(
            "device reported an invalid {:?} range 0x{:06x} - 0x{:06x}",
            field, start, end
        ))
    })
}

fn filename_packet(name: &str, size: usize) -> Vec<u8> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let size = size.to_string();
    let room = loader::FILENAME_PACKET_SIZE - 3 - size.len();
    let base = &base.as_bytes()[..base.len().min(room)];

    let mut packet = Vec::with_capacity(loader::FILENAME_PACKET_SIZE);
    packet.extend_from_slice(&[0x00, 0xff]);
    packet.extend_from_slice(base);
    packet.push(0x00);
    packet.extend_from_slice(size.as_bytes());
    packet.resize(loader::FILENAME_PACKET_SIZE, 0x00);
    packet
}

fn pad_to_sector(image: &[u8]) -> Vec<u8> {
    let mut padded = image.to_vec();
    let rem = padded.len() % SECTOR_SIZE;
    if rem != 0 {
        padded.resize(padded.len() + SECTOR_SIZE - rem, 0xff);
    }
    padded
}
