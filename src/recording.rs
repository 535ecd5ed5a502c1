//! Call recordings stored in the SPI flash outside the codeplug area.
//!
//! The area starts with three allocation bitmap sectors, followed by mapping
//! sectors listing the head block of every recording. A head block carries a
//! 0x20 byte header, up to 240 continuation block pointers and the first
//! part of the payload; the payload size of each block sits at offset 0xffe
//! and the sector state at 0xfff.
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::BufWriter;
use std::ops::Range;
use std::path::Path;

use bitfield::bitfield;
use chrono::{Local, NaiveDate, NaiveDateTime};
use scroll::{LE, Pread};

use crate::constants::SECTOR_SIZE;
use crate::dfu::Dfu;
use crate::format;
use crate::transport::Transport;
use crate::{Error, Result};

const HEADER_LEN: usize = 0x14;
const HEAD_READ_LEN: usize = 0x200;
const CONTINUATION_OFFSET: usize = 0x20;
const CONTINUATION_SLOTS: usize = 240;
const SIZE_OFFSET: u32 = 0xffe;
const STATE_OFFSET: u32 = 0xfff;
const HEAD_PAYLOAD_MAX: usize = 0xdfe;
const BLOCK_PAYLOAD_MAX: usize = 0xffe;
const MAPPING_ENTRIES: usize = 2047;
const UNUSED: u16 = 0xffff;

const BITMAP_SECTORS: u32 = 3;
const MAPPING_FIRST: u32 = 3;
/// Firmware revisions from this one on have six mapping sectors instead of three.
const EXTENDED_MAPPING_REVISION: u32 = 22;

/// Area start inside a full SPI dump, by firmware generation.
pub const IMAGE_AREA_START: u32 = 0x186000;
pub const IMAGE_AREA_START_LEGACY: u32 = 0x154000;
const LEGACY_REVISION_MAX: u32 = 14;

bitfield! {
    struct StatusFlags(u8);
    impl Debug;
    u8;
    tx, _: 0;
    valid, _: 4;
}

bitfield! {
    struct ChannelGroup(u8);
    impl Debug;
    u8;
    kind, _: 5, 4;
    bank_b, _: 7;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectorState {
    Used,
    Backup,
    Empty,
    Default,
    Unknown,
}

impl SectorState {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0xa5 => SectorState::Used,
            0xa6 => SectorState::Backup,
            0xff => SectorState::Empty,
            0x00 => SectorState::Default,
            _ => SectorState::Unknown,
        }
    }

    /// Whether a mapping sector in this state holds live entries.
    pub fn is_live(self) -> bool {
        matches!(self, SectorState::Used | SectorState::Backup)
    }
}

impl fmt::Display for SectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SectorState::Used => "Used",
            SectorState::Backup => "Backup",
            SectorState::Empty => "Empty",
            SectorState::Default => "Default",
            SectorState::Unknown => "???",
        };
        f.pad(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bank {
    A,
    B,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Private,
    TalkGroup,
    All,
}

/// Fixed part of a head block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingHeader {
    pub flags: u8,
    pub channel_group: u8,
    pub src_id: u32,
    pub dst_id: u32,
    pub zone: u8,
    pub zone_channel: u8,
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    /// Deciseconds; negative values are stored as-is.
    pub duration: i16,
}

impl RecordingHeader {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < HEADER_LEN {
            return Err(Error::Validation(format!(
                "recording header needs {} bytes, got {}",
                HEADER_LEN,
                raw.len()
            )));
        }
        let src_low: u16 = raw.pread_with(2, LE)?;
        let dst_low: u16 = raw.pread_with(5, LE)?;
        Ok(RecordingHeader {
            flags: raw[0],
            channel_group: raw[1],
            src_id: (raw[4] as u32) << 16 | src_low as u32,
            dst_id: (raw[7] as u32) << 16 | dst_low as u32,
            zone: raw[8],
            zone_channel: raw[9],
            year: raw[12] as u16 * 100 + raw[11] as u16,
            month: raw[13],
            day: raw[14],
            hour: raw[15],
            minute: raw[16],
            second: raw[17],
            duration: raw.pread_with(18, LE)?,
        })
    }

    pub fn timestamp(&self) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(self.year as i32, self.month as u32, self.day as u32)?.and_hms_opt(
            self.hour as u32,
            self.minute as u32,
            self.second as u32,
        )
    }

    pub fn is_tx(&self) -> bool {
        StatusFlags(self.flags).tx()
    }

    pub fn is_flagged_valid(&self) -> bool {
        StatusFlags(self.flags).valid()
    }

    pub fn bank(&self) -> Bank {
        if ChannelGroup(self.channel_group).bank_b() {
            Bank::B
        } else {
            Bank::A
        }
    }

    pub fn call_kind(&self) -> CallKind {
        match ChannelGroup(self.channel_group).kind() {
            0b01 => CallKind::TalkGroup,
            0b10 => CallKind::All,
            _ => CallKind::Private,
        }
    }

    /// Plausibility check used to accept orphaned head blocks.
    pub fn is_sane(&self) -> bool {
        self.timestamp().is_some()
            && self.zone < 64
            && self.duration >= -1
            && ChannelGroup(self.channel_group).kind() != 0b11
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Recording {
    pub block: u32,
    pub header: RecordingHeader,
    pub continuations: Vec<u32>,
    pub date_time: NaiveDateTime,
}

impl Recording {
    /// Seconds, or the raw negative marker.
    pub fn duration(&self) -> f64 {
        let raw = self.header.duration;
        if raw < 0 { raw as f64 } else { raw as f64 / 10.0 }
    }

    pub fn is_valid(&self) -> bool {
        self.header.is_flagged_valid() && self.duration().abs() >= 1.0
    }

    pub fn is_newer_than(&self, t: NaiveDateTime) -> bool {
        self.date_time > t
    }

    /// Every block the recording occupies.
    pub fn blocks(&self) -> impl Iterator<Item = u32> + '_ {
        std::iter::once(self.block).chain(self.continuations.iter().copied())
    }

    pub fn file_name(&self, prefix: &str) -> String {
        format!("{}{}{}", prefix, self, format::RECORDING_EXT)
    }
}

impl fmt::Display for Recording {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let h = &self.header;
        write!(
            f,
            "{}_{:?}_{}_",
            self.date_time.format("%F_%H-%M-%S"),
            h.bank(),
            h.src_id
        )?;
        match h.call_kind() {
            CallKind::Private => {}
            CallKind::TalkGroup => write!(f, "TG")?,
            CallKind::All => write!(f, "ALL")?,
        }
        write!(
            f,
            "{}_{}_Z{}C{}",
            h.dst_id,
            if h.is_tx() { "TX" } else { "RX" },
            h.zone,
            h.zone_channel
        )?;
        if self.duration() > 0.0 {
            write!(f, "_{:.1}s", self.duration())?;
        }
        if !self.is_valid() {
            write!(f, "_E")?;
        }
        Ok(())
    }
}

/// Raw access to the SPI flash, from a live session or a dump file.
pub trait FlashReader {
    /// Read up to `length` bytes at `address`; a dump may return fewer at its end.
    fn read_flash(&mut self, address: u32, length: usize) -> Result<Vec<u8>>;
    fn firmware_revision(&mut self) -> Result<u32>;
}

impl<T: Transport> FlashReader for Dfu<T> {
    fn read_flash(&mut self, address: u32, length: usize) -> Result<Vec<u8>> {
        self.upload_spi_raw(address, length)
    }

    fn firmware_revision(&mut self) -> Result<u32> {
        Dfu::firmware_revision(self)
    }
}

/// A SPI flash dump standing in for the radio.
pub struct FlashImage {
    data: Vec<u8>,
    revision: u32,
}

impl FlashImage {
    /// `leading_blocks` zero sectors are prepended, for dumps that start
    /// somewhere inside the flash.
    pub fn new(data: Vec<u8>, revision: u32, leading_blocks: usize) -> Self {
        let mut image = vec![0u8; leading_blocks * SECTOR_SIZE];
        image.extend_from_slice(&data);
        FlashImage { data: image, revision }
    }

    pub fn from_file<P: AsRef<Path>>(path: P, revision: u32, leading_blocks: usize) -> Result<Self> {
        Ok(Self::new(fs::read(path)?, revision, leading_blocks))
    }

    /// The recording area a full dump of this firmware generation holds.
    pub fn default_area(&self) -> Result<RecordingArea> {
        let start = if self.revision > LEGACY_REVISION_MAX {
            IMAGE_AREA_START
        } else {
            IMAGE_AREA_START_LEGACY
        };
        RecordingArea::new(start, self.data.len().saturating_sub(1) as u32, self.revision)
    }
}

impl FlashReader for FlashImage {
    fn read_flash(&mut self, address: u32, length: usize) -> Result<Vec<u8>> {
        let start = (address as usize).min(self.data.len());
        let end = (start + length).min(self.data.len());
        Ok(self.data[start..end].to_vec())
    }

    fn firmware_revision(&mut self) -> Result<u32> {
        Ok(self.revision)
    }
}

/// Block bounds of the recording area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordingArea {
    pub start_block: u32,
    pub end_block: u32,
    pub mapping_end: u32,
}

impl RecordingArea {
    pub fn new(start: u32, end: u32, firmware_revision: u32) -> Result<Self> {
        if start as usize % SECTOR_SIZE != 0 {
            return Err(Error::Validation(format!(
                "recording area start 0x{:06x} is not at a sector boundary",
                start
            )));
        }
        let mapping_end = if firmware_revision >= EXTENDED_MAPPING_REVISION { 9 } else { 6 };
        Ok(RecordingArea {
            start_block: start >> 12,
            end_block: end >> 12,
            mapping_end,
        })
    }

    /// Blocks that may hold recording data.
    pub fn data_blocks(&self) -> Range<u32> {
        self.start_block..self.end_block
    }

    pub fn mapping_blocks(&self) -> Range<u32> {
        self.start_block + MAPPING_FIRST..self.start_block + self.mapping_end
    }

    pub fn bitmap_blocks(&self) -> Range<u32> {
        self.start_block..self.start_block + BITMAP_SECTORS
    }
}

fn block_address(block: u32) -> u32 {
    block * SECTOR_SIZE as u32
}

pub fn read_sector_state<R: FlashReader + ?Sized>(reader: &mut R, block: u32) -> Result<SectorState> {
    let raw = reader.read_flash(block_address(block) + STATE_OFFSET, 1)?;
    Ok(raw.first().map_or(SectorState::Unknown, |&b| SectorState::from_byte(b)))
}

/// Payload bytes stored in `block`, 0 when unreadable.
pub fn read_block_size<R: FlashReader + ?Sized>(reader: &mut R, block: u32) -> Result<u16> {
    let raw = reader.read_flash(block_address(block) + SIZE_OFFSET, 2)?;
    if raw.len() < 2 {
        log::warn!("Invalid size information in block 0x{:04x}", block);
        return Ok(0);
    }
    Ok(raw.pread_with::<u16>(0, LE)?)
}

/// Head blocks listed in a mapping sector.
pub fn read_recording_starts<R: FlashReader + ?Sized>(reader: &mut R, block: u32) -> Result<Vec<u32>> {
    let raw = reader.read_flash(block_address(block), MAPPING_ENTRIES * 2)?;
    Ok(u16_entries(&raw).filter(|&v| v != UNUSED).map(u32::from).collect())
}

/// Allocation bitmap: 7 bits per byte, a cleared bit is an allocated block.
pub fn read_allocation_map<R: FlashReader + ?Sized>(reader: &mut R, block: u32) -> Result<Vec<bool>> {
    let raw = reader.read_flash(block_address(block), BLOCK_PAYLOAD_MAX)?;
    Ok(raw
        .iter()
        .flat_map(|&b| (0..7).map(move |bit| (b >> bit) & 1 == 0))
        .collect())
}

fn u16_entries(raw: &[u8]) -> impl Iterator<Item = u16> + '_ {
    raw.chunks_exact(2).map(|p| u16::from_le_bytes([p[0], p[1]]))
}

/// Decode the head block `block`. With `scan`, the header must also pass the
/// plausibility check and all continuations must lie inside `valid`.
pub fn decode_recording<R: FlashReader + ?Sized>(
    reader: &mut R,
    block: u32,
    valid: Range<u32>,
    scan: bool,
) -> Result<Option<Recording>> {
    if !valid.contains(&block) {
        return Ok(None);
    }
    let raw = reader.read_flash(block_address(block), HEAD_READ_LEN)?;
    if raw.len() < HEAD_READ_LEN {
        log::warn!("Recording block 0x{:04x} is truncated", block);
        return Ok(None);
    }
    let header = RecordingHeader::parse(&raw)?;
    let pointers: Vec<u32> = u16_entries(&raw[CONTINUATION_OFFSET..])
        .take(CONTINUATION_SLOTS)
        .filter(|&v| v != UNUSED)
        .map(u32::from)
        .collect();

    let in_range = |b: &u32| valid.contains(b) && *b != block;
    if scan && !(header.is_sane() && pointers.iter().all(in_range)) {
        return Ok(None);
    }
    if header.duration < -1 {
        return Ok(None);
    }

    let date_time = header.timestamp().unwrap_or_else(|| {
        log::warn!("Broken date/time in recording in sector 0x{:04x}: {:?}", block, header);
        Local::now().naive_local()
    });
    Ok(Some(Recording {
        block,
        continuations: pointers.into_iter().filter(in_range).collect(),
        header,
        date_time,
    }))
}

/// Concatenated payload of the head block and its continuations.
pub fn read_payload<R: FlashReader + ?Sized>(reader: &mut R, recording: &Recording) -> Result<Vec<u8>> {
    let size = read_block_size(reader, recording.block)?;
    if size == 0 {
        return Ok(Vec::new());
    }
    let mut data = reader.read_flash(
        block_address(recording.block) + HEAD_READ_LEN as u32,
        (size as usize).min(HEAD_PAYLOAD_MAX),
    )?;
    for &block in &recording.continuations {
        let size = read_block_size(reader, block)?;
        let chunk = reader.read_flash(block_address(block), (size as usize).min(BLOCK_PAYLOAD_MAX))?;
        if size == UNUSED {
            data.extend_from_slice(&format::trim_erased(chunk));
        } else {
            data.extend_from_slice(&chunk);
        }
    }
    Ok(data)
}

/// All recordings listed by the live mapping sectors; with `scan`, every
/// unreferenced block of the area is probed for an orphaned head as well.
pub fn collect_recordings<R: FlashReader + ?Sized>(
    reader: &mut R,
    area: &RecordingArea,
    scan: bool,
) -> Result<BTreeMap<u32, Recording>> {
    let mut recordings = BTreeMap::new();
    log::info!("Scanning recordings metadata");
    for block in area.mapping_blocks() {
        if !read_sector_state(reader, block)?.is_live() {
            continue;
        }
        for start in read_recording_starts(reader, block)? {
            if recordings.contains_key(&start) {
                continue;
            }
            if let Some(rec) = decode_recording(reader, start, area.data_blocks(), false)? {
                recordings.insert(start, rec);
            }
        }
    }

    if scan {
        log::info!("Scanning for missing records, this may take a lot of time");
        let used: Vec<u32> = recordings.values().flat_map(Recording::blocks).collect();
        for block in area.start_block + area.mapping_end..area.end_block {
            if used.contains(&block) || read_block_size(reader, block)? == 0 {
                continue;
            }
            if let Some(rec) = decode_recording(reader, block, area.data_blocks(), true)? {
                log::info!("Found recording {}", rec);
                recordings.insert(block, rec);
            }
        }
    }
    Ok(recordings)
}

/// Write every valid recording (optionally only those newer than
/// `newer_than`) to `<prefix><name>.dmr`; returns the number of files.
pub fn save_recordings<R: FlashReader + ?Sized>(
    reader: &mut R,
    area: &RecordingArea,
    recordings: &BTreeMap<u32, Recording>,
    prefix: &str,
    newer_than: Option<NaiveDateTime>,
) -> Result<usize> {
    let mut saved = 0;
    for (&block, rec) in recordings {
        if block > area.end_block {
            log::error!("Record block 0x{:x} out of bounds, skipping", block);
            continue;
        }
        if !rec.is_valid() {
            log::info!("Skipping invalid record {}", rec);
            continue;
        }
        if newer_than.is_some_and(|t| !rec.is_newer_than(t)) {
            log::info!("Skipping old record {}", rec);
            continue;
        }
        log::info!("Saving record {}", rec);
        let payload = read_payload(reader, rec)?;
        let mut out = BufWriter::new(File::create(rec.file_name(prefix))?);
        format::write_recording(&mut out, &payload)?;
        saved += 1;
    }
    Ok(saved)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectorSummary {
    pub index: u32,
    pub raw_state: u8,
    pub state: SectorState,
    /// Allocated blocks (bitmap) or listed recordings (mapping).
    pub count: Option<usize>,
    pub first: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AreaSummary {
    pub bitmaps: Vec<SectorSummary>,
    pub mappings: Vec<SectorSummary>,
}

pub fn area_summary<R: FlashReader + ?Sized>(reader: &mut R, area: &RecordingArea) -> Result<AreaSummary> {
    let mut bitmaps = Vec::new();
    for (index, block) in area.bitmap_blocks().enumerate() {
        let raw_state = raw_state(reader, block)?;
        let state = SectorState::from_byte(raw_state);
        let count = if matches!(state, SectorState::Used | SectorState::Default) {
            Some(read_allocation_map(reader, block)?.iter().filter(|&&a| a).count())
        } else {
            None
        };
        bitmaps.push(SectorSummary {
            index: index as u32,
            raw_state,
            state,
            count,
            first: None,
        });
    }

    let mut mappings = Vec::new();
    for block in area.mapping_blocks() {
        let raw_state = raw_state(reader, block)?;
        let state = SectorState::from_byte(raw_state);
        let (count, first) = if state.is_live() {
            let starts = read_recording_starts(reader, block)?;
            (Some(starts.len()), starts.first().copied())
        } else {
            (None, None)
        };
        mappings.push(SectorSummary {
            index: block - area.start_block,
            raw_state,
            state,
            count,
            first,
        });
    }
    Ok(AreaSummary { bitmaps, mappings })
}

fn raw_state<R: FlashReader + ?Sized>(reader: &mut R, block: u32) -> Result<u8> {
    let raw = reader.read_flash(block_address(block) + STATE_OFFSET, 1)?;
    Ok(raw.first().copied().unwrap_or(0xff))
}

impl fmt::Display for AreaSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for s in &self.bitmaps {
            writeln!(f, "Bitmap sector {}:  {} (0x{:02x})", s.index, s.state, s.raw_state)?;
            if let Some(count) = s.count {
                writeln!(f, "  '-- Allocated:  {}", count)?;
            }
        }
        for s in &self.mappings {
            writeln!(f, "Mapping sector {}: {} (0x{:02x})", s.index, s.state, s.raw_state)?;
            if let Some(count) = s.count {
                write!(f, "  '-- Recording count:  {}", count)?;
                if let Some(first) = s.first {
                    write!(f, " (first at 0x{:04x}000)", first)?;
                }
                writeln!(f)?;
            }
        }
        Ok(())
    }
}
