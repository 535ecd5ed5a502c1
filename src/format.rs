//! File formats: firmware images, raw flash images and recording dumps
use std::io::Write;
use std::path::Path;
use std::str;

use crate::constants::{SECTOR_SIZE, firmware};
use crate::{Error, Result};

/// Vendor CPS codeplug files have exactly this size; they are not raw images.
pub const VENDOR_CODEPLUG_SIZE: usize = 0x3c000;

/// Tag written in front of every recording payload.
pub const RECORDING_HEADER: &[u8] = b".dmr";
pub const RECORDING_EXT: &str = ".dmr";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirmwareFormat {
    PlainHex,
    IntelHex,
    Binary,
}

/// Drop the trailing run of erased (0xff) bytes.
pub fn trim_erased(mut data: Vec<u8>) -> Vec<u8> {
    let len = data.iter().rposition(|&b| b != 0xff).map_or(0, |i| i + 1);
    data.truncate(len);
    data
}

pub fn read_firmware_from_file<P: AsRef<Path>>(path: P) -> Result<Vec<u8>> {
    let p = path.as_ref();
    let raw = std::fs::read(p)?;

    let format = guess_format(p, &raw);
    log::info!("Read {} as {:?} format", p.display(), format);
    match format {
        FirmwareFormat::PlainHex => read_hex(
            &raw.into_iter()
                .filter(|&c| c != b'\r' && c != b'\n')
                .collect::<Vec<u8>>(),
        ),
        FirmwareFormat::IntelHex => read_ihex(
            str::from_utf8(&raw).map_err(|e| Error::Validation(format!("Intel HEX: {}", e)))?,
        ),
        FirmwareFormat::Binary => Ok(raw),
    }
}

pub fn guess_format(path: &Path, raw: &[u8]) -> FirmwareFormat {
    let ext = path
        .extension()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default()
        .to_lowercase();
    if ["ihex", "ihe", "h86", "hex", "a43", "a90"].contains(&&*ext) {
        return FirmwareFormat::IntelHex;
    }

    let is_text = |c: u8| (c as char).is_ascii_hexdigit() || c == b'\n' || c == b'\r';
    if raw.is_empty() {
        FirmwareFormat::Binary
    } else if raw[0] == b':' && raw.iter().all(|&c| is_text(c) || c == b':') {
        FirmwareFormat::IntelHex
    } else if raw.iter().all(|&c| is_text(c)) {
        FirmwareFormat::PlainHex
    } else {
        FirmwareFormat::Binary
    }
}

pub fn read_hex(data: &[u8]) -> Result<Vec<u8>> {
    hex::decode(data).map_err(|e| Error::Validation(format!("hex firmware: {}", e)))
}

pub fn read_ihex(data: &str) -> Result<Vec<u8>> {
    use ihex::Record;

    let mut base_address = 0;

    let mut records = vec![];
    for record in ihex::Reader::new(data) {
        let record = record.map_err(|e| Error::Validation(format!("Intel HEX: {}", e)))?;
        use Record::*;
        match record {
            Data { offset, value } => {
                records.push((base_address + offset as u32, value));
            }
            ExtendedSegmentAddress(address) => {
                base_address = (address as u32) * 16;
            }
            ExtendedLinearAddress(address) => {
                base_address = (address as u32) << 16;
            }
            EndOfFile | StartSegmentAddress { .. } | StartLinearAddress(_) => (),
        };
    }
    merge_sections(records)
}

/// Lay out address-tagged chunks into one image, gaps filled with erased bytes.
fn merge_sections(mut sections: Vec<(u32, Vec<u8>)>) -> Result<Vec<u8>> {
    sections.sort(); // order by start address

    let Some(start_address) = sections.first().map(|s| s.0) else {
        return Err(Error::Validation("firmware file holds no data".to_string()));
    };
    let end_address = sections
        .iter()
        .map(|(addr, sect)| *addr as usize + sect.len())
        .max()
        .unwrap_or(start_address as usize);

    let mut binary = vec![0xffu8; end_address - start_address as usize];
    for (addr, sect) in sections {
        let sect_start = (addr - start_address) as usize;
        binary[sect_start..sect_start + sect.len()].copy_from_slice(&sect);
    }
    Ok(binary)
}

/// Size bounds and vector table signature of a plain (unencrypted) firmware.
pub fn check_firmware(image: &[u8]) -> Result<()> {
    if image.len() > firmware::MAX_SIZE || image.len() < firmware::MIN_SIZE {
        return Err(Error::Validation(format!(
            "firmware size {} is not between {} and {} bytes, sanity check failed",
            image.len(),
            firmware::MIN_SIZE,
            firmware::MAX_SIZE
        )));
    }
    if image[3] != 0x20 || image[2] > 0x01 || image[7] != 0x08 || image[0xb] != 0x08 || image[0xf] != 0x08
    {
        return Err(Error::Validation(
            "firmware header sanity check failed, probably an encrypted firmware (use the official app)"
                .to_string(),
        ));
    }
    Ok(())
}

/// Raw codeplug images only; the vendor CPS file format is refused.
pub fn check_codeplug(image: &[u8]) -> Result<()> {
    if image.len() == VENDOR_CODEPLUG_SIZE {
        return Err(Error::Validation(
            "according to the size this is an official CPS codeplug, which is not supported"
                .to_string(),
        ));
    }
    Ok(())
}

/// Stock voice files carry one extra erased sector in front of the data.
pub fn strip_stock_voice_header(data: &[u8]) -> &[u8] {
    let stock = data.len() > 0x101b
        && data[..SECTOR_SIZE].iter().all(|&b| b == 0xff)
        && &data[0x1016..0x101b] == b"1.txt";
    if stock {
        log::info!("Stock voice data detected, removing first 0x{:x} bytes", SECTOR_SIZE);
        &data[SECTOR_SIZE..]
    } else {
        data
    }
}

pub fn write_recording<W: Write>(out: &mut W, payload: &[u8]) -> Result<()> {
    out.write_all(RECORDING_HEADER)?;
    out.write_all(payload)?;
    Ok(())
}

/// Render a classic hex dump, for dumps written to the terminal.
pub fn hexdump(data: &[u8]) -> Result<String> {
    let mut out = Vec::new();
    hxdmp::hexdump(data, &mut out)?;
    Ok(String::from_utf8_lossy(&out).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_firmware() -> Vec<u8> {
        let mut image = vec![0u8; firmware::MIN_SIZE];
        for offset in [7, 0xb, 0xf] {
            image[offset] = 0x08;
        }
        image[3] = 0x20;
        image
    }

    #[test]
    fn test_trim_erased() {
        assert_eq!(trim_erased(vec![1, 0xff, 2, 0xff, 0xff]), vec![1, 0xff, 2]);
        assert_eq!(trim_erased(vec![0xff; 8]), Vec::<u8>::new());
        assert_eq!(trim_erased(vec![0x00, 0xff]), vec![0x00]);
        assert_eq!(trim_erased(vec![]), Vec::<u8>::new());
    }

    #[test]
    fn test_check_firmware() {
        let image = valid_firmware();
        assert!(check_firmware(&image).is_ok());

        assert!(check_firmware(&image[..firmware::MIN_SIZE - 1]).is_err());
        assert!(check_firmware(&vec![0u8; firmware::MAX_SIZE + 1]).is_err());

        for (offset, value) in [(3, 0x00), (2, 0x02), (7, 0x00), (0xb, 0x09), (0xf, 0x00)] {
            let mut bad = image.clone();
            bad[offset] = value;
            assert!(
                matches!(check_firmware(&bad), Err(Error::Validation(_))),
                "offset {:#x} accepted",
                offset
            );
        }
    }

    #[test]
    fn test_check_codeplug_rejects_vendor_size() {
        assert!(check_codeplug(&vec![0xff; VENDOR_CODEPLUG_SIZE]).is_err());
        assert!(check_codeplug(&vec![0xff; 0xc8000]).is_ok());
    }

    #[test]
    fn test_strip_stock_voice_header() {
        let mut data = vec![0xff; 0x2000];
        data[0x1016..0x101b].copy_from_slice(b"1.txt");
        assert_eq!(strip_stock_voice_header(&data).len(), 0x1000);

        data[0] = 0;
        assert_eq!(strip_stock_voice_header(&data).len(), 0x2000);
    }

    #[test]
    fn test_read_ihex_merges_records() {
        let text = ":0400000001020304F2\n:02000800AABB91\n:00000001FF\n";
        let image = read_ihex(text).unwrap();
        assert_eq!(image, vec![1, 2, 3, 4, 0xff, 0xff, 0xff, 0xff, 0xaa, 0xbb]);
    }

    #[test]
    fn test_guess_format() {
        assert_eq!(guess_format(Path::new("fw.hex"), b"zz"), FirmwareFormat::IntelHex);
        assert_eq!(guess_format(Path::new("fw"), b"0a0b\n"), FirmwareFormat::PlainHex);
        assert_eq!(guess_format(Path::new("fw.bin"), &[0x00, 0x80]), FirmwareFormat::Binary);
    }

    #[test]
    fn test_hexdump() {
        let dump = hexdump(b"MD1702\x00\xff").unwrap();
        let padding = " ".repeat(8 * 3 + 1);
        assert_eq!(dump, format!("0000: 4D 44 31 37 30 32 00 FF {}MD1702..", padding));
    }

    #[test]
    fn test_write_recording() {
        let mut out = Vec::new();
        write_recording(&mut out, &[1, 2, 3]).unwrap();
        assert_eq!(out, b".dmr\x01\x02\x03".to_vec());
    }
}
