use chrono::NaiveDate;
use md1702::FlashImage;
use md1702::constants::SECTOR_SIZE;
use md1702::recording::{self, IMAGE_AREA_START, SectorState};

const AREA_BLOCK: usize = (IMAGE_AREA_START as usize) / SECTOR_SIZE;
const AREA_BLOCKS: usize = 0x40;
const HEAD: u16 = 0x190;
const CONTINUATION: u16 = 0x191;
const ORPHAN: u16 = 0x1a0;
const BROKEN: u16 = 0x1a5;

fn header(day: u8, month: u8, duration: i16) -> Vec<u8> {
    let mut h = vec![
        0x11, 0x10, 0x49, 0xfe, 0x27, 0x5b, 0x00, 0x00, 3, 2, 0x00, 24, 20, month, day, 10, 0, 0,
    ];
    h.extend_from_slice(&duration.to_le_bytes());
    h
}

fn block(area: &mut [u8], index: u16) -> &mut [u8] {
    let start = (index as usize - AREA_BLOCK) * SECTOR_SIZE;
    &mut area[start..start + SECTOR_SIZE]
}

fn set_size(sector: &mut [u8], size: u16) {
    sector[0xffe..0x1000].copy_from_slice(&size.to_le_bytes());
}

/// Recording area image: one indexed recording with a continuation, one
/// orphaned head and one implausible head.
fn area_image() -> FlashImage {
    let mut area = vec![0xffu8; AREA_BLOCKS * SECTOR_SIZE];

    let bitmap = block(&mut area, AREA_BLOCK as u16);
    bitmap[0] = 0b0111_1100;
    bitmap[0xfff] = 0xa5;

    let mapping = block(&mut area, AREA_BLOCK as u16 + 3);
    mapping[..2].copy_from_slice(&HEAD.to_le_bytes());
    mapping[0xfff] = 0xa5;

    let head = block(&mut area, HEAD);
    head[..0x14].copy_from_slice(&header(15, 6, 120));
    head[0x20..0x22].copy_from_slice(&CONTINUATION.to_le_bytes());
    head[0x200..0x300].fill(0xab);
    set_size(head, 0x100);

    let cont = block(&mut area, CONTINUATION);
    cont[..0x10].fill(0xcd);
    set_size(cont, 0x10);

    let orphan = block(&mut area, ORPHAN);
    orphan[..0x14].copy_from_slice(&header(16, 6, 50));
    orphan[0x200..0x220].fill(0xee);
    set_size(orphan, 0x20);

    let broken = block(&mut area, BROKEN);
    broken[..0x14].copy_from_slice(&header(16, 13, 50));
    set_size(broken, 0x20);

    FlashImage::new(area, 22, AREA_BLOCK)
}

#[test]
fn indexed_recordings_only_without_scan() {
    let mut image = area_image();
    let area = image.default_area().unwrap();
    assert_eq!(area.start_block, AREA_BLOCK as u32);

    let recs = recording::collect_recordings(&mut image, &area, false).unwrap();
    assert_eq!(recs.keys().copied().collect::<Vec<_>>(), vec![HEAD as u32]);

    let rec = &recs[&(HEAD as u32)];
    assert_eq!(rec.continuations, vec![CONTINUATION as u32]);
    assert_eq!(rec.header.src_id, 2621001);
    assert_eq!(rec.to_string(), "2024-06-15_10-00-00_A_2621001_TG91_TX_Z3C2_12.0s");

    let payload = recording::read_payload(&mut image, rec).unwrap();
    assert_eq!(payload.len(), 0x110);
    assert!(payload[..0x100].iter().all(|&b| b == 0xab));
    assert!(payload[0x100..].iter().all(|&b| b == 0xcd));
}

#[test]
fn scan_recovers_orphaned_heads() {
    let mut image = area_image();
    let area = image.default_area().unwrap();

    let recs = recording::collect_recordings(&mut image, &area, true).unwrap();
    assert_eq!(
        recs.keys().copied().collect::<Vec<_>>(),
        vec![HEAD as u32, ORPHAN as u32]
    );
    assert_eq!(recs[&(ORPHAN as u32)].duration(), 5.0);
}

#[test]
fn save_recordings_writes_tagged_files() {
    let mut image = area_image();
    let area = image.default_area().unwrap();
    let recs = recording::collect_recordings(&mut image, &area, true).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let prefix = format!("{}/", dir.path().display());
    let newer_than = NaiveDate::from_ymd_opt(2024, 6, 15)
        .unwrap()
        .and_hms_opt(12, 0, 0)
        .unwrap();

    let saved = recording::save_recordings(&mut image, &area, &recs, &prefix, Some(newer_than)).unwrap();
    assert_eq!(saved, 1);

    let orphan = &recs[&(ORPHAN as u32)];
    let content = std::fs::read(orphan.file_name(&prefix)).unwrap();
    assert_eq!(&content[..4], b".dmr");
    assert_eq!(content[4..], [0xeeu8; 0x20]);

    let saved = recording::save_recordings(&mut image, &area, &recs, &prefix, None).unwrap();
    assert_eq!(saved, 2);
}

#[test]
fn area_summary_reports_sector_states() {
    let mut image = area_image();
    let area = image.default_area().unwrap();
    let summary = recording::area_summary(&mut image, &area).unwrap();

    assert_eq!(summary.bitmaps.len(), 3);
    assert_eq!(summary.bitmaps[0].state, SectorState::Used);
    assert_eq!(summary.bitmaps[0].count, Some(2));
    assert_eq!(summary.bitmaps[1].state, SectorState::Empty);

    assert_eq!(summary.mappings.len(), 6);
    assert_eq!(summary.mappings[0].count, Some(1));
    assert_eq!(summary.mappings[0].first, Some(HEAD as u32));

    let text = summary.to_string();
    assert!(text.contains("Bitmap sector 0:  Used (0xa5)"));
    assert!(text.contains("Recording count:  1 (first at 0x0190000)"));
}
