//! Contact directory: an occupancy bitmap plus sorted indices in the metadata
//! resource, and fixed 24-byte records in the data resource.
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

use bitfield::bitfield;
use scroll::{LE, Pread};

use crate::Result;

pub const CAPACITY: usize = 800;
pub const RECORD_SIZE: usize = 24;
pub const CALL_SIGN_LEN: usize = 16;
pub const META_SIZE: usize = 0xd00;

const BITMAP_OFFSET: usize = 0x10;
const BITMAP_LEN: usize = CAPACITY.div_ceil(8);
const ALPHA_INDEX_OFFSET: usize = 0x80;
const NUMERIC_INDEX_OFFSET: usize = ALPHA_INDEX_OFFSET + CAPACITY * 2;
const INDEX_PAD: u16 = 0x00f0;
const WORD_OFFSET: usize = 17;

/// Broadcast id used for "all call" contacts.
pub const ALL_CALL_ID: u32 = 0xff_ffff;

bitfield! {
    /// Id and call type as stored in a contact record.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct ContactWord(u32);
    impl Debug;
    u32;
    pub id, set_id: 23, 0;
    pub u8, type_low, set_type_low: 27, 24;
    pub u8, type_high, set_type_high: 31, 28;
}

bitfield! {
    /// Entry of the alphabetic and numeric index arrays.
    #[derive(Clone, Copy, PartialEq, Eq)]
    struct IndexEntry(u16);
    impl Debug;
    u16;
    _, set_position: 11, 0;
    u8, _, set_call_type: 15, 12;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CallType {
    Private,
    Group,
    All,
}

impl CallType {
    pub fn code(self) -> u8 {
        match self {
            CallType::Private => 0x3,
            CallType::Group => 0x4,
            CallType::All => 0x5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x3 => Some(CallType::Private),
            0x4 => Some(CallType::Group),
            0x5 => Some(CallType::All),
            _ => None,
        }
    }

    /// Guess the call type of a bare id.
    pub fn infer(id: u32) -> Self {
        if id == ALL_CALL_ID {
            CallType::All
        } else if !(4000..=5000).contains(&id) && id < 1_000_000 && id != 9990 {
            CallType::Group
        } else {
            CallType::Private
        }
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallType::Private => write!(f, "Private Call"),
            CallType::Group => write!(f, "Group Call"),
            CallType::All => write!(f, "All Call"),
        }
    }
}

/// Disambiguates contacts sharing a numeric id, displayed as `id`, `id.1`
/// and `id.2` for private, group and all calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContactKey {
    pub id: u32,
    pub call_type: CallType,
}

impl ContactKey {
    pub fn new(id: u32, call_type: CallType) -> Self {
        ContactKey { id, call_type }
    }
}

impl fmt::Display for ContactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.call_type {
            CallType::Private => write!(f, "{}", self.id),
            CallType::Group => write!(f, "{}.1", self.id),
            CallType::All => write!(f, "{}.2", self.id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub id: u32,
    pub call_sign: String,
    pub name: Option<String>,
    pub country: Option<String>,
    pub call_type: CallType,
}

impl Contact {
    pub fn new(id: u32, call_sign: impl Into<String>, call_type: CallType) -> Self {
        Contact {
            id,
            call_sign: call_sign.into(),
            name: None,
            country: None,
            call_type,
        }
    }

    pub fn with_inferred_type(id: u32, call_sign: impl Into<String>) -> Self {
        Self::new(id, call_sign, CallType::infer(id))
    }

    pub fn key(&self) -> ContactKey {
        ContactKey::new(self.id, self.call_type)
    }

    fn from_record(record: &[u8]) -> Result<Self> {
        let raw = &record[..CALL_SIGN_LEN];
        let end = raw.iter().position(|&b| b == 0x00 || b == 0xff).unwrap_or(CALL_SIGN_LEN);
        let call_sign = String::from_utf8_lossy(&raw[..end]).into_owned();

        let word = ContactWord(record.pread_with::<u32>(WORD_OFFSET, LE)?);
        let id = word.id();
        let call_type = CallType::from_code(word.type_low())
            .or_else(|| CallType::from_code(word.type_high()))
            .unwrap_or_else(|| {
                log::debug!("Contact {} ({}) has no call type, guessing", call_sign, id);
                CallType::infer(id)
            });
        Ok(Contact::new(id, call_sign, call_type))
    }

    fn to_record(&self) -> [u8; RECORD_SIZE] {
        let mut record = [0xffu8; RECORD_SIZE];
        let call_sign = truncate_utf8(&self.call_sign, CALL_SIGN_LEN).as_bytes();
        record[..CALL_SIGN_LEN].fill(0x00);
        record[..call_sign.len()].copy_from_slice(call_sign);

        let mut word = ContactWord(0);
        word.set_id(self.id & ALL_CALL_ID);
        word.set_type_low(self.call_type.code());
        record[WORD_OFFSET..WORD_OFFSET + 4].copy_from_slice(&word.0.to_le_bytes());
        record
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.call_sign)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum SortOrder {
    #[default]
    CallSign,
    Id,
    Name,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Added,
    /// Call sign taken by another contact; stored under the new label.
    Renamed(String),
    Duplicate,
}

pub struct EncodedContacts {
    pub meta: Vec<u8>,
    pub data: Vec<u8>,
    /// Contacts beyond [`CAPACITY`] that were not encoded.
    pub dropped: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ContactTable {
    contacts: Vec<Contact>,
    by_call_sign: HashMap<String, usize>,
    by_id: HashMap<u32, usize>,
    by_key: HashMap<ContactKey, usize>,
}

impl ContactTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the contacts whose occupancy bit is set. The sorted indices in
    /// `meta` are not consulted.
    pub fn decode(data: &[u8], meta: &[u8]) -> Result<Self> {
        let mut table = ContactTable::new();
        let bitmap = meta.get(BITMAP_OFFSET..BITMAP_OFFSET + BITMAP_LEN).unwrap_or_default();
        for slot in 0..CAPACITY {
            let used = bitmap.get(slot / 8).is_some_and(|b| b & (1 << (slot % 8)) != 0);
            if !used {
                continue;
            }
            let Some(record) = data.get(slot * RECORD_SIZE..(slot + 1) * RECORD_SIZE) else {
                log::warn!("Contact slot {} lies outside the contact data", slot);
                break;
            };
            if record.iter().all(|&b| b == 0xff) {
                log::debug!("Contact slot {} is marked used but erased", slot);
                continue;
            }
            let contact = Contact::from_record(record)?;
            if table.insert(contact) == InsertOutcome::Duplicate {
                log::debug!("Duplicate contact in slot {}", slot);
            }
        }
        log::debug!("Decoded {} contacts", table.len());
        Ok(table)
    }

    pub fn insert(&mut self, mut contact: Contact) -> InsertOutcome {
        if self.by_key.contains_key(&contact.key()) {
            return InsertOutcome::Duplicate;
        }

        let mut outcome = InsertOutcome::Added;
        if self.by_call_sign.contains_key(&contact.call_sign) {
            let base = contact.call_sign.clone();
            let mut n = 1;
            loop {
                let candidate = suffixed(&base, n);
                match self.by_call_sign.get(&candidate) {
                    None => {
                        log::info!("Contact {} ({}) renamed to {}", base, contact.key(), candidate);
                        contact.call_sign = candidate.clone();
                        outcome = InsertOutcome::Renamed(candidate);
                        break;
                    }
                    Some(_) => n += 1,
                }
            }
        }

        let idx = self.contacts.len();
        self.index(idx, &contact);
        self.contacts.push(contact);
        outcome
    }

    fn index(&mut self, idx: usize, contact: &Contact) {
        self.by_call_sign.insert(contact.call_sign.clone(), idx);
        self.by_id.entry(contact.id).or_insert(idx);
        self.by_key.insert(contact.key(), idx);
    }

    fn reindex(&mut self) {
        self.by_call_sign.clear();
        self.by_id.clear();
        self.by_key.clear();
        let contacts = std::mem::take(&mut self.contacts);
        for (idx, contact) in contacts.iter().enumerate() {
            self.index(idx, contact);
        }
        self.contacts = contacts;
    }

    pub fn sort(&mut self, order: SortOrder) {
        match order {
            SortOrder::CallSign => self
                .contacts
                .sort_by(|a, b| a.call_sign.cmp(&b.call_sign).then(a.key().cmp(&b.key()))),
            SortOrder::Id => self.contacts.sort_by_key(Contact::key),
            SortOrder::Name => self
                .contacts
                .sort_by(|a, b| a.name.cmp(&b.name).then(a.call_sign.cmp(&b.call_sign))),
        }
        self.reindex();
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Contact> {
        self.contacts.get(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Contact> {
        self.contacts.iter()
    }

    pub fn by_call_sign(&self, call_sign: &str) -> Option<&Contact> {
        self.by_call_sign.get(call_sign).map(|&i| &self.contacts[i])
    }

    /// First contact inserted with this id, whatever its call type.
    pub fn by_id(&self, id: u32) -> Option<&Contact> {
        self.by_id.get(&id).map(|&i| &self.contacts[i])
    }

    pub fn by_key(&self, key: ContactKey) -> Option<&Contact> {
        self.by_key.get(&key).map(|&i| &self.contacts[i])
    }

    /// Encode metadata and records for the first [`CAPACITY`] contacts.
    pub fn encode(&self) -> EncodedContacts {
        let stored = &self.contacts[..self.contacts.len().min(CAPACITY)];
        let dropped = self.contacts.len() - stored.len();
        let count = stored.len();

        let mut meta = vec![0xffu8; META_SIZE];
        let groups = stored.iter().filter(|c| c.call_type == CallType::Group).count();
        let has_all = stored.iter().any(|c| c.call_type == CallType::All);
        meta[0..2].copy_from_slice(&(count as u16).to_le_bytes());
        meta[2..4].copy_from_slice(&(groups as u16).to_le_bytes());
        meta[4] = has_all as u8;

        let bitmap = &mut meta[BITMAP_OFFSET..BITMAP_OFFSET + BITMAP_LEN];
        bitmap.fill(0x00);
        bitmap[..count / 8].fill(0xff);
        if count % 8 != 0 {
            bitmap[count / 8] = (1u8 << (count % 8)) - 1;
        }

        let mut alpha: Vec<usize> = (0..count).collect();
        alpha.sort_by(|&a, &b| by_call_sign(&stored[a], &stored[b]));
        let mut numeric: Vec<usize> = (0..count).collect();
        numeric.sort_by_key(|&i| stored[i].key());
        write_index(&mut meta[ALPHA_INDEX_OFFSET..NUMERIC_INDEX_OFFSET], stored, &alpha);
        write_index(&mut meta[NUMERIC_INDEX_OFFSET..META_SIZE], stored, &numeric);

        let data = stored.iter().flat_map(Contact::to_record).collect();
        EncodedContacts { meta, data, dropped }
    }
}

fn by_call_sign(a: &Contact, b: &Contact) -> Ordering {
    a.call_sign
        .to_uppercase()
        .cmp(&b.call_sign.to_uppercase())
        .then(a.key().cmp(&b.key()))
}

fn write_index(out: &mut [u8], contacts: &[Contact], order: &[usize]) {
    for (i, entry) in out.chunks_exact_mut(2).enumerate() {
        let value = match order.get(i) {
            Some(&slot) => {
                let mut e = IndexEntry(0);
                e.set_position(slot as u16 + 1);
                e.set_call_type(contacts[slot].call_type.code());
                e.0
            }
            None => INDEX_PAD,
        };
        entry.copy_from_slice(&value.to_le_bytes());
    }
}

fn truncate_utf8(s: &str, max: usize) -> &str {
    let mut end = s.len().min(max);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// `base-n`, with `base` shortened so the label still fits a record.
fn suffixed(base: &str, n: usize) -> String {
    let suffix = format!("-{}", n);
    let base = truncate_utf8(base, CALL_SIGN_LEN.saturating_sub(suffix.len()));
    format!("{}{}", base, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_type_infer() {
        assert_eq!(CallType::infer(ALL_CALL_ID), CallType::All);
        assert_eq!(CallType::infer(91), CallType::Group);
        assert_eq!(CallType::infer(4500), CallType::Private);
        assert_eq!(CallType::infer(9990), CallType::Private);
        assert_eq!(CallType::infer(2_621_001), CallType::Private);
    }

    #[test]
    fn test_key_order_and_display() {
        let private = ContactKey::new(91, CallType::Private);
        let group = ContactKey::new(91, CallType::Group);
        assert!(private < group);
        assert!(group < ContactKey::new(92, CallType::Private));
        assert_eq!(private.to_string(), "91");
        assert_eq!(group.to_string(), "91.1");
        assert_eq!(ContactKey::new(91, CallType::All).to_string(), "91.2");
    }

    #[test]
    fn test_insert_duplicate_is_noop() {
        let mut table = ContactTable::new();
        assert_eq!(table.insert(Contact::new(2621001, "OK1ABC", CallType::Private)), InsertOutcome::Added);
        assert_eq!(
            table.insert(Contact::new(2621001, "OTHER", CallType::Private)),
            InsertOutcome::Duplicate
        );
        assert_eq!(table.len(), 1);
        assert_eq!(table.by_id(2621001).unwrap().call_sign, "OK1ABC");
    }

    #[test]
    fn test_insert_same_call_sign_renames() {
        let mut table = ContactTable::new();
        table.insert(Contact::new(2621001, "OK1ABC", CallType::Private));
        assert_eq!(
            table.insert(Contact::new(2621002, "OK1ABC", CallType::Private)),
            InsertOutcome::Renamed("OK1ABC-1".to_string())
        );
        assert_eq!(
            table.insert(Contact::new(2621003, "OK1ABC", CallType::Private)),
            InsertOutcome::Renamed("OK1ABC-2".to_string())
        );
        assert_eq!(table.by_call_sign("OK1ABC-1").unwrap().id, 2621002);
        assert_eq!(table.len(), 3);

        // a renamed contact is still found by its key
        assert_eq!(
            table.insert(Contact::new(2621002, "OK1ABC", CallType::Private)),
            InsertOutcome::Duplicate
        );
        assert_eq!(
            table.insert(Contact::new(2621002, "OK1ABC", CallType::Group)),
            InsertOutcome::Renamed("OK1ABC-3".to_string())
        );
        assert_eq!(table.len(), 4);
    }

    #[test]
    fn test_rename_fits_record() {
        let mut table = ContactTable::new();
        table.insert(Contact::new(1, "ABCDEFGHIJKLMNOP", CallType::Private));
        let outcome = table.insert(Contact::new(2, "ABCDEFGHIJKLMNOP", CallType::Private));
        assert_eq!(outcome, InsertOutcome::Renamed("ABCDEFGHIJKLMN-1".to_string()));
    }

    #[test]
    fn test_record_layout() {
        let contact = Contact::new(0x123456, "OK1ABC", CallType::Group);
        let record = contact.to_record();
        assert_eq!(&record[..6], b"OK1ABC");
        assert_eq!(record[6..16], [0u8; 10]);
        assert_eq!(record[16], 0xff);
        assert_eq!(&record[17..21], &[0x56, 0x34, 0x12, 0x04]);
        assert_eq!(&record[21..], &[0xff, 0xff, 0xff]);
        assert_eq!(Contact::from_record(&record).unwrap(), contact);
    }

    #[test]
    fn test_record_type_in_high_nibble() {
        let mut record = [0u8; RECORD_SIZE];
        record[..3].copy_from_slice(b"TG9");
        record[17..21].copy_from_slice(&0x4000_0009u32.to_le_bytes());
        let contact = Contact::from_record(&record).unwrap();
        assert_eq!(contact.key(), ContactKey::new(9, CallType::Group));
    }

    #[test]
    fn test_encode_decode_keeps_contacts() {
        let mut table = ContactTable::new();
        for i in 0..11u32 {
            table.insert(Contact::new(2621000 + i, format!("OK{}", i), CallType::Private));
        }
        table.insert(Contact::new(91, "WORLD", CallType::Group));
        table.insert(Contact::new(ALL_CALL_ID, "ALL", CallType::All));

        let encoded = table.encode();
        assert_eq!(encoded.dropped, 0);
        assert_eq!(encoded.meta.len(), META_SIZE);
        assert_eq!(encoded.data.len(), 13 * RECORD_SIZE);
        assert_eq!(u16::from_le_bytes([encoded.meta[0], encoded.meta[1]]), 13);
        assert_eq!(u16::from_le_bytes([encoded.meta[2], encoded.meta[3]]), 1);
        assert_eq!(encoded.meta[4], 1);
        assert_eq!(encoded.meta[BITMAP_OFFSET], 0xff);
        assert_eq!(encoded.meta[BITMAP_OFFSET + 1], 0x1f);
        assert_eq!(encoded.meta[BITMAP_OFFSET + 2], 0x00);

        // first alphabetic entry is "ALL", slot 12, type 5
        let first = u16::from_le_bytes([encoded.meta[ALPHA_INDEX_OFFSET], encoded.meta[ALPHA_INDEX_OFFSET + 1]]);
        assert_eq!(first, 13 | (5 << 12));
        let pad = ALPHA_INDEX_OFFSET + 13 * 2;
        assert_eq!(&encoded.meta[pad..pad + 2], &INDEX_PAD.to_le_bytes());
        // first numeric entry is the talkgroup
        let first = u16::from_le_bytes([encoded.meta[NUMERIC_INDEX_OFFSET], encoded.meta[NUMERIC_INDEX_OFFSET + 1]]);
        assert_eq!(first, 12 | (4 << 12));

        let decoded = ContactTable::decode(&encoded.data, &encoded.meta).unwrap();
        let mut before: Vec<_> = table.iter().cloned().collect();
        let mut after: Vec<_> = decoded.iter().cloned().collect();
        before.sort_by_key(Contact::key);
        after.sort_by_key(Contact::key);
        assert_eq!(before, after);
    }

    #[test]
    fn test_encode_drops_over_capacity() {
        let mut table = ContactTable::new();
        for i in 0..(CAPACITY as u32 + 5) {
            table.insert(Contact::new(1_000_000 + i, format!("C{}", i), CallType::Private));
        }
        let encoded = table.encode();
        assert_eq!(encoded.dropped, 5);
        assert_eq!(encoded.data.len(), CAPACITY * RECORD_SIZE);
        assert!(encoded.meta[BITMAP_OFFSET..BITMAP_OFFSET + BITMAP_LEN].iter().all(|&b| b == 0xff));
    }

    #[test]
    fn test_sort_rebuilds_indices() {
        let mut table = ContactTable::new();
        table.insert(Contact::new(3, "C", CallType::Private));
        table.insert(Contact::new(1, "B", CallType::Private));
        table.insert(Contact::new(2, "A", CallType::Private));

        table.sort(SortOrder::CallSign);
        assert_eq!(table.get(0).unwrap().call_sign, "A");
        table.sort(SortOrder::Id);
        assert_eq!(table.get(0).unwrap().call_sign, "B");
        assert_eq!(table.by_call_sign("C").unwrap().id, 3);
        assert_eq!(table.by_key(ContactKey::new(2, CallType::Private)).unwrap().call_sign, "A");
    }
}
