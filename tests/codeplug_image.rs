use md1702::codeplug::{CallType, Contact, ContactKey, Layout, MessageKind, MessageStatus, resources};
use md1702::constants::SECTOR_SIZE;
use md1702::{Codeplug, Error};
use proptest::prelude::*;

const CONTACT_META_MARK: u8 = 0x0c;
const CONTACT_DATA_MARK: u8 = 0x0d;
const MESSAGE_SENT_MARK: u8 = 0x13;

fn sector(mark: u8) -> Vec<u8> {
    let mut s = vec![0xff; SECTOR_SIZE];
    s[SECTOR_SIZE - 1] = mark;
    s
}

/// An image holding one sector for every mark the built-in layout uses.
fn full_image() -> Vec<u8> {
    let layout = Layout::load().unwrap();
    let mut marks: Vec<u8> = layout
        .names()
        .flat_map(|name| layout.chain(name).unwrap().iter().map(|l| l.mark))
        .collect();
    marks.sort();
    marks.dedup();
    marks.into_iter().flat_map(sector).collect()
}

#[test]
fn decode_single_contact_from_synthetic_image() {
    let mut meta = sector(CONTACT_META_MARK);
    meta[0] = 1;
    meta[0x10..0x10 + 100].fill(0);
    meta[0x10] = 0x01;

    let mut data = sector(CONTACT_DATA_MARK);
    data[..6].copy_from_slice(b"OK1ABC");
    data[6..16].fill(0);
    data[17..21].copy_from_slice(&(2621001u32 | 0x03 << 24).to_le_bytes());

    let image = [sector(0x01), meta, data].concat();
    let codeplug = Codeplug::from_bytes(image).unwrap();
    let contacts = codeplug.contacts().unwrap();

    assert_eq!(contacts.len(), 1);
    let contact = contacts.get(0).unwrap();
    assert_eq!(contact.id, 2621001);
    assert_eq!(contact.call_sign, "OK1ABC");
    assert_eq!(contact.call_type, CallType::Private);
}

#[test]
fn store_contacts_round_trip_through_file() {
    let mut codeplug = Codeplug::from_bytes(full_image()).unwrap();
    let mut table = codeplug.contacts().unwrap();
    assert!(table.is_empty());

    table.insert(Contact::new(2621001, "OK1ABC", CallType::Private));
    table.insert(Contact::new(91, "WORLDWIDE", CallType::Group));
    table.insert(Contact::new(2621002, "OK1ABC", CallType::Private));
    assert_eq!(codeplug.store_contacts(&table).unwrap(), 0);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("codeplug.bin");
    codeplug.save(&path).unwrap();

    let reloaded = Codeplug::from_file(&path).unwrap();
    assert_eq!(reloaded.image(), codeplug.image());
    let contacts = reloaded.contacts().unwrap();
    assert_eq!(contacts.len(), 3);
    assert_eq!(contacts.by_call_sign("OK1ABC-1").unwrap().id, 2621002);
    assert_eq!(
        contacts.by_key(ContactKey::new(91, CallType::Group)).unwrap().call_sign,
        "WORLDWIDE"
    );
}

#[test]
fn vendor_codeplug_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vendor.dat");
    std::fs::write(&path, vec![0xff; 0x3c000]).unwrap();
    assert!(matches!(Codeplug::from_file(&path), Err(Error::Validation(_))));
}

#[test]
fn messages_of_present_kinds_only() {
    let mut sent = sector(MESSAGE_SENT_MARK);
    sent[0x30] = 1;
    let slot = 0x130;
    sent[slot] = 3;
    sent[slot + 1] = 5 + 3;
    sent[slot + 13..slot + 16].copy_from_slice(&[0x49, 0xfe, 0x27]);
    sent[slot + 0x10..slot + 0x15].copy_from_slice(b"hello");

    let codeplug = Codeplug::from_bytes(sent).unwrap();
    assert!(codeplug.has_resource(resources::MESSAGE_SENT));
    assert!(codeplug.messages(MessageKind::Received, false, None).unwrap().is_none());

    let messages = codeplug.messages(MessageKind::Sent, false, None).unwrap().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].text, "hello");
    assert_eq!(messages[0].status, Some(MessageStatus::Unread));
    assert_eq!(messages[0].dmr_id, Some(2621001));
}

fn resource_and_payload() -> impl Strategy<Value = (&'static str, Vec<u8>)> {
    let names = [
        resources::CONTACT_META,
        resources::CONTACT_DATA,
        resources::MESSAGE_TEMPLATES,
        resources::MESSAGE_SENT,
        resources::BUTTONS,
        resources::CHANNEL_CONTACTS,
    ];
    prop::sample::select(names.to_vec()).prop_flat_map(|name| {
        let size = Layout::load().unwrap().size(name).unwrap();
        (Just(name), prop::collection::vec(any::<u8>(), size))
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn get_data_returns_what_set_data_stored((name, payload) in resource_and_payload()) {
        let mut codeplug = Codeplug::from_bytes(full_image()).unwrap();
        let sectors = codeplug.image().len();
        prop_assert_eq!(codeplug.get_data_size(name).unwrap(), payload.len());

        codeplug.set_data(name, &payload).unwrap();
        prop_assert_eq!(codeplug.get_data(name).unwrap(), payload);
        // no sector was added and the marks survived
        prop_assert_eq!(codeplug.image().len(), sectors);
        prop_assert!(codeplug.has_resource(name));
    }
}
