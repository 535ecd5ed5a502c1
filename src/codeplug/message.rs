//! Text messages: length-prefixed templates, and fixed slots for sent,
//! received and draft messages.
use std::fmt;

use crate::codeplug::contact::{CallType, ContactKey, ContactTable};
use crate::codeplug::layout::resources;
use crate::constants::SECTOR_SIZE;

const TEMPLATE_SLOT: usize = 0x81;
const TEMPLATE_START: usize = 0x10;
const INDEX_START: usize = 0x30;
const INDEX_END: usize = 0x110;
const SLOT_START: usize = 0x130;
const SLOT_SIZE: usize = 0x110;
const TEXT_OFFSET: usize = 0x10;
const ID_SUFFIX_LEN: usize = 3;
/// Indices below this are still recovered when their slot overruns the buffer.
const SHIM_LIMIT: usize = 28;
const SHIM_PERIOD: usize = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum MessageKind {
    Sent,
    Received,
    Drafts,
    Templates,
}

impl MessageKind {
    pub const ALL: [MessageKind; 4] = [
        MessageKind::Sent,
        MessageKind::Received,
        MessageKind::Drafts,
        MessageKind::Templates,
    ];

    pub fn resource(self) -> &'static str {
        match self {
            MessageKind::Sent => resources::MESSAGE_SENT,
            MessageKind::Received => resources::MESSAGE_RECEIVED,
            MessageKind::Drafts => resources::MESSAGE_DRAFTS,
            MessageKind::Templates => resources::MESSAGE_TEMPLATES,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Sent => "sent",
            MessageKind::Received => "received",
            MessageKind::Drafts => "drafts",
            MessageKind::Templates => "templates",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    Read,
    Unread,
}

impl MessageStatus {
    pub fn from_flag(flag: u8) -> Option<Self> {
        match flag {
            1 => Some(MessageStatus::Read),
            3 => Some(MessageStatus::Unread),
            _ => None,
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageStatus::Read => write!(f, "OK"),
            MessageStatus::Unread => write!(f, "unread"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub text: String,
    /// Templates carry no status or peer.
    pub status: Option<MessageStatus>,
    pub dmr_id: Option<u32>,
    pub group: bool,
    pub call_sign: Option<String>,
}

impl Message {
    fn template(text: String) -> Self {
        Message {
            text,
            status: None,
            dmr_id: None,
            group: false,
            call_sign: None,
        }
    }
}

/// Decode the messages of one kind. `scan` walks every slot instead of the
/// stored index list, recovering messages whose index entry was lost.
pub fn decode(
    data: &[u8],
    kind: MessageKind,
    scan: bool,
    contacts: Option<&ContactTable>,
) -> Vec<Message> {
    if kind == MessageKind::Templates {
        return decode_templates(data);
    }

    let indexes: Vec<usize> = if scan {
        (1..=data.len().saturating_sub(SLOT_START) / SLOT_SIZE).collect()
    } else {
        let list = data.get(INDEX_START..INDEX_END).unwrap_or_default();
        let end = list.iter().rposition(|&b| b != 0xff).map_or(0, |i| i + 1);
        list[..end].iter().map(|&i| i as usize).collect()
    };

    let mut messages = Vec::new();
    for i in indexes {
        if i == 0 {
            continue;
        }
        let mut pos = SLOT_START + (i - 1) * SLOT_SIZE;
        if pos + SLOT_SIZE > data.len() && i < SHIM_LIMIT {
            log::warn!("Message storage bug detected, trying to extract {} message {} anyway", kind, i);
            pos = ((i % SHIM_PERIOD) * SLOT_SIZE) % SECTOR_SIZE;
        }
        let Some(slot) = data.get(pos..(pos + SLOT_SIZE).min(data.len())) else {
            log::warn!("{} message {} lies outside the storage", kind, i);
            continue;
        };
        if slot.len() < TEXT_OFFSET {
            log::warn!("{} message {} is truncated", kind, i);
            continue;
        }

        let Some(status) = MessageStatus::from_flag(slot[0]) else {
            if !scan {
                log::warn!("Broken {} message {}: type 0x{:02x}, skipping", kind, i, slot[0]);
            }
            continue;
        };
        // lengths up to the id suffix are taken as plain text lengths
        let len = match slot[1] as usize {
            n if n > ID_SUFFIX_LEN => n - ID_SUFFIX_LEN,
            n => n,
        };
        let dmr_id = slot[13] as u32 | (slot[14] as u32) << 8 | (slot[15] as u32) << 16;
        let group = slot[2] & 0x01 != 0;
        let text_end = (TEXT_OFFSET + len).min(slot.len());

        messages.push(Message {
            text: to_text(&slot[TEXT_OFFSET..text_end]),
            status: Some(status),
            dmr_id: Some(dmr_id),
            group,
            call_sign: contacts.and_then(|c| resolve(c, dmr_id, group)),
        });
    }
    messages
}

fn decode_templates(data: &[u8]) -> Vec<Message> {
    let count = match data.first() {
        Some(&0xff) | None => 0,
        Some(&n) => n as usize,
    };
    let mut messages = Vec::with_capacity(count);
    for i in 0..count {
        let start = TEMPLATE_START + i * TEMPLATE_SLOT;
        let Some(&len) = data.get(start) else {
            log::warn!("Template {} lies outside the storage", i);
            break;
        };
        let end = (start + 1 + (len as usize).min(TEMPLATE_SLOT - 1)).min(data.len());
        messages.push(Message::template(to_text(&data[start + 1..end])));
    }
    messages
}

fn resolve(contacts: &ContactTable, id: u32, group: bool) -> Option<String> {
    let (first, second) = if group {
        (CallType::Group, CallType::Private)
    } else {
        (CallType::Private, CallType::Group)
    };
    let found = contacts
        .by_key(ContactKey::new(id, first))
        .or_else(|| contacts.by_key(ContactKey::new(id, second)));
    if found.is_none() {
        log::warn!("No contact found for DMR id {}", id);
    }
    found.map(|c| c.call_sign.clone())
}

fn to_text(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0x00).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codeplug::contact::Contact;

    fn slot(flag: u8, id: u32, group: bool, text: &str) -> Vec<u8> {
        let mut s = vec![0xffu8; SLOT_SIZE];
        s[0] = flag;
        s[1] = (text.len() + ID_SUFFIX_LEN) as u8;
        s[2] = group as u8;
        s[13..16].copy_from_slice(&id.to_le_bytes()[..3]);
        s[TEXT_OFFSET..TEXT_OFFSET + text.len()].copy_from_slice(text.as_bytes());
        s
    }

    fn storage(slots: &[Vec<u8>], index: &[u8]) -> Vec<u8> {
        let mut data = vec![0xffu8; SLOT_START];
        data[INDEX_START..INDEX_START + index.len()].copy_from_slice(index);
        for s in slots {
            data.extend_from_slice(s);
        }
        data
    }

    #[test]
    fn test_decode_templates() {
        let mut data = vec![0xffu8; 0x200];
        data[0] = 2;
        data[0x10] = 5;
        data[0x11..0x16].copy_from_slice(b"hello");
        data[0x91] = 3;
        data[0x92..0x95].copy_from_slice(b"73!");
        let messages = decode(&data, MessageKind::Templates, false, None);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].text, "hello");
        assert_eq!(messages[1].text, "73!");
        assert!(messages[1].status.is_none());
    }

    #[test]
    fn test_decode_uses_index_list() {
        let data = storage(
            &[slot(1, 2621001, false, "first"), slot(3, 2621002, false, "second")],
            &[2],
        );
        let messages = decode(&data, MessageKind::Received, false, None);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "second");
        assert_eq!(messages[0].status, Some(MessageStatus::Unread));
        assert_eq!(messages[0].dmr_id, Some(2621002));

        let messages = decode(&data, MessageKind::Received, true, None);
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn test_unknown_flag_skipped_in_both_modes() {
        let data = storage(
            &[slot(1, 1, false, "ok"), slot(0x07, 2, false, "bad"), slot(3, 3, false, "ok too")],
            &[1, 2, 3],
        );
        for scan in [false, true] {
            let messages = decode(&data, MessageKind::Sent, scan, None);
            let texts: Vec<_> = messages.iter().map(|m| m.text.as_str()).collect();
            assert_eq!(texts, vec!["ok", "ok too"], "scan={}", scan);
        }
    }

    #[test]
    fn test_short_length_keeps_text() {
        let mut record = slot(1, 42, false, "hi");
        record[1] = 2;
        let data = storage(&[record], &[1]);
        let messages = decode(&data, MessageKind::Sent, false, None);
        assert_eq!(messages[0].text, "hi");
    }

    #[test]
    fn test_storage_bug_shim() {
        let mut data = vec![0xffu8; SLOT_START + SHIM_PERIOD * SLOT_SIZE];
        data[INDEX_START] = 15;
        let record = slot(1, 42, false, "wrapped");
        data[SLOT_SIZE..2 * SLOT_SIZE].copy_from_slice(&record);

        let messages = decode(&data, MessageKind::Drafts, false, None);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "wrapped");
    }

    #[test]
    fn test_resolve_call_sign() {
        let mut contacts = ContactTable::new();
        contacts.insert(Contact::new(91, "WORLD", CallType::Group));
        contacts.insert(Contact::new(2621001, "OK1ABC", CallType::Private));

        let data = storage(
            &[slot(1, 91, true, "tg"), slot(1, 2621001, true, "fallback"), slot(1, 7, false, "none")],
            &[1, 2, 3],
        );
        let messages = decode(&data, MessageKind::Sent, false, Some(&contacts));
        assert_eq!(messages[0].call_sign.as_deref(), Some("WORLD"));
        assert_eq!(messages[1].call_sign.as_deref(), Some("OK1ABC"));
        assert_eq!(messages[2].call_sign, None);
    }
}
