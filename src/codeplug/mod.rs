//! Codeplug images: 4096-byte sectors tagged by their last byte, assembled
//! into logical resources through the chains of a [`Layout`].
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::constants::SECTOR_SIZE;
use crate::format;
use crate::{Error, Result};

pub use self::contact::{
    CallType, Contact, ContactKey, ContactTable, EncodedContacts, InsertOutcome, SortOrder,
};
pub use self::layout::{Layout, Link, resources};
pub use self::message::{Message, MessageKind, MessageStatus};

pub mod contact;
pub mod layout;
pub mod message;

const MARK_OFFSET: usize = SECTOR_SIZE - 1;

/// Mark byte to sector index, first occurrence wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SectorMap {
    marks: BTreeMap<u8, usize>,
}

impl SectorMap {
    pub fn build(image: &[u8]) -> Self {
        let mut marks = BTreeMap::new();
        for (index, sector) in image.chunks_exact(SECTOR_SIZE).enumerate() {
            let mark = sector[MARK_OFFSET];
            if mark == 0x00 || mark == 0xff {
                continue;
            }
            if let Some(first) = marks.get(&mark) {
                log::warn!(
                    "Duplicate mark 0x{:02x} in sector {}, keeping sector {}",
                    mark,
                    index,
                    first
                );
                continue;
            }
            marks.insert(mark, index);
        }
        SectorMap { marks }
    }

    pub fn get(&self, mark: u8) -> Option<usize> {
        self.marks.get(&mark).copied()
    }

    pub fn contains(&self, mark: u8) -> bool {
        self.marks.contains_key(&mark)
    }

    pub fn len(&self) -> usize {
        self.marks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, usize)> + '_ {
        self.marks.iter().map(|(&mark, &index)| (mark, index))
    }
}

/// A raw codeplug image with its derived sector map.
#[derive(Debug, Clone)]
pub struct Codeplug {
    image: Vec<u8>,
    layout: Layout,
    map: SectorMap,
}

impl Codeplug {
    /// Wrap an image using the built-in layout. A partial trailing sector is
    /// padded with erased bytes.
    pub fn from_bytes(image: Vec<u8>) -> Result<Self> {
        Ok(Self::with_layout(image, Layout::load()?))
    }

    pub fn with_layout(mut image: Vec<u8>, layout: Layout) -> Self {
        let rem = image.len() % SECTOR_SIZE;
        if rem != 0 {
            image.resize(image.len() + SECTOR_SIZE - rem, 0xff);
        }
        let map = SectorMap::build(&image);
        log::debug!("Codeplug of {} sectors, {} marks", image.len() / SECTOR_SIZE, map.len());
        Codeplug { image, layout, map }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = fs::read(path.as_ref())?;
        format::check_codeplug(&raw)?;
        Self::from_bytes(raw)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, &self.image)?;
        Ok(())
    }

    pub fn image(&self) -> &[u8] {
        &self.image
    }

    pub fn into_image(self) -> Vec<u8> {
        self.image
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn sector_map(&self) -> &SectorMap {
        &self.map
    }

    fn sector(&self, index: usize) -> &[u8] {
        &self.image[index * SECTOR_SIZE..(index + 1) * SECTOR_SIZE]
    }

    /// Assemble a logical resource. The result is always `get_data_size(name)`
    /// bytes long: missing links are filled with erased bytes, and a missing
    /// first link blanks the whole resource.
    pub fn get_data(&self, name: &str) -> Result<Vec<u8>> {
        let chain = self.layout.chain(name)?;
        let mut data = Vec::with_capacity(chain.iter().map(Link::len).sum());
        for (i, link) in chain.iter().enumerate() {
            match self.map.get(link.mark) {
                Some(index) => data.extend_from_slice(&self.sector(index)[link.range()]),
                None if i == 0 => {
                    log::warn!(
                        "Block with mark 0x{:02x} not found, {} is empty",
                        link.mark,
                        name
                    );
                    let size = self.layout.size(name)?;
                    data.resize(size, 0xff);
                    break;
                }
                None => {
                    log::warn!("Block with mark 0x{:02x} of {} not found", link.mark, name);
                    data.resize(data.len() + link.len(), 0xff);
                }
            }
        }
        Ok(data)
    }

    /// Write a logical resource back into its sectors. Links without a sector
    /// get a freshly appended erased sector; this placement is not what the
    /// radio itself would choose.
    pub fn set_data(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let chain = self.layout.chain(name)?.to_vec();
        let size: usize = chain.iter().map(Link::len).sum();
        if data.len() != size {
            return Err(Error::Validation(format!(
                "{} takes {} bytes, got {}",
                name,
                size,
                data.len()
            )));
        }

        let mut offset = 0;
        for link in chain {
            let index = match self.map.get(link.mark) {
                Some(index) => index,
                None => self.append_sector(link.mark),
            };
            let slice = &data[offset..offset + link.len()];
            let base = index * SECTOR_SIZE;
            self.image[base + link.start as usize..=base + link.end as usize].copy_from_slice(slice);
            offset += link.len();
        }
        Ok(())
    }

    fn append_sector(&mut self, mark: u8) -> usize {
        let index = self.image.len() / SECTOR_SIZE;
        log::warn!(
            "Allocating sector {} for mark 0x{:02x} at the end of the image (best effort)",
            index,
            mark
        );
        self.image.resize(self.image.len() + SECTOR_SIZE, 0xff);
        self.image[index * SECTOR_SIZE + MARK_OFFSET] = mark;
        self.map = SectorMap::build(&self.image);
        index
    }

    pub fn get_data_size(&self, name: &str) -> Result<usize> {
        self.layout.size(name)
    }

    /// Whether the first sector of the resource's chain is present.
    pub fn has_resource(&self, name: &str) -> bool {
        self.layout
            .chain(name)
            .map(|chain| self.map.contains(chain[0].mark))
            .unwrap_or(false)
    }

    pub fn contacts(&self) -> Result<ContactTable> {
        let meta = self.get_data(resources::CONTACT_META)?;
        let data = self.get_data(resources::CONTACT_DATA)?;
        ContactTable::decode(&data, &meta)
    }

    /// Encode and store a contact table, returning how many contacts did not fit.
    pub fn store_contacts(&mut self, table: &ContactTable) -> Result<usize> {
        let encoded = table.encode();
        let mut meta = encoded.meta;
        let mut data = encoded.data;
        meta.resize(self.get_data_size(resources::CONTACT_META)?, 0xff);
        data.resize(self.get_data_size(resources::CONTACT_DATA)?, 0xff);
        self.set_data(resources::CONTACT_META, &meta)?;
        self.set_data(resources::CONTACT_DATA, &data)?;
        if encoded.dropped > 0 {
            log::warn!("{} contacts did not fit and were dropped", encoded.dropped);
        }
        Ok(encoded.dropped)
    }

    /// Decode one message kind, or `None` when its storage is absent.
    pub fn messages(
        &self,
        kind: MessageKind,
        scan: bool,
        contacts: Option<&ContactTable>,
    ) -> Result<Option<Vec<Message>>> {
        if !self.has_resource(kind.resource()) {
            return Ok(None);
        }
        let data = self.get_data(kind.resource())?;
        Ok(Some(message::decode(&data, kind, scan, contacts)))
    }

    /// Contacts assigned to the programmable buttons, in slot order.
    pub fn button_contacts(&self, contacts: &ContactTable) -> Result<Vec<Option<ContactKey>>> {
        let data = self.get_data(resources::BUTTONS)?;
        Ok(contact_refs(&data, contacts, |pair| u16::from_le_bytes([pair[0], pair[1]])))
    }

    /// Contacts assigned to channels, in channel order.
    pub fn channel_contacts(&self, contacts: &ContactTable) -> Result<Vec<Option<ContactKey>>> {
        let data = self.get_data(resources::CHANNEL_CONTACTS)?;
        Ok(contact_refs(&data, contacts, |pair| {
            (((pair[0] >> 4) as u16) << 8) | pair[1] as u16
        }))
    }
}

/// Resolve 1-based contact positions; erased entries are skipped, 0 means
/// no contact.
fn contact_refs(
    data: &[u8],
    contacts: &ContactTable,
    decode: impl Fn(&[u8]) -> u16,
) -> Vec<Option<ContactKey>> {
    let mut refs = Vec::new();
    for pair in data.chunks_exact(2) {
        let index = decode(pair);
        match index {
            0xffff | 0x0fff => continue,
            0 => refs.push(None),
            n => match contacts.get(n as usize - 1) {
                Some(contact) => refs.push(Some(contact.key())),
                None => log::warn!("Contact reference {} out of range", n),
            },
        }
    }
    refs
}
