//! Sector chain tables describing how logical resources are assembled.
use std::collections::BTreeMap;
use std::ops::Range;

use serde::Deserialize;

use crate::constants::SECTOR_SIZE;
use crate::{Error, Result};

/// Resource names defined by the built-in layout.
pub mod resources {
    pub const CONTACT_META: &str = "contact_meta";
    pub const CONTACT_DATA: &str = "contact_data";
    pub const MESSAGE_TEMPLATES: &str = "message_templates";
    pub const MESSAGE_SENT: &str = "message_sent";
    pub const MESSAGE_RECEIVED: &str = "message_received";
    pub const MESSAGE_DRAFTS: &str = "message_drafts";
    pub const BUTTONS: &str = "buttons";
    pub const CHANNEL_CONTACTS: &str = "channel_contacts";
}

/// One link of a chain: the inclusive byte range `start..=end` of the sector
/// tagged `mark`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Link {
    #[serde(deserialize_with = "parse_number")]
    pub mark: u8,
    #[serde(deserialize_with = "parse_number")]
    pub start: u16,
    #[serde(deserialize_with = "parse_number")]
    pub end: u16,
}

impl Link {
    pub const fn new(mark: u8, start: u16, end: u16) -> Self {
        Link { mark, start, end }
    }

    pub fn len(&self) -> usize {
        (self.end - self.start) as usize + 1
    }

    /// Byte range inside the sector.
    pub fn range(&self) -> Range<usize> {
        self.start as usize..self.end as usize + 1
    }
}

#[derive(Debug, Clone)]
pub struct Layout {
    resources: BTreeMap<String, Vec<Link>>,
}

impl Layout {
    /// The built-in layout.
    pub fn load() -> Result<Self> {
        Self::from_yaml(include_str!("../../devices/layout.yaml"))
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let resources: BTreeMap<String, Vec<Link>> = serde_yaml::from_str(yaml)?;
        let layout = Layout { resources };
        layout.validate()?;
        Ok(layout)
    }

    pub fn from_chains<I, S>(chains: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, Vec<Link>)>,
        S: Into<String>,
    {
        let layout = Layout {
            resources: chains.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        };
        layout.validate()?;
        Ok(layout)
    }

    fn validate(&self) -> Result<()> {
        for (name, chain) in &self.resources {
            if chain.is_empty() {
                return Err(Error::Validation(format!("resource {} has an empty chain", name)));
            }
            for link in chain {
                if link.end < link.start || link.end as usize >= SECTOR_SIZE {
                    return Err(Error::Validation(format!(
                        "resource {}: bad range 0x{:03x}..=0x{:03x}",
                        name, link.start, link.end
                    )));
                }
                if link.mark == 0x00 || link.mark == 0xff {
                    return Err(Error::Validation(format!(
                        "resource {}: mark 0x{:02x} is reserved",
                        name, link.mark
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn chain(&self, name: &str) -> Result<&[Link]> {
        self.resources
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::UnknownResource(name.to_string()))
    }

    /// Sum of the declared link lengths.
    pub fn size(&self, name: &str) -> Result<usize> {
        Ok(self.chain(name)?.iter().map(Link::len).sum())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(String::as_str)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Number {
    Int(u64),
    Text(String),
}

fn parse_number<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: TryFrom<u64>,
{
    use serde::de::Error as _;

    let value = match Number::deserialize(deserializer)? {
        Number::Int(n) => n,
        Number::Text(s) => {
            let s = s.trim();
            let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                u64::from_str_radix(hex, 16)
            } else {
                s.parse()
            };
            parsed.map_err(|e| D::Error::custom(format!("error while parsing {:?}: {}", s, e)))?
        }
    };
    T::try_from(value).map_err(|_| D::Error::custom(format!("{} is out of range", value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_layout() {
        let layout = Layout::load().unwrap();
        assert_eq!(layout.size(resources::CONTACT_META).unwrap(), 0xd00);
        assert_eq!(layout.size(resources::CONTACT_DATA).unwrap(), 800 * 24);
        assert_eq!(layout.size(resources::MESSAGE_SENT).unwrap(), 2 * 0xfff);
        assert_eq!(layout.chain(resources::CONTACT_DATA).unwrap()[0].mark, 0x0d);
        assert!(matches!(
            layout.chain("zones"),
            Err(Error::UnknownResource(_))
        ));
    }

    #[test]
    fn test_number_forms() {
        let layout = Layout::from_yaml(
            "a:\n  - { mark: 7, start: \"0x10\", end: \"31\" }\n",
        )
        .unwrap();
        assert_eq!(layout.chain("a").unwrap(), &[Link::new(7, 0x10, 31)]);
    }

    #[test]
    fn test_invalid_layouts() {
        assert!(Layout::from_yaml("a:\n  - { mark: \"0xff\", start: 0, end: 1 }\n").is_err());
        assert!(Layout::from_yaml("a:\n  - { mark: 1, start: 9, end: 1 }\n").is_err());
        assert!(Layout::from_yaml("a:\n  - { mark: 1, start: 0, end: \"0x1000\" }\n").is_err());
        assert!(Layout::from_yaml("a:\n  - { mark: \"0x100\", start: 0, end: 1 }\n").is_err());
        assert!(Layout::from_yaml("a: []\n").is_err());
    }
}
