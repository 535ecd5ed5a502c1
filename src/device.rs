//! Radio model definitions, with model-specific framing parameters
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::protocol::FrameLayout;

/// A radio model as identified by the DFU search reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    /// Model string sent by the device, also echoed on SPI/USB mode entry
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Maximum payload bytes per upload/download chunk
    pub delta: usize,
    /// Whether data frames carry a 16-bit length instead of a single byte
    #[serde(default)]
    pub wide_length: bool,
}

impl ::std::fmt::Display for Model {
    fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
        write!(f, "{}(delta={})", self.name, self.delta)
    }
}

impl Model {
    pub const fn layout(&self) -> FrameLayout {
        FrameLayout {
            wide_length: self.wide_length,
        }
    }
}

pub struct ModelDB {
    models: Vec<Model>,
}

impl ModelDB {
    pub fn load() -> Result<Self> {
        Ok(ModelDB {
            models: serde_yaml::from_str(include_str!("../devices/models.yaml"))?,
        })
    }

    /// Look up a model by the identifier string the device replied with.
    pub fn find_model(&self, ident: &[u8]) -> Option<&Model> {
        self.models.iter().find(|m| m.name.as_bytes() == ident)
    }

    /// Framing assumed until a search reply selects the real model.
    pub fn default_model(&self) -> Result<&Model> {
        self.models.first().ok_or_else(|| {
            crate::Error::Validation("model database is empty".to_string())
        })
    }

    pub fn models(&self) -> &[Model] {
        &self.models
    }
}
