//! MD1702 / DM-1702 maintenance protocol and flash data formats.

pub mod codeplug;
pub mod constants;
pub mod crc;
pub mod device;
pub mod dfu;
pub mod error;
pub mod format;
pub mod protocol;
pub mod recording;
pub mod transport;

pub use self::codeplug::{Codeplug, Contact, ContactTable, Message, MessageKind, SectorMap};
pub use self::device::{Model, ModelDB};
pub use self::dfu::{Dfu, Mode};
pub use self::error::{Error, Result};
pub use self::protocol::{Command, InfoField};
pub use self::recording::{FlashImage, FlashReader, Recording, RecordingArea};
pub use self::transport::Transport;
