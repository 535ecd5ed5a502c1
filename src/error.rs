//! Error types shared by the protocol engine and the codeplug model.

use thiserror::Error;

use crate::dfu::Mode;

#[derive(Debug, Error)]
pub enum Error {
    /// Unexpected reply at a handshake or chunk step. Fatal to the session.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Pre-flight check failed, nothing was sent to the device.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("device is password protected, password mode is not supported")]
    Auth,

    #[error("unsupported bootloader version {0}")]
    UnsupportedVersion(String),

    #[error("data size {size} is larger than maximum allowed size {max}")]
    Size { size: usize, max: usize },

    #[error("operation requires {expected:?} mode, session is in {actual:?} mode")]
    InvalidMode { expected: Mode, actual: Mode },

    #[error("unknown codeplug resource {0:?}")]
    UnknownResource(String),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed data: {0}")]
    Parse(#[from] scroll::Error),

    #[error("configuration error: {0}")]
    Config(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Shorthand for building a [`Error::Protocol`].
pub(crate) fn protocol_error(msg: impl Into<String>) -> Error {
    Error::Protocol(msg.into())
}
