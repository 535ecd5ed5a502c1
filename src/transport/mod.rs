//! Abstract byte channel to the radio.
use std::time::Duration;

use crate::error::{Result, protocol_error};
use crate::protocol::{Command, Frame, FrameKind, FrameLayout};

pub use self::usb::UsbTransport;

mod usb;

/// Abstraction of the transport layer.
///
/// One `recv_raw` call is one bulk transfer; a logical reply may span several.
pub trait Transport {
    fn send_raw(&mut self, raw: &[u8]) -> Result<()>;
    fn recv_raw(&mut self) -> Result<Vec<u8>>;
    fn set_timeout(&mut self, timeout: Duration);

    fn send(&mut self, cmd: Command, layout: FrameLayout) -> Result<()> {
        let req = cmd.into_raw(layout);
        log::trace!("=> {}", hex::encode(&req));
        self.send_raw(&req)
    }

    /// Single-transfer status reply.
    fn recv_reply(&mut self) -> Result<Vec<u8>> {
        let resp = self.recv_raw()?;
        log::trace!("<= {}", hex::encode(&resp));
        Ok(resp)
    }

    /// Receive a framed reply, accumulating transfers until the header and the
    /// announced payload are complete.
    fn recv_frame(&mut self, kind: FrameKind, layout: FrameLayout) -> Result<Frame> {
        let mut raw = self.recv_raw()?;
        while raw.len() < kind.header_len(layout) {
            let more = self.recv_raw()?;
            if more.is_empty() {
                return Err(protocol_error("reply ended before frame header"));
            }
            raw.extend_from_slice(&more);
        }
        let wanted = kind.header_len(layout) + Frame::declared_len(&raw, kind, layout)?;
        while raw.len() < wanted {
            let more = self.recv_raw()?;
            if more.is_empty() {
                return Err(protocol_error(format!(
                    "reply ended after {} of {} bytes",
                    raw.len(),
                    wanted
                )));
            }
            raw.extend_from_slice(&more);
        }
        log::trace!("<= {}", hex::encode(&raw));
        Frame::from_raw(&raw, kind, layout)
    }
}
