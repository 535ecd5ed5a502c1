//! USB Transportation.
use std::time::Duration;

use rusb::{Context, Device, DeviceHandle, Direction, TransferType, UsbContext};

use super::Transport;
use crate::constants::INTERACTIVE_TIMEOUT;
use crate::{Error, Result};

pub const VENDOR_ID: u16 = 0x0483;
pub const PRODUCT_ID: u16 = 0x5780;

pub struct UsbTransport {
    device_handle: DeviceHandle<rusb::Context>,
    endpoint_out: u8,
    endpoint_in: u8,
    max_packet_size: usize,
    timeout: Duration,
}

fn is_md1702(device: &Device<Context>) -> bool {
    device
        .device_descriptor()
        .map(|desc| desc.vendor_id() == VENDOR_ID && desc.product_id() == PRODUCT_ID)
        .unwrap_or(false)
}

impl UsbTransport {
    pub fn open_nth(nth: usize) -> Result<UsbTransport> {
        let context = Context::new()?;

        let device = context
            .devices()?
            .iter()
            .filter(is_md1702)
            .nth(nth)
            .ok_or_else(|| {
                Error::DeviceNotFound(format!(
                    "{:04x}:{:04x} not found at index #{}",
                    VENDOR_ID, PRODUCT_ID, nth
                ))
            })?;
        log::debug!("Found USB Device {:?}", device);

        let mut device_handle = device.open()?;
        device_handle.set_active_configuration(1)?;

        let config = device.active_config_descriptor()?;

        let mut endpoint_out = None;
        let mut endpoint_in = None;
        let mut max_packet_size = 64;
        if let Some(intf) = config.interfaces().next() {
            if let Some(desc) = intf.descriptors().next() {
                for endpoint in desc.endpoint_descriptors() {
                    if endpoint.transfer_type() != TransferType::Bulk {
                        continue;
                    }
                    match endpoint.direction() {
                        Direction::Out if endpoint_out.is_none() => {
                            endpoint_out = Some(endpoint.address());
                        }
                        Direction::In if endpoint_in.is_none() => {
                            endpoint_in = Some(endpoint.address());
                            max_packet_size = endpoint.max_packet_size() as usize;
                        }
                        _ => {}
                    }
                }
            }
        }

        let (Some(endpoint_out), Some(endpoint_in)) = (endpoint_out, endpoint_in) else {
            return Err(Error::DeviceNotFound("USB bulk endpoints not found".to_string()));
        };

        device_handle.claim_interface(0)?;

        Ok(UsbTransport {
            device_handle,
            endpoint_out,
            endpoint_in,
            max_packet_size,
            timeout: INTERACTIVE_TIMEOUT,
        })
    }

    pub fn open_any() -> Result<UsbTransport> {
        Self::open_nth(0)
    }
}

impl Transport for UsbTransport {
    fn send_raw(&mut self, raw: &[u8]) -> Result<()> {
        self.device_handle
            .write_bulk(self.endpoint_out, raw, self.timeout)?;
        Ok(())
    }

    fn recv_raw(&mut self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.max_packet_size];
        let nread = self
            .device_handle
            .read_bulk(self.endpoint_in, &mut buf, self.timeout)?;
        buf.truncate(nread);
        Ok(buf)
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }
}
