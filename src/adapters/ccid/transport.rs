//! USB CCID transport backed by `rusb`.
//!
//! Talks to the token's CCID interface directly, without pcscd or any smart
//! card middleware.

use super::framing::{BulkPipe, CcidFramer};
use crate::adapters::transport::{Transport, TransportKind};
use crate::domain::constants::{USB_CLASS_SMART_CARD, YUBIKEY_VID};
use crate::infra::config::OathConfiguration;
use crate::infra::error::{OathError, OathResult};
use rusb::{Context, Device, DeviceHandle, Direction, TransferType, UsbContext};
use std::time::Duration;

/// Bulk endpoints of a claimed CCID interface.
pub struct RusbPipe {
    handle: DeviceHandle<Context>,
    endpoint_out: u8,
    endpoint_in: u8,
    packet_size: usize,
    interface_number: u8,
    timeout: Duration,
}

impl BulkPipe for RusbPipe {
    fn max_packet_size(&self) -> usize {
        self.packet_size
    }

    fn write_packet(&mut self, packet: &[u8]) -> OathResult<usize> {
        self.handle
            .write_bulk(self.endpoint_out, packet, self.timeout)
            .map_err(|e| OathError::Transport(format!("USB write failed: {e}")))
    }

    fn read_packet(&mut self, buf: &mut [u8]) -> OathResult<usize> {
        self.handle
            .read_bulk(self.endpoint_in, buf, self.timeout)
            .map_err(|e| OathError::Transport(format!("USB read failed: {e}")))
    }
}

impl Drop for RusbPipe {
    fn drop(&mut self) {
        if let Err(e) = self.handle.release_interface(self.interface_number) {
            log::debug!("Failed to release interface {}: {e}", self.interface_number);
        }
    }
}

/// Located CCID interface and its bulk endpoints.
struct CcidInterface {
    number: u8,
    endpoint_in: u8,
    endpoint_out: u8,
    packet_size: usize,
}

/// A powered-on token reached over USB CCID.
pub struct CcidTransport {
    framer: CcidFramer<RusbPipe>,
}

impl CcidTransport {
    /// Open the first attached token that exposes a CCID interface.
    ///
    /// # Errors
    ///
    /// Returns [`OathError::Transport`] if no token is found or claiming and
    /// powering the interface fails.
    pub fn open(config: &OathConfiguration) -> OathResult<Self> {
        let context = Context::new()
            .map_err(|e| OathError::Transport(format!("Failed to create USB context: {e}")))?;
        let devices = context
            .devices()
            .map_err(|e| OathError::Transport(format!("Failed to enumerate USB devices: {e}")))?;

        for device in devices.iter() {
            let Ok(descriptor) = device.device_descriptor() else {
                continue;
            };
            if descriptor.vendor_id() != YUBIKEY_VID {
                continue;
            }
            log::debug!(
                "Found YubiKey: VID={:04x} PID={:04x}",
                descriptor.vendor_id(),
                descriptor.product_id()
            );
            if let Some(interface) = find_ccid_interface(&device)? {
                return Self::connect(&device, &interface, config);
            }
        }

        Err(OathError::Transport(
            "No YubiKey with CCID interface found".to_string(),
        ))
    }

    fn connect(
        device: &Device<Context>,
        interface: &CcidInterface,
        config: &OathConfiguration,
    ) -> OathResult<Self> {
        let handle = device.open()?;

        #[cfg(target_os = "linux")]
        {
            if handle.kernel_driver_active(interface.number).unwrap_or(false) {
                handle.detach_kernel_driver(interface.number)?;
            }
        }

        handle.claim_interface(interface.number)?;

        let pipe = RusbPipe {
            handle,
            endpoint_out: interface.endpoint_out,
            endpoint_in: interface.endpoint_in,
            packet_size: interface.packet_size,
            interface_number: interface.number,
            timeout: Duration::from_millis(config.usb_timeout_ms),
        };
        let mut framer = CcidFramer::new(pipe, config.ccid_read_retries)
            .with_time_extension_budget(config.ccid_time_extension_budget());
        framer.power_on()?;
        log::info!("Connected to CCID interface {}", interface.number);
        Ok(Self { framer })
    }

    /// Answer-To-Reset returned at power on.
    #[must_use]
    pub fn atr(&self) -> &[u8] {
        self.framer.atr()
    }
}

impl Transport for CcidTransport {
    fn transceive(&mut self, apdu: &[u8]) -> OathResult<Vec<u8>> {
        self.framer.transmit(apdu)
    }

    fn close(&mut self) -> OathResult<()> {
        self.framer.shutdown()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Usb
    }
}

fn find_ccid_interface(device: &Device<Context>) -> OathResult<Option<CcidInterface>> {
    let config = device.active_config_descriptor()?;
    for interface in config.interfaces() {
        for descriptor in interface.descriptors() {
            if descriptor.class_code() != USB_CLASS_SMART_CARD {
                continue;
            }
            let mut endpoint_in = None;
            let mut endpoint_out = None;
            for endpoint in descriptor.endpoint_descriptors() {
                if endpoint.transfer_type() != TransferType::Bulk {
                    continue;
                }
                let entry = (endpoint.address(), usize::from(endpoint.max_packet_size()));
                match endpoint.direction() {
                    Direction::In => endpoint_in = Some(entry),
                    Direction::Out => endpoint_out = Some(entry),
                }
            }
            if let (Some((ep_in, in_size)), Some((ep_out, out_size))) = (endpoint_in, endpoint_out) {
                log::debug!(
                    "CCID interface {} found: IN=0x{ep_in:02x} OUT=0x{ep_out:02x}",
                    descriptor.interface_number()
                );
                return Ok(Some(CcidInterface {
                    number: descriptor.interface_number(),
                    endpoint_in: ep_in,
                    endpoint_out: ep_out,
                    packet_size: in_size.min(out_size),
                }));
            }
        }
    }
    Ok(None)
}
