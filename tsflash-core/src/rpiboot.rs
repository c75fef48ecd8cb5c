//! Switching a Raspberry Pi boot ROM into USB mass-storage mode.
//!
//! The boot ROM accepts a second-stage loader over USB. Once the loader runs
//! it detaches from the bus and the module re-enumerates as a storage device
//! (the eMMC or SD card), which is then flashed like any other card.
//!
//! The wire protocol lives in [`bootstrap_device`] and talks to a
//! [`BootTransport`]; [`RpiBoot`] supplies the real `nusb` transport.
use crate::classify::is_boot_rom;
use crate::device::PortPath;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Default location of the second-stage loader shipped by the `rpiboot`
/// package.
pub const DEFAULT_BOOTCODE_PATH: &str = "/usr/share/rpiboot/bootcode4.bin";

/// Upper bound for any single USB transfer.
pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(5);

/// Payload is streamed in bulk transfers of this size.
const BULK_CHUNK: usize = 16 * 1024;

/// Length word followed by a zeroed 20-byte signature.
const BOOT_MESSAGE_LEN: usize = 24;

#[derive(Debug, thiserror::Error)]
pub enum BootError {
    #[error("no boot ROM device found{}", .0.as_ref().map(|p| format!(" on port {p}")).unwrap_or_default())]
    NotFound(Option<PortPath>),
    #[error("device {vendor:04x}:{product:04x} is not a Raspberry Pi boot ROM")]
    Signature { vendor: u16, product: u16 },
    #[error("cannot open boot ROM: {0}")]
    Open(String),
    #[error("boot ROM exposes no bulk OUT endpoint")]
    NoBulkEndpoint,
    #[error("USB transfer failed: {0}")]
    Transport(String),
    #[error("USB transfer timed out")]
    Timeout,
    #[error("short bulk transfer: {actual} of {expected} bytes")]
    ShortTransfer { expected: usize, actual: usize },
    #[error("boot ROM rejected the loader with status {0:#x}")]
    Rejected(u32),
    #[error("loader payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("cannot read loader {path}: {source}")]
    Payload {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("rpiboot is only supported on Linux")]
    Unsupported,
}

/// The handful of USB operations the boot protocol needs.
pub trait BootTransport {
    /// Vendor and product id of the connected device.
    fn identify(&self) -> (u16, u16);

    fn control_out(&mut self, request: u8, value: u16, index: u16, data: &[u8])
    -> Result<(), BootError>;

    fn control_in(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
    ) -> Result<Vec<u8>, BootError>;

    /// Sends `data` on the bulk OUT endpoint and returns the bytes accepted.
    fn bulk_out(&mut self, data: &[u8]) -> Result<usize, BootError>;
}

/// Announces a transfer of `data.len()` bytes, then sends it in bulk chunks.
fn ep_write<T: BootTransport>(transport: &mut T, data: &[u8]) -> Result<(), BootError> {
    let len = data.len();
    transport.control_out(0, (len & 0xffff) as u16, (len >> 16) as u16, &[])?;

    for chunk in data.chunks(BULK_CHUNK) {
        let sent = transport.bulk_out(chunk)?;
        if sent != chunk.len() {
            return Err(BootError::ShortTransfer {
                expected: chunk.len(),
                actual: sent,
            });
        }
    }
    Ok(())
}

/// Reads `len` bytes back; the length goes in `wValue`/`wIndex` as for writes.
fn ep_read<T: BootTransport>(transport: &mut T, len: usize) -> Result<Vec<u8>, BootError> {
    let length = u16::try_from(len).map_err(|_| BootError::PayloadTooLarge(len))?;
    transport.control_in(0, (len & 0xffff) as u16, (len >> 16) as u16, length)
}

fn boot_message(payload_len: u32) -> [u8; BOOT_MESSAGE_LEN] {
    let mut message = [0u8; BOOT_MESSAGE_LEN];
    message[..4].copy_from_slice(&payload_len.to_le_bytes());
    message
}

/// Sends the second-stage loader to a boot ROM and checks its verdict.
pub fn bootstrap_device<T: BootTransport>(transport: &mut T, payload: &[u8]) -> Result<(), BootError> {
    let (vendor, product) = transport.identify();
    if !is_boot_rom(vendor, product) {
        return Err(BootError::Signature { vendor, product });
    }
    let len = u32::try_from(payload.len()).map_err(|_| BootError::PayloadTooLarge(payload.len()))?;

    log::debug!("Sending boot message ({} byte loader)", len);
    ep_write(transport, &boot_message(len))?;
    log::debug!("Sending loader");
    ep_write(transport, payload)?;

    let status = ep_read(transport, 4)?;
    let bytes: [u8; 4] = status
        .get(..4)
        .and_then(|s| s.try_into().ok())
        .ok_or(BootError::ShortTransfer {
            expected: 4,
            actual: status.len(),
        })?;
    match u32::from_le_bytes(bytes) {
        0 => Ok(()),
        code => Err(BootError::Rejected(code)),
    }
}

/// Something that can put the device on a port into mass-storage mode.
pub trait BootHandoff: Send + Sync + 'static {
    fn bootstrap(&self, port: &PortPath) -> impl Future<Output = Result<(), BootError>> + Send;
}

/// The real boot-mode driver, talking to the boot ROM through usbfs.
#[derive(Clone, Debug)]
pub struct RpiBoot {
    payload: Arc<[u8]>,
    timeout: Duration,
}

impl RpiBoot {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload: payload.into(),
            timeout: TRANSFER_TIMEOUT,
        }
    }

    /// Loads the second-stage loader from `path`.
    pub fn from_file(path: &Path) -> Result<Self, BootError> {
        let payload = std::fs::read(path).map_err(|source| BootError::Payload {
            path: path.to_path_buf(),
            source,
        })?;
        log::debug!("Loaded {} ({} bytes)", path.display(), payload.len());
        Ok(Self::new(payload))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Boots the device on `port`, or the first boot ROM found when `port`
    /// is `None`. Blocks for the duration of the transfer.
    pub fn bootstrap_blocking(&self, port: Option<&PortPath>) -> Result<PortPath, BootError> {
        usb::bootstrap_port(port, &self.payload, self.timeout)
    }
}

impl BootHandoff for RpiBoot {
    async fn bootstrap(&self, port: &PortPath) -> Result<(), BootError> {
        let this = self.clone();
        let port = port.clone();
        log::info!("Booting {} into mass-storage mode", port);
        tokio::task::spawn_blocking(move || this.bootstrap_blocking(Some(&port)))
            .await
            .map_err(|e| BootError::Transport(e.to_string()))?
            .map(|_| ())
    }
}

/// Ports of all boot ROMs currently on the bus.
pub fn find_boot_roms() -> Result<Vec<PortPath>, BootError> {
    usb::find_boot_roms()
}

#[cfg(target_os = "linux")]
mod usb {
    use super::{BootError, BootTransport, bootstrap_device};
    use crate::classify::is_boot_rom;
    use crate::device::PortPath;
    use nusb::transfer::{Buffer, Bulk, ControlIn, ControlOut, ControlType, Out, Recipient, TransferError};
    use nusb::{DeviceInfo, Endpoint, Interface, MaybeFuture};
    use std::time::Duration;

    fn transfer_error(e: TransferError) -> BootError {
        match e {
            TransferError::Cancelled => BootError::Timeout,
            other => BootError::Transport(other.to_string()),
        }
    }

    fn port_of(info: &DeviceInfo) -> Option<PortPath> {
        PortPath::new(info.busnum(), info.port_chain().to_vec())
    }

    fn boot_rom_devices() -> Result<Vec<DeviceInfo>, BootError> {
        Ok(nusb::list_devices()
            .wait()
            .map_err(|e| BootError::Open(e.to_string()))?
            .filter(|d| is_boot_rom(d.vendor_id(), d.product_id()))
            .collect())
    }

    pub(super) fn find_boot_roms() -> Result<Vec<PortPath>, BootError> {
        Ok(boot_rom_devices()?.iter().filter_map(port_of).collect())
    }

    struct UsbTransport {
        ids: (u16, u16),
        interface: Interface,
        endpoint: Endpoint<Bulk, Out>,
        timeout: Duration,
    }

    impl UsbTransport {
        fn open(info: &DeviceInfo, timeout: Duration) -> Result<Self, BootError> {
            let device = info
                .open()
                .wait()
                .map_err(|e| BootError::Open(e.to_string()))?;
            let config = device
                .active_configuration()
                .map_err(|e| BootError::Open(e.to_string()))?;

            // The BCM2711/2712 ROMs expose a second interface for the boot
            // protocol; older ROMs only have one. Take the highest that has a
            // bulk OUT endpoint.
            let mut selected: Option<(u8, u8)> = None;
            for iface in config.interface_alt_settings() {
                for ep in iface.endpoints() {
                    if ep.transfer_type() == nusb::descriptors::TransferType::Bulk
                        && ep.direction() == nusb::transfer::Direction::Out
                        && selected.is_none_or(|(n, _)| iface.interface_number() > n)
                    {
                        selected = Some((iface.interface_number(), ep.address()));
                    }
                }
            }
            let (iface_num, out_ep) = selected.ok_or(BootError::NoBulkEndpoint)?;
            log::debug!("Using interface {}, OUT EP 0x{:02X}", iface_num, out_ep);

            let interface = device
                .claim_interface(iface_num)
                .wait()
                .map_err(|e| BootError::Open(e.to_string()))?;
            let endpoint = interface
                .endpoint::<Bulk, Out>(out_ep)
                .map_err(|e| BootError::Open(e.to_string()))?;

            Ok(Self {
                ids: (info.vendor_id(), info.product_id()),
                interface,
                endpoint,
                timeout,
            })
        }
    }

    impl BootTransport for UsbTransport {
        fn identify(&self) -> (u16, u16) {
            self.ids
        }

        fn control_out(
            &mut self,
            request: u8,
            value: u16,
            index: u16,
            data: &[u8],
        ) -> Result<(), BootError> {
            self.interface
                .control_out(
                    ControlOut {
                        control_type: ControlType::Vendor,
                        recipient: Recipient::Device,
                        request,
                        value,
                        index,
                        data,
                    },
                    self.timeout,
                )
                .wait()
                .map_err(transfer_error)
        }

        fn control_in(
            &mut self,
            request: u8,
            value: u16,
            index: u16,
            length: u16,
        ) -> Result<Vec<u8>, BootError> {
            self.interface
                .control_in(
                    ControlIn {
                        control_type: ControlType::Vendor,
                        recipient: Recipient::Device,
                        request,
                        value,
                        index,
                        length,
                    },
                    self.timeout,
                )
                .wait()
                .map_err(transfer_error)
        }

        fn bulk_out(&mut self, data: &[u8]) -> Result<usize, BootError> {
            let mut buf = Buffer::new(data.len());
            buf.extend_from_slice(data);
            self.endpoint
                .transfer_blocking(buf, self.timeout)
                .into_result()
                .map_err(transfer_error)?;
            Ok(data.len())
        }
    }

    pub(super) fn bootstrap_port(
        port: Option<&PortPath>,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<PortPath, BootError> {
        let devices = boot_rom_devices()?;
        let info = match port {
            Some(port) => devices
                .iter()
                .find(|d| port_of(d).as_ref() == Some(port)),
            None => devices.first(),
        }
        .ok_or_else(|| BootError::NotFound(port.cloned()))?;
        let found = port_of(info).ok_or_else(|| BootError::NotFound(port.cloned()))?;

        log::info!(
            "Found boot ROM {:04x}:{:04x} on port {}",
            info.vendor_id(),
            info.product_id(),
            found
        );
        let mut transport = UsbTransport::open(info, timeout)?;
        bootstrap_device(&mut transport, payload)?;
        log::info!("Loader accepted by boot ROM on port {}", found);
        Ok(found)
    }
}

#[cfg(not(target_os = "linux"))]
mod usb {
    use super::BootError;
    use crate::device::PortPath;
    use std::time::Duration;

    pub(super) fn find_boot_roms() -> Result<Vec<PortPath>, BootError> {
        Err(BootError::Unsupported)
    }

    pub(super) fn bootstrap_port(
        _port: Option<&PortPath>,
        _payload: &[u8],
        _timeout: Duration,
    ) -> Result<PortPath, BootError> {
        Err(BootError::Unsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::BROADCOM_VID;

    #[derive(Debug, PartialEq, Eq)]
    enum Op {
        ControlOut { value: u16, index: u16 },
        ControlIn { value: u16, index: u16, length: u16 },
        Bulk(usize),
    }

    struct Scripted {
        ids: (u16, u16),
        ops: Vec<Op>,
        sent: Vec<u8>,
        status: Vec<u8>,
        short_bulk: bool,
        fail_control_in: bool,
    }

    impl Scripted {
        fn new(product: u16) -> Self {
            Self {
                ids: (BROADCOM_VID, product),
                ops: Vec::new(),
                sent: Vec::new(),
                status: 0u32.to_le_bytes().to_vec(),
                short_bulk: false,
                fail_control_in: false,
            }
        }
    }

    impl BootTransport for Scripted {
        fn identify(&self) -> (u16, u16) {
            self.ids
        }

        fn control_out(&mut self, request: u8, value: u16, index: u16, data: &[u8]) -> Result<(), BootError> {
            assert_eq!(request, 0);
            assert!(data.is_empty());
            self.ops.push(Op::ControlOut { value, index });
            Ok(())
        }

        fn control_in(&mut self, request: u8, value: u16, index: u16, length: u16) -> Result<Vec<u8>, BootError> {
            assert_eq!(request, 0);
            self.ops.push(Op::ControlIn { value, index, length });
            if self.fail_control_in {
                return Err(BootError::Timeout);
            }
            Ok(self.status.clone())
        }

        fn bulk_out(&mut self, data: &[u8]) -> Result<usize, BootError> {
            self.ops.push(Op::Bulk(data.len()));
            self.sent.extend_from_slice(data);
            Ok(if self.short_bulk { data.len() - 1 } else { data.len() })
        }
    }

    #[test]
    fn sends_boot_message_then_chunked_payload() {
        let payload: Vec<u8> = (0..40_000u32).map(|i| i as u8).collect();
        let mut transport = Scripted::new(0x2711);
        bootstrap_device(&mut transport, &payload).unwrap();

        assert_eq!(
            transport.ops,
            vec![
                Op::ControlOut { value: 24, index: 0 },
                Op::Bulk(24),
                Op::ControlOut { value: 40_000, index: 0 },
                Op::Bulk(16_384),
                Op::Bulk(16_384),
                Op::Bulk(7_232),
                Op::ControlIn { value: 4, index: 0, length: 4 },
            ]
        );
        assert_eq!(&transport.sent[..4], &40_000u32.to_le_bytes());
        assert!(transport.sent[4..24].iter().all(|&b| b == 0));
        assert_eq!(&transport.sent[24..], &payload[..]);
    }

    #[test]
    fn large_lengths_split_across_value_and_index() {
        let payload = vec![0u8; 0x1_2345];
        let mut transport = Scripted::new(0x2712);
        bootstrap_device(&mut transport, &payload).unwrap();
        assert_eq!(
            transport.ops[2],
            Op::ControlOut {
                value: 0x2345,
                index: 0x1
            }
        );
    }

    #[test]
    fn rejects_wrong_signature_before_any_transfer() {
        let mut transport = Scripted::new(0x2711);
        transport.ids = (0x1234, 0x5678);
        let err = bootstrap_device(&mut transport, b"loader").unwrap_err();
        assert!(matches!(err, BootError::Signature { vendor: 0x1234, product: 0x5678 }));
        assert!(transport.ops.is_empty());
    }

    #[test]
    fn nonzero_status_is_a_rejection() {
        let mut transport = Scripted::new(0x2763);
        transport.status = 7u32.to_le_bytes().to_vec();
        assert!(matches!(
            bootstrap_device(&mut transport, b"loader"),
            Err(BootError::Rejected(7))
        ));
    }

    #[test]
    fn short_status_and_short_bulk_are_errors() {
        let mut transport = Scripted::new(0x2763);
        transport.status = vec![0, 0];
        assert!(matches!(
            bootstrap_device(&mut transport, b"loader"),
            Err(BootError::ShortTransfer { expected: 4, actual: 2 })
        ));

        let mut transport = Scripted::new(0x2763);
        transport.short_bulk = true;
        assert!(matches!(
            bootstrap_device(&mut transport, b"loader"),
            Err(BootError::ShortTransfer { expected: 24, actual: 23 })
        ));
    }

    #[test]
    fn timeouts_are_not_retried() {
        let mut transport = Scripted::new(0x2764);
        transport.fail_control_in = true;
        assert!(matches!(
            bootstrap_device(&mut transport, b"loader"),
            Err(BootError::Timeout)
        ));
        let control_ins = transport
            .ops
            .iter()
            .filter(|op| matches!(op, Op::ControlIn { .. }))
            .count();
        assert_eq!(control_ins, 1);
    }

    #[test]
    fn missing_loader_file_is_reported() {
        let err = RpiBoot::from_file(Path::new("/nonexistent/bootcode4.bin")).unwrap_err();
        assert!(matches!(err, BootError::Payload { .. }));
    }
}
