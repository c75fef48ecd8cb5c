//! Decides what, if anything, the system may do with a newly attached device.
//!
//! The classification table is the safety boundary of the whole tool: only a
//! device classified [`Classification::ReadyBlockDevice`] is ever written to.
use crate::device::{CLASS_MASS_STORAGE, DeviceDescriptor};
use std::path::PathBuf;

/// Broadcom's USB vendor id, used by every Raspberry Pi boot ROM.
pub const BROADCOM_VID: u16 = 0x0a5c;

/// Boot ROM product ids that speak the rpiboot protocol
/// (BCM2835/6/7, BCM2711, BCM2712).
pub const RPIBOOT_PRODUCT_IDS: &[u16] = &[0x2763, 0x2764, 0x2711, 0x2712];

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Classification {
    /// Not ours to touch.
    Ignore,
    /// A mass-storage device with a kernel block device.
    ReadyBlockDevice(PathBuf),
    /// A boot ROM that can be switched into mass-storage mode.
    BootModeCapable,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Rule {
    BootRom,
    MassStorage,
}

#[derive(Clone, Copy, Debug)]
struct Entry {
    vendor_id: Option<u16>,
    product_id: Option<u16>,
    class: Option<u8>,
    rule: Rule,
}

impl Entry {
    fn matches(&self, device: &DeviceDescriptor) -> bool {
        self.vendor_id.is_none_or(|v| v == device.vendor_id)
            && self.product_id.is_none_or(|p| p == device.product_id)
            && self.class.is_none_or(|c| device.has_class(c))
    }
}

/// Table-driven classifier. The first matching entry wins.
#[derive(Clone, Debug)]
pub struct Classifier {
    entries: Vec<Entry>,
}

impl Default for Classifier {
    fn default() -> Self {
        let mut entries: Vec<Entry> = RPIBOOT_PRODUCT_IDS
            .iter()
            .map(|&pid| Entry {
                vendor_id: Some(BROADCOM_VID),
                product_id: Some(pid),
                class: None,
                rule: Rule::BootRom,
            })
            .collect();
        entries.push(Entry {
            vendor_id: None,
            product_id: None,
            class: Some(CLASS_MASS_STORAGE),
            rule: Rule::MassStorage,
        });
        Self { entries }
    }
}

impl Classifier {
    /// Classifies a device from its identifiers and class alone; no I/O.
    pub fn classify(&self, device: &DeviceDescriptor) -> Classification {
        let Some(entry) = self.entries.iter().find(|e| e.matches(device)) else {
            return Classification::Ignore;
        };
        match entry.rule {
            Rule::BootRom => Classification::BootModeCapable,
            Rule::MassStorage => match &device.block_device {
                Some(path) => Classification::ReadyBlockDevice(path.clone()),
                None => Classification::Ignore,
            },
        }
    }
}

/// Classifies with the built-in table.
pub fn classify(device: &DeviceDescriptor) -> Classification {
    Classifier::default().classify(device)
}

/// True for the vendor/product pair of a known boot ROM.
pub fn is_boot_rom(vendor_id: u16, product_id: u16) -> bool {
    vendor_id == BROADCOM_VID && RPIBOOT_PRODUCT_IDS.contains(&product_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(vid: u16, pid: u16) -> DeviceDescriptor {
        DeviceDescriptor::new("1-1.2".parse().unwrap(), vid, pid)
    }

    #[test]
    fn boot_roms_are_boot_mode_capable() {
        for &pid in RPIBOOT_PRODUCT_IDS {
            assert_eq!(
                classify(&device(BROADCOM_VID, pid)),
                Classification::BootModeCapable
            );
        }
    }

    #[test]
    fn mass_storage_needs_a_block_device() {
        let mut reader = device(0x0bda, 0x0158);
        reader.interface_classes = vec![CLASS_MASS_STORAGE];
        assert_eq!(classify(&reader), Classification::Ignore);

        reader.block_device = Some(PathBuf::from("/dev/sdb"));
        assert_eq!(
            classify(&reader),
            Classification::ReadyBlockDevice(PathBuf::from("/dev/sdb"))
        );
    }

    #[test]
    fn unknown_devices_are_ignored_even_with_a_block_device() {
        let mut keyboard = device(0x046d, 0xc31c);
        keyboard.interface_classes = vec![0x03];
        keyboard.block_device = Some(PathBuf::from("/dev/sdz"));
        assert_eq!(classify(&keyboard), Classification::Ignore);
        assert_eq!(classify(&device(BROADCOM_VID, 0x0001)), Classification::Ignore);
    }

    #[test]
    fn hubs_are_ignored() {
        let mut hub = device(0x2109, 0x2813);
        hub.device_class = crate::device::CLASS_HUB;
        hub.child_ports = 4;
        assert_eq!(classify(&hub), Classification::Ignore);
    }
}
