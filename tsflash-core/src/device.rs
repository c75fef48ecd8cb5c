use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// USB class code for mass-storage devices.
pub const CLASS_MASS_STORAGE: u8 = 0x08;
/// USB class code for hubs.
pub const CLASS_HUB: u8 = 0x09;

/// The physical position of a USB port: bus number plus the chain of port
/// numbers leading to it, written the way the kernel names it (`1-2.3`).
///
/// Ordering compares the bus first and then the chain component-wise, so
/// `1-2.3` sorts before `1-2.10`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortPath {
    bus: u8,
    chain: Vec<u8>,
}

impl PortPath {
    /// Builds a path from a bus number and a non-empty port chain.
    pub fn new(bus: u8, chain: Vec<u8>) -> Option<Self> {
        if chain.is_empty() {
            return None;
        }
        Some(Self { bus, chain })
    }

    pub fn bus(&self) -> u8 {
        self.bus
    }

    pub fn chain(&self) -> &[u8] {
        &self.chain
    }

    /// Returns the port `port` one level below this one.
    pub fn child(&self, port: u8) -> Self {
        let mut chain = self.chain.clone();
        chain.push(port);
        Self {
            bus: self.bus,
            chain,
        }
    }

    /// True when `self` sits strictly below `ancestor` on the same bus.
    pub fn is_downstream_of(&self, ancestor: &PortPath) -> bool {
        self.bus == ancestor.bus
            && self.chain.len() > ancestor.chain.len()
            && self.chain.starts_with(&ancestor.chain)
    }

    /// Nesting depth below the root hub (`1-2` is 1, `1-2.3` is 2).
    pub fn depth(&self) -> usize {
        self.chain.len()
    }
}

impl fmt::Display for PortPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-", self.bus)?;
        for (i, port) in self.chain.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{port}")?;
        }
        Ok(())
    }
}

/// Error returned when a string is not a valid port path.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid USB port path '{0}' (expected e.g. 1-2 or 1-2.3)")]
pub struct ParsePortPathError(pub String);

impl FromStr for PortPath {
    type Err = ParsePortPathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParsePortPathError(s.to_string());
        let (bus, rest) = s.trim().split_once('-').ok_or_else(err)?;
        let bus = bus.parse::<u8>().map_err(|_| err())?;
        let chain = rest
            .split('.')
            .map(|p| match p.parse::<u8>() {
                Ok(0) | Err(_) => Err(err()),
                Ok(n) => Ok(n),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(bus, chain).ok_or_else(err)
    }
}

impl Serialize for PortPath {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PortPath {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Everything known about the device plugged into one port at the moment of
/// a topology snapshot.
///
/// Descriptors are replaced wholesale whenever the topology changes; they are
/// never patched in place.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub port: PortPath,
    pub vendor_id: u16,
    pub product_id: u16,
    /// `bDeviceClass`; usually 0 with the real class given per interface.
    pub device_class: u8,
    pub interface_classes: Vec<u8>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial: Option<String>,
    /// Number of downstream ports when the device is a hub.
    pub child_ports: u8,
    /// The OS block device (e.g. `/dev/sda`) once the kernel has bound one.
    pub block_device: Option<PathBuf>,
    pub capacity_bytes: Option<u64>,
}

impl DeviceDescriptor {
    /// A bare descriptor with only the identifiers filled in.
    pub fn new(port: PortPath, vendor_id: u16, product_id: u16) -> Self {
        Self {
            port,
            vendor_id,
            product_id,
            device_class: 0,
            interface_classes: Vec::new(),
            manufacturer: None,
            product: None,
            serial: None,
            child_ports: 0,
            block_device: None,
            capacity_bytes: None,
        }
    }

    /// True if the device or any of its interfaces reports `class`.
    pub fn has_class(&self, class: u8) -> bool {
        self.device_class == class || self.interface_classes.contains(&class)
    }

    pub fn is_hub(&self) -> bool {
        self.child_ports > 0 || self.device_class == CLASS_HUB
    }

    /// Manufacturer and product strings joined for display, if any.
    pub fn display_name(&self) -> Option<String> {
        let parts: Vec<&str> = [self.manufacturer.as_deref(), self.product.as_deref()]
            .into_iter()
            .flatten()
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" "))
        }
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}:0x{:04x}", self.vendor_id, self.product_id)?;
        if let Some(name) = self.display_name() {
            write!(f, " {name}")?;
        }
        if let Some(block) = &self.block_device {
            write!(f, " [{}]", block.display())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_prints_port_paths() {
        let p: PortPath = "1-2.3".parse().unwrap();
        assert_eq!(p.bus(), 1);
        assert_eq!(p.chain(), &[2, 3]);
        assert_eq!(p.to_string(), "1-2.3");
        assert_eq!("3-1".parse::<PortPath>().unwrap().to_string(), "3-1");
    }

    #[test]
    fn rejects_malformed_port_paths() {
        for bad in ["", "1", "1-", "usb1", "1-2.", "1-0", "a-1", "1-2:1.0"] {
            assert!(bad.parse::<PortPath>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn orders_numerically_per_component() {
        let mut ports: Vec<PortPath> = ["1-2.10", "1-2.3", "2-1", "1-2"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        ports.sort();
        let names: Vec<String> = ports.iter().map(ToString::to_string).collect();
        assert_eq!(names, ["1-2", "1-2.3", "1-2.10", "2-1"]);
    }

    #[test]
    fn downstream_requires_strict_prefix_on_same_bus() {
        let hub: PortPath = "1-2".parse().unwrap();
        assert!("1-2.3".parse::<PortPath>().unwrap().is_downstream_of(&hub));
        assert!("1-2.3.1".parse::<PortPath>().unwrap().is_downstream_of(&hub));
        assert!(!hub.is_downstream_of(&hub));
        assert!(!"1-20".parse::<PortPath>().unwrap().is_downstream_of(&hub));
        assert!(!"2-2.3".parse::<PortPath>().unwrap().is_downstream_of(&hub));
    }

    #[test]
    fn descriptor_display_matches_usb_listing() {
        let mut d = DeviceDescriptor::new("1-2.3".parse().unwrap(), 0x0a5c, 0x2711);
        d.manufacturer = Some("Broadcom".into());
        d.product = Some("BCM2711 Boot".into());
        d.block_device = Some(PathBuf::from("/dev/sda"));
        assert_eq!(d.to_string(), "0x0a5c:0x2711 Broadcom BCM2711 Boot [/dev/sda]");
    }
}
