//! Point-in-time snapshots of the USB port tree.
//!
//! A [`Topology`] is plain data: every known port, occupied or not, keyed by
//! [`PortPath`]. Snapshots are produced by a [`TopologySource`] and compared
//! with [`diff`] to derive [`TopologyEvent`]s.
use crate::device::{DeviceDescriptor, PortPath};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io;
use std::path::PathBuf;

/// Errors raised while enumerating the USB tree.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("USB sysfs not found at {0} (is this a Linux system?)")]
    SysfsMissing(PathBuf),
    #[error("error reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("USB enumeration is only supported on Linux")]
    Unsupported,
    #[error("USB enumeration task failed: {0}")]
    Worker(String),
}

/// Anything that can enumerate the current USB topology.
pub trait TopologySource: Send + Sync + 'static {
    fn snapshot(&self) -> Result<Topology, TopologyError>;
}

/// All ports of a USB tree at one instant. `None` marks an empty port.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Topology {
    ports: BTreeMap<PortPath, Option<DeviceDescriptor>>,
}

/// Which part of the tree a watch or listing is limited to.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum RootSelector {
    All,
    Port(PortPath),
    /// The first port (in path order) that has ports below it. A watch with
    /// no hub present covers nothing.
    #[default]
    FirstHub,
}

/// A change between two consecutive snapshots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TopologyEvent {
    Attached(PortPath, DeviceDescriptor),
    Detached(PortPath),
    Changed(PortPath, DeviceDescriptor),
    /// Enumeration failed for one tick; the watch carries on.
    WatchError(String),
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a port; `device` is `None` for an empty port.
    pub fn insert(&mut self, port: PortPath, device: Option<DeviceDescriptor>) {
        self.ports.insert(port, device);
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn contains(&self, port: &PortPath) -> bool {
        self.ports.contains_key(port)
    }

    /// The device at `port`, if the port exists and is occupied.
    pub fn device(&self, port: &PortPath) -> Option<&DeviceDescriptor> {
        self.ports.get(port).and_then(Option::as_ref)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PortPath, Option<&DeviceDescriptor>)> {
        self.ports.iter().map(|(p, d)| (p, d.as_ref()))
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceDescriptor> {
        self.ports.values().flatten()
    }

    /// The first port with at least one port below it.
    pub fn first_hub(&self) -> Option<&PortPath> {
        self.ports
            .keys()
            .find(|hub| self.ports.keys().any(|p| p.is_downstream_of(hub)))
    }

    /// Resolves a selector to a concrete root port. `None` means the whole tree.
    pub fn resolve_root(&self, selector: &RootSelector) -> Option<PortPath> {
        match selector {
            RootSelector::All => None,
            RootSelector::Port(port) => Some(port.clone()),
            RootSelector::FirstHub => self.first_hub().cloned(),
        }
    }

    /// The root port and everything below it.
    pub fn subtree(&self, root: &PortPath) -> Topology {
        Topology {
            ports: self
                .ports
                .iter()
                .filter(|(p, _)| *p == root || p.is_downstream_of(root))
                .map(|(p, d)| (p.clone(), d.clone()))
                .collect(),
        }
    }

    /// Only the ports strictly below `root`.
    pub fn downstream(&self, root: &PortPath) -> Topology {
        Topology {
            ports: self
                .ports
                .iter()
                .filter(|(p, _)| p.is_downstream_of(root))
                .map(|(p, d)| (p.clone(), d.clone()))
                .collect(),
        }
    }

    /// Human-readable listing, one port per line.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for (port, device) in self.iter() {
            match device {
                Some(d) => {
                    let _ = writeln!(out, "{port}: {d}");
                }
                None => {
                    let _ = writeln!(out, "{port}: (empty)");
                }
            }
        }
        out
    }
}

/// Compares two snapshots port by port.
///
/// Events come out in [`PortPath`] order. Empty ports count as absent, so a
/// port going from empty to occupied is an attach.
pub fn diff(prev: &Topology, next: &Topology) -> Vec<TopologyEvent> {
    let mut events = Vec::new();
    let ports: std::collections::BTreeSet<&PortPath> =
        prev.ports.keys().chain(next.ports.keys()).collect();

    for port in ports {
        match (prev.device(port), next.device(port)) {
            (Some(_), None) => events.push(TopologyEvent::Detached(port.clone())),
            (None, Some(d)) => events.push(TopologyEvent::Attached(port.clone(), d.clone())),
            (Some(old), Some(new)) if old != new => {
                events.push(TopologyEvent::Changed(port.clone(), new.clone()))
            }
            _ => {}
        }
    }
    events
}
