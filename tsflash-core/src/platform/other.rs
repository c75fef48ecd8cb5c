use crate::topology::{Topology, TopologyError, TopologySource};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

/// Placeholder for platforms without a sysfs; every snapshot fails.
#[derive(Clone, Debug, Default)]
pub struct SysfsTopology;

impl SysfsTopology {
    pub fn new() -> Self {
        Self
    }

    pub fn with_roots(_sysfs: impl Into<PathBuf>, _dev: impl Into<PathBuf>) -> Self {
        Self
    }
}

impl TopologySource for SysfsTopology {
    fn snapshot(&self) -> Result<Topology, TopologyError> {
        Err(TopologyError::Unsupported)
    }
}

fn unsupported() -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        "block devices are only supported on Linux",
    )
}

pub fn block_device_size(_file: &File) -> io::Result<u64> {
    Err(unsupported())
}

pub fn system_disk() -> Option<PathBuf> {
    None
}

pub fn mounted_partitions(_device: &Path) -> Vec<PathBuf> {
    Vec::new()
}

pub fn unmount(_mount_point: &Path) -> io::Result<()> {
    Err(unsupported())
}

pub fn process_running(_name: &str) -> bool {
    false
}
