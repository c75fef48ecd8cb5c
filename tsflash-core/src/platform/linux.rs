use crate::device::{DeviceDescriptor, PortPath};
use crate::topology::{Topology, TopologyError, TopologySource};
use nix::ioctl_read;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

ioctl_read!(blkgetsize64, 0x12, 114, u64);

/// Reads the USB tree from sysfs the way `lsusb -t` sees it, including
/// empty hub ports.
///
/// The sysfs and `/dev` roots are configurable so tests can point the reader
/// at a fabricated tree.
#[derive(Clone, Debug)]
pub struct SysfsTopology {
    sysfs: PathBuf,
    dev: PathBuf,
}

impl Default for SysfsTopology {
    fn default() -> Self {
        Self::new()
    }
}

impl SysfsTopology {
    pub fn new() -> Self {
        Self::with_roots("/sys", "/dev")
    }

    pub fn with_roots(sysfs: impl Into<PathBuf>, dev: impl Into<PathBuf>) -> Self {
        Self {
            sysfs: sysfs.into(),
            dev: dev.into(),
        }
    }

    fn usb_devices(&self) -> PathBuf {
        self.sysfs.join("bus/usb/devices")
    }

    /// Walks the ports of one hub, recursing into occupied ports.
    fn enumerate_ports(
        &self,
        topology: &mut Topology,
        blocks: &HashMap<String, BlockInfo>,
        bus: u8,
        hub_dir: &Path,
        hub: Option<&PortPath>,
    ) {
        let maxchild = read_number(&hub_dir.join("maxchild"), 10).unwrap_or(0) as u8;

        for n in 1..=maxchild {
            let port = match hub {
                Some(parent) => parent.child(n),
                None => match PortPath::new(bus, vec![n]) {
                    Some(p) => p,
                    None => continue,
                },
            };
            let dir = self.usb_devices().join(port.to_string());
            if dir.is_dir() {
                let device = self.describe(&dir, &port, blocks);
                topology.insert(port.clone(), Some(device));
                self.enumerate_ports(topology, blocks, bus, &dir, Some(&port));
            } else {
                topology.insert(port, None);
            }
        }
    }

    fn describe(
        &self,
        dir: &Path,
        port: &PortPath,
        blocks: &HashMap<String, BlockInfo>,
    ) -> DeviceDescriptor {
        let vendor_id = read_number(&dir.join("idVendor"), 16).unwrap_or(0) as u16;
        let product_id = read_number(&dir.join("idProduct"), 16).unwrap_or(0) as u16;
        let mut device = DeviceDescriptor::new(port.clone(), vendor_id, product_id);
        device.device_class = read_number(&dir.join("bDeviceClass"), 16).unwrap_or(0) as u8;
        device.child_ports = read_number(&dir.join("maxchild"), 10).unwrap_or(0) as u8;
        device.manufacturer = read_string(&dir.join("manufacturer"));
        device.product = read_string(&dir.join("product"));
        device.serial = read_string(&dir.join("serial"));

        // Interfaces show up as `<port>:<config>.<iface>` children.
        let prefix = format!("{port}:");
        if let Ok(entries) = fs::read_dir(dir) {
            let mut interfaces: Vec<(String, u8)> = entries
                .filter_map(Result::ok)
                .filter_map(|e| {
                    let name = e.file_name().to_string_lossy().to_string();
                    if !name.starts_with(&prefix) {
                        return None;
                    }
                    let class = read_number(&e.path().join("bInterfaceClass"), 16)?;
                    Some((name, class as u8))
                })
                .collect();
            interfaces.sort();
            device.interface_classes = interfaces.into_iter().map(|(_, c)| c).collect();
        }

        if let Some(block) = blocks.get(&port.to_string()) {
            device.block_device = Some(block.path.clone());
            device.capacity_bytes = block.capacity;
        }
        device
    }

    /// Maps USB port names to the whole-disk block devices hanging off them.
    ///
    /// USB storage sits behind SCSI, so the link from `/sys/block/<dev>` goes
    /// through the USB device, its interface, a SCSI host and target. The
    /// deepest component that parses as a port path is the owning port, which
    /// keeps a hub at `1-2` from claiming a disk on `1-2.3`.
    fn block_devices(&self) -> HashMap<String, BlockInfo> {
        let mut map: HashMap<String, BlockInfo> = HashMap::new();
        let block_dir = self.sysfs.join("block");
        let entries = match fs::read_dir(&block_dir) {
            Ok(entries) => entries,
            Err(e) => {
                log::debug!("Error scanning {}: {}", block_dir.display(), e);
                return map;
            }
        };

        let mut names: Vec<String> = entries
            .filter_map(Result::ok)
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| !is_virtual_block(name))
            .collect();
        names.sort();

        for name in names {
            let link = block_dir.join(&name);
            let resolved = match fs::canonicalize(&link) {
                Ok(p) => p,
                Err(e) => {
                    log::debug!("Error resolving device link for {}: {}", name, e);
                    continue;
                }
            };
            let owner = resolved
                .components()
                .filter_map(|c| c.as_os_str().to_str())
                .filter(|c| c.parse::<PortPath>().is_ok())
                .last()
                .map(str::to_string);

            if let Some(port) = owner {
                let capacity = read_number(&link.join("size"), 10).map(|sectors| sectors * 512);
                map.entry(port).or_insert(BlockInfo {
                    path: self.dev.join(&name),
                    capacity,
                });
            }
        }
        map
    }
}

impl TopologySource for SysfsTopology {
    fn snapshot(&self) -> Result<Topology, TopologyError> {
        let devices = self.usb_devices();
        if !devices.is_dir() {
            return Err(TopologyError::SysfsMissing(devices));
        }

        let blocks = self.block_devices();
        let mut topology = Topology::new();
        let entries = fs::read_dir(&devices).map_err(|source| TopologyError::Read {
            path: devices.clone(),
            source,
        })?;

        let mut buses: Vec<(u8, PathBuf)> = entries
            .filter_map(Result::ok)
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                let bus = name.strip_prefix("usb")?.parse::<u8>().ok()?;
                Some((bus, e.path()))
            })
            .collect();
        buses.sort();

        for (bus, dir) in buses {
            self.enumerate_ports(&mut topology, &blocks, bus, &dir, None);
        }
        Ok(topology)
    }
}

struct BlockInfo {
    path: PathBuf,
    capacity: Option<u64>,
}

fn is_virtual_block(name: &str) -> bool {
    ["loop", "ram", "zram", "dm-", "md", "sr", "nbd"]
        .iter()
        .any(|p| name.starts_with(p))
}

fn read_string(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn read_number(path: &Path, radix: u32) -> Option<u64> {
    read_string(path).and_then(|s| u64::from_str_radix(&s, radix).ok())
}

/// Size in bytes of an open block device.
pub fn block_device_size(file: &File) -> io::Result<u64> {
    let mut size_bytes: u64 = 0;
    // SAFETY: the fd is owned by `file` and BLKGETSIZE64 writes one u64.
    unsafe {
        blkgetsize64(file.as_raw_fd(), &mut size_bytes).map_err(io::Error::from)?;
    }
    Ok(size_bytes)
}

/// Helper to find the parent device of a partition (e.g., /dev/sda1 -> /dev/sda).
fn get_parent_device_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str.starts_with("/dev/sd") {
        if let Some(index) = path_str.rfind(|c: char| c.is_alphabetic()) {
            return PathBuf::from(&path_str[..=index]);
        }
    } else if path_str.starts_with("/dev/mmcblk") || path_str.starts_with("/dev/nvme") {
        if let Some(index) = path_str.rfind('p') {
            if path_str[index + 1..].chars().all(|c| c.is_ascii_digit()) {
                return PathBuf::from(&path_str[..index]);
            }
        }
    }

    path.to_path_buf()
}

/// The whole-disk device that holds the root filesystem, if it can be found.
pub fn system_disk() -> Option<PathBuf> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .iter()
        .find(|disk| disk.mount_point() == Path::new("/"))
        .map(|disk| {
            let name = Path::new(disk.name());
            let path = if name.is_absolute() {
                name.to_path_buf()
            } else {
                PathBuf::from("/dev/").join(name)
            };
            get_parent_device_path(&path)
        })
}

/// Mount points of every mounted partition of `device` (or of the device itself).
pub fn mounted_partitions(device: &Path) -> Vec<PathBuf> {
    let Some(device_name) = device.file_name().map(|n| n.to_string_lossy().to_string()) else {
        return Vec::new();
    };
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter(|disk| {
            let name = Path::new(disk.name());
            name.file_name()
                .is_some_and(|n| is_partition_of(&n.to_string_lossy(), &device_name))
        })
        .map(|disk| disk.mount_point().to_path_buf())
        .filter(|mp| !mp.as_os_str().is_empty())
        .collect()
}

/// True for `device` itself or one of its partitions as the kernel names
/// them: `sda` -> `sda1`, but `mmcblk1` -> `mmcblk1p1` (never `mmcblk10`).
fn is_partition_of(name: &str, device: &str) -> bool {
    let Some(rest) = name.strip_prefix(device) else {
        return false;
    };
    let numbered = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());
    if rest.is_empty() {
        true
    } else if device.ends_with(|c: char| c.is_ascii_digit()) {
        rest.strip_prefix('p').is_some_and(numbered)
    } else {
        numbered(rest)
    }
}

/// True if a process with exactly this name is running, such as an
/// auto-mounter that would grab freshly attached cards.
pub fn process_running(name: &str) -> bool {
    let mut system = sysinfo::System::new();
    system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);
    system
        .processes_by_exact_name(std::ffi::OsStr::new(name))
        .next()
        .is_some()
}

/// Unmounts a single mount point.
pub fn unmount(mount_point: &Path) -> io::Result<()> {
    nix::mount::umount(mount_point).map_err(io::Error::from)
}
