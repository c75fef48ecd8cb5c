//! Opening a flash target for exclusive, unbuffered writing.
use crate::platform;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// A target device (or, in tests, a plain file) opened for writing.
#[derive(Debug)]
pub struct Target {
    pub path: PathBuf,
    pub file: File,
    pub capacity: u64,
    /// Whether the file was opened with `O_DIRECT`.
    pub direct: bool,
}

impl Target {
    /// Opens `path` write-only.
    ///
    /// Block devices get `O_EXCL`, which makes the kernel refuse the open
    /// with `EBUSY` while the device is mounted or held open exclusively by
    /// anyone else, and `O_DIRECT` so writes bypass the page cache. Regular
    /// files are opened as-is; their capacity is their current length.
    pub fn open(path: &Path) -> io::Result<Self> {
        let is_block = std::fs::metadata(path)?.file_type().is_block_device();

        let mut options = OpenOptions::new();
        options.write(true);
        if is_block {
            options.custom_flags(libc::O_EXCL | direct_flag());
        }
        let file = options.open(path)?;

        let capacity = if is_block {
            platform::block_device_size(&file)?
        } else {
            file.metadata()?.len()
        };

        Ok(Self {
            path: path.to_path_buf(),
            file,
            capacity,
            direct: is_block && direct_flag() != 0,
        })
    }

    /// Turns `O_DIRECT` off, for tails that are not sector aligned.
    pub fn disable_direct(&mut self) -> io::Result<()> {
        if !self.direct {
            return Ok(());
        }
        let fd = self.file.as_raw_fd();
        // SAFETY: F_GETFL/F_SETFL on a descriptor we own.
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags & !direct_flag()) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        self.direct = false;
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn direct_flag() -> libc::c_int {
    libc::O_DIRECT
}

#[cfg(not(target_os = "linux"))]
fn direct_flag() -> libc::c_int {
    0
}

/// Tells the kernel to drop cached pages of `file` so a read-back really
/// comes from the device.
pub fn drop_cache(file: &File) {
    #[cfg(target_os = "linux")]
    // SAFETY: advisory call on a descriptor we own.
    unsafe {
        libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_DONTNEED);
    }
    #[cfg(not(target_os = "linux"))]
    let _ = file;
}

/// Why a block device may not be prepared for flashing.
#[derive(Debug, thiserror::Error)]
pub enum PrepareError {
    #[error("{0} holds the running system's root filesystem")]
    SystemDisk(PathBuf),
    #[error("failed to unmount {mount_point}: {source}")]
    Unmount {
        mount_point: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Gets a block device ready to be overwritten: refuses the system disk and
/// unmounts every mounted partition. Regular files pass straight through.
pub fn prepare(path: &Path) -> Result<(), PrepareError> {
    let is_block = std::fs::metadata(path)
        .map(|m| m.file_type().is_block_device())
        .unwrap_or(false);
    if !is_block {
        return Ok(());
    }

    if let Some(system) = platform::system_disk() {
        if system == path {
            return Err(PrepareError::SystemDisk(path.to_path_buf()));
        }
    }

    let mounted = platform::mounted_partitions(path);
    if mounted.is_empty() {
        log::debug!("No mounted partitions found for {}", path.display());
        return Ok(());
    }
    log::info!(
        "Found {} mounted partition(s) for {}",
        mounted.len(),
        path.display()
    );
    for mount_point in mounted {
        if mount_point == Path::new("/") {
            return Err(PrepareError::SystemDisk(path.to_path_buf()));
        }
        platform::unmount(&mount_point).map_err(|source| PrepareError::Unmount {
            mount_point: mount_point.clone(),
            source,
        })?;
        log::info!("Unmounted {}", mount_point.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn regular_files_use_their_length_as_capacity() {
        let file = NamedTempFile::new().unwrap();
        file.as_file().set_len(8192).unwrap();
        let target = Target::open(file.path()).unwrap();
        assert_eq!(target.capacity, 8192);
        assert!(!target.direct);
        prepare(file.path()).unwrap();
    }

    #[test]
    fn missing_target_is_an_io_error() {
        let err = Target::open(Path::new("/nonexistent/tsflash-target")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
