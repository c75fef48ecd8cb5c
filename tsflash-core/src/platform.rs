//! Provides platform-specific functionality.
//!
//! Everything that touches the operating system directly lives here: walking
//! the USB tree in sysfs, sizing block devices, and finding and unmounting
//! their mounted partitions.
//!
//! Each submodule exposes the same public API, selected with `#[cfg]`, so the
//! rest of the library never needs to know which one it got. Only Linux has a
//! real implementation; elsewhere every call reports that it is unsupported.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::*;

#[cfg(not(target_os = "linux"))]
mod other;
#[cfg(not(target_os = "linux"))]
pub use self::other::*;
