//! The core, UI-agnostic library for the `tsflash` hub flasher.
//!
//! `tsflash-core` watches the ports of a USB hub, recognises SD card readers
//! and Raspberry Pi boot ROMs as they are plugged in, switches boot ROMs into
//! mass-storage mode, and writes one OS image to every resulting block device
//! in parallel. Front-ends (the `tsflash` CLI, its daemon and its terminal
//! view) only render what the library reports.
//!
//! The library is structured into several key modules:
//! - [`device`] and [`topology`]: port paths, device descriptors and USB tree
//!   snapshots.
//! - [`platform`]: the Linux specifics (sysfs enumeration, block device
//!   ioctls, mounts).
//! - [`watcher`]: turns successive snapshots into attach/detach events.
//! - [`classify`]: decides which devices may be touched at all.
//! - [`machine`]: the pure per-port state machine.
//! - [`rpiboot`]: the boot-ROM handoff protocol.
//! - [`image`], [`target`] and [`mod@write`]: the flash engine.
//! - [`orchestrator`] and [`events`]: ties it all together and publishes
//!   progress.
//! - [`config`]: the daemon's YAML configuration.
//!
//! ## Example: Flashing one card with progress reporting
//!
//! ```rust,no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use tsflash_core::cancel::CancelToken;
//! use tsflash_core::image::SourceImage;
//! use tsflash_core::write::{FlashEngine, FlashOptions};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = Arc::new(SourceImage::open(Path::new("raspios.img.xz"))?);
//!     let engine = FlashEngine::new();
//!
//!     let handle = engine.submit(
//!         image,
//!         Path::new("/dev/sda"),
//!         FlashOptions::default(),
//!         CancelToken::new(),
//!         |p| println!("{:?}: {}/{} bytes", p.stage, p.bytes, p.total),
//!     )?;
//!     let report = handle.wait_blocking()?;
//!     println!("Wrote {} bytes, sha256 {:?}", report.bytes_written, report.sha256);
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod classify;
pub mod config;
pub mod device;
pub mod events;
pub mod image;
pub mod machine;
pub mod orchestrator;
pub mod platform;
pub mod rpiboot;
pub mod target;
pub mod topology;
pub mod watcher;
pub mod write;
