//! `tsflash usb` and `tsflash rpiboot`.
use crate::Outcome;
use anyhow::{Context, Result};
use console::style;
use std::path::Path;
use tsflash_core::device::PortPath;
use tsflash_core::platform::SysfsTopology;
use tsflash_core::rpiboot::RpiBoot;
use tsflash_core::topology::{RootSelector, TopologySource};

pub fn list(json: bool, all: bool, port: Option<PortPath>) -> Result<Outcome> {
    let topology = SysfsTopology::new()
        .snapshot()
        .context("reading the USB topology")?;

    let selector = match (all, port) {
        (true, _) => RootSelector::All,
        (false, Some(port)) => RootSelector::Port(port),
        (false, None) => RootSelector::FirstHub,
    };
    let shown = match topology.resolve_root(&selector) {
        Some(root) => topology.subtree(&root),
        None => topology,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&shown)?);
    } else if shown.is_empty() {
        println!("No USB devices found.");
    } else {
        print!("{}", shown.to_text());
    }
    Ok(Outcome::Success)
}

pub fn rpiboot(port: Option<PortPath>, bootcode: &Path) -> Result<Outcome> {
    let boot = RpiBoot::from_file(bootcode)?;
    let booted = boot
        .bootstrap_blocking(port.as_ref())
        .context("booting into mass-storage mode")?;
    println!(
        "✨ Device on port {} is booting into mass-storage mode.",
        style(booted).cyan()
    );
    Ok(Outcome::Success)
}
