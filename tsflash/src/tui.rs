//! `tsflash tui`: the orchestrator with one live progress line per port.
use crate::daemon::{check_conflicts, drain};
use crate::{Outcome, TuiArgs, ui};
use anyhow::{Context, Result};
use console::style;
use indicatif::{HumanBytes, MultiProgress, ProgressBar};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tsflash_core::cancel::CancelToken;
use tsflash_core::config::parse_block_size;
use tsflash_core::device::PortPath;
use tsflash_core::events::{Event, EventStream};
use tsflash_core::image::{ImageError, SourceImage};
use tsflash_core::machine::PortSnapshot;
use tsflash_core::orchestrator::{Orchestrator, OrchestratorConfig, StatusMap};
use tsflash_core::platform::SysfsTopology;
use tsflash_core::rpiboot::RpiBoot;
use tsflash_core::topology::RootSelector;
use tsflash_core::write::FlashOptions;

pub fn run(args: TuiArgs, shutdown: CancelToken) -> Result<Outcome> {
    check_conflicts()?;
    let config = orchestrator_config(&args)?;
    let boot = RpiBoot::from_file(&args.bootcode)?;

    println!("Loading {}...", style(args.image.display()).cyan());
    let image = match SourceImage::open_with_progress(&args.image, &shutdown, |_| {}) {
        Ok(image) => Arc::new(image),
        Err(ImageError::Cancelled(_)) => return Ok(Outcome::Cancelled),
        Err(e) => return Err(e).context("loading the image"),
    };
    println!(
        "Writing {} ({}) to every card on {}. Press Ctrl+C to stop.\n",
        style(args.image.display()).cyan(),
        HumanBytes(image.len()),
        match &config.root {
            RootSelector::Port(port) => format!("port {port}"),
            _ => "the first hub".to_string(),
        }
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let summary = runtime.block_on(async move {
        let orchestrator = Orchestrator::new(config, SysfsTopology::new(), boot, image);
        let mut view = LiveView::new();
        let printer = tokio::spawn(print_results(orchestrator.events(), view.multi.clone()));
        let mut status = orchestrator.status();
        let mut run = tokio::spawn(orchestrator.run(shutdown));

        let summary = loop {
            tokio::select! {
                summary = &mut run => break summary,
                changed = status.changed() => {
                    if changed.is_err() {
                        break run.await;
                    }
                    let ports = status.borrow_and_update().clone();
                    view.render(&ports);
                }
            }
        };
        drain(printer).await;
        view.finish();
        summary
    })?;

    println!(
        "\n{} completed, {} failed.",
        style(summary.completed).green().bold(),
        style(summary.failed).red().bold()
    );
    Ok(Outcome::Success)
}

fn orchestrator_config(args: &TuiArgs) -> Result<OrchestratorConfig> {
    let flash = FlashOptions {
        block_size: parse_block_size(&args.block_size)?,
        verify: !args.no_verify,
        length: None,
    };
    flash.validate()?;
    let mut config = OrchestratorConfig {
        root: args
            .port
            .clone()
            .map_or(RootSelector::FirstHub, RootSelector::Port),
        flash,
        parallelism: args.parallelism,
        ..OrchestratorConfig::default()
    };
    config.timings.stable_delay = Duration::try_from_secs_f64(args.stable_delay)
        .context("--stable-delay must be a non-negative number of seconds")?;
    Ok(config)
}

/// One bar per port, in port order.
struct LiveView {
    multi: MultiProgress,
    bars: BTreeMap<PortPath, ProgressBar>,
}

impl LiveView {
    fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: BTreeMap::new(),
        }
    }

    fn render(&mut self, ports: &StatusMap) {
        for (port, snapshot) in ports {
            if !self.bars.contains_key(port) {
                let bar = self.insert_bar(port);
                self.bars.insert(port.clone(), bar);
            }
            if let Some(bar) = self.bars.get(port) {
                update_bar(bar, snapshot);
            }
        }
    }

    /// Adds a bar for `port`, keeping the lines sorted by port.
    fn insert_bar(&self, port: &PortPath) -> ProgressBar {
        let bar = ProgressBar::new(0)
            .with_style(ui::port_style())
            .with_prefix(port.to_string());
        match self.bars.range(port.clone()..).next() {
            Some((_, after)) => self.multi.insert_before(after, bar),
            None => self.multi.add(bar),
        }
    }

    fn finish(self) {
        for bar in self.bars.values() {
            bar.abandon();
        }
    }
}

fn update_bar(bar: &ProgressBar, snapshot: &PortSnapshot) {
    let mut message = ui::phase_label(&snapshot.phase).to_string();
    if let Some(device) = snapshot.device.as_ref().and_then(|d| d.display_name()) {
        message.push_str(&format!(" {}", style(device).dim()));
    }
    bar.set_message(message);
    bar.set_length(snapshot.total_bytes);
    bar.set_position(snapshot.bytes_written);
}

/// Prints a permanent line above the bars for every finished card.
async fn print_results(mut events: EventStream, multi: MultiProgress) {
    while let Some(envelope) = events.next().await {
        let line = match envelope.event {
            Event::Completed { port, report } => format!(
                "{} {} flashed {} in {:.1?}",
                style("✔").green().bold(),
                port,
                HumanBytes(report.bytes_written),
                report.elapsed
            ),
            Event::Failed { port, reason } => {
                format!("{} {} {}", style("✘").red().bold(), port, reason)
            }
            Event::WatchError { message } => {
                format!("{} USB enumeration failed: {}", style("!").yellow(), message)
            }
            _ => continue,
        };
        multi.println(line).ok();
    }
}
