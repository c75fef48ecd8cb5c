//! `tsflash daemon`: the headless orchestrator, configured from YAML.
use crate::{Outcome, init_logging};
use anyhow::{Context, Result, bail};
use indicatif::HumanBytes;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tsflash_core::cancel::CancelToken;
use tsflash_core::config::Config;
use tsflash_core::device::PortPath;
use tsflash_core::events::{Event, EventStream};
use tsflash_core::image::SourceImage;
use tsflash_core::orchestrator::Orchestrator;
use tsflash_core::platform::{self, SysfsTopology};
use tsflash_core::rpiboot::RpiBoot;

/// Minimum time between two progress lines for the same port.
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Longest wait for an event consumer to catch up after the run ends.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Auto-mounters that would grab cards while they are being written.
const CONFLICTING_PROCESSES: &[&str] = &["devmon"];

/// Fails if a process that fights over freshly attached cards is running.
pub fn check_conflicts() -> Result<()> {
    for name in CONFLICTING_PROCESSES {
        if platform::process_running(name) {
            bail!("{name} is running and would mount cards while they are flashed; stop it first");
        }
    }
    Ok(())
}

pub fn run(path: &Path, level: Option<log::LevelFilter>, shutdown: CancelToken) -> Result<Outcome> {
    let config = Config::load(path)?;
    init_logging(level.unwrap_or_else(|| config.log_filter()));
    log::info!("Using configuration {}", path.display());
    check_conflicts()?;

    let boot = RpiBoot::from_file(&config.bootcode_path)?;
    log::info!("Loading image {}", config.image_path.display());
    let image = match SourceImage::open_with_progress(&config.image_path, &shutdown, |_| {}) {
        Ok(image) => Arc::new(image),
        Err(e) if shutdown.is_cancelled() => {
            log::warn!("Stopped while loading the image: {e}");
            return Ok(Outcome::Cancelled);
        }
        Err(e) => return Err(e).context("loading the image"),
    };
    log::info!("Image is {}", HumanBytes(image.len()));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let summary = runtime.block_on(async move {
        let orchestrator = Orchestrator::new(config.orchestrator(), SysfsTopology::new(), boot, image);
        let logger = tokio::spawn(log_events(orchestrator.events()));
        let summary = orchestrator.run(shutdown).await;
        drain(logger).await;
        summary
    });

    log::info!(
        "Flashed {} card(s), {} failure(s)",
        summary.completed,
        summary.failed
    );
    Ok(Outcome::Success)
}

/// Waits for an event consumer to read out the closed bus.
pub async fn drain(consumer: tokio::task::JoinHandle<()>) {
    match tokio::time::timeout(DRAIN_TIMEOUT, consumer).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::error!("Event consumer failed: {e}"),
        Err(_) => log::warn!("Gave up waiting for the last events after {DRAIN_TIMEOUT:?}"),
    }
}

/// Logs every orchestrator event, keeping progress to one line per port
/// every [`PROGRESS_LOG_INTERVAL`].
async fn log_events(mut events: EventStream) {
    let mut last_progress: HashMap<PortPath, Instant> = HashMap::new();
    while let Some(envelope) = events.next().await {
        match envelope.event {
            Event::Attached { port, device } => log::info!("[{port}] attached {device}"),
            Event::Detached { port } => {
                last_progress.remove(&port);
                log::info!("[{port}] detached");
            }
            Event::PhaseChanged { port, from, to } => log::debug!("[{port}] {from} -> {to}"),
            Event::Progress {
                port,
                stage,
                bytes,
                total,
            } => {
                let due = last_progress
                    .get(&port)
                    .is_none_or(|at| at.elapsed() >= PROGRESS_LOG_INTERVAL);
                if due || bytes == total {
                    log::info!(
                        "[{port}] {stage:?}: {} / {}",
                        HumanBytes(bytes),
                        HumanBytes(total)
                    );
                    last_progress.insert(port, Instant::now());
                }
            }
            Event::Completed { port, report } => {
                last_progress.remove(&port);
                log::info!(
                    "[{port}] completed: {} written to {} in {:.1?}",
                    HumanBytes(report.bytes_written),
                    report.target.display(),
                    report.elapsed
                );
            }
            Event::Failed { port, reason } => {
                last_progress.remove(&port);
                log::error!("[{port}] failed: {reason}");
            }
            Event::WatchError { message } => log::warn!("USB enumeration failed: {message}"),
        }
    }
    if events.missed() > 0 {
        log::warn!("Event log skipped {} event(s)", events.missed());
    }
}
