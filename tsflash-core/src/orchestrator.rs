//! Runs the whole pipeline: watch the hub, drive one state machine per port,
//! boot and flash devices, and report everything on the event bus.
use crate::cancel::CancelToken;
use crate::device::PortPath;
use crate::events::{Event, EventBus, EventStream};
use crate::image::SourceImage;
use crate::machine::{PortInput, PortSnapshot, Timings};
use crate::rpiboot::BootHandoff;
use crate::topology::{RootSelector, TopologyEvent, TopologySource};
use crate::watcher::{self, DEFAULT_POLL_INTERVAL};
use crate::write::{FlashEngine, FlashOptions};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinHandle;

mod port;

use port::{PortContext, PortReport, PortTask};

/// What happens to running flash jobs when the orchestrator is stopped.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownPolicy {
    /// Let running jobs finish; start nothing new.
    #[default]
    Drain,
    /// Cancel running jobs at their next chunk boundary.
    Cancel,
}

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub root: RootSelector,
    pub poll_interval: Duration,
    pub timings: Timings,
    pub flash: FlashOptions,
    /// Maximum concurrent flash jobs; `None` for no limit.
    pub parallelism: Option<usize>,
    pub shutdown: ShutdownPolicy,
    pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            root: RootSelector::FirstHub,
            poll_interval: DEFAULT_POLL_INTERVAL,
            timings: Timings::default(),
            flash: FlashOptions::default(),
            parallelism: None,
            shutdown: ShutdownPolicy::Drain,
            event_capacity: crate::events::DEFAULT_CAPACITY,
        }
    }
}

pub type StatusMap = BTreeMap<PortPath, PortSnapshot>;

/// Latest snapshot of every port, published through a `watch` channel.
#[derive(Clone, Debug)]
pub struct StatusBoard {
    tx: Arc<watch::Sender<StatusMap>>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBoard {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(StatusMap::new());
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusMap> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> StatusMap {
        self.tx.borrow().clone()
    }

    pub fn update(&self, snapshot: PortSnapshot) {
        self.tx.send_modify(|ports| {
            ports.insert(snapshot.port.clone(), snapshot);
        });
    }

    pub fn record_progress(&self, port: &PortPath, bytes: u64, total: u64) {
        self.tx.send_modify(|ports| {
            if let Some(snapshot) = ports.get_mut(port) {
                snapshot.bytes_written = bytes;
                snapshot.total_bytes = total;
            }
        });
    }
}

/// Outcome of a whole [`Orchestrator::run`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub completed: usize,
    pub failed: usize,
    pub ports: StatusMap,
}

struct PortHandle {
    inbox: mpsc::UnboundedSender<PortInput>,
    task: JoinHandle<PortReport>,
}

pub struct Orchestrator<S, B> {
    config: OrchestratorConfig,
    source: Arc<S>,
    context: Arc<PortContext<B>>,
}

impl<S: TopologySource, B: BootHandoff> Orchestrator<S, B> {
    pub fn new(config: OrchestratorConfig, source: S, boot: B, image: Arc<SourceImage>) -> Self {
        let permits = config
            .parallelism
            .map_or(Semaphore::MAX_PERMITS, |n| n.max(1));
        let context = PortContext {
            boot: Arc::new(boot),
            engine: Arc::new(FlashEngine::new()),
            image,
            flash: config.flash,
            timings: config.timings,
            slots: Arc::new(Semaphore::new(permits)),
            bus: EventBus::with_capacity(config.event_capacity.max(1)),
            status: StatusBoard::new(),
        };
        Self {
            config,
            source: Arc::new(source),
            context: Arc::new(context),
        }
    }

    pub fn events(&self) -> EventStream {
        self.context.bus.subscribe()
    }

    pub fn status(&self) -> watch::Receiver<StatusMap> {
        self.context.status.subscribe()
    }

    pub fn engine(&self) -> &Arc<FlashEngine> {
        &self.context.engine
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Watches and flashes until `shutdown` is cancelled, then stops every
    /// port according to the shutdown policy and waits for them.
    pub async fn run(self, shutdown: CancelToken) -> RunSummary {
        let mut watcher = watcher::watch(
            self.source.clone(),
            self.config.root.clone(),
            self.config.poll_interval,
        );
        let mut ports: BTreeMap<PortPath, PortHandle> = BTreeMap::new();
        log::info!(
            "Orchestrator started (parallelism: {}, verify: {})",
            self.config
                .parallelism
                .map_or_else(|| "unbounded".to_string(), |n| n.to_string()),
            self.config.flash.verify
        );

        loop {
            let events = tokio::select! {
                _ = shutdown.cancelled() => break,
                events = watcher.tick() => events,
            };
            for event in events {
                self.route(event, &mut ports);
            }
        }

        let cancel_jobs = self.config.shutdown == ShutdownPolicy::Cancel;
        log::info!(
            "Shutting down ({:?}), waiting for {} port(s)",
            self.config.shutdown,
            ports.len()
        );
        let mut summary = RunSummary::default();
        let mut tasks = Vec::with_capacity(ports.len());
        for (port, handle) in ports {
            if handle.inbox.send(PortInput::Shutdown { cancel_jobs }).is_err() {
                log::debug!("Port {} already stopped", port);
            }
            tasks.push((port, handle.task));
        }
        for (port, task) in tasks {
            match task.await {
                Ok(report) => {
                    summary.completed += report.completed;
                    summary.failed += report.failed;
                }
                Err(e) => log::error!("Port {} task failed: {}", port, e),
            }
        }
        summary.ports = self.context.status.current();
        log::info!(
            "Stopped: {} completed, {} failed",
            summary.completed,
            summary.failed
        );
        summary
    }

    fn route(&self, event: TopologyEvent, ports: &mut BTreeMap<PortPath, PortHandle>) {
        let (port, input) = match event {
            TopologyEvent::Attached(port, device) => {
                log::info!("Port {}: attached {}", port, device);
                self.context.bus.publish(Event::Attached {
                    port: port.clone(),
                    device: device.clone(),
                });
                (port, PortInput::Attached(device))
            }
            TopologyEvent::Changed(port, device) => {
                log::debug!("Port {}: changed to {}", port, device);
                (port, PortInput::Changed(device))
            }
            TopologyEvent::Detached(port) => {
                log::info!("Port {}: detached", port);
                self.context.bus.publish(Event::Detached { port: port.clone() });
                if !ports.contains_key(&port) {
                    return;
                }
                (port, PortInput::Detached)
            }
            TopologyEvent::WatchError(message) => {
                self.context.bus.publish(Event::WatchError { message });
                return;
            }
        };

        let handle = ports
            .entry(port.clone())
            .or_insert_with(|| self.spawn_port(port.clone()));
        if handle.inbox.send(input).is_err() {
            log::warn!("Port {} task is gone, dropping input", port);
        }
    }

    fn spawn_port(&self, port: PortPath) -> PortHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = PortTask::new(port, rx, self.context.clone());
        PortHandle {
            inbox: tx,
            task: tokio::spawn(task.run()),
        }
    }
}
