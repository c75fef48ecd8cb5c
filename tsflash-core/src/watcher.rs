//! Polls a [`TopologySource`] and turns consecutive snapshots into events.
use crate::cancel::CancelToken;
use crate::device::PortPath;
use crate::topology::{
    RootSelector, Topology, TopologyError, TopologyEvent, TopologySource, diff,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A lazy sequence of topology changes below one root.
pub struct Watcher<S> {
    source: Arc<S>,
    selector: RootSelector,
    root: Option<PortPath>,
    interval: Interval,
    previous: Topology,
    warned_no_hub: bool,
}

/// Starts watching. The first tick fires immediately and reports every
/// device already plugged in as attached.
pub fn watch<S: TopologySource>(
    source: Arc<S>,
    selector: RootSelector,
    poll_interval: Duration,
) -> Watcher<S> {
    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let root = match &selector {
        RootSelector::Port(port) => Some(port.clone()),
        _ => None,
    };
    Watcher {
        source,
        selector,
        root,
        interval,
        previous: Topology::new(),
        warned_no_hub: false,
    }
}

impl<S: TopologySource> Watcher<S> {
    /// The port whose subtree is being watched, once known.
    pub fn root(&self) -> Option<&PortPath> {
        self.root.as_ref()
    }

    /// Last successfully enumerated (and scoped) snapshot.
    pub fn current(&self) -> &Topology {
        &self.previous
    }

    /// Waits for the next poll, then returns what changed since the last one.
    /// Enumeration reads sysfs, so it runs on the blocking pool.
    pub async fn tick(&mut self) -> Vec<TopologyEvent> {
        self.interval.tick().await;
        let source = self.source.clone();
        let snapshot = tokio::task::spawn_blocking(move || source.snapshot())
            .await
            .unwrap_or_else(|e| Err(TopologyError::Worker(e.to_string())));
        self.update(snapshot)
    }

    /// On failure the previous snapshot is kept, so nothing is reported as
    /// detached just because one enumeration went wrong.
    fn update(&mut self, snapshot: Result<Topology, TopologyError>) -> Vec<TopologyEvent> {
        match snapshot {
            Ok(full) => {
                let next = self.scope(full);
                let events = diff(&self.previous, &next);
                self.previous = next;
                events
            }
            Err(e) => {
                log::warn!("USB enumeration failed: {}", e);
                vec![TopologyEvent::WatchError(e.to_string())]
            }
        }
    }

    /// Limits a snapshot to the watched ports. With [`RootSelector::FirstHub`]
    /// and no hub on the bus nothing is watched; root ports are never
    /// flash targets.
    fn scope(&mut self, full: Topology) -> Topology {
        if self.root.is_none() && self.selector == RootSelector::FirstHub {
            self.root = full.first_hub().cloned();
            match &self.root {
                Some(root) => log::info!("Monitoring hub at port {}", root),
                None if !self.warned_no_hub => {
                    log::warn!("No USB hub found; waiting for one to be plugged in");
                    self.warned_no_hub = true;
                }
                None => {}
            }
        }
        match (&self.root, &self.selector) {
            (Some(root), _) => full.downstream(root),
            (None, RootSelector::All) => full,
            (None, _) => Topology::new(),
        }
    }

    /// Runs the watch loop on its own task until `shutdown` is cancelled or
    /// the receiver goes away.
    pub fn spawn(mut self, tx: mpsc::Sender<TopologyEvent>, shutdown: CancelToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let events = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    events = self.tick() => events,
                };
                for event in events {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
            log::debug!("Topology watcher stopped");
        })
    }
}
