//! The orchestrator's event stream.
//!
//! Events fan out through a bounded `tokio::broadcast` channel. Publishing
//! never blocks; an observer that falls behind loses the oldest events and
//! carries on from the newest ones.
use crate::device::{DeviceDescriptor, PortPath};
use crate::machine::{FailReason, Phase};
use crate::write::{FlashReport, Stage};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

/// Sequential identifier assigned on publish.
pub type EventId = u64;

pub const DEFAULT_CAPACITY: usize = 1_024;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Attached {
        port: PortPath,
        device: DeviceDescriptor,
    },
    Detached {
        port: PortPath,
    },
    PhaseChanged {
        port: PortPath,
        from: Phase,
        to: Phase,
    },
    Progress {
        port: PortPath,
        stage: Stage,
        bytes: u64,
        total: u64,
    },
    Completed {
        port: PortPath,
        report: FlashReport,
    },
    Failed {
        port: PortPath,
        reason: FailReason,
    },
    WatchError {
        message: String,
    },
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Attached { .. } => "attached",
            Event::Detached { .. } => "detached",
            Event::PhaseChanged { .. } => "phase_changed",
            Event::Progress { .. } => "progress",
            Event::Completed { .. } => "completed",
            Event::Failed { .. } => "failed",
            Event::WatchError { .. } => "watch_error",
        }
    }

    /// The port the event is about; `None` for bus-wide events.
    pub fn port(&self) -> Option<&PortPath> {
        match self {
            Event::Attached { port, .. }
            | Event::Detached { port }
            | Event::PhaseChanged { port, .. }
            | Event::Progress { port, .. }
            | Event::Completed { port, .. }
            | Event::Failed { port, .. } => Some(port),
            Event::WatchError { .. } => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EventEnvelope {
    pub id: EventId,
    #[serde(flatten)]
    pub event: Event,
}

#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "event bus capacity must be positive");
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Publishes to every current subscriber. Having none is not an error.
    pub fn publish(&self, event: Event) -> EventId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.sender.send(EventEnvelope { id, event });
        id
    }

    pub fn subscribe(&self) -> EventStream {
        EventStream {
            receiver: self.sender.subscribe(),
            missed: 0,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// One observer's view of the bus.
#[derive(Debug)]
pub struct EventStream {
    receiver: broadcast::Receiver<EventEnvelope>,
    missed: u64,
}

impl EventStream {
    /// Next event, skipping over anything lost to lag. `None` once the bus
    /// is gone.
    pub async fn next(&mut self) -> Option<EventEnvelope> {
        loop {
            match self.receiver.recv().await {
                Ok(envelope) => return Some(envelope),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::debug!("Event observer lagged, {} events dropped", n);
                    self.missed += n;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Events dropped so far because this observer was too slow.
    pub fn missed(&self) -> u64 {
        self.missed
    }
}
