//! The per-port lifecycle.
//!
//! [`PortMachine`] is a plain value: feed it a [`PortInput`] and the current
//! time and it returns the [`Effect`]s its driver must carry out. It does no
//! I/O and owns no tasks, so every transition is testable without a runtime.
//!
//! ```text
//! Idle -> Settling -> Classifying -+-> Dispatchable -> Flashing -> Completed -+
//!                                  |                                          |
//!                                  +-> BootHandoff -> AwaitingReenum          +-> Cooldown -> Idle
//!                                  |                   (-> Settling)          |
//!                                  +-> Idle                         Failed ---+
//! ```
use crate::classify::{Classification, Classifier};
use crate::device::{DeviceDescriptor, PortPath};
use crate::rpiboot::BootError;
use crate::write::{FlashError, FlashJob};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;

/// Why an attach cycle ended without a successful flash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum FailReason {
    Boot(String),
    ReenumTimeout,
    DeviceBusy,
    TargetTooSmall,
    Io(String),
    ShortWrite,
    VerificationMismatch,
    Cancelled,
    /// The device was unplugged while its flash job was running.
    DeviceLost,
    Unsupported(String),
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailReason::Boot(msg) => write!(f, "boot handoff failed: {msg}"),
            FailReason::ReenumTimeout => f.write_str("device did not re-enumerate as storage"),
            FailReason::DeviceBusy => f.write_str("device busy"),
            FailReason::TargetTooSmall => f.write_str("target too small for image"),
            FailReason::Io(msg) => write!(f, "I/O error: {msg}"),
            FailReason::ShortWrite => f.write_str("short write"),
            FailReason::VerificationMismatch => f.write_str("verification mismatch"),
            FailReason::Cancelled => f.write_str("cancelled"),
            FailReason::DeviceLost => f.write_str("device unplugged during flash"),
            FailReason::Unsupported(msg) => write!(f, "unsupported: {msg}"),
        }
    }
}

impl From<&FlashError> for FailReason {
    fn from(err: &FlashError) -> Self {
        match err {
            FlashError::DeviceBusy(_) => FailReason::DeviceBusy,
            FlashError::TargetTooSmall { .. } => FailReason::TargetTooSmall,
            FlashError::ShortWrite { .. } => FailReason::ShortWrite,
            FlashError::VerificationMismatch { .. } => FailReason::VerificationMismatch,
            FlashError::Cancelled { .. } => FailReason::Cancelled,
            FlashError::InvalidBlockSize(_) | FlashError::InvalidLength { .. } => {
                FailReason::Unsupported(err.to_string())
            }
            FlashError::Prepare(_) | FlashError::Open { .. } | FlashError::Io { .. } => {
                FailReason::Io(err.to_string())
            }
        }
    }
}

impl From<&BootError> for FailReason {
    fn from(err: &BootError) -> Self {
        match err {
            BootError::Unsupported => FailReason::Unsupported(err.to_string()),
            other => FailReason::Boot(other.to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", content = "reason", rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Settling,
    Classifying,
    BootHandoff,
    AwaitingReenum,
    Dispatchable,
    Flashing,
    Completed,
    Failed(FailReason),
    Cooldown,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Settling => "settling",
            Phase::Classifying => "classifying",
            Phase::BootHandoff => "boot handoff",
            Phase::AwaitingReenum => "awaiting re-enumeration",
            Phase::Dispatchable => "queued",
            Phase::Flashing => "flashing",
            Phase::Completed => "completed",
            Phase::Failed(_) => "failed",
            Phase::Cooldown => "cooldown",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed(_))
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Failed(reason) => write!(f, "failed ({reason})"),
            other => f.write_str(other.name()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PortInput {
    Attached(DeviceDescriptor),
    Changed(DeviceDescriptor),
    Detached,
    /// The machine's deadline has passed.
    TimerFired,
    BootFinished(Result<(), FailReason>),
    SlotGranted,
    JobFinished(Result<(), FailReason>),
    /// Stop accepting topology input; with `cancel_jobs` a running flash is
    /// cancelled, otherwise it is allowed to finish.
    Shutdown { cancel_jobs: bool },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Effect {
    PhaseChanged { from: Phase, to: Phase },
    StartBoot,
    RequestSlot,
    StartFlash { target: PathBuf },
    CancelFlash,
    /// Give back the worker slot, or stop waiting for one.
    ReleaseSlot,
}

/// Delays that drive the timed transitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timings {
    pub stable_delay: Duration,
    pub reenum_timeout: Duration,
    pub cooldown: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            stable_delay: Duration::from_secs(3),
            reenum_timeout: Duration::from_secs(30),
            cooldown: Duration::from_secs(1),
        }
    }
}

/// What observers see of a port.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PortSnapshot {
    pub port: PortPath,
    pub phase: Phase,
    pub device: Option<DeviceDescriptor>,
    pub target: Option<PathBuf>,
    pub attempts: u32,
    pub last_error: Option<FailReason>,
    pub bytes_written: u64,
    pub total_bytes: u64,
}

#[derive(Debug)]
pub struct PortMachine {
    port: PortPath,
    timings: Timings,
    classifier: Classifier,
    phase: Phase,
    deadline: Option<Instant>,
    device: Option<DeviceDescriptor>,
    /// Device seen while in cooldown, started once the cooldown ends.
    pending: Option<DeviceDescriptor>,
    /// A ready block device appeared before the boot handoff reported back.
    ready_during_boot: bool,
    /// The device went away while its flash job was still running.
    lost_while_flashing: bool,
    attached_at: Option<Instant>,
    attempts: u32,
    last_error: Option<FailReason>,
    target: Option<PathBuf>,
    job: Option<Weak<FlashJob>>,
    shutting_down: bool,
}

impl PortMachine {
    pub fn new(port: PortPath, timings: Timings) -> Self {
        Self::with_classifier(port, timings, Classifier::default())
    }

    pub fn with_classifier(port: PortPath, timings: Timings, classifier: Classifier) -> Self {
        Self {
            port,
            timings,
            classifier,
            phase: Phase::Idle,
            deadline: None,
            device: None,
            pending: None,
            ready_during_boot: false,
            lost_while_flashing: false,
            attached_at: None,
            attempts: 0,
            last_error: None,
            target: None,
            job: None,
            shutting_down: false,
        }
    }

    pub fn port(&self) -> &PortPath {
        &self.port
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn device(&self) -> Option<&DeviceDescriptor> {
        self.device.as_ref()
    }

    pub fn attached_at(&self) -> Option<Instant> {
        self.attached_at
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_error(&self) -> Option<&FailReason> {
        self.last_error.as_ref()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// A boot handoff or flash job is outstanding.
    pub fn in_flight(&self) -> bool {
        matches!(self.phase, Phase::BootHandoff | Phase::Flashing)
    }

    /// Records the job started for the last `StartFlash` effect.
    pub fn set_job(&mut self, job: &Arc<FlashJob>) {
        self.job = Some(Arc::downgrade(job));
    }

    pub fn snapshot(&self) -> PortSnapshot {
        let job = self.job.as_ref().and_then(Weak::upgrade);
        PortSnapshot {
            port: self.port.clone(),
            phase: self.phase.clone(),
            device: self.device.clone(),
            target: self.target.clone(),
            attempts: self.attempts,
            last_error: self.last_error.clone(),
            bytes_written: job.as_ref().map_or(0, |j| j.bytes_transferred()),
            total_bytes: job.as_ref().map_or(0, |j| j.total_bytes()),
        }
    }

    /// Applies one input. Pairs with no listed transition leave the phase
    /// as it is.
    pub fn handle(&mut self, input: PortInput, now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();
        match input {
            PortInput::Attached(device) | PortInput::Changed(device) => {
                if !self.shutting_down {
                    self.on_present(device, now, &mut effects);
                }
            }
            PortInput::Detached => {
                if !self.shutting_down {
                    self.on_detached(now, &mut effects);
                }
            }
            PortInput::TimerFired => self.on_timer(now, &mut effects),
            PortInput::BootFinished(result) => self.on_boot_finished(result, now, &mut effects),
            PortInput::SlotGranted => self.on_slot_granted(&mut effects),
            PortInput::JobFinished(result) => self.on_job_finished(result, now, &mut effects),
            PortInput::Shutdown { cancel_jobs } => self.on_shutdown(cancel_jobs, &mut effects),
        }
        effects
    }

    fn transition(&mut self, to: Phase, effects: &mut Vec<Effect>) {
        self.deadline = None;
        if self.phase != to {
            let from = std::mem::replace(&mut self.phase, to.clone());
            effects.push(Effect::PhaseChanged { from, to });
        }
    }

    fn settle(&mut self, device: DeviceDescriptor, now: Instant, effects: &mut Vec<Effect>) {
        self.device = Some(device);
        self.attached_at = Some(now);
        self.transition(Phase::Settling, effects);
        self.deadline = Some(now + self.timings.stable_delay);
    }

    fn is_ready(&self, device: &DeviceDescriptor) -> bool {
        matches!(
            self.classifier.classify(device),
            Classification::ReadyBlockDevice(_)
        )
    }

    fn on_present(&mut self, device: DeviceDescriptor, now: Instant, effects: &mut Vec<Effect>) {
        match self.phase {
            Phase::Idle => self.settle(device, now, effects),
            Phase::Settling | Phase::Dispatchable | Phase::Flashing => {
                self.device = Some(device);
            }
            Phase::BootHandoff => {
                self.ready_during_boot = self.is_ready(&device);
                self.device = Some(device);
            }
            Phase::AwaitingReenum => {
                if self.is_ready(&device) {
                    self.settle(device, now, effects);
                } else {
                    self.device = Some(device);
                }
            }
            Phase::Cooldown => self.pending = Some(device),
            Phase::Classifying | Phase::Completed | Phase::Failed(_) => {}
        }
    }

    fn on_detached(&mut self, now: Instant, effects: &mut Vec<Effect>) {
        match self.phase {
            Phase::Settling => {
                self.device = None;
                self.transition(Phase::Idle, effects);
            }
            Phase::BootHandoff => {
                // The boot ROM drops off the bus as part of a successful handoff.
                self.device = None;
                self.ready_during_boot = false;
            }
            Phase::AwaitingReenum => self.device = None,
            Phase::Dispatchable => {
                self.device = None;
                self.target = None;
                self.transition(Phase::Idle, effects);
                effects.push(Effect::ReleaseSlot);
            }
            Phase::Flashing => {
                self.device = None;
                if !self.lost_while_flashing {
                    self.lost_while_flashing = true;
                    effects.push(Effect::CancelFlash);
                }
            }
            Phase::Completed | Phase::Failed(_) => {
                self.device = None;
                self.enter_cooldown(now, effects);
            }
            Phase::Cooldown => self.pending = None,
            Phase::Idle | Phase::Classifying => {}
        }
    }

    fn enter_cooldown(&mut self, now: Instant, effects: &mut Vec<Effect>) {
        self.pending = None;
        self.transition(Phase::Cooldown, effects);
        if !self.shutting_down {
            self.deadline = Some(now + self.timings.cooldown);
        }
    }

    fn on_timer(&mut self, now: Instant, effects: &mut Vec<Effect>) {
        if !self.deadline.is_some_and(|d| d <= now) {
            return;
        }
        match self.phase {
            Phase::Settling => self.classify(effects),
            Phase::AwaitingReenum => self.fail(FailReason::ReenumTimeout, now, effects),
            Phase::Cooldown => match self.pending.take() {
                Some(device) => self.settle(device, now, effects),
                None => self.transition(Phase::Idle, effects),
            },
            _ => self.deadline = None,
        }
    }

    fn classify(&mut self, effects: &mut Vec<Effect>) {
        self.transition(Phase::Classifying, effects);
        let classification = match &self.device {
            Some(device) => self.classifier.classify(device),
            None => Classification::Ignore,
        };
        match classification {
            Classification::Ignore => {
                self.transition(Phase::Idle, effects);
            }
            Classification::ReadyBlockDevice(target) => {
                self.target = Some(target);
                self.transition(Phase::Dispatchable, effects);
                effects.push(Effect::RequestSlot);
            }
            Classification::BootModeCapable => {
                self.ready_during_boot = false;
                self.transition(Phase::BootHandoff, effects);
                effects.push(Effect::StartBoot);
            }
        }
    }

    fn on_boot_finished(
        &mut self,
        result: Result<(), FailReason>,
        now: Instant,
        effects: &mut Vec<Effect>,
    ) {
        if self.phase != Phase::BootHandoff {
            return;
        }
        match result {
            Ok(()) if self.shutting_down => self.transition(Phase::Idle, effects),
            Ok(()) => {
                let ready = self.device.clone().filter(|d| self.ready_during_boot && self.is_ready(d));
                match ready {
                    Some(device) => self.settle(device, now, effects),
                    None => {
                        self.transition(Phase::AwaitingReenum, effects);
                        self.deadline = Some(now + self.timings.reenum_timeout);
                    }
                }
            }
            Err(reason) => self.fail(reason, now, effects),
        }
        self.ready_during_boot = false;
    }

    fn on_slot_granted(&mut self, effects: &mut Vec<Effect>) {
        if self.phase != Phase::Dispatchable || self.shutting_down {
            effects.push(Effect::ReleaseSlot);
            return;
        }
        let Some(target) = self.target.clone() else {
            effects.push(Effect::ReleaseSlot);
            self.transition(Phase::Idle, effects);
            return;
        };
        self.attempts += 1;
        self.lost_while_flashing = false;
        self.transition(Phase::Flashing, effects);
        effects.push(Effect::StartFlash { target });
    }

    fn on_job_finished(
        &mut self,
        result: Result<(), FailReason>,
        now: Instant,
        effects: &mut Vec<Effect>,
    ) {
        if self.phase != Phase::Flashing {
            return;
        }
        effects.push(Effect::ReleaseSlot);
        let lost = std::mem::take(&mut self.lost_while_flashing);
        match result {
            Ok(()) => {
                self.last_error = None;
                self.transition(Phase::Completed, effects);
                if lost {
                    // Finished before the unplug took effect.
                    self.enter_cooldown(now, effects);
                }
            }
            Err(_) if lost => self.fail(FailReason::DeviceLost, now, effects),
            Err(reason) => self.fail(reason, now, effects),
        }
    }

    /// Enters `Failed`; a port whose device is already gone moves straight
    /// on to cooldown.
    fn fail(&mut self, reason: FailReason, now: Instant, effects: &mut Vec<Effect>) {
        self.last_error = Some(reason.clone());
        self.transition(Phase::Failed(reason), effects);
        if self.device.is_none() {
            self.enter_cooldown(now, effects);
        }
    }

    fn on_shutdown(&mut self, cancel_jobs: bool, effects: &mut Vec<Effect>) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        match self.phase {
            Phase::Flashing => {
                if cancel_jobs {
                    effects.push(Effect::CancelFlash);
                }
            }
            Phase::Dispatchable => {
                self.transition(Phase::Idle, effects);
                effects.push(Effect::ReleaseSlot);
            }
            Phase::Settling | Phase::AwaitingReenum | Phase::Cooldown => {
                self.transition(Phase::Idle, effects);
            }
            _ => self.deadline = None,
        }
    }
}
