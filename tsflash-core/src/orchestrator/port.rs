use super::StatusBoard;
use crate::cancel::CancelToken;
use crate::device::PortPath;
use crate::events::{Event, EventBus};
use crate::image::SourceImage;
use crate::machine::{Effect, FailReason, Phase, PortInput, PortMachine, Timings};
use crate::rpiboot::{BootError, BootHandoff};
use crate::write::{
    FlashEngine, FlashError, FlashJobHandle, FlashOptions, FlashReport, Progress, Stage,
};
use std::future::Future;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::time::Instant;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Everything a port task shares with the orchestrator and its siblings.
pub(crate) struct PortContext<B> {
    pub boot: Arc<B>,
    pub engine: Arc<FlashEngine>,
    pub image: Arc<SourceImage>,
    pub flash: FlashOptions,
    pub timings: Timings,
    pub slots: Arc<Semaphore>,
    pub bus: EventBus,
    pub status: StatusBoard,
}

#[derive(Debug, Default)]
pub(crate) struct PortReport {
    pub completed: usize,
    pub failed: usize,
}

/// Owns one port's machine and carries out its effects.
pub(crate) struct PortTask<B> {
    port: PortPath,
    machine: PortMachine,
    inbox: mpsc::UnboundedReceiver<PortInput>,
    ctx: Arc<PortContext<B>>,
    boot: Option<BoxFuture<Result<(), BootError>>>,
    slot: Option<BoxFuture<Result<OwnedSemaphorePermit, AcquireError>>>,
    permit: Option<OwnedSemaphorePermit>,
    submitting: Option<BoxFuture<Result<FlashJobHandle, FlashError>>>,
    job: Option<BoxFuture<Result<FlashReport, FlashError>>>,
    cancel: Option<CancelToken>,
    report: Option<FlashReport>,
    counts: PortReport,
}

async fn pending_or<T>(fut: &mut Option<BoxFuture<T>>) -> T {
    match fut {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl<B: BootHandoff> PortTask<B> {
    pub fn new(
        port: PortPath,
        inbox: mpsc::UnboundedReceiver<PortInput>,
        ctx: Arc<PortContext<B>>,
    ) -> Self {
        let machine = PortMachine::new(port.clone(), ctx.timings);
        Self {
            port,
            machine,
            inbox,
            ctx,
            boot: None,
            slot: None,
            permit: None,
            submitting: None,
            job: None,
            cancel: None,
            report: None,
            counts: PortReport::default(),
        }
    }

    fn is_quiet(&self) -> bool {
        self.boot.is_none()
            && self.submitting.is_none()
            && self.job.is_none()
            && !self.machine.in_flight()
    }

    pub async fn run(mut self) -> PortReport {
        let mut inbox_open = true;
        self.ctx.status.update(self.machine.snapshot());

        while !(self.machine.is_shutting_down() && self.is_quiet()) {
            let deadline = self.machine.deadline();
            tokio::select! {
                input = self.inbox.recv(), if inbox_open => match input {
                    Some(input) => self.apply(input),
                    None => {
                        inbox_open = false;
                        self.apply(PortInput::Shutdown { cancel_jobs: false });
                    }
                },
                _ = sleep_until(deadline) => self.apply(PortInput::TimerFired),
                result = pending_or(&mut self.boot) => {
                    self.boot = None;
                    let result = result.map_err(|e| {
                        log::error!("Port {}: boot handoff failed: {}", self.port, e);
                        FailReason::from(&e)
                    });
                    self.apply(PortInput::BootFinished(result));
                }
                permit = pending_or(&mut self.slot) => {
                    self.slot = None;
                    match permit {
                        Ok(permit) => {
                            self.permit = Some(permit);
                            self.apply(PortInput::SlotGranted);
                        }
                        Err(_) => log::error!("Port {}: worker pool closed", self.port),
                    }
                }
                submitted = pending_or(&mut self.submitting) => {
                    self.submitting = None;
                    match submitted {
                        Ok(handle) => {
                            self.machine.set_job(handle.job());
                            self.ctx.status.update(self.machine.snapshot());
                            self.job = Some(Box::pin(handle.wait()));
                        }
                        Err(e) => {
                            log::error!("Port {}: cannot start flash: {}", self.port, e);
                            self.cancel = None;
                            self.apply(PortInput::JobFinished(Err(FailReason::from(&e))));
                        }
                    }
                }
                result = pending_or(&mut self.job) => {
                    self.job = None;
                    self.cancel = None;
                    let result = match result {
                        Ok(report) => {
                            self.report = Some(report);
                            Ok(())
                        }
                        Err(e) => {
                            log::error!("Port {}: flash failed: {}", self.port, e);
                            Err(FailReason::from(&e))
                        }
                    };
                    self.apply(PortInput::JobFinished(result));
                }
            }
        }

        log::debug!("Port {} task stopped in phase {}", self.port, self.machine.phase());
        self.counts
    }

    /// Feeds one input through the machine and carries out its effects.
    fn apply(&mut self, input: PortInput) {
        for effect in self.machine.handle(input, Instant::now()) {
            self.perform(effect);
        }
        self.ctx.status.update(self.machine.snapshot());
    }

    fn perform(&mut self, effect: Effect) {
        match effect {
            Effect::PhaseChanged { from, to } => self.announce(from, to),
            Effect::StartBoot => {
                let boot = self.ctx.boot.clone();
                let port = self.port.clone();
                self.boot = Some(Box::pin(async move { boot.bootstrap(&port).await }));
            }
            Effect::RequestSlot => {
                self.slot = Some(Box::pin(self.ctx.slots.clone().acquire_owned()));
            }
            Effect::StartFlash { target } => self.start_flash(&target),
            Effect::CancelFlash => {
                if let Some(cancel) = &self.cancel {
                    log::warn!("Port {}: cancelling flash", self.port);
                    cancel.cancel();
                }
            }
            Effect::ReleaseSlot => {
                self.permit = None;
                self.slot = None;
            }
        }
    }

    fn announce(&mut self, from: Phase, to: Phase) {
        log::info!("Port {}: {} -> {}", self.port, from, to);
        self.ctx.bus.publish(Event::PhaseChanged {
            port: self.port.clone(),
            from,
            to: to.clone(),
        });
        match to {
            Phase::Completed => {
                self.counts.completed += 1;
                if let Some(report) = self.report.take() {
                    self.ctx.bus.publish(Event::Completed {
                        port: self.port.clone(),
                        report,
                    });
                }
            }
            Phase::Failed(reason) => {
                self.counts.failed += 1;
                log::error!("Port {}: {}", self.port, reason);
                self.ctx.bus.publish(Event::Failed {
                    port: self.port.clone(),
                    reason,
                });
            }
            _ => {}
        }
    }

    fn start_flash(&mut self, target: &Path) {
        let cancel = CancelToken::new();
        let bus = self.ctx.bus.clone();
        let status = self.ctx.status.clone();
        let port = self.port.clone();
        let on_progress = move |p: Progress| {
            if p.stage == Stage::Writing {
                status.record_progress(&port, p.bytes, p.total);
            }
            bus.publish(Event::Progress {
                port: port.clone(),
                stage: p.stage,
                bytes: p.bytes,
                total: p.total,
            });
        };

        // Submission unmounts, opens and sizes the target; keep it off the
        // runtime threads.
        let engine = self.ctx.engine.clone();
        let image = self.ctx.image.clone();
        let target = target.to_path_buf();
        let options = self.ctx.flash;
        let token = cancel.clone();
        let submit = tokio::task::spawn_blocking(move || {
            engine.submit(image, &target, options, token, on_progress)
        });
        self.cancel = Some(cancel);
        self.submitting = Some(Box::pin(async move {
            submit.await.unwrap_or_else(|e| {
                Err(FlashError::Io {
                    offset: 0,
                    source: io::Error::other(format!("flash submission aborted: {e}")),
                })
            })
        }));
    }
}
