//! The flash engine: chunked, cancellable, verified image writes.
//!
//! A write happens in two stages:
//! 1.  Copying the mapped source image to the target device chunk by chunk,
//!     publishing progress after every chunk.
//! 2.  Optionally reading the target back and comparing it with the image.
//!
//! [`FlashEngine::submit`] validates and opens the target synchronously, so
//! `DeviceBusy` and `TargetTooSmall` come back before anything is written,
//! and then runs the copy on its own worker thread. Any number of jobs may
//! share one [`SourceImage`]; at most one job may write a given target.
use crate::cancel::CancelToken;
use crate::image::SourceImage;
use crate::target::{self, PrepareError, Target};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Default chunk size: 4 MiB.
pub const DEFAULT_BLOCK_SIZE: usize = 4 * 1024 * 1024;

const SECTOR_SIZE: usize = 512;
// O_DIRECT buffers are aligned to the largest logical block size in use.
const BUFFER_ALIGN: usize = 4096;

pub type JobId = u64;

#[derive(Debug, thiserror::Error)]
pub enum FlashError {
    #[error("{0} is already being flashed")]
    DeviceBusy(PathBuf),
    #[error("{target} is too small: {capacity} bytes, image needs {required}")]
    TargetTooSmall {
        target: PathBuf,
        capacity: u64,
        required: u64,
    },
    #[error("block size {0} is not a positive multiple of 512")]
    InvalidBlockSize(usize),
    #[error("requested length {requested} exceeds the image size {image}")]
    InvalidLength { requested: u64, image: u64 },
    #[error(transparent)]
    Prepare(#[from] PrepareError),
    #[error("cannot open {target}: {source}")]
    Open {
        target: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("short write at offset {offset}: {written} of {expected} bytes")]
    ShortWrite {
        offset: u64,
        expected: usize,
        written: usize,
    },
    #[error("I/O error at offset {offset}: {source}")]
    Io {
        offset: u64,
        #[source]
        source: io::Error,
    },
    #[error("verification failed: device differs from image at offset {offset}")]
    VerificationMismatch { offset: u64 },
    #[error("cancelled after {written} bytes")]
    Cancelled { written: u64 },
}

impl FlashError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FlashError::Cancelled { .. })
    }
}

/// Tunables for one job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlashOptions {
    /// Chunk size; a positive multiple of 512.
    pub block_size: usize,
    /// Read the device back and compare after writing.
    pub verify: bool,
    /// Write only this many bytes of the image instead of all of it.
    pub length: Option<u64>,
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            verify: true,
            length: None,
        }
    }
}

impl FlashOptions {
    pub fn validate(&self) -> Result<(), FlashError> {
        if self.block_size == 0 || self.block_size % SECTOR_SIZE != 0 {
            return Err(FlashError::InvalidBlockSize(self.block_size));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Writing,
    Verifying,
}

/// One progress report, sent after every completed chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Progress {
    pub stage: Stage,
    pub bytes: u64,
    pub total: u64,
}

/// Summary of a successful job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FlashReport {
    pub target: PathBuf,
    pub bytes_written: u64,
    pub elapsed: Duration,
    /// SHA-256 of the written region, present when verification ran.
    pub sha256: Option<String>,
}

/// Terminal state of a job as seen by observers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "error", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed,
    Failed(String),
    Cancelled,
}

/// Shared state of one copy operation.
///
/// The worker is the only writer of the counters; anyone holding the job can
/// read them without locking.
#[derive(Debug)]
pub struct FlashJob {
    id: JobId,
    image: Arc<SourceImage>,
    target: PathBuf,
    total_bytes: u64,
    transferred: AtomicU64,
    verified: AtomicU64,
    started: Instant,
    outcome: OnceLock<JobOutcome>,
}

impl FlashJob {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn image(&self) -> &Arc<SourceImage> {
        &self.image
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Bytes written to the device so far. Never decreases.
    pub fn bytes_transferred(&self) -> u64 {
        self.transferred.load(Ordering::Acquire)
    }

    /// Bytes read back and compared so far.
    pub fn bytes_verified(&self) -> u64 {
        self.verified.load(Ordering::Acquire)
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn outcome(&self) -> Option<&JobOutcome> {
        self.outcome.get()
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.get().is_some()
    }
}

/// The submitter's end of a job: progress, cancellation and the result.
#[derive(Debug)]
pub struct FlashJobHandle {
    job: Arc<FlashJob>,
    cancel: CancelToken,
    done: oneshot::Receiver<Result<FlashReport, FlashError>>,
}

impl FlashJobHandle {
    pub fn job(&self) -> &Arc<FlashJob> {
        &self.job
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.job.bytes_transferred()
    }

    /// Requests cooperative cancellation; takes effect at the next chunk.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Waits for the job to reach its terminal state.
    pub async fn wait(self) -> Result<FlashReport, FlashError> {
        self.done.await.unwrap_or_else(|_| Err(worker_gone()))
    }

    /// Blocking variant of [`wait`](Self::wait) for callers outside a runtime.
    pub fn wait_blocking(self) -> Result<FlashReport, FlashError> {
        self.done.blocking_recv().unwrap_or_else(|_| Err(worker_gone()))
    }
}

fn worker_gone() -> FlashError {
    FlashError::Io {
        offset: 0,
        source: io::Error::other("flash worker exited without a result"),
    }
}

type ActiveMap = Arc<Mutex<HashMap<PathBuf, Weak<FlashJob>>>>;

/// Keeps a target marked busy until dropped.
struct Reservation {
    key: PathBuf,
    active: ActiveMap,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.key);
        }
    }
}

/// Runs flash jobs, at most one per target.
#[derive(Debug, Default)]
pub struct FlashEngine {
    active: ActiveMap,
    next_id: AtomicU64,
}

impl FlashEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs that are currently running.
    pub fn active_jobs(&self) -> Vec<Arc<FlashJob>> {
        match self.active.lock() {
            Ok(active) => active.values().filter_map(Weak::upgrade).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Whether a job currently holds `target`.
    pub fn is_busy(&self, target: &Path) -> bool {
        let key = target.canonicalize().unwrap_or_else(|_| target.to_path_buf());
        self.active
            .lock()
            .map(|active| active.contains_key(&key))
            .unwrap_or(false)
    }

    fn reserve(&self, key: PathBuf) -> Result<Reservation, FlashError> {
        let mut active = self
            .active
            .lock()
            .map_err(|_| FlashError::DeviceBusy(key.clone()))?;
        if active.contains_key(&key) {
            return Err(FlashError::DeviceBusy(key));
        }
        active.insert(key.clone(), Weak::new());
        Ok(Reservation {
            key,
            active: self.active.clone(),
        })
    }

    /// Starts writing `image` to `target` and returns immediately.
    ///
    /// The target is prepared (unmounted, system disk refused), opened and
    /// sized before this returns. The copy itself runs on a dedicated worker
    /// thread and reports through `on_progress` after every chunk.
    ///
    /// # Errors
    ///
    /// - `DeviceBusy` if another job holds the target (or the kernel refuses
    ///   the exclusive open).
    /// - `TargetTooSmall` if the target cannot hold the image; nothing is
    ///   written in that case.
    /// - `InvalidBlockSize` / `InvalidLength` for bad options.
    pub fn submit<F>(
        &self,
        image: Arc<SourceImage>,
        target: &Path,
        options: FlashOptions,
        cancel: CancelToken,
        on_progress: F,
    ) -> Result<FlashJobHandle, FlashError>
    where
        F: FnMut(Progress) + Send + 'static,
    {
        options.validate()?;
        let length = match options.length {
            Some(requested) if requested > image.len() => {
                return Err(FlashError::InvalidLength {
                    requested,
                    image: image.len(),
                });
            }
            Some(requested) => requested,
            None => image.len(),
        };

        let key = target
            .canonicalize()
            .map_err(|source| FlashError::Open {
                target: target.to_path_buf(),
                source,
            })?;
        let reservation = self.reserve(key)?;

        target::prepare(target)?;
        let device = Target::open(target).map_err(|source| {
            if source.raw_os_error() == Some(libc::EBUSY) {
                FlashError::DeviceBusy(target.to_path_buf())
            } else {
                FlashError::Open {
                    target: target.to_path_buf(),
                    source,
                }
            }
        })?;

        if device.capacity < length {
            return Err(FlashError::TargetTooSmall {
                target: target.to_path_buf(),
                capacity: device.capacity,
                required: length,
            });
        }

        let job = Arc::new(FlashJob {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            image,
            target: target.to_path_buf(),
            total_bytes: length,
            transferred: AtomicU64::new(0),
            verified: AtomicU64::new(0),
            started: Instant::now(),
            outcome: OnceLock::new(),
        });
        if let Ok(mut active) = self.active.lock() {
            active.insert(reservation.key.clone(), Arc::downgrade(&job));
        }

        log::info!(
            "Flashing {} to {} ({} bytes, {} byte chunks, verify={})",
            job.image.path().display(),
            target.display(),
            length,
            options.block_size,
            options.verify
        );

        let (tx, rx) = oneshot::channel();
        let worker_job = job.clone();
        let worker_cancel = cancel.clone();
        let name = format!(
            "flash-{}",
            target
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default()
        );
        let spawned = std::thread::Builder::new().name(name).spawn(move || {
            let result = run_job(&worker_job, device, options, &worker_cancel, on_progress);
            let outcome = match &result {
                Ok(_) => JobOutcome::Completed,
                Err(e) if e.is_cancelled() => JobOutcome::Cancelled,
                Err(e) => JobOutcome::Failed(e.to_string()),
            };
            let _ = worker_job.outcome.set(outcome);
            drop(reservation);
            let _ = tx.send(result);
        });
        if let Err(source) = spawned {
            return Err(FlashError::Io { offset: 0, source });
        }

        Ok(FlashJobHandle {
            job,
            cancel,
            done: rx,
        })
    }
}

fn run_job<F>(
    job: &FlashJob,
    mut device: Target,
    options: FlashOptions,
    cancel: &CancelToken,
    mut on_progress: F,
) -> Result<FlashReport, FlashError>
where
    F: FnMut(Progress),
{
    copy_image(job, &mut device, options.block_size, cancel, &mut on_progress)?;
    drop(device);

    let sha256 = if options.verify {
        log::info!("Verifying {}", job.target.display());
        Some(verify_target(job, options.block_size, cancel, &mut on_progress)?)
    } else {
        None
    };

    let report = FlashReport {
        target: job.target.clone(),
        bytes_written: job.bytes_transferred(),
        elapsed: job.started.elapsed(),
        sha256,
    };
    log::info!(
        "Successfully flashed {} bytes to {} in {:.1}s",
        report.bytes_written,
        report.target.display(),
        report.elapsed.as_secs_f64()
    );
    Ok(report)
}

/// A heap buffer whose usable window starts on a `BUFFER_ALIGN` boundary.
struct AlignedBuffer {
    buf: Vec<u8>,
    offset: usize,
    len: usize,
}

impl AlignedBuffer {
    fn new(len: usize) -> Self {
        let buf = vec![0u8; len + BUFFER_ALIGN];
        let offset = buf.as_ptr().align_offset(BUFFER_ALIGN);
        Self { buf, offset, len }
    }

    fn load(&mut self, data: &[u8]) -> &[u8] {
        let window = &mut self.buf[self.offset..self.offset + self.len];
        window[..data.len()].copy_from_slice(data);
        &window[..data.len()]
    }
}

fn copy_image<F>(
    job: &FlashJob,
    device: &mut Target,
    block_size: usize,
    cancel: &CancelToken,
    on_progress: &mut F,
) -> Result<(), FlashError>
where
    F: FnMut(Progress),
{
    let total = job.total_bytes;
    let mut buffer = AlignedBuffer::new(block_size);
    let mut written: u64 = 0;

    while written < total {
        if cancel.is_cancelled() {
            log::warn!("Flash of {} cancelled at {} bytes", job.target.display(), written);
            return Err(FlashError::Cancelled { written });
        }

        let to_write = std::cmp::min(block_size as u64, total - written) as usize;
        let chunk = job.image.chunk(written, to_write);

        // The final chunk may not be sector aligned; rather than padding past
        // the end of the image, finish it through the page cache.
        if device.direct && to_write % SECTOR_SIZE != 0 {
            device
                .disable_direct()
                .map_err(|source| FlashError::Io { offset: written, source })?;
        }
        let data = if device.direct { buffer.load(chunk) } else { chunk };

        write_chunk(&device.file, data, written)?;
        written += to_write as u64;
        job.transferred.store(written, Ordering::Release);
        on_progress(Progress {
            stage: Stage::Writing,
            bytes: written,
            total,
        });
        log::debug!("{}: {}/{} bytes", job.target.display(), written, total);
    }

    device
        .file
        .sync_all()
        .map_err(|source| FlashError::Io { offset: written, source })
}

/// Issues one positional write for the whole chunk.
fn write_chunk(file: &File, data: &[u8], offset: u64) -> Result<(), FlashError> {
    loop {
        match file.write_at(data, offset) {
            Ok(n) if n == data.len() => return Ok(()),
            Ok(n) => {
                return Err(FlashError::ShortWrite {
                    offset,
                    expected: data.len(),
                    written: n,
                });
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(source) => return Err(FlashError::Io { offset, source }),
        }
    }
}

/// Reads the target back and compares it with the image, chunk by chunk.
/// Returns the SHA-256 of the image region on success.
fn verify_target<F>(
    job: &FlashJob,
    block_size: usize,
    cancel: &CancelToken,
    on_progress: &mut F,
) -> Result<String, FlashError>
where
    F: FnMut(Progress),
{
    let total = job.total_bytes;
    let device = File::open(&job.target).map_err(|source| FlashError::Open {
        target: job.target.clone(),
        source,
    })?;
    target::drop_cache(&device);

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; block_size];
    let mut verified: u64 = 0;

    while verified < total {
        if cancel.is_cancelled() {
            return Err(FlashError::Cancelled {
                written: job.bytes_transferred(),
            });
        }

        let chunk = std::cmp::min(block_size as u64, total - verified) as usize;
        device
            .read_exact_at(&mut buf[..chunk], verified)
            .map_err(|source| FlashError::Io {
                offset: verified,
                source,
            })?;

        let expected = job.image.chunk(verified, chunk);
        if let Some(i) = buf[..chunk].iter().zip(expected).position(|(a, b)| a != b) {
            log::error!(
                "Verification of {} failed at offset {}",
                job.target.display(),
                verified + i as u64
            );
            return Err(FlashError::VerificationMismatch {
                offset: verified + i as u64,
            });
        }
        hasher.update(expected);

        verified += chunk as u64;
        job.verified.store(verified, Ordering::Release);
        on_progress(Progress {
            stage: Stage::Verifying,
            bytes: verified,
            total,
        });
    }

    Ok(format!("{:x}", hasher.finalize()))
}
