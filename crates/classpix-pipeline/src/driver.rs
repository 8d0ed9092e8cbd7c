//! Recognition driver: serial loop or worker pool.
//!
//! Work items flow C1 → C2 → C7 (decode, detect+embed, match). In
//! parallel mode a fixed-size rayon pool processes chunks and streams
//! results back over a channel in arrival order; the read-only inputs
//! (reference arrays, parameters, backend) are shared into the pool once
//! via `Arc`, never per item. Pool construction failure silently
//! downgrades the batch to serial and flags the run.

use classpix_core::{
    matcher, ErrorKind, FaceBackend, MatchError, RecognitionResult, ReferenceSet,
};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

use crate::config::{ForceToggles, ParallelSettings};

/// Cooperative cancellation: set once, observed between work items.
pub type CancelFlag = Arc<AtomicBool>;

/// One photo to recognize, identified the same way the cache keys it.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub date: String,
    pub rel_path: String,
    pub abs_path: PathBuf,
    pub size: u64,
    pub mtime: i64,
}

/// Read-only matcher inputs for a batch.
#[derive(Debug, Clone, Copy)]
pub struct BatchParams {
    pub tolerance: f32,
    pub min_face_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Serial,
    Parallel,
}

/// Pick the execution mode for a batch.
///
/// Force-serial wins over everything; force-parallel and the automatic
/// threshold both still require at least two workers and, for the
/// automatic path, the config master switch.
pub fn decide_mode(
    toggles: ForceToggles,
    settings: &ParallelSettings,
    workers: usize,
    work_count: usize,
) -> Mode {
    if toggles.force_serial {
        return Mode::Serial;
    }
    if toggles.force_parallel && workers >= 2 {
        return Mode::Parallel;
    }
    let min_photos = toggles.min_photos_override.unwrap_or(settings.min_photos);
    if settings.enabled && workers >= 2 && work_count >= min_photos {
        return Mode::Parallel;
    }
    Mode::Serial
}

/// Worker count: configured upper bound clamped to the machine.
pub fn effective_workers(settings: &ParallelSettings) -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    settings.workers.clamp(1, cpus)
}

struct WorkerContext {
    backend: Arc<dyn FaceBackend>,
    refs: Arc<ReferenceSet>,
    params: BatchParams,
    cancel: CancelFlag,
}

/// Recognize one photo: decode, detect+embed, match.
///
/// Per-photo failures come back as `RecognitionResult` with an error
/// kind; only a dimensionality violation escapes as `Err`.
fn recognize_one(
    item: &WorkItem,
    ctx: &WorkerContext,
) -> Result<RecognitionResult, MatchError> {
    let pixels = match classpix_core::imageio::load(&item.abs_path) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(photo = %item.rel_path, error = %e, "unreadable photo");
            return Ok(RecognitionResult::error(ErrorKind::UnreadableImage));
        }
    };

    let faces = match ctx
        .backend
        .detect_and_encode(&pixels, ctx.params.min_face_size)
    {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(photo = %item.rel_path, error = %e, "face backend failed");
            return Ok(RecognitionResult::error(ErrorKind::Backend));
        }
    };

    matcher::match_faces(&faces, &ctx.refs, ctx.params.tolerance)
}

/// `recognize_one` with panic isolation: a panicking worker yields an
/// error result instead of tearing down the pool.
fn recognize_guarded(
    item: &WorkItem,
    ctx: &WorkerContext,
) -> Result<RecognitionResult, MatchError> {
    match catch_unwind(AssertUnwindSafe(|| recognize_one(item, ctx))) {
        Ok(result) => result,
        Err(_) => {
            tracing::error!(photo = %item.rel_path, "worker panicked on photo");
            Ok(RecognitionResult::error(ErrorKind::Worker))
        }
    }
}

/// Stream of `(item, result)` pairs; order is unspecified in parallel
/// mode. Every dispatched item yields exactly one pair; after a cancel
/// is observed, no further items are dispatched.
pub struct RecognitionStream {
    inner: StreamInner,
    fell_back_to_serial: bool,
}

enum StreamInner {
    Serial {
        items: std::vec::IntoIter<WorkItem>,
        ctx: WorkerContext,
    },
    Parallel {
        rx: mpsc::IntoIter<(WorkItem, Result<RecognitionResult, MatchError>)>,
        // Keeps the workers alive until the stream is drained or dropped.
        _pool: rayon::ThreadPool,
    },
}

impl RecognitionStream {
    /// True if a parallel batch had to downgrade to serial.
    pub fn fell_back_to_serial(&self) -> bool {
        self.fell_back_to_serial
    }
}

impl Iterator for RecognitionStream {
    type Item = (WorkItem, Result<RecognitionResult, MatchError>);

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            StreamInner::Serial { items, ctx } => {
                if ctx.cancel.load(Ordering::SeqCst) {
                    return None;
                }
                let item = items.next()?;
                let result = recognize_guarded(&item, ctx);
                Some((item, result))
            }
            StreamInner::Parallel { rx, .. } => rx.next(),
        }
    }
}

/// Dispatch a batch of work items.
///
/// The caller decides nothing: the mode comes from the toggles, the
/// config, and the batch size. Results must be drained; dropping the
/// stream early discards undelivered results but lets in-flight items
/// finish.
pub fn recognize_batch(
    work_items: Vec<WorkItem>,
    backend: Arc<dyn FaceBackend>,
    refs: Arc<ReferenceSet>,
    params: BatchParams,
    settings: &ParallelSettings,
    toggles: ForceToggles,
    cancel: CancelFlag,
) -> RecognitionStream {
    let workers = effective_workers(settings);
    let mode = decide_mode(toggles, settings, workers, work_items.len());

    let ctx = WorkerContext {
        backend,
        refs,
        params,
        cancel,
    };

    match mode {
        Mode::Serial => {
            tracing::debug!(photos = work_items.len(), "recognizing serially");
            RecognitionStream {
                inner: StreamInner::Serial {
                    items: work_items.into_iter(),
                    ctx,
                },
                fell_back_to_serial: false,
            }
        }
        Mode::Parallel => match rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("classpix-worker-{i}"))
            .build()
        {
            Ok(pool) => {
                tracing::info!(
                    photos = work_items.len(),
                    workers,
                    chunk_size = settings.chunk_size,
                    "recognizing in parallel"
                );
                let rx = dispatch_parallel(work_items, ctx, settings.chunk_size, &pool);
                RecognitionStream {
                    inner: StreamInner::Parallel {
                        rx: rx.into_iter(),
                        _pool: pool,
                    },
                    fell_back_to_serial: false,
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "worker pool construction failed, falling back to serial");
                RecognitionStream {
                    inner: StreamInner::Serial {
                        items: work_items.into_iter(),
                        ctx,
                    },
                    fell_back_to_serial: true,
                }
            }
        },
    }
}

fn dispatch_parallel(
    work_items: Vec<WorkItem>,
    ctx: WorkerContext,
    chunk_size: usize,
    pool: &rayon::ThreadPool,
) -> mpsc::Receiver<(WorkItem, Result<RecognitionResult, MatchError>)> {
    let (tx, rx) = mpsc::channel();
    let ctx = Arc::new(ctx);

    let mut items = work_items;
    let chunk_size = chunk_size.max(1);
    while !items.is_empty() {
        let rest = items.split_off(items.len().min(chunk_size));
        let chunk = std::mem::replace(&mut items, rest);
        let tx = tx.clone();
        let ctx = Arc::clone(&ctx);
        pool.spawn(move || {
            for item in chunk {
                if ctx.cancel.load(Ordering::SeqCst) {
                    break;
                }
                let result = recognize_guarded(&item, &ctx);
                // Receiver gone means the consumer stopped early; just drop.
                if tx.send((item, result)).is_err() {
                    break;
                }
            }
        });
    }

    rx
}
