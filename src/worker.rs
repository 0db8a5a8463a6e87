//! Batch workers: build a partial label map, then apply it to chunks.

use crate::chunk_lock::{self, LockOutcome};
use crate::config::{JoinOptions, LockPolicy, SourceScan};
use crate::join::relabel_in_place;
use crate::label_map::build_label_map;
use crate::LabelError;
use crossbeam_channel::{Receiver, Sender};
use rand::seq::SliceRandom;
use std::path::{Path, PathBuf};
use std::thread;

/// Progress of one chunk within one batch task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Pending,
    /// The last attempt timed out waiting for another worker's lock.
    LockedByOther,
    Labeled,
}

/// Per-task chunk states, indexed like [`BatchTask::chunks`].
#[derive(Debug, Clone)]
pub struct ChunkTracker {
    states: Vec<ChunkState>,
}

impl ChunkTracker {
    pub fn new(chunks: usize) -> Self {
        Self {
            states: vec![ChunkState::Pending; chunks],
        }
    }

    pub fn mark_locked_by_other(&mut self, slot: usize) {
        if self.states[slot] != ChunkState::Labeled {
            self.states[slot] = ChunkState::LockedByOther;
        }
    }

    pub fn mark_labeled(&mut self, slot: usize) {
        self.states[slot] = ChunkState::Labeled;
    }

    /// Slots not yet labeled, in index order.
    pub fn unfinished(&self) -> Vec<usize> {
        self.states
            .iter()
            .enumerate()
            .filter(|(_, s)| **s != ChunkState::Labeled)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn is_done(&self) -> bool {
        self.states.iter().all(|s| *s == ChunkState::Labeled)
    }
}

/// Read-only state a worker needs; one per thread.
#[derive(Debug, Clone, Copy)]
pub struct WorkerContext<'a> {
    pub worker_id: usize,
    pub scan: &'a SourceScan,
    pub join: &'a JoinOptions,
    pub lock: &'a LockPolicy,
    /// Every chunk (or clone) of the run, indexed by chunk number.
    pub chunks: &'a [PathBuf],
}

/// One batch of source files and the chunks it still has to label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchTask {
    pub batch_index: usize,
    pub files: Vec<PathBuf>,
    pub chunks: Vec<usize>,
    /// Zero for the first hand-out, incremented on every re-queue.
    pub attempt: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub batch_index: usize,
    pub worker_id: usize,
    pub ids_loaded: usize,
    pub labeled: Vec<usize>,
    /// Chunks this attempt could never lock.
    pub pending: Vec<usize>,
    pub attempt: usize,
}

/// What a worker thread sends back to the coordinator.
#[derive(Debug)]
pub enum WorkerEvent {
    Finished(BatchReport),
    Failed { worker_id: usize, error: LabelError },
    Panicked(usize),
}

/// Reports a panic on the way out of a worker thread so the coordinator does
/// not wait for a result that will never arrive.
struct PanicNotice<'a> {
    worker_id: usize,
    events: &'a Sender<WorkerEvent>,
}

impl Drop for PanicNotice<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            let _ = self.events.send(WorkerEvent::Panicked(self.worker_id));
        }
    }
}

fn chunk_path<'a>(ctx: &WorkerContext<'a>, chunk: usize) -> Result<&'a Path, LabelError> {
    ctx.chunks
        .get(chunk)
        .map(PathBuf::as_path)
        .ok_or_else(|| LabelError::InvalidConfig(format!("chunk {} out of range", chunk)))
}

/// Label every chunk of `task` this worker can lock within its passes.
///
/// Each pass visits the unfinished chunks in a fresh random order. Chunks
/// still unlabeled after the last pass come back in `pending`.
pub fn run_shared_task(ctx: &WorkerContext<'_>, task: &BatchTask) -> Result<BatchReport, LabelError> {
    let map = build_label_map(&task.files, ctx.scan)?;
    tracing::info!(
        worker = ctx.worker_id,
        batch = task.batch_index,
        attempt = task.attempt,
        ids = map.len(),
        "loaded batch"
    );

    let mut tracker = ChunkTracker::new(task.chunks.len());
    let mut labeled = Vec::with_capacity(task.chunks.len());
    let mut rng = rand::thread_rng();

    for pass in 0..ctx.lock.max_passes {
        if tracker.is_done() {
            break;
        }
        let mut order = tracker.unfinished();
        order.shuffle(&mut rng);

        for slot in order {
            let chunk = task.chunks[slot];
            let path = chunk_path(ctx, chunk)?;
            match chunk_lock::acquire(path, ctx.lock)? {
                LockOutcome::Acquired(guard) => {
                    let stats = relabel_in_place(path, &map, ctx.join)?;
                    drop(guard);
                    tracker.mark_labeled(slot);
                    labeled.push(chunk);
                    tracing::debug!(
                        worker = ctx.worker_id,
                        batch = task.batch_index,
                        chunk = %path.display(),
                        rows_in = stats.rows_in,
                        rows_out = stats.rows_out,
                        matched = stats.matched,
                        first_batch = !stats.was_labeled,
                        "labeled chunk"
                    );
                }
                LockOutcome::TimedOut(waited) => {
                    tracker.mark_locked_by_other(slot);
                    tracing::warn!(
                        worker = ctx.worker_id,
                        batch = task.batch_index,
                        pass,
                        chunk = %path.display(),
                        waited_ms = waited.as_millis() as u64,
                        "timed out waiting for chunk lock"
                    );
                }
            }
        }
    }

    let pending = tracker.unfinished().into_iter().map(|slot| task.chunks[slot]).collect();
    Ok(BatchReport {
        batch_index: task.batch_index,
        worker_id: ctx.worker_id,
        ids_loaded: map.len(),
        labeled,
        pending,
        attempt: task.attempt,
    })
}

/// Pull tasks until the queue closes, reporting each outcome.
pub fn shared_worker_loop(ctx: WorkerContext<'_>, tasks: Receiver<BatchTask>, events: Sender<WorkerEvent>) {
    let _notice = PanicNotice {
        worker_id: ctx.worker_id,
        events: &events,
    };
    for task in tasks.iter() {
        let event = match run_shared_task(&ctx, &task) {
            Ok(report) => WorkerEvent::Finished(report),
            Err(error) => WorkerEvent::Failed {
                worker_id: ctx.worker_id,
                error,
            },
        };
        if events.send(event).is_err() {
            break;
        }
    }
    tracing::debug!(worker = ctx.worker_id, "task queue closed, worker exiting");
}

/// Apply each batch in turn to the clone this worker owns. No lock is taken:
/// a clone is only ever touched by its owner.
pub fn run_clone_batches(ctx: &WorkerContext<'_>, clone: usize, tasks: &[BatchTask]) -> Result<Vec<BatchReport>, LabelError> {
    let path = chunk_path(ctx, clone)?;
    let mut reports = Vec::with_capacity(tasks.len());
    for task in tasks {
        let map = build_label_map(&task.files, ctx.scan)?;
        let stats = relabel_in_place(path, &map, ctx.join)?;
        tracing::info!(
            worker = ctx.worker_id,
            batch = task.batch_index,
            ids = map.len(),
            clone = %path.display(),
            rows = stats.rows_out,
            matched = stats.matched,
            "labeled clone"
        );
        reports.push(BatchReport {
            batch_index: task.batch_index,
            worker_id: ctx.worker_id,
            ids_loaded: map.len(),
            labeled: vec![clone],
            pending: Vec::new(),
            attempt: task.attempt,
        });
    }
    Ok(reports)
}
