//! Drives a labeling run in one of its three execution modes.

use crate::combiner::{combine_chunks, combine_clones};
use crate::config::{ChunkSize, Distribution, RunConfig, AUTO_CHUNKS_PER_THREAD};
use crate::file_handler::{artifact_prefix, clear_stale_artifacts, remove_chunk_artifacts, PartialOutput};
use crate::join::label_records;
use crate::label_map::build_label_map;
use crate::splitter::{calculate_blocksize, clone_file, split_file};
use crate::work_queue::WorkQueue;
use crate::worker::{self, BatchReport, BatchTask, WorkerContext, WorkerEvent};
use crate::LabelError;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::thread;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Sequential,
    SharedChunks,
    Clones,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub mode: RunMode,
    pub clusters: usize,
    pub batches: usize,
    /// Chunk or clone files the input was spread over.
    pub chunks: usize,
    /// Sum of ids loaded over every batch attempt.
    pub ids_loaded: usize,
    pub requeues: usize,
}

/// Applied-batch record for every chunk, checked before the final combine.
#[derive(Debug, Clone)]
pub struct CompletionLedger {
    applied: Vec<Vec<usize>>,
}

impl CompletionLedger {
    pub fn new(chunks: usize) -> Self {
        Self {
            applied: vec![Vec::new(); chunks],
        }
    }

    pub fn record(&mut self, report: &BatchReport) {
        for &chunk in &report.labeled {
            if let Some(batches) = self.applied.get_mut(chunk) {
                batches.push(report.batch_index);
            }
        }
    }

    /// Every chunk must have been labeled exactly once by each batch in
    /// `expected[chunk]`.
    pub fn verify(&self, paths: &[PathBuf], expected: &[Vec<usize>]) -> Result<(), LabelError> {
        for ((applied, want), path) in self.applied.iter().zip(expected).zip(paths) {
            let mut got = applied.clone();
            got.sort_unstable();
            let mut want = want.clone();
            want.sort_unstable();
            if got != want {
                return Err(LabelError::IncompleteChunk {
                    chunk: path.clone(),
                    applied: applied.len(),
                    expected: want.len(),
                });
            }
        }
        Ok(())
    }
}

/// Removes chunk files and their companions when dropped, on success and on
/// abort alike.
struct ChunkArtifacts {
    paths: Vec<PathBuf>,
}

impl Drop for ChunkArtifacts {
    fn drop(&mut self) {
        match remove_chunk_artifacts(&self.paths) {
            Ok(()) => tracing::debug!(files = self.paths.len(), "removed chunk files"),
            Err(e) => tracing::warn!(error = %e, "failed to remove chunk files"),
        }
    }
}

/// Sources grouped into consecutive batches of `batch_size`.
pub fn make_batches(sources: &[PathBuf], batch_size: usize) -> Vec<Vec<PathBuf>> {
    sources.chunks(batch_size.max(1)).map(<[PathBuf]>::to_vec).collect()
}

/// Batch indices owned by each of `workers` clones: batch `i` goes to
/// clone `i % workers`.
pub fn assign_clone_batches(batches: usize, workers: usize) -> Vec<Vec<usize>> {
    let workers = workers.max(1);
    let mut owned = vec![Vec::new(); workers];
    for batch in 0..batches {
        owned[batch % workers].push(batch);
    }
    owned
}

/// Run the whole pipeline described by `config` and write its output.
pub fn run(config: &RunConfig) -> Result<RunSummary, LabelError> {
    config.validate()?;
    if config.out_file.exists() {
        return Err(LabelError::OutputExists(config.out_file.clone()));
    }
    if fs::metadata(&config.input_file)?.len() == 0 {
        return Err(LabelError::EmptyInput(config.input_file.clone()));
    }
    tracing::debug!(config = %config.describe()?, "effective configuration");
    tracing::info!(
        input = %config.input_file.display(),
        sources = config.sources.len(),
        "starting labeling run"
    );

    let summary = match &config.distribution {
        None => run_sequential(config),
        Some(dist) if dist.chunk_size == ChunkSize::Clone => run_clones(config, dist),
        Some(dist) => run_shared_chunks(config, dist),
    }?;

    tracing::info!(
        mode = ?summary.mode,
        clusters = summary.clusters,
        batches = summary.batches,
        chunks = summary.chunks,
        ids_loaded = summary.ids_loaded,
        requeues = summary.requeues,
        out = %config.out_file.display(),
        "labeling run complete"
    );
    Ok(summary)
}

/// Full map in memory, one streaming pass over the input.
pub fn run_sequential(config: &RunConfig) -> Result<RunSummary, LabelError> {
    let map = build_label_map(&config.sources, &config.scan)?;
    tracing::info!(ids = map.len(), "loaded label map");

    let input = BufReader::new(File::open(&config.input_file)?);
    let (partial, output) = PartialOutput::create(&config.out_file)?;
    let clusters = label_records(
        input,
        &output,
        &map,
        &config.join,
        &config.input_file.display().to_string(),
    )?;
    output.sync_all()?;
    drop(output);
    partial.commit()?;

    Ok(RunSummary {
        mode: RunMode::Sequential,
        clusters,
        batches: 1,
        chunks: 0,
        ids_loaded: map.len(),
        requeues: 0,
    })
}

fn resolve_split_size(input: &Path, dist: &Distribution) -> Result<u64, LabelError> {
    match dist.chunk_size {
        ChunkSize::Bytes(n) => Ok(n),
        ChunkSize::Auto | ChunkSize::Clone => calculate_blocksize(input, AUTO_CHUNKS_PER_THREAD * dist.threads),
    }
}

/// Split the input, let the pool label shared chunks under locks, then
/// concatenate.
pub fn run_shared_chunks(config: &RunConfig, dist: &Distribution) -> Result<RunSummary, LabelError> {
    let split_size = resolve_split_size(&config.input_file, dist)?;
    let chunks = split_file(&config.input_file, split_size, &artifact_prefix(&config.input_file))?;
    let artifacts = ChunkArtifacts {
        paths: chunks.iter().map(|c| c.path.clone()).collect(),
    };
    clear_stale_artifacts(&artifacts.paths)?;

    let batches = make_batches(&config.sources, dist.batch_size);
    tracing::info!(
        chunks = chunks.len(),
        split_size,
        batches = batches.len(),
        threads = dist.threads,
        "split input into shared chunks"
    );

    let (ledger, ids_loaded, requeues) = distribute_shared(config, dist, &artifacts.paths, &batches)?;
    let all_batches: Vec<usize> = (0..batches.len()).collect();
    let expected = vec![all_batches; artifacts.paths.len()];
    ledger.verify(&artifacts.paths, &expected)?;

    let (partial, output) = PartialOutput::create(&config.out_file)?;
    let clusters = combine_chunks(&artifacts.paths, &output, &config.join)?;
    output.sync_all()?;
    drop(output);
    partial.commit()?;

    Ok(RunSummary {
        mode: RunMode::SharedChunks,
        clusters,
        batches: batches.len(),
        chunks: artifacts.paths.len(),
        ids_loaded,
        requeues,
    })
}

/// Feed batch tasks to the worker pool until every chunk has been labeled by
/// every batch, re-queuing chunks a worker could not lock.
fn distribute_shared(
    config: &RunConfig,
    dist: &Distribution,
    chunk_paths: &[PathBuf],
    batches: &[Vec<PathBuf>],
) -> Result<(CompletionLedger, usize, usize), LabelError> {
    let tasks: WorkQueue<BatchTask> = WorkQueue::new();
    let events: WorkQueue<WorkerEvent> = WorkQueue::new();
    let all_chunks: Vec<usize> = (0..chunk_paths.len()).collect();

    thread::scope(|scope| {
        let handles: Vec<_> = (0..dist.threads)
            .map(|worker_id| {
                let ctx = WorkerContext {
                    worker_id,
                    scan: &config.scan,
                    join: &config.join,
                    lock: &dist.lock,
                    chunks: chunk_paths,
                };
                let task_rx = tasks.receiver.clone();
                let event_tx = events.sender.clone();
                scope.spawn(move || worker::shared_worker_loop(ctx, task_rx, event_tx))
            })
            .collect();

        for (batch_index, files) in batches.iter().enumerate() {
            tasks.push(BatchTask {
                batch_index,
                files: files.clone(),
                chunks: all_chunks.clone(),
                attempt: 0,
            });
        }

        let outcome = collect_shared_reports(&tasks, &events, batches, chunk_paths, dist);

        let dropped = tasks.drain();
        if dropped > 0 {
            tracing::debug!(dropped, "discarded queued tasks");
        }
        drop(tasks.close());

        let mut panicked = None;
        for (worker_id, handle) in handles.into_iter().enumerate() {
            if handle.join().is_err() {
                panicked.get_or_insert(worker_id);
            }
        }
        match (outcome, panicked) {
            (Err(e), _) => Err(e),
            (Ok(_), Some(worker_id)) => Err(LabelError::WorkerPanicked(worker_id)),
            (Ok(result), None) => Ok(result),
        }
    })
}

fn collect_shared_reports(
    tasks: &WorkQueue<BatchTask>,
    events: &WorkQueue<WorkerEvent>,
    batches: &[Vec<PathBuf>],
    chunk_paths: &[PathBuf],
    dist: &Distribution,
) -> Result<(CompletionLedger, usize, usize), LabelError> {
    let mut ledger = CompletionLedger::new(chunk_paths.len());
    let mut outstanding = batches.len();
    let mut ids_loaded = 0;
    let mut requeues = 0;

    while outstanding > 0 {
        let event = events
            .receiver
            .recv()
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "worker event channel closed"))?;
        let report = match event {
            WorkerEvent::Finished(report) => report,
            WorkerEvent::Failed { worker_id, error } => {
                tracing::error!(worker = worker_id, error = %error, "worker failed, aborting run");
                return Err(error);
            }
            WorkerEvent::Panicked(worker_id) => return Err(LabelError::WorkerPanicked(worker_id)),
        };
        outstanding -= 1;
        ids_loaded += report.ids_loaded;
        ledger.record(&report);

        if report.pending.is_empty() {
            tracing::debug!(batch = report.batch_index, worker = report.worker_id, "batch complete");
            continue;
        }
        if report.attempt >= dist.lock.max_requeues {
            return Err(LabelError::LockStarved {
                batch_index: report.batch_index,
                chunks: report.pending.iter().map(|&c| chunk_paths[c].clone()).collect(),
                requeues: report.attempt,
            });
        }
        tracing::warn!(
            batch = report.batch_index,
            pending = report.pending.len(),
            attempt = report.attempt + 1,
            "re-queuing chunks that could not be locked"
        );
        tasks.push(BatchTask {
            batch_index: report.batch_index,
            files: batches[report.batch_index].clone(),
            chunks: report.pending,
            attempt: report.attempt + 1,
        });
        outstanding += 1;
        requeues += 1;
    }
    Ok((ledger, ids_loaded, requeues))
}

/// One private clone per worker, statically assigned batches, zipped at the
/// end.
pub fn run_clones(config: &RunConfig, dist: &Distribution) -> Result<RunSummary, LabelError> {
    let batches = make_batches(&config.sources, dist.batch_size);
    let workers = dist.threads.min(batches.len()).max(1);
    let clones = clone_file(&config.input_file, workers, &artifact_prefix(&config.input_file))?;
    let artifacts = ChunkArtifacts {
        paths: clones.iter().map(|c| c.path.clone()).collect(),
    };
    clear_stale_artifacts(&artifacts.paths)?;

    let owned = assign_clone_batches(batches.len(), workers);
    tracing::info!(clones = workers, batches = batches.len(), "cloned input per worker");

    let results: Vec<Result<Vec<BatchReport>, LabelError>> = thread::scope(|scope| {
        let handles: Vec<_> = owned
            .iter()
            .enumerate()
            .map(|(worker_id, batch_ids)| {
                let ctx = WorkerContext {
                    worker_id,
                    scan: &config.scan,
                    join: &config.join,
                    lock: &dist.lock,
                    chunks: &artifacts.paths,
                };
                let tasks: Vec<BatchTask> = batch_ids
                    .iter()
                    .map(|&batch_index| BatchTask {
                        batch_index,
                        files: batches[batch_index].clone(),
                        chunks: vec![worker_id],
                        attempt: 0,
                    })
                    .collect();
                scope.spawn(move || worker::run_clone_batches(&ctx, worker_id, &tasks))
            })
            .collect();

        handles
            .into_iter()
            .enumerate()
            .map(|(worker_id, handle)| handle.join().unwrap_or(Err(LabelError::WorkerPanicked(worker_id))))
            .collect()
    });

    let mut ledger = CompletionLedger::new(workers);
    let mut ids_loaded = 0;
    for result in results {
        for report in result? {
            ids_loaded += report.ids_loaded;
            ledger.record(&report);
        }
    }
    ledger.verify(&artifacts.paths, &owned)?;

    let (partial, output) = PartialOutput::create(&config.out_file)?;
    let clusters = combine_clones(&artifacts.paths, &output, &config.join)?;
    output.sync_all()?;
    drop(output);
    partial.commit()?;

    Ok(RunSummary {
        mode: RunMode::Clones,
        clusters,
        batches: batches.len(),
        chunks: workers,
        ids_loaded,
        requeues: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(batch_index: usize, labeled: Vec<usize>) -> BatchReport {
        BatchReport {
            batch_index,
            worker_id: 0,
            ids_loaded: 0,
            labeled,
            pending: Vec::new(),
            attempt: 0,
        }
    }

    #[test]
    fn test_make_batches() {
        let sources: Vec<PathBuf> = (0..5).map(|i| PathBuf::from(format!("{}.fa", i))).collect();
        let batches = make_batches(&sources, 2);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2], vec![PathBuf::from("4.fa")]);
        assert_eq!(make_batches(&sources, 10).len(), 1);
    }

    #[test]
    fn test_assign_clone_batches_gives_every_clone_work() {
        let owned = assign_clone_batches(5, 3);
        assert_eq!(owned, vec![vec![0, 3], vec![1, 4], vec![2]]);
        assert!(assign_clone_batches(2, 2).iter().all(|b| !b.is_empty()));
    }

    #[test]
    fn test_ledger_accepts_complete_run() {
        let paths = vec![PathBuf::from("c0"), PathBuf::from("c1")];
        let mut ledger = CompletionLedger::new(2);
        ledger.record(&report(1, vec![1, 0]));
        ledger.record(&report(0, vec![0]));
        ledger.record(&report(0, vec![1]));
        ledger.verify(&paths, &[vec![0, 1], vec![0, 1]]).unwrap();
    }

    #[test]
    fn test_ledger_flags_missing_and_duplicate_batches() {
        let paths = vec![PathBuf::from("c0")];
        let mut missing = CompletionLedger::new(1);
        missing.record(&report(0, vec![0]));
        let err = missing.verify(&paths, &[vec![0, 1]]).unwrap_err();
        assert!(matches!(err, LabelError::IncompleteChunk { applied: 1, expected: 2, .. }));

        let mut twice = CompletionLedger::new(1);
        twice.record(&report(0, vec![0]));
        twice.record(&report(0, vec![0]));
        assert!(twice.verify(&paths, &[vec![0]]).is_err());
    }

    struct SharedSetup {
        _dir: tempfile::TempDir,
        config: RunConfig,
        dist: Distribution,
        chunks: Vec<PathBuf>,
        batches: Vec<Vec<PathBuf>>,
    }

    fn shared_setup(max_requeues: usize) -> SharedSetup {
        let dir = tempfile::tempdir().unwrap();
        let chunks: Vec<PathBuf> = ["A\tp1\n", "B\tp2\n"]
            .iter()
            .enumerate()
            .map(|(i, text)| {
                let p = dir.path().join(format!("in.tsv_{}", i));
                std::fs::write(&p, text).unwrap();
                p
            })
            .collect();
        let source = dir.path().join("x.fa");
        std::fs::write(&source, ">p1\n>p2\n").unwrap();
        let config = RunConfig::sequential(dir.path().join("in.tsv"), dir.path().join("out.tsv"), vec![source]);
        let dist = Distribution {
            threads: 2,
            batch_size: 1,
            chunk_size: ChunkSize::Auto,
            lock: crate::config::LockPolicy {
                timeout: std::time::Duration::from_millis(20),
                max_jitter: std::time::Duration::ZERO,
                poll_interval: std::time::Duration::from_millis(2),
                max_passes: 1,
                max_requeues,
            },
        };
        let batches = make_batches(&config.sources, 1);
        SharedSetup {
            _dir: dir,
            config,
            dist,
            chunks,
            batches,
        }
    }

    #[test]
    fn test_held_lock_starves_batch() {
        let s = shared_setup(2);
        let held = crate::chunk_lock::acquire(&s.chunks[1], &s.dist.lock).unwrap();
        assert!(held.is_acquired());

        let err = distribute_shared(&s.config, &s.dist, &s.chunks, &s.batches).unwrap_err();
        match err {
            LabelError::LockStarved {
                batch_index,
                chunks,
                requeues,
            } => {
                assert_eq!(batch_index, 0);
                assert_eq!(chunks, vec![s.chunks[1].clone()]);
                assert_eq!(requeues, 2);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(std::fs::read_to_string(&s.chunks[0]).unwrap(), "A\tp1\tx\n");
    }

    #[test]
    fn test_requeued_chunks_are_labeled_once_lock_frees() {
        let s = shared_setup(1_000);
        let held = crate::chunk_lock::acquire(&s.chunks[0], &s.dist.lock).unwrap();
        let releaser = thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(300));
            drop(held);
        });

        let (ledger, _, requeues) = distribute_shared(&s.config, &s.dist, &s.chunks, &s.batches).unwrap();
        releaser.join().unwrap();
        assert!(requeues >= 1);
        ledger.verify(&s.chunks, &[vec![0], vec![0]]).unwrap();
        assert_eq!(std::fs::read_to_string(&s.chunks[0]).unwrap(), "A\tp1\tx\n");
        assert_eq!(std::fs::read_to_string(&s.chunks[1]).unwrap(), "B\tp2\tx\n");
    }
}
