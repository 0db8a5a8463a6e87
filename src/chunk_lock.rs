//! Exclusive, timeout-bounded access to a chunk file.
//!
//! The lock is an advisory `flock` on a `<chunk>.lock` marker next to the
//! chunk. Acquisition polls a non-blocking attempt until the deadline, which
//! is the base timeout plus a random jitter so that workers that collided once
//! do not keep colliding.

use crate::config::LockPolicy;
use crate::file_handler::lock_path;
use crate::LabelError;
use fs2::FileExt;
use rand::Rng;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Held lock on one chunk. Dropping it releases the lock.
#[derive(Debug)]
pub struct ChunkLockGuard {
    file: File,
    marker: PathBuf,
}

impl ChunkLockGuard {
    pub fn marker(&self) -> &Path {
        &self.marker
    }
}

impl Drop for ChunkLockGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(marker = %self.marker.display(), error = %e, "failed to release chunk lock");
        }
    }
}

#[derive(Debug)]
pub enum LockOutcome {
    Acquired(ChunkLockGuard),
    /// Nobody released the lock within the waited duration.
    TimedOut(Duration),
}

impl LockOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, LockOutcome::Acquired(_))
    }
}

/// Base timeout plus a uniformly drawn jitter in `[0, max_jitter]`.
pub fn jittered_timeout(policy: &LockPolicy) -> Duration {
    let jitter_ms = policy.max_jitter.as_millis() as u64;
    let extra = if jitter_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=jitter_ms)
    };
    policy.timeout + Duration::from_millis(extra)
}

/// Try to lock `resource` until the jittered deadline passes.
pub fn acquire(resource: &Path, policy: &LockPolicy) -> Result<LockOutcome, LabelError> {
    acquire_within(resource, jittered_timeout(policy), policy.poll_interval)
}

/// Try to lock `resource` for at most `wait`.
pub fn acquire_within(resource: &Path, wait: Duration, poll: Duration) -> Result<LockOutcome, LabelError> {
    let marker = lock_path(resource);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&marker)?;

    let deadline = Instant::now() + wait;
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => return Ok(LockOutcome::Acquired(ChunkLockGuard { file, marker })),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(LockOutcome::TimedOut(wait));
                }
                std::thread::sleep(poll.min(deadline - now));
            }
            Err(e) => return Err(LabelError::Io(e)),
        }
    }
}
