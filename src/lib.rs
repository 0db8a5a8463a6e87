pub mod chunk_lock;
pub mod combiner;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod file_handler;
pub mod join;
pub mod label_map;
pub mod record_reader;
pub mod splitter;
pub mod work_queue;
pub mod worker;

pub use config::{ChunkSize, Distribution, JoinOptions, LockPolicy, ReadMethod, RunConfig};
pub use coordinator::{run, RunMode, RunSummary};
pub use error::*;
pub use label_map::LabelMap;

use std::io::IsTerminal;
use tracing_subscriber::EnvFilter;

/// Install the stderr log subscriber for the binary named `service`.
///
/// `level` overrides `RUST_LOG`; with neither set, `info` is used.
pub fn init_tracing(service: &str, level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(false)
        .try_init();
    tracing::debug!(service, "tracing initialized");
}
