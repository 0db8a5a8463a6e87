use crate::LabelError;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

/// Smallest chunk size accepted when the operator asks for one explicitly.
pub const MIN_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Chunks per worker when the chunk size is computed automatically.
pub const AUTO_CHUNKS_PER_THREAD: usize = 3;

/// Parsed form of a human-entered size string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SizeSpec {
    Bytes(u64),
    NoSplit,
}

/// Parse sizes like `"5m"`, `"1G"`, `"4096"`, `"0"` or `"n"`.
///
/// Suffixes `k`, `m`, `g`, `t`, `p` multiply by powers of 1024 and are
/// case-insensitive. `"n"` means the input must not be split.
pub fn parse_size(text: &str) -> Result<SizeSpec, LabelError> {
    let trimmed = text.trim();
    if trimmed.eq_ignore_ascii_case("n") {
        return Ok(SizeSpec::NoSplit);
    }
    if trimmed == "0" {
        return Ok(SizeSpec::Bytes(0));
    }

    let lower = trimmed.to_ascii_lowercase();
    let invalid = || LabelError::InvalidSize(text.to_string());

    let (digits, power) = match lower.chars().last() {
        Some('k') => (&lower[..lower.len() - 1], 1),
        Some('m') => (&lower[..lower.len() - 1], 2),
        Some('g') => (&lower[..lower.len() - 1], 3),
        Some('t') => (&lower[..lower.len() - 1], 4),
        Some('p') => (&lower[..lower.len() - 1], 5),
        Some(_) => (lower.as_str(), 0),
        None => return Err(invalid()),
    };

    let base: u64 = digits.parse().map_err(|_| invalid())?;
    let bytes = base.checked_mul(1024u64.pow(power)).ok_or_else(invalid)?;
    Ok(SizeSpec::Bytes(bytes))
}

/// How the input is distributed among workers once resolved against the
/// input size and thread count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChunkSize {
    /// Compute `ceil(input_size / (3 * threads))` at run time.
    Auto,
    Bytes(u64),
    /// Clone the whole input once per worker instead of splitting it.
    Clone,
}

impl ChunkSize {
    /// Resolve the `--chunksize` argument. Zero means automatic sizing and
    /// explicit sizes are raised to [`MIN_CHUNK_SIZE`].
    pub fn from_arg(arg: Option<&str>) -> Result<Self, LabelError> {
        match arg {
            None => Ok(ChunkSize::Auto),
            Some(text) => match parse_size(text)? {
                SizeSpec::NoSplit => Ok(ChunkSize::Clone),
                SizeSpec::Bytes(0) => Ok(ChunkSize::Auto),
                SizeSpec::Bytes(n) => Ok(ChunkSize::Bytes(n.max(MIN_CHUNK_SIZE))),
            },
        }
    }
}

/// Strategy used to pull header records out of a source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ReadMethod {
    #[default]
    Lines,
    Full,
    Chunks,
}

/// How a record id is cut out of a header record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdRule {
    pub marker: char,
    pub delimiter: char,
}

impl Default for IdRule {
    fn default() -> Self {
        Self {
            marker: '>',
            delimiter: ' ',
        }
    }
}

/// Naming convention turning a source file name into its label.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LabelNaming {
    pub prefix: Option<String>,
    pub extension: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceScan {
    pub naming: LabelNaming,
    pub id_rule: IdRule,
    pub read_method: ReadMethod,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JoinOptions {
    pub nolabel: String,
    pub sortlabels: bool,
    pub uniq: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockPolicy {
    pub timeout: Duration,
    pub max_jitter: Duration,
    pub poll_interval: Duration,
    /// Shuffled passes a worker makes over its pending chunks before handing
    /// them back to the coordinator.
    pub max_passes: usize,
    /// Times a batch may be handed back before the run is aborted.
    pub max_requeues: usize,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(90),
            max_jitter: Duration::from_secs(20),
            poll_interval: Duration::from_millis(50),
            max_passes: 8,
            max_requeues: 3,
        }
    }
}

/// Batched execution settings. Absent for the single-pass sequential run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Distribution {
    pub threads: usize,
    pub batch_size: usize,
    pub chunk_size: ChunkSize,
    pub lock: LockPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunConfig {
    pub input_file: PathBuf,
    pub out_file: PathBuf,
    pub sources: Vec<PathBuf>,
    pub scan: SourceScan,
    pub join: JoinOptions,
    pub distribution: Option<Distribution>,
}

impl RunConfig {
    pub fn sequential(input_file: PathBuf, out_file: PathBuf, sources: Vec<PathBuf>) -> Self {
        Self {
            input_file,
            out_file,
            sources,
            scan: SourceScan::default(),
            join: JoinOptions::default(),
            distribution: None,
        }
    }

    pub fn with_distribution(mut self, distribution: Distribution) -> Self {
        self.distribution = Some(distribution);
        self
    }

    pub fn validate(&self) -> Result<(), LabelError> {
        if self.sources.is_empty() {
            return Err(LabelError::InvalidConfig("no source files given".to_string()));
        }
        if let Some(dist) = &self.distribution {
            if dist.threads == 0 {
                return Err(LabelError::InvalidConfig("threads must be positive".to_string()));
            }
            if dist.batch_size == 0 {
                return Err(LabelError::InvalidConfig("batch size must be positive".to_string()));
            }
            if dist.lock.max_passes == 0 {
                return Err(LabelError::InvalidConfig("max passes must be positive".to_string()));
            }
        }
        Ok(())
    }

    /// JSON dump of the effective configuration, logged at debug level.
    pub fn describe(&self) -> Result<String, LabelError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Clamp the requested worker count to what the host offers.
pub fn clamp_threads(requested: usize) -> usize {
    let available = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    requested.clamp(1, available)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_suffixes() {
        assert_eq!(parse_size("5m").unwrap(), SizeSpec::Bytes(5 * 1024 * 1024));
        assert_eq!(parse_size("1G").unwrap(), SizeSpec::Bytes(1024 * 1024 * 1024));
        assert_eq!(parse_size("10k").unwrap(), SizeSpec::Bytes(10240));
        assert_eq!(parse_size("2t").unwrap(), SizeSpec::Bytes(2 * 1024u64.pow(4)));
        assert_eq!(parse_size("1p").unwrap(), SizeSpec::Bytes(1024u64.pow(5)));
        assert_eq!(parse_size("4096").unwrap(), SizeSpec::Bytes(4096));
    }

    #[test]
    fn test_parse_size_sentinels() {
        assert_eq!(parse_size("0").unwrap(), SizeSpec::Bytes(0));
        assert_eq!(parse_size("n").unwrap(), SizeSpec::NoSplit);
        assert_eq!(parse_size("N").unwrap(), SizeSpec::NoSplit);
    }

    #[test]
    fn test_parse_size_rejects_garbage() {
        assert!(matches!(parse_size("abc"), Err(LabelError::InvalidSize(_))));
        assert!(matches!(parse_size(""), Err(LabelError::InvalidSize(_))));
        assert!(matches!(parse_size("m"), Err(LabelError::InvalidSize(_))));
        assert!(matches!(parse_size("-5m"), Err(LabelError::InvalidSize(_))));
        assert!(matches!(parse_size("99999999999p"), Err(LabelError::InvalidSize(_))));
    }

    #[test]
    fn test_chunk_size_resolution() {
        assert_eq!(ChunkSize::from_arg(None).unwrap(), ChunkSize::Auto);
        assert_eq!(ChunkSize::from_arg(Some("0")).unwrap(), ChunkSize::Auto);
        assert_eq!(ChunkSize::from_arg(Some("n")).unwrap(), ChunkSize::Clone);
        assert_eq!(ChunkSize::from_arg(Some("1k")).unwrap(), ChunkSize::Bytes(MIN_CHUNK_SIZE));
        assert_eq!(
            ChunkSize::from_arg(Some("1g")).unwrap(),
            ChunkSize::Bytes(1024 * 1024 * 1024)
        );
    }

    #[test]
    fn test_validate_rejects_zero_threads() {
        let config = RunConfig::sequential("in".into(), "out".into(), vec!["a.fa".into()])
            .with_distribution(Distribution {
                threads: 0,
                batch_size: 1,
                chunk_size: ChunkSize::Auto,
                lock: LockPolicy::default(),
            });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_describe_is_json() {
        let config = RunConfig::sequential("in".into(), "out".into(), vec!["a.fa".into()]);
        let json = config.describe().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["join"]["uniq"], false);
        assert_eq!(value["scan"]["read_method"], "lines");
    }

    #[test]
    fn test_clamp_threads_at_least_one() {
        assert_eq!(clamp_threads(0), 1);
        assert!(clamp_threads(1_000_000) >= 1);
    }
}
