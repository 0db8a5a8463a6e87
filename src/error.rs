use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub enum LabelError {
    OutputExists(PathBuf),
    OutputUnwritable(PathBuf, std::io::Error),
    NoSourceDir(PathBuf),
    NoInputFile(PathBuf),
    NoSourceFiles { dir: PathBuf, pattern: String },
    EmptyInput(PathBuf),
    ChunkSizeWithoutBatch,
    InvalidSize(String),
    InvalidConfig(String),
    MalformedRow {
        source: String,
        line_number: usize,
        columns: usize,
        line: String,
    },
    CloneMismatch {
        line_number: usize,
        detail: String,
    },
    LockStarved {
        batch_index: usize,
        chunks: Vec<PathBuf>,
        requeues: usize,
    },
    IncompleteChunk {
        chunk: PathBuf,
        applied: usize,
        expected: usize,
    },
    WorkerPanicked(usize),
    Io(std::io::Error),
}

impl LabelError {
    /// Process exit status reported by the binary for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            LabelError::OutputExists(_) => 17,
            LabelError::OutputUnwritable(..) => 1,
            LabelError::NoSourceDir(_) | LabelError::NoInputFile(_) | LabelError::NoSourceFiles { .. } => 2,
            LabelError::EmptyInput(_) => 3,
            LabelError::ChunkSizeWithoutBatch
            | LabelError::InvalidSize(_)
            | LabelError::InvalidConfig(_) => 22,
            LabelError::LockStarved { .. } => 4,
            LabelError::MalformedRow { .. } | LabelError::CloneMismatch { .. } => 5,
            LabelError::IncompleteChunk { .. } => 6,
            LabelError::WorkerPanicked(_) => 70,
            LabelError::Io(_) => 74,
        }
    }
}

impl fmt::Display for LabelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabelError::OutputExists(p) => {
                write!(f, "File '{}' exists; remove it to proceed", p.display())
            }
            LabelError::OutputUnwritable(p, e) => {
                write!(f, "Cannot write to file '{}': {}", p.display(), e)
            }
            LabelError::NoSourceDir(p) => write!(f, "No such directory '{}'", p.display()),
            LabelError::NoInputFile(p) => write!(f, "No such file '{}'", p.display()),
            LabelError::NoSourceFiles { dir, pattern } => {
                write!(f, "No matching '{}' files in '{}'", pattern, dir.display())
            }
            LabelError::EmptyInput(p) => write!(f, "File '{}' is empty", p.display()),
            LabelError::ChunkSizeWithoutBatch => write!(
                f,
                "chunksize requires distributed execution; specify --batchsize and optionally --threads"
            ),
            LabelError::InvalidSize(s) => write!(f, "Invalid size string '{}'", s),
            LabelError::InvalidConfig(e) => write!(f, "Invalid configuration: {}", e),
            LabelError::MalformedRow {
                source,
                line_number,
                columns,
                line,
            } => write!(
                f,
                "'{}' line {}: unexpected number of columns ({}): {:?}",
                source, line_number, columns, line
            ),
            LabelError::CloneMismatch { line_number, detail } => {
                write!(f, "Cloned copies disagree at line {}: {}", line_number, detail)
            }
            LabelError::LockStarved {
                batch_index,
                chunks,
                requeues,
            } => write!(
                f,
                "Batch {} could not lock {} chunk(s) after {} re-queues (stale lock or permissions?): {:?}",
                batch_index,
                chunks.len(),
                requeues,
                chunks
            ),
            LabelError::IncompleteChunk {
                chunk,
                applied,
                expected,
            } => write!(
                f,
                "Chunk '{}' was labeled by {} of {} batches",
                chunk.display(),
                applied,
                expected
            ),
            LabelError::WorkerPanicked(id) => write!(f, "Worker {} panicked", id),
            LabelError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for LabelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LabelError::Io(e) | LabelError::OutputUnwritable(_, e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for LabelError {
    fn from(err: std::io::Error) -> Self {
        LabelError::Io(err)
    }
}

impl From<serde_json::Error> for LabelError {
    fn from(err: serde_json::Error) -> Self {
        LabelError::InvalidConfig(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct_per_configuration_condition() {
        let exists = LabelError::OutputExists(PathBuf::from("out.tsv"));
        let no_files = LabelError::NoSourceFiles {
            dir: PathBuf::from("src"),
            pattern: "*.fa".to_string(),
        };
        let empty = LabelError::EmptyInput(PathBuf::from("in.tsv"));
        let chunk = LabelError::ChunkSizeWithoutBatch;

        let codes = [exists.exit_code(), no_files.exit_code(), empty.exit_code(), chunk.exit_code()];
        let unique: std::collections::HashSet<_> = codes.iter().collect();
        assert_eq!(unique.len(), codes.len());
        assert!(codes.iter().all(|c| *c != 0));
    }

    #[test]
    fn test_malformed_row_message_names_line() {
        let err = LabelError::MalformedRow {
            source: "chunk_0".to_string(),
            line_number: 7,
            columns: 4,
            line: "a\tb\tc\td".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("chunk_0"));
        assert!(msg.contains("line 7"));
        assert!(msg.contains("(4)"));
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: LabelError = io.into();
        assert_eq!(err.exit_code(), 74);
        assert!(std::error::Error::source(&err).is_some());
    }
}
