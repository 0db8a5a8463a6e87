use crate::config::LabelNaming;
use crate::LabelError;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

/// Suffix of the file a chunk is rewritten into before replacing it.
pub const TMP_SUFFIX: &str = "_tmp";

/// Suffix of the lock marker guarding a chunk.
pub const LOCK_SUFFIX: &str = ".lock";

/// Suffix of the final output while it is being written.
pub const PARTIAL_SUFFIX: &str = ".partial";

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

pub fn tmp_path(chunk: &Path) -> PathBuf {
    with_suffix(chunk, TMP_SUFFIX)
}

pub fn lock_path(chunk: &Path) -> PathBuf {
    with_suffix(chunk, LOCK_SUFFIX)
}

pub fn partial_path(out_file: &Path) -> PathBuf {
    with_suffix(out_file, PARTIAL_SUFFIX)
}

/// Prefix shared by all chunk and clone files of `input`.
pub fn artifact_prefix(input: &Path) -> String {
    format!("{}_", input.display())
}

/// Remove each file that exists; missing files are fine.
pub fn delete_files<P: AsRef<Path>>(paths: &[P]) -> Result<(), LabelError> {
    for path in paths {
        match fs::remove_file(path.as_ref()) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(LabelError::Io(e)),
        }
    }
    Ok(())
}

/// Delete `_tmp` and `.lock` companions left behind by a previous run.
pub fn clear_stale_artifacts<P: AsRef<Path>>(chunks: &[P]) -> Result<usize, LabelError> {
    let mut removed = 0;
    for chunk in chunks {
        for stale in [tmp_path(chunk.as_ref()), lock_path(chunk.as_ref())] {
            if stale.is_file() {
                fs::remove_file(&stale)?;
                removed += 1;
            }
        }
    }
    if removed > 0 {
        tracing::info!(removed, "removed stale temporary files from a previous run");
    }
    Ok(removed)
}

/// Delete chunk files together with their `_tmp` and `.lock` companions.
pub fn remove_chunk_artifacts<P: AsRef<Path>>(chunks: &[P]) -> Result<(), LabelError> {
    let mut all = Vec::with_capacity(chunks.len() * 3);
    for chunk in chunks {
        let chunk = chunk.as_ref();
        all.push(chunk.to_path_buf());
        all.push(tmp_path(chunk));
        all.push(lock_path(chunk));
    }
    delete_files(&all)
}

/// Refuse to run when the output already exists or cannot be created.
pub fn check_output_path(out_file: &Path) -> Result<(), LabelError> {
    if out_file.exists() {
        return Err(LabelError::OutputExists(out_file.to_path_buf()));
    }
    File::create(out_file).map_err(|e| LabelError::OutputUnwritable(out_file.to_path_buf(), e))?;
    fs::remove_file(out_file)?;
    Ok(())
}

/// Source files in `dir` matching `prefix*extension`, sorted by path.
///
/// The prefix only narrows the search when an extension is also given.
pub fn discover_sources(dir: &Path, naming: &LabelNaming) -> Result<Vec<PathBuf>, LabelError> {
    if !dir.is_dir() {
        return Err(LabelError::NoSourceDir(dir.to_path_buf()));
    }
    let extension = naming.extension.as_deref().unwrap_or("");
    let prefix = match (&naming.prefix, &naming.extension) {
        (Some(p), Some(_)) => p.as_str(),
        _ => "",
    };

    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with(prefix) && name.ends_with(extension) {
            files.push(path);
        }
    }
    files.sort();

    if files.is_empty() {
        return Err(LabelError::NoSourceFiles {
            dir: dir.to_path_buf(),
            pattern: format!("{}*{}", prefix, extension),
        });
    }
    Ok(files)
}

/// Writable handle on `<out>.partial`; [`PartialOutput::commit`] renames it
/// to the final path, dropping it uncommitted deletes it.
#[derive(Debug)]
pub struct PartialOutput {
    partial: PathBuf,
    target: PathBuf,
    committed: bool,
}

impl PartialOutput {
    pub fn create(target: &Path) -> Result<(Self, File), LabelError> {
        let partial = partial_path(target);
        let file = File::create(&partial)?;
        Ok((
            Self {
                partial,
                target: target.to_path_buf(),
                committed: false,
            },
            file,
        ))
    }

    pub fn commit(mut self) -> Result<(), LabelError> {
        if self.target.exists() {
            return Err(LabelError::OutputExists(self.target.clone()));
        }
        fs::rename(&self.partial, &self.target)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for PartialOutput {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.partial);
        }
    }
}
