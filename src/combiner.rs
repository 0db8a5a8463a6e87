//! Final merge of labeled chunks or clones into the output table.

use crate::config::JoinOptions;
use crate::join::{append_labels, sort_labels, write_output_row, AdjacentDedup, Renumberer, Row, HEADER};
use crate::LabelError;
use std::borrow::Cow;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// Applies the stream-wide passes (uniq, sortlabels, renumbering) to rows
/// arriving in final order and writes them out.
struct FinalTable<W: Write> {
    out: BufWriter<W>,
    opts: JoinOptions,
    renumber: Renumberer,
    dedup: AdjacentDedup,
}

impl<W: Write> FinalTable<W> {
    fn start(output: W, opts: &JoinOptions) -> Result<Self, LabelError> {
        let mut out = BufWriter::new(output);
        out.write_all(HEADER.as_bytes())?;
        Ok(Self {
            out,
            opts: opts.clone(),
            renumber: Renumberer::new(),
            dedup: AdjacentDedup::default(),
        })
    }

    fn push(&mut self, cluster_key: &str, record_id: &str, labels: &str) -> Result<(), LabelError> {
        if self.opts.uniq && self.dedup.is_repeat(cluster_key, record_id) {
            return Ok(());
        }
        // unmatched ids reach here with no labels from any batch
        let labels = if labels.is_empty() { self.opts.nolabel.as_str() } else { labels };
        let labels = if self.opts.sortlabels {
            sort_labels(labels)
        } else {
            Cow::Borrowed(labels)
        };
        let (sequence, is_new) = self.renumber.assign(cluster_key);
        write_output_row(&mut self.out, sequence, record_id, &labels, is_new)?;
        Ok(())
    }

    fn finish(mut self) -> Result<usize, LabelError> {
        self.out.flush()?;
        Ok(self.renumber.clusters())
    }
}

fn strip_newline(buffer: &mut String) {
    if buffer.ends_with('\n') {
        buffer.pop();
    }
}

/// Concatenate labeled chunks in order into the final table.
///
/// Returns the number of clusters written.
pub fn combine_chunks<P: AsRef<Path>, W: Write>(chunks: &[P], output: W, opts: &JoinOptions) -> Result<usize, LabelError> {
    let mut table = FinalTable::start(output, opts)?;
    let mut line = String::new();
    for chunk in chunks {
        let chunk = chunk.as_ref();
        let source = chunk.display().to_string();
        let mut reader = BufReader::new(File::open(chunk)?);
        let mut line_number = 0;
        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                break;
            }
            line_number += 1;
            strip_newline(&mut line);
            let row = Row::parse(&line, 3, &source, line_number)?;
            table.push(row.cluster_key, row.record_id, row.labels.unwrap_or_default())?;
        }
    }
    table.finish()
}

/// Zip labeled clones row by row, joining their labels, into the final
/// table. Clones must agree on every record id and have the same length.
pub fn combine_clones<P: AsRef<Path>, W: Write>(clones: &[P], output: W, opts: &JoinOptions) -> Result<usize, LabelError> {
    let sources: Vec<String> = clones.iter().map(|c| c.as_ref().display().to_string()).collect();
    let mut readers = clones
        .iter()
        .map(|c| File::open(c.as_ref()).map(BufReader::new))
        .collect::<Result<Vec<_>, _>>()?;
    let mut lines = vec![String::new(); readers.len()];

    let mut table = FinalTable::start(output, opts)?;
    let mut labels = String::new();
    let mut line_number = 0;
    loop {
        let mut ended = 0;
        for (reader, line) in readers.iter_mut().zip(lines.iter_mut()) {
            line.clear();
            if reader.read_line(line)? == 0 {
                ended += 1;
            }
            strip_newline(line);
        }
        line_number += 1;
        if ended == readers.len() {
            break;
        }
        if ended > 0 {
            return Err(LabelError::CloneMismatch {
                line_number,
                detail: format!("{} of {} copies ended early", ended, readers.len()),
            });
        }

        let rows = lines
            .iter()
            .zip(&sources)
            .map(|(line, source)| Row::parse(line, 3, source, line_number))
            .collect::<Result<Vec<_>, _>>()?;
        let Some(first) = rows.first() else { break };

        labels.clear();
        for (row, source) in rows.iter().zip(&sources) {
            if row.record_id != first.record_id || row.cluster_key != first.cluster_key {
                return Err(LabelError::CloneMismatch {
                    line_number,
                    detail: format!(
                        "'{}' has {}/{} where '{}' has {}/{}",
                        source, row.cluster_key, row.record_id, sources[0], first.cluster_key, first.record_id
                    ),
                });
            }
            append_labels(&mut labels, row.labels.unwrap_or_default());
        }
        table.push(first.cluster_key, first.record_id, &labels)?;
    }
    table.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    fn write_files(dir: &Path, contents: &[&str]) -> Vec<PathBuf> {
        contents
            .iter()
            .enumerate()
            .map(|(i, text)| {
                let path = dir.join(format!("input_{}", i));
                fs::write(&path, text).unwrap();
                path
            })
            .collect()
    }

    fn rows(out: &[u8]) -> Vec<String> {
        String::from_utf8(out.to_vec())
            .unwrap()
            .lines()
            .skip(1)
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_combine_chunks_renumbers_across_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let chunks = write_files(dir.path(), &["A\tp1\tx,y\nA\tp2\t\n", "A\tp4\tz\nB\tp3\ty\n"]);
        let mut out = Vec::new();
        let clusters = combine_chunks(&chunks, &mut out, &JoinOptions::default()).unwrap();
        assert_eq!(clusters, 2);
        assert_eq!(
            rows(&out),
            vec!["0\tp1\tx,y\t*", "0\tp2\t\t", "0\tp4\tz\t", "1\tp3\ty\t*"]
        );
        assert!(out.starts_with(HEADER.as_bytes()));
    }

    #[test]
    fn test_combine_chunks_uniq_across_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let chunks = write_files(dir.path(), &["A\tp1\tx\n", "A\tp1\tx\nA\tp2\t\n"]);
        let opts = JoinOptions {
            uniq: true,
            ..JoinOptions::default()
        };
        let mut out = Vec::new();
        combine_chunks(&chunks, &mut out, &opts).unwrap();
        assert_eq!(rows(&out), vec!["0\tp1\tx\t*", "0\tp2\t\t"]);
    }

    #[test]
    fn test_combine_chunks_sorts_labels() {
        let dir = tempfile::tempdir().unwrap();
        let chunks = write_files(dir.path(), &["A\tp1\ty,x,y\n"]);
        let opts = JoinOptions {
            sortlabels: true,
            ..JoinOptions::default()
        };
        let mut out = Vec::new();
        combine_chunks(&chunks, &mut out, &opts).unwrap();
        assert_eq!(rows(&out), vec!["0\tp1\tx,y\t*"]);
    }

    #[test]
    fn test_placeholder_written_once_for_unlabeled_rows() {
        let dir = tempfile::tempdir().unwrap();
        let opts = JoinOptions {
            nolabel: "?".to_string(),
            sortlabels: true,
            ..JoinOptions::default()
        };
        let chunks = write_files(dir.path(), &["A\tp1\tx\nA\tp2\t\n", "B\tp3\ty\n"]);
        let mut out = Vec::new();
        combine_chunks(&chunks, &mut out, &opts).unwrap();
        assert_eq!(rows(&out), vec!["0\tp1\tx\t*", "0\tp2\t?\t", "1\tp3\ty\t*"]);

        let clones = write_files(dir.path(), &["A\tp1\tx\nA\tp2\t\nB\tp3\t\n", "A\tp1\t\nA\tp2\t\nB\tp3\ty\n"]);
        let mut out = Vec::new();
        combine_clones(&clones, &mut out, &opts).unwrap();
        assert_eq!(rows(&out), vec!["0\tp1\tx\t*", "0\tp2\t?\t", "1\tp3\ty\t*"]);
    }

    #[test]
    fn test_combine_chunks_rejects_unlabeled_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let chunks = write_files(dir.path(), &["A\tp1\tx\n", "A\tp2\n"]);
        let err = combine_chunks(&chunks, Vec::new(), &JoinOptions::default()).unwrap_err();
        assert!(matches!(err, LabelError::MalformedRow { line_number: 1, columns: 2, .. }));
    }

    #[test]
    fn test_combine_clones_joins_labels() {
        let dir = tempfile::tempdir().unwrap();
        let clones = write_files(
            dir.path(),
            &["A\tp1\tx\nA\tp2\t\nB\tp3\t\n", "A\tp1\ty\nA\tp2\t\nB\tp3\ty\n"],
        );
        let mut out = Vec::new();
        let clusters = combine_clones(&clones, &mut out, &JoinOptions::default()).unwrap();
        assert_eq!(clusters, 2);
        assert_eq!(rows(&out), vec!["0\tp1\tx,y\t*", "0\tp2\t\t", "1\tp3\ty\t*"]);
    }

    #[test]
    fn test_combine_clones_length_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let clones = write_files(dir.path(), &["A\tp1\tx\nA\tp2\t\n", "A\tp1\ty\n"]);
        let err = combine_clones(&clones, Vec::new(), &JoinOptions::default()).unwrap_err();
        assert!(matches!(err, LabelError::CloneMismatch { line_number: 2, .. }));
    }

    #[test]
    fn test_combine_clones_id_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let clones = write_files(dir.path(), &["A\tp1\tx\n", "A\tp9\ty\n"]);
        let err = combine_clones(&clones, Vec::new(), &JoinOptions::default()).unwrap_err();
        match err {
            LabelError::CloneMismatch { line_number, detail } => {
                assert_eq!(line_number, 1);
                assert!(detail.contains("p9"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_single_clone_passes_through() {
        let dir = tempfile::tempdir().unwrap();
        let clones = write_files(dir.path(), &["A\tp1\tx\n"]);
        let mut out = Vec::new();
        combine_clones(&clones, &mut out, &JoinOptions::default()).unwrap();
        assert_eq!(rows(&out), vec!["0\tp1\tx\t*"]);
    }
}
