//! Joins the `(cluster_key, record_id)` stream against a [`LabelMap`].
//!
//! Two shapes of output exist. The sequential path writes the final
//! four-column table directly. The batched path rewrites chunks as
//! three-column rows that keep the original cluster key, so that several
//! partial maps can be applied one after another and the global cluster
//! numbering is done once by the combiner.

use crate::config::JoinOptions;
use crate::file_handler::tmp_path;
use crate::label_map::LabelMap;
use crate::LabelError;
use itertools::Itertools;
use std::borrow::Cow;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

pub const HEADER: &str = "cluster_id\trecord_id\tlabels\tis_rep\n";

/// Marker written in the last column of a cluster's first row.
pub const REPRESENTATIVE_MARKER: &str = "*";

/// One parsed input row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Row<'a> {
    pub cluster_key: &'a str,
    pub record_id: &'a str,
    pub labels: Option<&'a str>,
}

impl<'a> Row<'a> {
    /// Split a line (without terminator) expecting exactly `columns` fields.
    pub fn parse(line: &'a str, columns: usize, source: &str, line_number: usize) -> Result<Self, LabelError> {
        let mut fields = line.split('\t');
        let found = line.split('\t').count();
        if found != columns {
            return Err(LabelError::MalformedRow {
                source: source.to_string(),
                line_number,
                columns: found,
                line: line.to_string(),
            });
        }
        let cluster_key = fields.next().unwrap_or_default();
        let record_id = fields.next().unwrap_or_default();
        let labels = fields.next();
        Ok(Row {
            cluster_key,
            record_id,
            labels,
        })
    }
}

/// Assigns dense cluster numbers to runs of equal cluster keys.
#[derive(Debug, Default)]
pub struct Renumberer {
    previous: Option<String>,
    clusters: usize,
}

impl Renumberer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number for a row with `cluster_key`, and whether the row
    /// opens a new cluster.
    pub fn assign(&mut self, cluster_key: &str) -> (usize, bool) {
        let is_new = self.previous.as_deref() != Some(cluster_key);
        if is_new {
            self.clusters += 1;
            match &mut self.previous {
                Some(prev) => {
                    prev.clear();
                    prev.push_str(cluster_key);
                }
                None => self.previous = Some(cluster_key.to_string()),
            }
        }
        (self.clusters - 1, is_new)
    }

    /// Clusters seen so far.
    pub fn clusters(&self) -> usize {
        self.clusters
    }
}

/// One-row lookback filter on `(cluster_key, record_id)`.
#[derive(Debug, Default)]
pub struct AdjacentDedup {
    previous: Option<(String, String)>,
}

impl AdjacentDedup {
    /// True if the row repeats the one before it.
    pub fn is_repeat(&mut self, cluster_key: &str, record_id: &str) -> bool {
        if let Some((key, id)) = &self.previous {
            if key == cluster_key && id == record_id {
                return true;
            }
        }
        self.previous = Some((cluster_key.to_string(), record_id.to_string()));
        false
    }
}

/// Sorted, duplicate-free form of a comma-joined label set.
pub fn sort_labels(labels: &str) -> Cow<'_, str> {
    if !labels.contains(',') {
        return Cow::Borrowed(labels);
    }
    Cow::Owned(labels.split(',').sorted_unstable().dedup().join(","))
}

/// Append `more` to `labels` with a comma, skipping empty contributions.
pub fn append_labels(labels: &mut String, more: &str) {
    if more.is_empty() {
        return;
    }
    if !labels.is_empty() {
        labels.push(',');
    }
    labels.push_str(more);
}

/// Write one row of the final table.
pub fn write_output_row<W: Write>(
    out: &mut W,
    sequence: usize,
    record_id: &str,
    labels: &str,
    is_representative: bool,
) -> std::io::Result<()> {
    let marker = if is_representative { REPRESENTATIVE_MARKER } else { "" };
    writeln!(out, "{}\t{}\t{}\t{}", sequence, record_id, labels, marker)
}

fn trim_newline(line: &str) -> &str {
    line.strip_suffix('\n').unwrap_or(line)
}

/// Reads lines into a reusable buffer, tracking line numbers.
struct LineSource<R> {
    reader: R,
    buffer: String,
    line_number: usize,
}

impl<R: BufRead> LineSource<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: String::new(),
            line_number: 0,
        }
    }

    fn next_line(&mut self) -> Result<Option<&str>, LabelError> {
        self.buffer.clear();
        if self.reader.read_line(&mut self.buffer)? == 0 {
            return Ok(None);
        }
        self.line_number += 1;
        Ok(Some(trim_newline(&self.buffer)))
    }
}

/// Label a two-column stream in one pass and write the final table.
///
/// Returns the number of clusters written.
pub fn label_records<R: BufRead, W: Write>(
    input: R,
    output: W,
    map: &LabelMap,
    opts: &JoinOptions,
    source: &str,
) -> Result<usize, LabelError> {
    let mut out = BufWriter::new(output);
    out.write_all(HEADER.as_bytes())?;

    let mut lines = LineSource::new(input);
    let mut renumber = Renumberer::new();
    let mut dedup = AdjacentDedup::default();

    loop {
        let line_number = lines.line_number + 1;
        let Some(line) = lines.next_line()? else { break };
        let row = Row::parse(line, 2, source, line_number)?;
        if opts.uniq && dedup.is_repeat(row.cluster_key, row.record_id) {
            continue;
        }
        let labels = map.get(row.record_id).unwrap_or(opts.nolabel.as_str());
        let labels = if opts.sortlabels { sort_labels(labels) } else { Cow::Borrowed(labels) };
        let (sequence, is_new) = renumber.assign(row.cluster_key);
        write_output_row(&mut out, sequence, row.record_id, &labels, is_new)?;
    }

    out.flush()?;
    Ok(renumber.clusters())
}

/// Counts reported by [`relabel_rows`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelabelStats {
    pub rows_in: usize,
    pub rows_out: usize,
    pub matched: usize,
    /// The input already carried labels from an earlier batch.
    pub was_labeled: bool,
}

/// Apply a partial map to a chunk, producing three-column rows.
///
/// Ids missing from `map` contribute nothing; the `nolabel` placeholder is
/// only written by the combiner once every batch has been applied.
///
/// The first row decides the shape: two columns for a fresh chunk (the only
/// case where `uniq` applies) or three for a chunk some batch already
/// labeled, whose existing labels are extended.
pub fn relabel_rows<R: BufRead, W: Write>(
    input: R,
    output: W,
    map: &LabelMap,
    opts: &JoinOptions,
    source: &str,
) -> Result<RelabelStats, LabelError> {
    let mut out = BufWriter::new(output);
    let mut lines = LineSource::new(input);
    let mut stats = RelabelStats::default();
    let mut dedup = AdjacentDedup::default();
    let mut columns: Option<usize> = None;
    let mut labels = String::new();

    loop {
        let line_number = lines.line_number + 1;
        let Some(line) = lines.next_line()? else { break };
        let expected = *columns.get_or_insert_with(|| line.split('\t').count());
        if expected != 2 && expected != 3 {
            return Err(LabelError::MalformedRow {
                source: source.to_string(),
                line_number,
                columns: expected,
                line: line.to_string(),
            });
        }
        let row = Row::parse(line, expected, source, line_number)?;
        stats.rows_in += 1;

        if expected == 2 && opts.uniq && dedup.is_repeat(row.cluster_key, row.record_id) {
            continue;
        }

        let found = map.get(row.record_id);
        if found.is_some() {
            stats.matched += 1;
        }

        labels.clear();
        if let Some(existing) = row.labels {
            labels.push_str(existing);
        }
        append_labels(&mut labels, found.unwrap_or_default());

        writeln!(out, "{}\t{}\t{}", row.cluster_key, row.record_id, labels)?;
        stats.rows_out += 1;
    }

    stats.was_labeled = columns == Some(3);
    out.flush()?;
    Ok(stats)
}

/// Rewrite the chunk at `path` through `<path>_tmp`, then replace it.
pub fn relabel_in_place(path: &Path, map: &LabelMap, opts: &JoinOptions) -> Result<RelabelStats, LabelError> {
    let tmp = tmp_path(path);
    let source = path.display().to_string();
    let result = (|| {
        let input = BufReader::new(File::open(path)?);
        let output = File::create(&tmp)?;
        let stats = relabel_rows(input, &output, map, opts, &source)?;
        output.sync_data()?;
        Ok::<_, LabelError>(stats)
    })();

    match result {
        Ok(stats) => {
            fs::rename(&tmp, path)?;
            Ok(stats)
        }
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            Err(e)
        }
    }
}
