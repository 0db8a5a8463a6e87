//! Readers that pull header records out of a source file.
//!
//! A record is a line beginning with the configured marker. Three strategies
//! exist with the same observable output and different memory/IO trade-offs:
//! streaming lines, slurping the whole file, or reading fixed-size buffers.

use crate::config::{IdRule, ReadMethod};
use crate::LabelError;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

/// Buffer size used by [`ChunkedReader`].
pub const READ_BUFFER_SIZE: usize = 1024 * 1024;

pub trait RecordReader {
    /// Next header record, without its line terminator.
    fn next_record(&mut self) -> Result<Option<String>, LabelError>;
}

/// Open `path` with the reader selected by `method`.
pub fn open_reader(
    path: &Path,
    method: ReadMethod,
    marker: char,
) -> Result<Box<dyn RecordReader>, LabelError> {
    let reader: Box<dyn RecordReader> = match method {
        ReadMethod::Lines => Box::new(LineReader::open(path, marker)?),
        ReadMethod::Full => Box::new(WholeFileReader::open(path, marker)?),
        ReadMethod::Chunks => Box::new(ChunkedReader::open(path, marker, READ_BUFFER_SIZE)?),
    };
    Ok(reader)
}

/// Cut the record id out of a header record, e.g. `>p1 desc` -> `p1`.
pub fn extract_id<'a>(record: &'a str, rule: &IdRule) -> &'a str {
    let body = record.strip_prefix(rule.marker).unwrap_or(record);
    body.split(rule.delimiter).next().unwrap_or(body)
}

fn trim_line_end(line: &str) -> &str {
    let line = line.strip_suffix('\n').unwrap_or(line);
    line.strip_suffix('\r').unwrap_or(line)
}

pub struct LineReader {
    reader: BufReader<File>,
    marker: char,
    line: String,
}

impl LineReader {
    pub fn open(path: &Path, marker: char) -> Result<Self, LabelError> {
        let file = File::open(path)?;
        Ok(Self {
            reader: BufReader::new(file),
            marker,
            line: String::new(),
        })
    }
}

impl RecordReader for LineReader {
    fn next_record(&mut self) -> Result<Option<String>, LabelError> {
        loop {
            self.line.clear();
            if self.reader.read_line(&mut self.line)? == 0 {
                return Ok(None);
            }
            if self.line.starts_with(self.marker) {
                return Ok(Some(trim_line_end(&self.line).to_string()));
            }
        }
    }
}

pub struct WholeFileReader {
    content: String,
    position: usize,
    marker: char,
}

impl WholeFileReader {
    pub fn open(path: &Path, marker: char) -> Result<Self, LabelError> {
        Ok(Self {
            content: fs::read_to_string(path)?,
            position: 0,
            marker,
        })
    }
}

impl RecordReader for WholeFileReader {
    fn next_record(&mut self) -> Result<Option<String>, LabelError> {
        while self.position < self.content.len() {
            let rest = &self.content[self.position..];
            let end = rest.find('\n').map(|i| i + 1).unwrap_or(rest.len());
            let line = &rest[..end];
            self.position += end;
            if line.starts_with(self.marker) {
                return Ok(Some(trim_line_end(line).to_string()));
            }
        }
        Ok(None)
    }
}

/// Reads `buffer_size` bytes at a time and only hands out complete lines;
/// the unfinished tail of each buffer is carried over to the next read.
pub struct ChunkedReader {
    file: File,
    /// Read buffer, allocated once and reused by every refill.
    buffer: Vec<u8>,
    pending: Vec<u8>,
    lines: std::collections::VecDeque<String>,
    exhausted: bool,
    marker: char,
}

impl ChunkedReader {
    pub fn open(path: &Path, marker: char, buffer_size: usize) -> Result<Self, LabelError> {
        Ok(Self {
            file: File::open(path)?,
            buffer: vec![0u8; buffer_size.max(1)],
            pending: Vec::new(),
            lines: std::collections::VecDeque::new(),
            exhausted: false,
            marker,
        })
    }

    fn fill(&mut self) -> Result<(), LabelError> {
        while self.lines.is_empty() && !self.exhausted {
            let read = self.file.read(&mut self.buffer)?;
            if read == 0 {
                self.exhausted = true;
                if !self.pending.is_empty() {
                    let tail = std::mem::take(&mut self.pending);
                    self.lines.push_back(decode_line(tail)?);
                }
                break;
            }
            self.pending.extend_from_slice(&self.buffer[..read]);

            let Some(last_newline) = self.pending.iter().rposition(|b| *b == b'\n') else {
                continue;
            };
            let rest = self.pending.split_off(last_newline + 1);
            let complete = std::mem::replace(&mut self.pending, rest);
            for raw in complete.split(|b| *b == b'\n') {
                if !raw.is_empty() {
                    self.lines.push_back(decode_line(raw.to_vec())?);
                }
            }
        }
        Ok(())
    }
}

fn decode_line(raw: Vec<u8>) -> Result<String, LabelError> {
    let text = String::from_utf8(raw)
        .map_err(|e| LabelError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
    Ok(trim_line_end(&text).to_string())
}

impl RecordReader for ChunkedReader {
    fn next_record(&mut self) -> Result<Option<String>, LabelError> {
        loop {
            if self.lines.is_empty() {
                self.fill()?;
            }
            match self.lines.pop_front() {
                None => return Ok(None),
                Some(line) if line.starts_with(self.marker) => return Ok(Some(line)),
                Some(_) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FASTA: &str = ">p1 first protein\nMKV\nLLA\n>p2\nMMM\n>p3 third\r\nAAA";

    fn collect(mut reader: Box<dyn RecordReader>) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(record) = reader.next_record().unwrap() {
            out.push(record);
        }
        out
    }

    #[test]
    fn test_all_read_methods_agree() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.fa");
        fs::write(&path, FASTA).unwrap();

        let expected = vec![
            ">p1 first protein".to_string(),
            ">p2".to_string(),
            ">p3 third".to_string(),
        ];
        for method in [ReadMethod::Lines, ReadMethod::Full, ReadMethod::Chunks] {
            let reader = open_reader(&path, method, '>').unwrap();
            assert_eq!(collect(reader), expected, "method {:?}", method);
        }
    }

    #[test]
    fn test_chunked_reader_tiny_buffer_keeps_lines_whole() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.fa");
        fs::write(&path, FASTA).unwrap();

        let reader = Box::new(ChunkedReader::open(&path, '>', 3).unwrap());
        assert_eq!(
            collect(reader),
            vec![">p1 first protein", ">p2", ">p3 third"]
        );
    }

    #[test]
    fn test_chunked_reader_reuses_its_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.fa");
        fs::write(&path, FASTA).unwrap();

        let mut reader = ChunkedReader::open(&path, '>', 4).unwrap();
        let start = reader.buffer.as_ptr();
        let mut headers = 0;
        while reader.next_record().unwrap().is_some() {
            headers += 1;
        }
        assert_eq!(headers, 3);
        assert_eq!(reader.buffer.len(), 4);
        assert_eq!(reader.buffer.as_ptr(), start);
    }

    #[test]
    fn test_header_without_trailing_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("y.fa");
        fs::write(&path, "AAA\n>last").unwrap();
        for method in [ReadMethod::Lines, ReadMethod::Full, ReadMethod::Chunks] {
            let reader = open_reader(&path, method, '>').unwrap();
            assert_eq!(collect(reader), vec![">last"]);
        }
    }

    #[test]
    fn test_empty_file_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.fa");
        fs::write(&path, "").unwrap();
        for method in [ReadMethod::Lines, ReadMethod::Full, ReadMethod::Chunks] {
            let reader = open_reader(&path, method, '>').unwrap();
            assert!(collect(reader).is_empty());
        }
    }

    #[test]
    fn test_extract_id() {
        let rule = IdRule::default();
        assert_eq!(extract_id(">p1 desc", &rule), "p1");
        assert_eq!(extract_id(">sp|P12345|NAME", &rule), "sp|P12345|NAME");
        assert_eq!(extract_id(">", &rule), "");

        let pipe = IdRule {
            marker: '>',
            delimiter: '|',
        };
        assert_eq!(extract_id(">sp|P12345|NAME", &pipe), "sp");
    }
}
