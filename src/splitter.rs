use crate::LabelError;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A line-aligned slice of the input file, materialized at `path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    pub path: PathBuf,
    pub start: u64,
    pub len: u64,
}

/// Byte range of one chunk before it is written out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub len: u64,
}

impl ByteRange {
    pub fn end(&self) -> u64 {
        self.start + self.len
    }
}

fn file_size(path: &Path) -> Result<u64, LabelError> {
    let size = fs::metadata(path)?.len();
    if size == 0 {
        return Err(LabelError::EmptyInput(path.to_path_buf()));
    }
    Ok(size)
}

/// End offset of the line that contains byte `position - 1`.
fn next_line_end<R: BufRead + Seek>(reader: &mut R, file_size: u64, position: u64) -> io::Result<u64> {
    if position >= file_size {
        return Ok(file_size);
    }
    if position == 0 {
        return Ok(0);
    }
    reader.seek(SeekFrom::Start(position - 1))?;
    let mut skipped = Vec::new();
    let read = reader.read_until(b'\n', &mut skipped)?;
    Ok(position - 1 + read as u64)
}

/// Ranges of roughly `split_size` bytes that never break a line.
///
/// Ranges partition the file exactly; the last one holds whatever remains.
pub fn compute_split_positions(path: &Path, split_size: u64) -> Result<Vec<ByteRange>, LabelError> {
    if split_size == 0 {
        return Err(LabelError::InvalidConfig("split size must be positive".to_string()));
    }
    let size = file_size(path)?;
    let mut reader = BufReader::new(File::open(path)?);

    let mut ranges = Vec::new();
    let mut start = 0u64;
    while start < size {
        let end = next_line_end(&mut reader, size, start + split_size)?;
        ranges.push(ByteRange {
            start,
            len: end - start,
        });
        start = end;
    }
    Ok(ranges)
}

/// Split `path` into chunk files named `prefix` + zero-padded index.
pub fn split_file(path: &Path, split_size: u64, prefix: &str) -> Result<Vec<FileChunk>, LabelError> {
    let ranges = compute_split_positions(path, split_size)?;
    let width = ranges.len().to_string().len();

    let mut input = File::open(path)?;
    let mut chunks = Vec::with_capacity(ranges.len());
    for (index, range) in ranges.iter().enumerate() {
        let chunk_path = PathBuf::from(format!("{}{:0width$}", prefix, index, width = width));
        input.seek(SeekFrom::Start(range.start))?;
        let mut writer = BufWriter::new(File::create(&chunk_path)?);
        let copied = io::copy(&mut (&mut input).take(range.len), &mut writer)?;
        writer.flush()?;
        if copied != range.len {
            return Err(LabelError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("short copy into '{}'", chunk_path.display()),
            )));
        }
        chunks.push(FileChunk {
            path: chunk_path,
            start: range.start,
            len: range.len,
        });
    }
    Ok(chunks)
}

/// Write `copies` byte-identical copies of `path` named `prefix` + index.
pub fn clone_file(path: &Path, copies: usize, prefix: &str) -> Result<Vec<FileChunk>, LabelError> {
    let size = file_size(path)?;
    let paths: Vec<PathBuf> = (0..copies).map(|i| PathBuf::from(format!("{}{}", prefix, i))).collect();

    let mut writers = paths
        .iter()
        .map(|p| File::create(p).map(BufWriter::new))
        .collect::<Result<Vec<_>, _>>()?;

    let mut input = File::open(path)?;
    let mut buffer = vec![0u8; crate::record_reader::READ_BUFFER_SIZE];
    loop {
        let read = input.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        for writer in writers.iter_mut() {
            writer.write_all(&buffer[..read])?;
        }
    }
    for writer in writers.iter_mut() {
        writer.flush()?;
    }

    Ok(paths
        .into_iter()
        .map(|path| FileChunk { path, start: 0, len: size })
        .collect())
}

/// `ceil(file_size / chunks)`.
pub fn calculate_blocksize(path: &Path, chunks: usize) -> Result<u64, LabelError> {
    let size = file_size(path)?;
    let chunks = chunks.max(1) as u64;
    Ok(size.div_ceil(chunks))
}
