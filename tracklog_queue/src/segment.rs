use std::{
    fmt::Display,
    fs::{File, OpenOptions},
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use serde::Deserialize;

use crate::{
    Error, Result,
    frame::{FrameError, read_frame, write_frame},
};

const SEGMENT_FILE_PREFIX: &str = "data-";
const SEGMENT_FILE_EXTENSION: &str = "log";

/// Segments are identified by the sequence number of the first record written into them, which
/// also gives the order they must be read in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentId(u64);

impl SegmentId {
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl Display for SegmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub(crate) fn build_segment_path(dir: impl Into<PathBuf>, id: SegmentId) -> PathBuf {
    let mut path = dir.into();
    path.push(format!("{SEGMENT_FILE_PREFIX}{id}.{SEGMENT_FILE_EXTENSION}"));
    path
}

/// Parse a segment id out of a file name, `None` for files that are not segments.
pub(crate) fn parse_segment_file_name(name: &str) -> Option<SegmentId> {
    name.strip_prefix(SEGMENT_FILE_PREFIX)?
        .strip_suffix(SEGMENT_FILE_EXTENSION)?
        .strip_suffix('.')?
        .parse()
        .ok()
        .map(SegmentId::new)
}

/// Sequential reader over the records of one segment file.
#[derive(Debug)]
pub(crate) struct SegmentReader {
    path: PathBuf,
    file: BufReader<File>,
    offset: u64,
}

impl SegmentReader {
    pub(crate) fn open(dir: &Path, id: SegmentId) -> Result<Self> {
        let path = build_segment_path(dir, id);
        let file = File::open(&path).map_err(|source| Error::OpenSegment {
            path: path.clone(),
            source,
        })?;
        Ok(Self {
            path,
            file: BufReader::new(file),
            offset: 0,
        })
    }

    /// Next record payload and its framed size, `None` at the end of the written data.
    pub(crate) fn next_record(&mut self) -> Result<Option<(Vec<u8>, u64)>> {
        match read_frame(&mut self.file) {
            Ok(Some(payload)) => {
                let size = crate::frame::frame_len(payload.len());
                self.offset += size;
                Ok(Some((payload, size)))
            }
            Ok(None) => Ok(None),
            Err(source) => Err(Error::MalformedRecord {
                path: self.path.clone(),
                offset: self.offset,
                reason: source.to_string(),
            }),
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn offset(&self) -> u64 {
        self.offset
    }
}

/// Appending writer for the segment currently receiving records.
#[derive(Debug)]
pub(crate) struct SegmentWriter {
    id: SegmentId,
    path: PathBuf,
    file: BufWriter<File>,
    size: u64,
    unflushed: bool,
}

impl SegmentWriter {
    pub(crate) fn create(dir: &Path, id: SegmentId) -> Result<Self> {
        Self::open_at(dir, id, 0)
    }

    /// Open an existing segment for appending, discarding anything past `valid_len`.
    pub(crate) fn open_at(dir: &Path, id: SegmentId, valid_len: u64) -> Result<Self> {
        let path = build_segment_path(dir, id);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| Error::OpenSegment {
                path: path.clone(),
                source,
            })?;
        file.set_len(valid_len)?;
        Ok(Self {
            id,
            path,
            file: BufWriter::new(file),
            size: valid_len,
            unflushed: false,
        })
    }

    pub(crate) fn id(&self) -> SegmentId {
        self.id
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn append(&mut self, payload: &[u8]) -> Result<u64> {
        let written = write_frame(&mut self.file, payload).map_err(|e| match e {
            FrameError::Io(source) => Error::Write {
                path: self.path.clone(),
                source,
            },
            other => Error::MalformedRecord {
                path: self.path.clone(),
                offset: self.size,
                reason: other.to_string(),
            },
        })?;
        self.size += written;
        self.unflushed = true;
        Ok(written)
    }

    /// Hand buffered records to the OS so readers of the same file can see them.
    pub(crate) fn flush_buffer(&mut self) -> Result<()> {
        if self.unflushed {
            self.file.flush().map_err(|source| Error::Write {
                path: self.path.clone(),
                source,
            })?;
            self.unflushed = false;
        }
        Ok(())
    }

    /// Flush and fsync the segment.
    pub(crate) fn sync(&mut self) -> Result<()> {
        self.flush_buffer()?;
        self.file
            .get_ref()
            .sync_data()
            .map_err(|source| Error::Write {
                path: self.path.clone(),
                source,
            })
    }
}

/// What a scan of an existing segment found.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SegmentScan {
    /// Length of the prefix made of complete, decodable records.
    pub(crate) valid_len: u64,
    pub(crate) records: u64,
    pub(crate) last_version: Option<u64>,
    /// Bytes after `valid_len`, i.e. a partial or corrupt tail.
    pub(crate) trailing_bytes: u64,
}

#[derive(Deserialize)]
struct VersionOnly {
    version: u64,
}

/// Walk a segment, stopping at the first record that is incomplete or does not decode.
pub(crate) fn scan_segment(dir: &Path, id: SegmentId) -> Result<SegmentScan> {
    let mut reader = SegmentReader::open(dir, id)?;
    let file_len = reader.file.get_ref().metadata()?.len();
    let mut scan = SegmentScan::default();

    loop {
        match reader.next_record() {
            Ok(Some((payload, _))) => match serde_json::from_slice::<VersionOnly>(&payload) {
                Ok(record) => {
                    scan.records += 1;
                    scan.last_version = Some(record.version);
                    scan.valid_len = reader.offset();
                }
                Err(_) => break,
            },
            Ok(None) => break,
            Err(Error::MalformedRecord { .. }) => break,
            Err(e) => return Err(e),
        }
    }

    scan.trailing_bytes = file_len.saturating_sub(scan.valid_len);
    Ok(scan)
}
