//! # Disk queue
//!
//! A durable, segmented, append-only queue of sequence-numbered records. Records are appended to
//! numbered segment files (`data-<n>.log`) and read back in order; the highest delivered sequence
//! number is persisted separately in `last_ack_version` and fully acknowledged segments are
//! deleted.
//!
//! # Constraints
//!
//! A [`DiskQueue`] must be the only owner of its directory. It supports exactly one writer and one
//! reader, which must share it through a single lock when they live on different threads.

use std::{
    collections::BTreeMap,
    fs,
    marker::PhantomData,
    ops::Bound,
    path::{Path, PathBuf},
};

use chrono::Utc;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::{debug, info, warn};

mod ack;
mod frame;
mod segment;

use ack::AckFile;
pub use frame::FrameError;
pub use segment::SegmentId;
use segment::{
    SegmentReader, SegmentWriter, build_segment_path, parse_segment_file_name, scan_segment,
};

/// Default upper bound for the size of one segment file.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unable to create queue directory {path:?}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to read queue directory {path:?}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to open segment {path:?}: {source}")]
    OpenSegment {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to write segment {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to delete segment {path:?}: {source}")]
    DeleteSegment {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to access acknowledgment file {path:?}: {source}")]
    AckFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed record in {path:?} at offset {offset}: {reason}")]
    MalformedRecord {
        path: PathBuf,
        offset: u64,
        reason: String,
    },

    #[error("unable to serialize record: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("queue is closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// One record read back from the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueElement<T> {
    pub obj: T,
    /// Sequence number assigned by [`DiskQueue::put`].
    pub ver: u64,
    /// Size of the framed record on disk.
    pub size: u64,
    /// Milliseconds since the unix epoch at which the record was written.
    pub at: i64,
}

#[derive(Serialize)]
struct RecordRef<'a, T> {
    obj: &'a T,
    version: u64,
    at: i64,
}

#[derive(Deserialize)]
struct Record<T> {
    obj: T,
    version: u64,
    at: i64,
}

/// The durable queue. See the [crate docs](crate) for the layout on disk.
#[derive(Debug)]
pub struct DiskQueue<T> {
    dir: PathBuf,
    max_file_size: u64,
    /// Every segment still on disk, keyed by the first sequence number it holds.
    segments: BTreeMap<SegmentId, PathBuf>,
    writer: Option<SegmentWriter>,
    read_segment: SegmentId,
    reader: Option<SegmentReader>,
    ack_file: AckFile,
    last_put: u64,
    last_read: u64,
    last_ack: u64,
    _records: PhantomData<fn() -> T>,
}

impl<T> DiskQueue<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Open the queue in `dir`, resuming from whatever a previous run left behind.
    ///
    /// A partially written record at the end of the newest segment is cut off, since it can
    /// only come from a crash in the middle of a write.
    pub fn open(dir: impl Into<PathBuf>, max_file_size: u64) -> Result<Self> {
        let dir = dir.into();
        info!(queue_dir = ?dir, max_file_size, "opening disk queue");

        fs::create_dir_all(&dir).map_err(|source| Error::CreateDir {
            path: dir.clone(),
            source,
        })?;

        let mut ack_file = AckFile::open(&dir)?;
        let last_ack = ack_file.read()?;
        let mut segments = list_segments(&dir)?;

        let (writer, last_put) = match segments.keys().next_back().copied() {
            None => {
                let id = SegmentId::new(last_ack + 1);
                let writer = SegmentWriter::create(&dir, id)?;
                segments.insert(id, build_segment_path(&dir, id));
                (writer, last_ack)
            }
            Some(id) => {
                let scan = scan_segment(&dir, id)?;
                if scan.trailing_bytes > 0 {
                    warn!(
                        segment = %id,
                        valid_records = scan.records,
                        dropped_bytes = scan.trailing_bytes,
                        "truncating partially written record at the end of segment"
                    );
                }
                let writer = SegmentWriter::open_at(&dir, id, scan.valid_len)?;
                let last_put = scan
                    .last_version
                    .unwrap_or_else(|| id.get().saturating_sub(1))
                    .max(last_ack);
                (writer, last_put)
            }
        };

        let read_segment = segments
            .range(..=SegmentId::new(last_ack + 1))
            .next_back()
            .or_else(|| segments.iter().next())
            .map(|(id, _)| *id)
            .unwrap_or_else(|| writer.id());

        let mut queue = Self {
            dir,
            max_file_size,
            segments,
            writer: Some(writer),
            read_segment,
            reader: None,
            ack_file,
            last_put,
            last_read: last_ack,
            last_ack,
            _records: PhantomData,
        };
        queue.delete_acknowledged_segments()?;

        debug!(
            last_put = queue.last_put,
            last_ack = queue.last_ack,
            segments = queue.segments.len(),
            "disk queue opened"
        );
        Ok(queue)
    }

    /// Append a record, returning the sequence number assigned to it.
    pub fn put(&mut self, obj: &T) -> Result<u64> {
        let version = self.last_put + 1;
        let payload = serde_json::to_vec(&RecordRef {
            obj,
            version,
            at: Utc::now().timestamp_millis(),
        })
        .map_err(Error::Serialize)?;
        let record_size = frame::frame_len(payload.len());

        let writer = self.writer.as_mut().ok_or(Error::Closed)?;
        if writer.size() > 0 && writer.size() + record_size > self.max_file_size {
            self.roll_segment(SegmentId::new(version))?;
        }

        self.writer
            .as_mut()
            .ok_or(Error::Closed)?
            .append(&payload)?;
        self.last_put = version;
        Ok(version)
    }

    fn roll_segment(&mut self, id: SegmentId) -> Result<()> {
        if let Some(old) = self.writer.as_mut() {
            old.sync()?;
        }
        let writer = SegmentWriter::create(&self.dir, id)?;
        debug!(segment = %id, "rolled over to new segment");
        self.segments.insert(id, build_segment_path(&self.dir, id));
        self.writer = Some(writer);
        Ok(())
    }

    /// The next unread record, or `None` when the reader has caught up with the writer.
    pub fn get(&mut self) -> Result<Option<QueueElement<T>>> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush_buffer()?;
        }

        loop {
            let Some((payload, size)) = self.read_next_payload()? else {
                match self.next_segment_after(self.read_segment) {
                    Some(next) => {
                        debug!(from = %self.read_segment, to = %next, "reader moving to next segment");
                        self.reader = None;
                        self.read_segment = next;
                        continue;
                    }
                    None => return Ok(None),
                }
            };

            let record: Record<T> = match serde_json::from_slice(&payload) {
                Ok(record) => record,
                Err(e) => return Err(self.undecodable_record(size, e)),
            };

            if record.version <= self.last_read {
                continue;
            }
            if record.version > self.last_read + 1 {
                warn!(
                    last_acknowledged = self.last_ack,
                    next = record.version,
                    "possible data loss, records are missing from the queue"
                );
            }
            self.last_read = record.version;

            return Ok(Some(QueueElement {
                obj: record.obj,
                ver: record.version,
                size,
                at: record.at,
            }));
        }
    }

    fn read_next_payload(&mut self) -> Result<Option<(Vec<u8>, u64)>> {
        let reader = match self.reader.as_mut() {
            Some(reader) => reader,
            None => self
                .reader
                .insert(SegmentReader::open(&self.dir, self.read_segment)?),
        };
        reader.next_record()
    }

    fn undecodable_record(&self, size: u64, e: serde_json::Error) -> Error {
        let (path, offset) = match self.reader.as_ref() {
            Some(reader) => (
                reader.path().to_path_buf(),
                reader.offset().saturating_sub(size),
            ),
            None => (build_segment_path(&self.dir, self.read_segment), 0),
        };
        Error::MalformedRecord {
            path,
            offset,
            reason: e.to_string(),
        }
    }

    fn next_segment_after(&self, id: SegmentId) -> Option<SegmentId> {
        self.segments
            .range((Bound::Excluded(id), Bound::Unbounded))
            .next()
            .map(|(id, _)| *id)
    }

    /// Up to `max_n` records, stopping early when the queue runs dry.
    pub fn get_batch(&mut self, max_n: usize) -> Result<Vec<QueueElement<T>>> {
        let mut batch = Vec::with_capacity(max_n.min(1024));
        while batch.len() < max_n {
            match self.get()? {
                Some(element) => batch.push(element),
                None => break,
            }
        }
        Ok(batch)
    }

    /// Persist that every record up to and including `version` has been delivered, and delete
    /// segments that hold nothing newer.
    pub fn ack(&mut self, version: u64) -> Result<()> {
        if version <= self.last_ack {
            return Ok(());
        }
        self.ack_file.write(version)?;
        self.last_ack = version;
        self.delete_acknowledged_segments()
    }

    fn delete_acknowledged_segments(&mut self) -> Result<()> {
        // a segment only holds records below the first record of its successor
        let ids: Vec<SegmentId> = self.segments.keys().copied().collect();
        for pair in ids.windows(2) {
            let (id, next) = (pair[0], pair[1]);
            if next.get() > self.last_ack + 1 {
                break;
            }
            self.delete_segment(id, next)?;
        }
        Ok(())
    }

    fn delete_segment(&mut self, id: SegmentId, next: SegmentId) -> Result<()> {
        let Some(path) = self.segments.remove(&id) else {
            return Ok(());
        };
        if self.read_segment == id {
            self.reader = None;
            self.read_segment = next;
        }
        debug!(segment = %id, ?path, "deleting acknowledged segment");
        fs::remove_file(&path).map_err(|source| Error::DeleteSegment { path, source })
    }

    /// Force written records to durable storage, without acknowledging anything.
    pub fn flush(&mut self) -> Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.sync(),
            None => Ok(()),
        }
    }

    /// Whether the reader has fallen far enough behind that a sleeping consumer should be woken.
    ///
    /// True when the writer is more than one segment ahead of the reader, or one segment ahead and
    /// already half way through it.
    pub fn is_overflowing(&self) -> bool {
        let Some(writer) = self.writer.as_ref() else {
            return false;
        };
        let segments_ahead = self
            .segments
            .range((Bound::Excluded(self.read_segment), Bound::Unbounded))
            .count();
        segments_ahead > 1 || (segments_ahead == 1 && writer.size() >= self.max_file_size / 2)
    }

    /// Number of records written but not yet acknowledged.
    pub fn size(&self) -> u64 {
        self.last_put - self.last_ack
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn last_put_version(&self) -> u64 {
        self.last_put
    }

    pub fn last_ack_version(&self) -> u64 {
        self.last_ack
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Flush and release the segment files. Further writes fail with [`Error::Closed`].
    pub fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.sync()?;
        }
        self.reader = None;
        Ok(())
    }

    /// Remove the queue directory if everything written has been acknowledged. Returns whether it
    /// was removed.
    pub fn cleanup_if_empty(&mut self) -> Result<bool> {
        if !self.is_empty() {
            return Ok(false);
        }
        self.close()?;
        info!(queue_dir = ?self.dir, "removing fully acknowledged disk queue");
        fs::remove_dir_all(&self.dir).map_err(|source| Error::DeleteSegment {
            path: self.dir.clone(),
            source,
        })?;
        self.segments.clear();
        Ok(true)
    }
}

fn list_segments(dir: &Path) -> Result<BTreeMap<SegmentId, PathBuf>> {
    let read_dir_err = |source| Error::ReadDir {
        path: dir.to_path_buf(),
        source,
    };

    let mut segments = BTreeMap::new();
    for entry in fs::read_dir(dir).map_err(read_dir_err)? {
        let entry = entry.map_err(read_dir_err)?;
        if !entry.file_type().map_err(read_dir_err)?.is_file() {
            continue;
        }
        let Some(id) = entry.file_name().to_str().and_then(parse_segment_file_name) else {
            continue;
        };
        segments.insert(id, entry.path());
    }
    Ok(segments)
}
