//! Assembly of queued records into bounded, merged batches.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};
use tracklog_backend::{BackendError, RemoteBackend, resolve_copy};
use tracklog_ops::Operation;
use tracklog_preprocessor::{AccumulatedOperations, MetadataInconsistency, OperationsPreprocessor};
use tracklog_queue::{DiskQueue, QueueElement};

use crate::Result;

/// Upper bounds for a single batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_points_per_batch: usize,
    pub max_attributes_in_batch: usize,
    pub max_points_per_attribute: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_points_per_batch: 100_000,
            max_attributes_in_batch: 1_000,
            max_points_per_attribute: 10_000,
        }
    }
}

/// Where the batcher reads records from.
pub trait RecordSource: Send {
    fn next_record(&mut self) -> tracklog_queue::Result<Option<QueueElement<Operation>>>;
}

impl RecordSource for DiskQueue<Operation> {
    fn next_record(&mut self) -> tracklog_queue::Result<Option<QueueElement<Operation>>> {
        self.get()
    }
}

/// A queue shared with a producer, locked once per record.
impl RecordSource for Arc<Mutex<DiskQueue<Operation>>> {
    fn next_record(&mut self) -> tracklog_queue::Result<Option<QueueElement<Operation>>> {
        self.lock().get()
    }
}

/// A merged batch ready to be sent.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub operations: AccumulatedOperations,
    /// Records that were read but could not be turned into operations.
    pub dropped: usize,
    /// Highest record version covered by this batch. Acknowledge this once delivered.
    pub version: u64,
}

#[derive(Debug)]
pub struct Batcher<Q, B: ?Sized = dyn RemoteBackend> {
    source: Q,
    backend: Arc<B>,
    limits: BatchLimits,
    /// A record read for the previous batch that did not fit in it.
    stashed: Option<QueueElement<Operation>>,
}

impl<Q, B> Batcher<Q, B>
where
    Q: RecordSource,
    B: RemoteBackend + ?Sized,
{
    pub fn new(source: Q, backend: Arc<B>, limits: BatchLimits) -> Self {
        Self {
            source,
            backend,
            limits,
            stashed: None,
        }
    }

    pub fn source(&self) -> &Q {
        &self.source
    }

    fn next_record(&mut self) -> Result<Option<QueueElement<Operation>>> {
        match self.stashed.take() {
            Some(record) => Ok(Some(record)),
            None => Ok(self.source.next_record()?),
        }
    }

    /// Read records until the batch is full or the source is drained.
    ///
    /// Returns `None` when there was nothing to read. A batch can carry no operations at all
    /// when every record in it was dropped, it still has to be acknowledged.
    ///
    /// A copy whose source could not be fetched because of a retryable backend error is kept
    /// and read again by the next call. If it would have led the batch, the error is returned.
    pub fn collect_batch(&mut self) -> Result<Option<Batch>> {
        let mut preprocessor = OperationsPreprocessor::new();
        let mut errors = vec![];
        let mut dropped = 0;
        let mut version = None;

        while let Some(record) = self.next_record()? {
            let is_copy = matches!(record.obj, Operation::CopyAttribute { .. });
            let resolved = if is_copy {
                // copies read the backend's current state, so they may only lead a batch
                if preprocessor.source_operations_count() > 0 {
                    self.stashed = Some(record);
                    break;
                }
                match resolve_copy(self.backend.as_ref(), &record.obj) {
                    Ok(op) => Some(op),
                    Err(error) if error.is_retryable() => {
                        // keep the copy for the next attempt, what was collected so far still ships
                        self.stashed = Some(record);
                        if version.is_some() {
                            break;
                        }
                        return Err(error.into());
                    }
                    Err(error) => {
                        warn!(
                            version = record.ver,
                            path = %record.obj.path(),
                            %error,
                            "dropping attribute copy that could not be resolved"
                        );
                        errors.push(copy_failure(&record.obj, error));
                        dropped += 1;
                        version = Some(record.ver);
                        continue;
                    }
                }
            } else {
                None
            };

            let op = resolved.as_ref().unwrap_or(&record.obj);
            let consumed = self.fits(&preprocessor, op) && preprocessor.process(op)?;
            if !consumed {
                self.stashed = Some(record);
                break;
            }
            version = Some(record.ver);
        }

        let Some(version) = version else {
            return Ok(None);
        };
        let operations = preprocessor.accumulate_operations(errors);
        debug!(
            version,
            dropped,
            source_operations = operations.source_operations_count,
            operations = operations.operations_count(),
            "collected batch"
        );
        Ok(Some(Batch {
            operations,
            dropped,
            version,
        }))
    }

    /// Whether `op` can join the batch without breaking a limit. An empty batch takes anything.
    fn fits(&self, preprocessor: &OperationsPreprocessor, op: &Operation) -> bool {
        if preprocessor.source_operations_count() == 0 {
            return true;
        }

        let path = op.path();
        if !preprocessor.has_accumulator(path)
            && preprocessor.accumulators_count() + 1 > self.limits.max_attributes_in_batch
        {
            return false;
        }

        if op.is_log() {
            let points = op.value_count();
            if preprocessor.points_count() + points > self.limits.max_points_per_batch
                || preprocessor.accumulator_append_count(path) + points
                    > self.limits.max_points_per_attribute
            {
                return false;
            }
        }
        true
    }
}

fn copy_failure(op: &Operation, error: BackendError) -> MetadataInconsistency {
    match error {
        BackendError::MetadataInconsistency(inconsistency) => inconsistency,
        other => MetadataInconsistency::new(
            op.path().clone(),
            format!("Cannot copy attribute {}: {other}", op.path()),
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use pretty_assertions::assert_eq;
    use tracklog_backend::InMemoryBackend;
    use tracklog_ops::{AttributePath, ContainerType, CopySourceKind, LogSeriesValue};

    use super::*;

    #[derive(Debug, Default)]
    struct VecSource {
        records: VecDeque<QueueElement<Operation>>,
        calls: usize,
    }

    impl VecSource {
        fn new(ops: Vec<Operation>) -> Self {
            let records = ops
                .into_iter()
                .zip(1..)
                .map(|(obj, ver)| QueueElement {
                    obj,
                    ver,
                    size: 0,
                    at: 0,
                })
                .collect();
            Self { records, calls: 0 }
        }
    }

    impl RecordSource for VecSource {
        fn next_record(&mut self) -> tracklog_queue::Result<Option<QueueElement<Operation>>> {
            self.calls += 1;
            Ok(self.records.pop_front())
        }
    }

    fn p(s: &str) -> AttributePath {
        AttributePath::parse(s).unwrap()
    }

    fn int(path: &str, value: i64) -> Operation {
        Operation::AssignInt {
            path: p(path),
            value,
        }
    }

    fn floats(path: &str, n: usize) -> Operation {
        Operation::LogFloats {
            path: p(path),
            values: (0..n)
                .map(|i| LogSeriesValue::new(i as f64, None, 0.0))
                .collect(),
        }
    }

    fn copy(path: &str, source: &str) -> Operation {
        Operation::CopyAttribute {
            path: p(path),
            container_id: "RUN-1".to_string(),
            container_type: ContainerType::Run,
            source_path: p(source),
            source_kind: CopySourceKind::Int,
        }
    }

    fn batcher(
        ops: Vec<Operation>,
        limits: BatchLimits,
    ) -> (Batcher<VecSource, InMemoryBackend>, Arc<InMemoryBackend>) {
        let backend = Arc::new(InMemoryBackend::new());
        let batcher = Batcher::new(VecSource::new(ops), Arc::clone(&backend), limits);
        (batcher, backend)
    }

    #[test]
    fn attribute_limit_stashes_and_rereads() {
        let limits = BatchLimits {
            max_attributes_in_batch: 2,
            ..Default::default()
        };
        let (mut batcher, _) = batcher(vec![int("a", 1), int("b", 2), int("c", 3)], limits);

        let first = batcher.collect_batch().unwrap().unwrap();
        assert_eq!(first.operations.other_operations, vec![int("a", 1), int("b", 2)]);
        assert_eq!(first.version, 2);
        assert_eq!(batcher.source().calls, 3);

        let second = batcher.collect_batch().unwrap().unwrap();
        assert_eq!(second.operations.other_operations, vec![int("c", 3)]);
        assert_eq!(second.version, 3);
        // the stashed record is not read from the source again
        assert_eq!(batcher.source().calls, 4);

        assert!(batcher.collect_batch().unwrap().is_none());
    }

    #[test]
    fn same_attribute_does_not_count_twice() {
        let limits = BatchLimits {
            max_attributes_in_batch: 1,
            ..Default::default()
        };
        let (mut batcher, _) = batcher(vec![int("a", 1), int("a", 2), int("b", 3)], limits);

        let first = batcher.collect_batch().unwrap().unwrap();
        assert_eq!(first.operations.other_operations, vec![int("a", 2)]);
        assert_eq!(first.operations.source_operations_count, 2);
        assert_eq!(first.version, 2);
    }

    #[test]
    fn point_limits() {
        let limits = BatchLimits {
            max_points_per_batch: 10,
            max_points_per_attribute: 4,
            ..Default::default()
        };
        let (mut batcher, _) = batcher(
            vec![
                floats("a", 3),
                floats("b", 3),
                // would put `a` over its own limit
                floats("a", 2),
                floats("c", 4),
                floats("d", 4),
                // would put the batch over its limit
                floats("e", 3),
            ],
            limits,
        );

        let first = batcher.collect_batch().unwrap().unwrap();
        assert_eq!(first.version, 2);

        let second = batcher.collect_batch().unwrap().unwrap();
        assert_eq!(second.version, 5);
        assert_eq!(second.operations.operations_count(), 3);

        let third = batcher.collect_batch().unwrap().unwrap();
        assert_eq!(third.version, 6);
    }

    fn points(batch: &Batch) -> usize {
        batch
            .operations
            .all_operations()
            .map(|op| op.value_count())
            .sum()
    }

    #[test]
    fn batch_point_limit_cuts_before_overflow() {
        let limits = BatchLimits {
            max_points_per_batch: 3,
            ..Default::default()
        };
        let (mut batcher, _) = batcher(
            vec![floats("a", 2), floats("b", 1), floats("c", 3)],
            limits,
        );

        let first = batcher.collect_batch().unwrap().unwrap();
        assert_eq!(points(&first), 3);
        assert_eq!(first.version, 2);

        let second = batcher.collect_batch().unwrap().unwrap();
        assert_eq!(points(&second), 3);
        assert_eq!(second.version, 3);
        assert_eq!(batcher.source().calls, 4);
    }

    #[test]
    fn oversized_record_forms_its_own_batch() {
        let limits = BatchLimits {
            max_points_per_batch: 2,
            max_points_per_attribute: 2,
            ..Default::default()
        };
        let (mut batcher, _) = batcher(vec![floats("a", 5), floats("a", 1)], limits);

        let first = batcher.collect_batch().unwrap().unwrap();
        assert_eq!(first.operations.other_operations, vec![floats("a", 5)]);
        let second = batcher.collect_batch().unwrap().unwrap();
        assert_eq!(second.operations.other_operations, vec![floats("a", 1)]);
    }

    #[test]
    fn copy_at_batch_start_is_resolved() {
        let (mut batcher, backend) =
            batcher(vec![copy("b", "a"), int("c", 3)], BatchLimits::default());
        backend.set_attribute("RUN-1", int("a", 7));

        let batch = batcher.collect_batch().unwrap().unwrap();
        assert_eq!(batch.operations.other_operations, vec![int("b", 7), int("c", 3)]);
        assert_eq!(batch.dropped, 0);
        assert_eq!(batch.version, 2);
    }

    #[test]
    fn copy_after_other_operations_starts_the_next_batch() {
        let (mut batcher, backend) = batcher(
            vec![int("a", 1), copy("b", "a"), copy("c", "a")],
            BatchLimits::default(),
        );
        backend.set_attribute("RUN-1", int("a", 7));

        let first = batcher.collect_batch().unwrap().unwrap();
        assert_eq!(first.operations.other_operations, vec![int("a", 1)]);
        assert_eq!(first.version, 1);

        // two copies in a row land in separate batches
        let second = batcher.collect_batch().unwrap().unwrap();
        assert_eq!(second.operations.other_operations, vec![int("b", 7)]);
        assert_eq!(second.version, 2);

        let third = batcher.collect_batch().unwrap().unwrap();
        assert_eq!(third.operations.other_operations, vec![int("c", 7)]);
        assert_eq!(third.version, 3);
    }

    #[test]
    fn unresolvable_copy_is_dropped_and_counted() {
        let (mut batcher, _) = batcher(
            vec![copy("b", "missing"), int("c", 3)],
            BatchLimits::default(),
        );

        let batch = batcher.collect_batch().unwrap().unwrap();
        assert_eq!(batch.dropped, 1);
        assert_eq!(batch.version, 2);
        assert_eq!(batch.operations.other_operations, vec![int("c", 3)]);
        assert_eq!(batch.operations.errors.len(), 1);
        assert_eq!(batch.operations.errors[0].path, p("missing"));
    }

    #[test]
    fn copy_is_kept_while_the_backend_is_unreachable() {
        let (mut batcher, backend) =
            batcher(vec![copy("b", "a"), int("c", 3)], BatchLimits::default());
        backend.set_attribute("RUN-1", int("a", 7));
        backend.fail_next_fetch_with(BackendError::Connection("timeout".to_string()));

        let err = batcher.collect_batch().unwrap_err();
        assert!(
            matches!(err, crate::Error::Backend(BackendError::Connection(_))),
            "{err}"
        );
        assert_eq!(batcher.source().calls, 1);

        let batch = batcher.collect_batch().unwrap().unwrap();
        assert_eq!(batch.operations.other_operations, vec![int("b", 7), int("c", 3)]);
        assert_eq!(batch.dropped, 0);
        assert_eq!(batch.version, 2);
    }

    #[test]
    fn unreachable_backend_ends_a_batch_of_dropped_copies() {
        let (mut batcher, backend) = batcher(
            vec![copy("x", "gone"), copy("b", "a")],
            BatchLimits::default(),
        );
        backend.set_attribute("RUN-1", int("a", 7));
        backend.fail_next_fetch_with(BackendError::MetadataInconsistency(
            MetadataInconsistency::new(p("gone"), "Attribute gone was deleted"),
        ));
        backend.fail_next_fetch_with(BackendError::Connection("timeout".to_string()));

        let first = batcher.collect_batch().unwrap().unwrap();
        assert_eq!(first.dropped, 1);
        assert_eq!(first.version, 1);
        assert_eq!(first.operations.operations_count(), 0);

        let second = batcher.collect_batch().unwrap().unwrap();
        assert_eq!(second.operations.other_operations, vec![int("b", 7)]);
        assert_eq!(second.version, 2);
    }

    #[test]
    fn only_dropped_records_still_advance_the_version() {
        let (mut batcher, _) = batcher(vec![copy("b", "missing")], BatchLimits::default());

        let batch = batcher.collect_batch().unwrap().unwrap();
        assert_eq!(batch.dropped, 1);
        assert_eq!(batch.version, 1);
        assert_eq!(batch.operations.operations_count(), 0);
    }

    #[test]
    fn errors_are_counted_in_the_batch() {
        let (mut batcher, _) = batcher(
            vec![
                int("a", 1),
                Operation::AssignString {
                    path: p("a"),
                    value: "x".to_string(),
                },
                int("b", 2),
            ],
            BatchLimits::default(),
        );

        let batch = batcher.collect_batch().unwrap().unwrap();
        assert_eq!(batch.operations.source_operations_count, 3);
        assert_eq!(batch.operations.operations_count(), 2);
        assert_eq!(batch.operations.errors.len(), 1);
        assert_eq!(batch.version, 3);
    }

    #[test]
    fn upload_after_delete_waits_for_the_next_batch() {
        let upload = Operation::UploadFileSet {
            path: p("files"),
            file_globs: vec!["*.txt".to_string()],
            reset: false,
        };
        let (mut batcher, _) = batcher(
            vec![Operation::delete(p("files")), upload.clone()],
            BatchLimits::default(),
        );

        let first = batcher.collect_batch().unwrap().unwrap();
        assert_eq!(
            first.operations.other_operations,
            vec![Operation::delete(p("files"))]
        );
        assert_eq!(first.version, 1);

        let second = batcher.collect_batch().unwrap().unwrap();
        assert_eq!(second.operations.upload_operations, vec![upload]);
        assert_eq!(second.version, 2);
    }

    #[test]
    fn reads_from_a_shared_disk_queue() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(Mutex::new(
            DiskQueue::open(dir.path(), tracklog_queue::DEFAULT_MAX_FILE_SIZE).unwrap(),
        ));
        for i in 0..5 {
            queue.lock().put(&int("a", i)).unwrap();
        }

        let backend = Arc::new(InMemoryBackend::new());
        let mut batcher = Batcher::new(Arc::clone(&queue), backend, BatchLimits::default());
        let batch = batcher.collect_batch().unwrap().unwrap();
        assert_eq!(batch.operations.other_operations, vec![int("a", 4)]);
        assert_eq!(batch.version, 5);
        assert!(batcher.collect_batch().unwrap().is_none());
    }
}
