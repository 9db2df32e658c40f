//! Delivery of operations to a [`RemoteBackend`](tracklog_backend::RemoteBackend).
//!
//! Three processors share the [`OperationProcessor`] interface:
//!
//! * [`AsyncOperationProcessor`] persists every operation to a disk queue and ships merged
//!   batches from a background thread,
//! * [`SyncOperationProcessor`] sends each operation as it is enqueued,
//! * [`OfflineOperationProcessor`] only persists, leaving delivery to a later sync.

use std::{fmt::Debug, fs, path::PathBuf, time::Duration};

use tracing::warn;
use tracklog_backend::{BackendError, BusinessError};
use tracklog_ops::Operation;
use tracklog_preprocessor::AccumulatedOperations;

mod async_processor;
pub mod batcher;
mod offline;
mod storage;
mod sync;

pub use async_processor::{AsyncOperationProcessor, AsyncProcessorSettings, ProcessorStatus};
pub use batcher::{Batch, BatchLimits, Batcher, RecordSource};
pub use offline::OfflineOperationProcessor;
pub use storage::{ExecutionMetadata, METADATA_FILE_NAME, OperationStorage, ProcessorMode};
pub use sync::SyncOperationProcessor;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("queue error: {0}")]
    Queue(#[from] tracklog_queue::Error),

    #[error("preprocessing error: {0}")]
    Preprocess(#[from] tracklog_preprocessor::Error),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("{} operation(s) rejected by the backend", .errors.len())]
    Business { errors: Vec<BusinessError> },

    #[error("synchronization with the backend has already stopped")]
    SynchronizationAlreadyStopped,

    #[error("unable to prepare storage directory {path:?}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to encode execution metadata: {0}")]
    Metadata(#[source] serde_json::Error),

    #[error("unable to spawn the consumer thread: {0}")]
    SpawnConsumer(#[source] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Accepts operations from the producer and gets them to the backend, one way or another.
pub trait OperationProcessor: Debug + Send + Sync {
    /// Accept one operation. With `wait`, return only once it has been delivered.
    fn enqueue_operation(&self, op: &Operation, wait: bool) -> Result<()>;

    /// Block until everything enqueued so far has been delivered.
    fn wait(&self) -> Result<()>;

    fn flush(&self) -> Result<()>;

    fn start(&self) -> Result<()>;

    fn pause(&self) -> Result<()>;

    fn resume(&self) -> Result<()>;

    /// Deliver what can be delivered within `timeout`, then release every resource.
    fn stop(&self, timeout: Option<Duration>) -> Result<()>;

    fn close(&self) -> Result<()>;
}

/// Remove local files the producer asked to have deleted once uploaded.
pub(crate) fn clean_uploaded_files(operations: &AccumulatedOperations) {
    for op in &operations.upload_operations {
        if let Operation::UploadFile {
            file_path,
            clean_after_upload: true,
            ..
        } = op
        {
            if let Err(error) = fs::remove_file(file_path) {
                warn!(%file_path, %error, "unable to remove uploaded file");
            }
        }
    }
}
