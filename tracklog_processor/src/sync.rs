use std::{sync::Arc, time::Duration};

use tracing::debug;
use tracklog_backend::{RemoteBackend, resolve_copy};
use tracklog_ops::{ContainerType, Operation};
use tracklog_preprocessor::AccumulatedOperations;

use crate::{Error, OperationProcessor, Result, clean_uploaded_files};

/// Sends every operation as soon as it is enqueued, on the caller's thread.
///
/// Nothing is buffered, so every lifecycle call is a no-op and every failure is reported to the
/// caller that enqueued the operation.
#[derive(Debug)]
pub struct SyncOperationProcessor {
    container_id: String,
    container_type: ContainerType,
    backend: Arc<dyn RemoteBackend>,
}

impl SyncOperationProcessor {
    pub fn new(
        container_id: impl Into<String>,
        container_type: ContainerType,
        backend: Arc<dyn RemoteBackend>,
    ) -> Self {
        Self {
            container_id: container_id.into(),
            container_type,
            backend,
        }
    }
}

impl OperationProcessor for SyncOperationProcessor {
    fn enqueue_operation(&self, op: &Operation, _wait: bool) -> Result<()> {
        let op = resolve_copy(self.backend.as_ref(), op)?;
        debug!(op = %op, "sending operation");

        let mut operations = AccumulatedOperations {
            source_operations_count: 1,
            ..Default::default()
        };
        operations.push(op);

        let (_, errors) =
            self.backend
                .execute_operations(&self.container_id, self.container_type, &operations)?;
        clean_uploaded_files(&operations);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Business { errors })
        }
    }

    fn wait(&self) -> Result<()> {
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn pause(&self) -> Result<()> {
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        Ok(())
    }

    fn stop(&self, _timeout: Option<Duration>) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}
