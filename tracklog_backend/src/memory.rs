//! A [`RemoteBackend`] that keeps everything in memory, for tests of the pipeline.

use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use parking_lot::Mutex;
use tracing::debug;
use tracklog_ops::{AttributePath, ContainerType, CopySourceKind, Operation};
use tracklog_preprocessor::{AccumulatedOperations, MetadataInconsistency};

use crate::{BackendError, BusinessError, RemoteBackend, Result};

/// One call to [`RemoteBackend::execute_operations`] that went through.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedBatch {
    pub container_id: String,
    pub container_type: ContainerType,
    pub operations: AccumulatedOperations,
}

#[derive(Debug, Default)]
struct State {
    batches: Vec<ExecutedBatch>,
    attributes: HashMap<(String, AttributePath), Operation>,
    connection_failures: usize,
    scripted_failures: VecDeque<BackendError>,
    fetch_failures: VecDeque<BackendError>,
    business_errors: VecDeque<Vec<BusinessError>>,
    execute_calls: usize,
    delay: Option<Duration>,
}

/// Records every batch it receives and replays scripted failures.
///
/// Injected connection failures come first, then scripted errors, then scripted business
/// errors for batches that do go through.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    state: Mutex<State>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an attribute value that copies can read back.
    pub fn set_attribute(&self, container_id: &str, op: Operation) {
        let key = (container_id.to_string(), op.path().clone());
        self.state.lock().attributes.insert(key, op);
    }

    pub fn attribute(&self, container_id: &str, path: &AttributePath) -> Option<Operation> {
        self.state
            .lock()
            .attributes
            .get(&(container_id.to_string(), path.clone()))
            .cloned()
    }

    /// Fail the next `n` executions with [`BackendError::Connection`].
    pub fn fail_connections(&self, n: usize) {
        self.state.lock().connection_failures += n;
    }

    /// Fail one upcoming execution with `error`.
    pub fn fail_next_with(&self, error: BackendError) {
        self.state.lock().scripted_failures.push_back(error);
    }

    /// Fail one upcoming [`RemoteBackend::fetch_attribute`] with `error`.
    pub fn fail_next_fetch_with(&self, error: BackendError) {
        self.state.lock().fetch_failures.push_back(error);
    }

    /// Report `errors` for the next batch that goes through.
    pub fn reject_next(&self, errors: Vec<BusinessError>) {
        self.state.lock().business_errors.push_back(errors);
    }

    /// Sleep this long in every execution, outside of any lock.
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().delay = Some(delay);
    }

    pub fn batches(&self) -> Vec<ExecutedBatch> {
        self.state.lock().batches.clone()
    }

    /// Every delivered operation, in delivery order.
    pub fn operations(&self) -> Vec<Operation> {
        self.state
            .lock()
            .batches
            .iter()
            .flat_map(|b| b.operations.all_operations().cloned())
            .collect()
    }

    /// Executions attempted, failed ones included.
    pub fn execute_calls(&self) -> usize {
        self.state.lock().execute_calls
    }
}

impl State {
    fn apply(&mut self, container_id: &str, op: &Operation) {
        let key = (container_id.to_string(), op.path().clone());
        match op {
            Operation::AssignFloat { .. }
            | Operation::AssignInt { .. }
            | Operation::AssignBool { .. }
            | Operation::AssignString { .. }
            | Operation::AssignDatetime { .. }
            | Operation::AssignArtifact { .. } => {
                self.attributes.insert(key, op.clone());
            }
            Operation::AddStrings { values, .. } => {
                if let Some(Operation::AddStrings {
                    values: existing, ..
                }) = self.attributes.get_mut(&key)
                {
                    existing.extend(values.iter().cloned());
                } else {
                    self.attributes.insert(key, op.clone());
                }
            }
            Operation::RemoveStrings { values, .. } => {
                if let Some(Operation::AddStrings {
                    values: existing, ..
                }) = self.attributes.get_mut(&key)
                {
                    existing.retain(|v| !values.contains(v));
                }
            }
            Operation::ClearStringSet { .. } => {
                if let Some(Operation::AddStrings {
                    values: existing, ..
                }) = self.attributes.get_mut(&key)
                {
                    existing.clear();
                }
            }
            Operation::DeleteAttribute { .. } => {
                self.attributes.remove(&key);
            }
            _ => {}
        }
    }
}

impl RemoteBackend for InMemoryBackend {
    fn execute_operations(
        &self,
        container_id: &str,
        container_type: ContainerType,
        operations: &AccumulatedOperations,
    ) -> Result<(usize, Vec<BusinessError>)> {
        let delay = {
            let mut state = self.state.lock();
            state.execute_calls += 1;
            state.delay
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let mut state = self.state.lock();
        if state.connection_failures > 0 {
            state.connection_failures -= 1;
            return Err(BackendError::Connection(
                "injected connection failure".to_string(),
            ));
        }
        if let Some(error) = state.scripted_failures.pop_front() {
            return Err(error);
        }

        let errors = state.business_errors.pop_front().unwrap_or_default();
        for op in operations.all_operations() {
            state.apply(container_id, op);
        }
        state.batches.push(ExecutedBatch {
            container_id: container_id.to_string(),
            container_type,
            operations: operations.clone(),
        });

        let accepted = operations.operations_count().saturating_sub(errors.len());
        debug!(
            container_id,
            accepted,
            rejected = errors.len(),
            "executed batch"
        );
        Ok((accepted, errors))
    }

    fn fetch_attribute(
        &self,
        container_id: &str,
        container_type: ContainerType,
        path: &AttributePath,
        _kind: CopySourceKind,
    ) -> Result<Operation> {
        if let Some(error) = self.state.lock().fetch_failures.pop_front() {
            return Err(error);
        }
        self.attribute(container_id, path).ok_or_else(|| {
            let message =
                format!("Attribute {path} not found in {container_type} {container_id}");
            MetadataInconsistency::new(path.clone(), message).into()
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn p(s: &str) -> AttributePath {
        AttributePath::parse(s).unwrap()
    }

    fn batch(ops: Vec<Operation>) -> AccumulatedOperations {
        AccumulatedOperations {
            source_operations_count: ops.len(),
            other_operations: ops,
            ..Default::default()
        }
    }

    #[test_log::test]
    fn failures_are_replayed_in_order() {
        let backend = InMemoryBackend::new();
        backend.fail_connections(2);
        backend.fail_next_with(BackendError::Other("boom".to_string()));
        backend.reject_next(vec![BusinessError::new(p("a"), "nope")]);

        let ops = batch(vec![Operation::AssignInt {
            path: p("a"),
            value: 1,
        }]);
        for _ in 0..2 {
            let err = backend
                .execute_operations("RUN-1", ContainerType::Run, &ops)
                .unwrap_err();
            assert!(err.is_retryable());
        }
        let err = backend
            .execute_operations("RUN-1", ContainerType::Run, &ops)
            .unwrap_err();
        assert!(matches!(err, BackendError::Other(_)));
        assert!(backend.batches().is_empty());

        let (accepted, errors) = backend
            .execute_operations("RUN-1", ContainerType::Run, &ops)
            .unwrap();
        assert_eq!(accepted, 0);
        assert_eq!(errors, vec![BusinessError::new(p("a"), "nope")]);

        let (accepted, errors) = backend
            .execute_operations("RUN-1", ContainerType::Run, &ops)
            .unwrap();
        assert_eq!(accepted, 1);
        assert!(errors.is_empty());
        assert_eq!(backend.execute_calls(), 5);
        assert_eq!(backend.batches().len(), 2);
    }

    #[test]
    fn delivered_values_can_be_fetched() {
        let backend = InMemoryBackend::new();
        let ops = batch(vec![
            Operation::AssignFloat {
                path: p("lr"),
                value: 0.1,
            },
            Operation::AddStrings {
                path: p("tags"),
                values: vec!["a".to_string()],
            },
        ]);
        backend
            .execute_operations("RUN-1", ContainerType::Run, &ops)
            .unwrap();
        let more = batch(vec![Operation::AddStrings {
            path: p("tags"),
            values: vec!["b".to_string()],
        }]);
        backend
            .execute_operations("RUN-1", ContainerType::Run, &more)
            .unwrap();

        let fetched = backend
            .fetch_attribute("RUN-1", ContainerType::Run, &p("tags"), CopySourceKind::StringSet)
            .unwrap();
        assert_eq!(
            fetched,
            Operation::AddStrings {
                path: p("tags"),
                values: vec!["a".to_string(), "b".to_string()],
            }
        );
        assert!(backend.attribute("RUN-2", &p("lr")).is_none());
        assert_eq!(backend.operations().len(), 3);
    }

    #[test_log::test]
    fn string_set_removals_and_clears_are_applied() {
        let backend = InMemoryBackend::new();
        let strings = |values: &[&str]| values.iter().map(|v| v.to_string()).collect::<Vec<_>>();
        let add = batch(vec![Operation::AddStrings {
            path: p("tags"),
            values: strings(&["a", "b", "c"]),
        }]);
        let remove = batch(vec![Operation::RemoveStrings {
            path: p("tags"),
            values: strings(&["b"]),
        }]);
        backend
            .execute_operations("RUN-1", ContainerType::Run, &add)
            .unwrap();
        backend
            .execute_operations("RUN-1", ContainerType::Run, &remove)
            .unwrap();

        let fetch = || {
            backend
                .fetch_attribute("RUN-1", ContainerType::Run, &p("tags"), CopySourceKind::StringSet)
                .unwrap()
        };
        assert_eq!(
            fetch(),
            Operation::AddStrings {
                path: p("tags"),
                values: strings(&["a", "c"]),
            }
        );

        let clear = batch(vec![Operation::ClearStringSet { path: p("tags") }]);
        backend
            .execute_operations("RUN-1", ContainerType::Run, &clear)
            .unwrap();
        assert_eq!(
            fetch(),
            Operation::AddStrings {
                path: p("tags"),
                values: vec![],
            }
        );
    }

    #[test]
    fn scripted_fetch_failures_come_first() {
        let backend = InMemoryBackend::new();
        backend.set_attribute(
            "RUN-1",
            Operation::AssignInt {
                path: p("a"),
                value: 1,
            },
        );
        backend.fail_next_fetch_with(BackendError::Connection("timeout".to_string()));

        let err = backend
            .fetch_attribute("RUN-1", ContainerType::Run, &p("a"), CopySourceKind::Int)
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(
            backend
                .fetch_attribute("RUN-1", ContainerType::Run, &p("a"), CopySourceKind::Int)
                .is_ok()
        );
    }
}
