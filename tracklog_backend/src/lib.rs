//! The contract between the write pipeline and the remote metadata service.
//!
//! The pipeline never talks to the network itself. It hands merged batches to a
//! [`RemoteBackend`] and reacts to the [`BackendError`] it gets back: connection failures are
//! retried, everything else is reported and the batch is considered delivered.

use std::fmt::Debug;

use tracing::debug;
use tracklog_ops::{AttributePath, ContainerType, CopySourceKind, Operation};
use tracklog_preprocessor::{AccumulatedOperations, MetadataInconsistency};

mod memory;

pub use memory::{ExecutedBatch, InMemoryBackend};

#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// The service could not be reached. The request may be retried as is.
    #[error("connection to the backend failed: {0}")]
    Connection(String),

    #[error(transparent)]
    MetadataInconsistency(#[from] MetadataInconsistency),

    #[error("backend request failed: {0}")]
    Other(String),
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

/// A single operation the service refused. Reported, never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{path}: {message}")]
pub struct BusinessError {
    pub path: AttributePath,
    pub message: String,
}

impl BusinessError {
    pub fn new(path: AttributePath, message: impl Into<String>) -> Self {
        Self {
            path,
            message: message.into(),
        }
    }
}

pub type Result<T, E = BackendError> = std::result::Result<T, E>;

/// Blocking client for the remote metadata service.
pub trait RemoteBackend: Debug + Send + Sync + 'static {
    /// Apply one merged batch. Returns how many operations were accepted, and the ones that
    /// were refused.
    fn execute_operations(
        &self,
        container_id: &str,
        container_type: ContainerType,
        operations: &AccumulatedOperations,
    ) -> Result<(usize, Vec<BusinessError>)>;

    /// Read the current value of an attribute as the assignment that would recreate it.
    fn fetch_attribute(
        &self,
        container_id: &str,
        container_type: ContainerType,
        path: &AttributePath,
        kind: CopySourceKind,
    ) -> Result<Operation>;
}

/// Turn a [`Operation::CopyAttribute`] into the concrete assignment of the source's value.
///
/// Any other operation is returned unchanged.
pub fn resolve_copy<B>(backend: &B, op: &Operation) -> Result<Operation>
where
    B: RemoteBackend + ?Sized,
{
    let Operation::CopyAttribute {
        path,
        container_id,
        container_type,
        source_path,
        source_kind,
    } = op
    else {
        return Ok(op.clone());
    };

    let fetched =
        backend.fetch_attribute(container_id, *container_type, source_path, *source_kind)?;
    debug!(%path, source = %source_path, kind = fetched.kind(), "resolved attribute copy");
    retarget(fetched, path.clone(), *source_kind, source_path)
}

fn retarget(
    fetched: Operation,
    path: AttributePath,
    kind: CopySourceKind,
    source_path: &AttributePath,
) -> Result<Operation> {
    use CopySourceKind as K;

    let op = match (kind, fetched) {
        (K::Float, Operation::AssignFloat { value, .. }) => Operation::AssignFloat { path, value },
        (K::Int, Operation::AssignInt { value, .. }) => Operation::AssignInt { path, value },
        (K::Bool, Operation::AssignBool { value, .. }) => Operation::AssignBool { path, value },
        (K::String, Operation::AssignString { value, .. }) => {
            Operation::AssignString { path, value }
        }
        (K::Datetime, Operation::AssignDatetime { value, .. }) => {
            Operation::AssignDatetime { path, value }
        }
        (K::Artifact, Operation::AssignArtifact { hash, .. }) => {
            Operation::AssignArtifact { path, hash }
        }
        (K::StringSet, Operation::AddStrings { values, .. }) => {
            Operation::AddStrings { path, values }
        }
        (kind, other) => {
            let message = format!(
                "Cannot copy {source_path} as {kind:?}: source holds {}",
                other.kind()
            );
            return Err(MetadataInconsistency::new(path, message).into());
        }
    };
    Ok(op)
}
