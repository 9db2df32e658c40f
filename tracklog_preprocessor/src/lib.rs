//! Merges a run of operations into the smallest equivalent sequence per attribute.
//!
//! One [`OperationsPreprocessor`] is used per batch. Operations are grouped by path and each path
//! keeps strict input order; the result is an [`AccumulatedOperations`] with paths visited in
//! sorted order, so the same input always produces the same requests.

use tracklog_ops::AttributePath;

mod accumulator;
mod preprocessor;

pub use accumulator::DataType;
pub use preprocessor::{AccumulatedOperations, OperationsPreprocessor};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("CopyAttribute on {path} reached the accumulator, copies must be resolved first")]
    CopyAttributeInAccumulator { path: AttributePath },

    #[error("unexpected pending operations on {path}: {pending:?}")]
    UnexpectedPendingOperations {
        path: AttributePath,
        pending: Vec<&'static str>,
    },

    #[error("cannot merge {new} into {existing} on {path}")]
    IncompatibleMerge {
        path: AttributePath,
        existing: &'static str,
        new: &'static str,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An operation that does not fit the attribute it targets.
///
/// Reported per operation, it never aborts the batch it was found in.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct MetadataInconsistency {
    pub path: AttributePath,
    message: String,
}

impl MetadataInconsistency {
    pub fn new(path: AttributePath, message: impl Into<String>) -> Self {
        Self {
            path,
            message: message.into(),
        }
    }

    pub fn type_mismatch(path: AttributePath, op_kind: &str, expected: DataType) -> Self {
        let message =
            format!("Cannot perform {op_kind} operation on {path}: Attribute is not a {expected}");
        Self { path, message }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}
