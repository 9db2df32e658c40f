use std::collections::BTreeMap;

use tracing::debug;
use tracklog_ops::{AttributePath, Operation};

use crate::{
    MetadataInconsistency, Result,
    accumulator::{OperationsAccumulator, Visit},
};

/// The merged form of one batch, split the way the backend ships it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccumulatedOperations {
    pub upload_operations: Vec<Operation>,
    pub artifact_operations: Vec<Operation>,
    pub other_operations: Vec<Operation>,
    pub errors: Vec<MetadataInconsistency>,
    /// Source operations consumed to build this batch, rejected ones included.
    pub source_operations_count: usize,
}

impl AccumulatedOperations {
    /// Number of operations that will actually be sent.
    pub fn operations_count(&self) -> usize {
        self.upload_operations.len() + self.artifact_operations.len() + self.other_operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations_count() == 0 && self.errors.is_empty()
    }

    /// Append `op` to the list it ships in.
    pub fn push(&mut self, op: Operation) {
        if op.is_file_op() {
            self.upload_operations.push(op);
        } else if op.is_artifact_op() {
            self.artifact_operations.push(op);
        } else {
            self.other_operations.push(op);
        }
    }

    /// Uploads, then artifact tracks, then everything else.
    pub fn all_operations(&self) -> impl Iterator<Item = &Operation> {
        self.upload_operations
            .iter()
            .chain(&self.artifact_operations)
            .chain(&self.other_operations)
    }
}

/// Folds a stream of operations into per-attribute accumulators.
#[derive(Debug, Default)]
pub struct OperationsPreprocessor {
    accumulators: BTreeMap<AttributePath, OperationsAccumulator>,
    source_operations_count: usize,
    points_count: usize,
}

impl OperationsPreprocessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one operation.
    ///
    /// Returns `false` when the operation cannot join this batch; it was not consumed and has to
    /// start the next one.
    pub fn process(&mut self, op: &Operation) -> Result<bool> {
        let accumulator = self
            .accumulators
            .entry(op.path().clone())
            .or_insert_with(|| OperationsAccumulator::new(op.path().clone()));

        let points_before = accumulator.append_count();
        let visit = accumulator.visit(op)?;
        let points_after = accumulator.append_count();
        self.points_count = self.points_count - points_before + points_after;

        match visit {
            Visit::Accepted | Visit::Rejected => {
                self.source_operations_count += 1;
                Ok(true)
            }
            Visit::RequiresPreviousCompleted => {
                debug!(path = %op.path(), op = op.kind(), "operation waits for a pending delete");
                Ok(false)
            }
        }
    }

    /// Merge operations in order until one cannot join the batch. Returns how many were consumed.
    pub fn process_batch(&mut self, ops: &[Operation]) -> Result<usize> {
        let mut consumed = 0;
        for op in ops {
            if !self.process(op)? {
                break;
            }
            consumed += 1;
        }
        Ok(consumed)
    }

    pub fn accumulators_count(&self) -> usize {
        self.accumulators.len()
    }

    pub fn has_accumulator(&self, path: &AttributePath) -> bool {
        self.accumulators.contains_key(path)
    }

    /// Series points held across every attribute.
    pub fn points_count(&self) -> usize {
        self.points_count
    }

    /// Series points held for one attribute, zero for an unknown path.
    pub fn accumulator_append_count(&self, path: &AttributePath) -> usize {
        self.accumulators
            .get(path)
            .map_or(0, OperationsAccumulator::append_count)
    }

    /// Number of merged operations currently held.
    pub fn operations_count(&self) -> usize {
        self.accumulators.values().map(OperationsAccumulator::op_count).sum()
    }

    pub fn source_operations_count(&self) -> usize {
        self.source_operations_count
    }

    /// Finish the batch. `initial_errors` come first in the result, ahead of the merge errors.
    pub fn accumulate_operations(
        self,
        initial_errors: Vec<MetadataInconsistency>,
    ) -> AccumulatedOperations {
        let mut result = AccumulatedOperations {
            errors: initial_errors,
            source_operations_count: self.source_operations_count,
            ..Default::default()
        };

        for accumulator in self.accumulators.into_values() {
            let (ops, errors) = accumulator.into_parts();
            for op in ops {
                result.push(op);
            }
            result.errors.extend(errors);
        }

        result
    }
}
