//! Per-attribute merge state used while preprocessing one batch.

use std::fmt::Display;

use tracing::debug;
use tracklog_ops::{AttributePath, Operation};

use crate::{Error, MetadataInconsistency, Result};

/// The attribute type an operation implies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Float,
    Int,
    Bool,
    String,
    File,
    Datetime,
    FileSet,
    FloatSeries,
    StringSeries,
    ImageSeries,
    StringSet,
    Artifact,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Float => "Float",
            Self::Int => "Int",
            Self::Bool => "Bool",
            Self::String => "String",
            Self::File => "File",
            Self::Datetime => "Datetime",
            Self::FileSet => "File Set",
            Self::FloatSeries => "Float Series",
            Self::StringSeries => "String Series",
            Self::ImageSeries => "Image Series",
            Self::StringSet => "String Set",
            Self::Artifact => "Artifact",
        }
    }
}

impl Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an accepted operation combines with the pending modify operations of its path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Modifier {
    /// The new operation replaces everything pending.
    Assign,
    /// Appended without compaction, order matters against unknown server state.
    Append,
    /// Replaces everything pending, and drops their points from the append count.
    Clear,
    /// Consecutive logs concatenate their points.
    Log,
    /// Track operations concatenate their file entries.
    TrackArtifact,
}

/// What happened to an operation handed to [`OperationsAccumulator::visit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Visit {
    Accepted,
    /// Type conflict, recorded as an error and otherwise ignored.
    Rejected,
    /// A pending delete must reach the server before this operation can be merged.
    RequiresPreviousCompleted,
}

#[derive(Debug)]
pub(crate) struct OperationsAccumulator {
    path: AttributePath,
    data_type: Option<DataType>,
    delete_ops: Vec<Operation>,
    modify_ops: Vec<Operation>,
    config_ops: Vec<Operation>,
    errors: Vec<MetadataInconsistency>,
    append_count: usize,
}

impl OperationsAccumulator {
    pub(crate) fn new(path: AttributePath) -> Self {
        Self {
            path,
            data_type: None,
            delete_ops: vec![],
            modify_ops: vec![],
            config_ops: vec![],
            errors: vec![],
            append_count: 0,
        }
    }

    /// Points currently held by pending log operations.
    pub(crate) fn append_count(&self) -> usize {
        self.append_count
    }

    pub(crate) fn op_count(&self) -> usize {
        self.delete_ops.len() + self.modify_ops.len() + self.config_ops.len()
    }

    pub(crate) fn visit(&mut self, op: &Operation) -> Result<Visit> {
        use DataType as T;
        use Modifier as M;

        match op {
            Operation::AssignFloat { .. } => self.modify(T::Float, op, M::Assign),
            Operation::AssignInt { .. } => self.modify(T::Int, op, M::Assign),
            Operation::AssignBool { .. } => self.modify(T::Bool, op, M::Assign),
            Operation::AssignString { .. } => self.modify(T::String, op, M::Assign),
            Operation::AssignDatetime { .. } => self.modify(T::Datetime, op, M::Assign),
            Operation::AssignArtifact { .. } => self.modify(T::Artifact, op, M::Assign),
            Operation::UploadFile { .. } | Operation::UploadFileContent { .. } => {
                self.modify(T::File, op, M::Assign)
            }
            Operation::UploadFileSet { reset: true, .. } => self.modify(T::FileSet, op, M::Assign),
            Operation::UploadFileSet { reset: false, .. } | Operation::DeleteFiles { .. } => {
                self.modify(T::FileSet, op, M::Append)
            }
            Operation::LogFloats { .. } => self.modify(T::FloatSeries, op, M::Log),
            Operation::LogStrings { .. } => self.modify(T::StringSeries, op, M::Log),
            Operation::LogImages { .. } => self.modify(T::ImageSeries, op, M::Log),
            Operation::ClearFloatLog { .. } => self.modify(T::FloatSeries, op, M::Clear),
            Operation::ClearStringLog { .. } => self.modify(T::StringSeries, op, M::Clear),
            Operation::ClearImageLog { .. } => self.modify(T::ImageSeries, op, M::Clear),
            Operation::ConfigFloatSeries { .. } => Ok(self.config(T::FloatSeries, op)),
            Operation::AddStrings { .. } | Operation::RemoveStrings { .. } => {
                self.modify(T::StringSet, op, M::Append)
            }
            Operation::ClearStringSet { .. } => self.modify(T::StringSet, op, M::Clear),
            Operation::DeleteAttribute { .. } => {
                self.delete(op);
                Ok(Visit::Accepted)
            }
            Operation::TrackFilesToArtifact { .. } => {
                self.modify(T::Artifact, op, M::TrackArtifact)
            }
            Operation::ClearArtifact { .. } => self.modify(T::Artifact, op, M::Clear),
            Operation::CopyAttribute { .. } => Err(Error::CopyAttributeInAccumulator {
                path: self.path.clone(),
            }),
        }
    }

    /// Record a type conflict if `expected` differs from the type this path already has.
    fn conflicts(&mut self, expected: DataType, op: &Operation) -> bool {
        match self.data_type {
            Some(current) if current != expected => {
                debug!(
                    path = %self.path,
                    op = op.kind(),
                    %current,
                    "rejecting operation of conflicting type"
                );
                self.errors.push(MetadataInconsistency::type_mismatch(
                    self.path.clone(),
                    op.kind(),
                    expected,
                ));
                true
            }
            _ => false,
        }
    }

    fn modify(&mut self, expected: DataType, op: &Operation, modifier: Modifier) -> Result<Visit> {
        if self.conflicts(expected, op) {
            return Ok(Visit::Rejected);
        }
        if (op.is_file_op() || op.is_artifact_op()) && !self.delete_ops.is_empty() {
            return Ok(Visit::RequiresPreviousCompleted);
        }

        self.data_type = Some(expected);
        match modifier {
            Modifier::Assign => self.modify_ops = vec![op.clone()],
            Modifier::Append => self.modify_ops.push(op.clone()),
            Modifier::Clear => {
                let dropped: usize = self.modify_ops.iter().map(Operation::value_count).sum();
                self.append_count = self.append_count.saturating_sub(dropped);
                self.modify_ops = vec![op.clone()];
            }
            Modifier::Log => self.log(op)?,
            Modifier::TrackArtifact => self.track(op)?,
        }
        Ok(Visit::Accepted)
    }

    fn log(&mut self, op: &Operation) -> Result<()> {
        self.append_count += op.value_count();

        match self.modify_ops.as_slice() {
            // nothing pending, or a clear the log has to follow
            [] => self.modify_ops.push(op.clone()),
            [only] if !only.is_log() => self.modify_ops.push(op.clone()),
            [_] | [_, _] => match self.modify_ops.last_mut() {
                Some(last) if last.is_log() => merge_log(last, op)?,
                _ => return Err(self.unexpected_pending_ops()),
            },
            _ => return Err(self.unexpected_pending_ops()),
        }
        Ok(())
    }

    fn track(&mut self, op: &Operation) -> Result<()> {
        match (self.modify_ops.last_mut(), op) {
            (
                Some(Operation::TrackFilesToArtifact { entries, .. }),
                Operation::TrackFilesToArtifact {
                    entries: new_entries,
                    ..
                },
            ) => entries.extend(new_entries.iter().cloned()),
            _ => self.modify_ops.push(op.clone()),
        }
        Ok(())
    }

    fn config(&mut self, expected: DataType, op: &Operation) -> Visit {
        if self.conflicts(expected, op) {
            return Visit::Rejected;
        }
        self.data_type = Some(expected);
        self.config_ops = vec![op.clone()];
        Visit::Accepted
    }

    fn delete(&mut self, op: &Operation) {
        match (self.data_type.is_some(), self.delete_ops.is_empty()) {
            // a delete is already pending, drop what was set after it
            (true, false) => {
                self.modify_ops.clear();
                self.config_ops.clear();
            }
            // The attribute may not exist server side yet, and deleting a missing attribute
            // fails. Replaying one modification first keeps the delete valid.
            (true, true) => {
                let first = self
                    .modify_ops
                    .first()
                    .or_else(|| self.config_ops.first())
                    .cloned();
                self.delete_ops = first.into_iter().chain([op.clone()]).collect();
                self.modify_ops.clear();
                self.config_ops.clear();
            }
            (false, false) => {}
            (false, true) => self.delete_ops.push(op.clone()),
        }
        self.data_type = None;
        self.append_count = 0;
    }

    fn unexpected_pending_ops(&self) -> Error {
        Error::UnexpectedPendingOperations {
            path: self.path.clone(),
            pending: self.modify_ops.iter().map(Operation::kind).collect(),
        }
    }

    /// Consume the accumulator into its operations, in `delete + modify + config` order, and its
    /// errors.
    pub(crate) fn into_parts(self) -> (Vec<Operation>, Vec<MetadataInconsistency>) {
        let mut ops = self.delete_ops;
        ops.extend(self.modify_ops);
        ops.extend(self.config_ops);
        (ops, self.errors)
    }
}

fn merge_log(existing: &mut Operation, new: &Operation) -> Result<()> {
    match (existing, new) {
        (
            Operation::LogFloats { values, .. },
            Operation::LogFloats {
                values: new_values,
                ..
            },
        ) => values.extend(new_values.iter().cloned()),
        (
            Operation::LogStrings { values, .. },
            Operation::LogStrings {
                values: new_values,
                ..
            },
        ) => values.extend(new_values.iter().cloned()),
        (
            Operation::LogImages { values, .. },
            Operation::LogImages {
                values: new_values,
                ..
            },
        ) => values.extend(new_values.iter().cloned()),
        (existing, new) => {
            return Err(Error::IncompatibleMerge {
                path: new.path().clone(),
                existing: existing.kind(),
                new: new.kind(),
            });
        }
    }
    Ok(())
}
