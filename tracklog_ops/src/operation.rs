//! The closed set of mutations that can be applied to an attribute.

use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::path::AttributePath;
use crate::serialize::float_repr;

/// The kind of object an operation targets on the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerType {
    Run,
    Project,
    Model,
    ModelVersion,
}

impl ContainerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Project => "project",
            Self::Model => "model",
            Self::ModelVersion => "model_version",
        }
    }
}

impl Display for ContainerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Names the concrete assignment a [`Operation::CopyAttribute`] resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CopySourceKind {
    Float,
    Int,
    Bool,
    String,
    Datetime,
    Artifact,
    StringSet,
}

/// One point of a series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(serialize = "T: SeriesPoint", deserialize = "T: SeriesPoint"))]
pub struct LogSeriesValue<T> {
    #[serde(
        serialize_with = "serialize_point",
        deserialize_with = "deserialize_point"
    )]
    pub value: T,
    #[serde(with = "float_repr::option", default)]
    pub step: Option<f64>,
    /// Seconds since the unix epoch.
    pub ts: f64,
}

impl<T> LogSeriesValue<T> {
    pub fn new(value: T, step: Option<f64>, ts: f64) -> Self {
        Self { value, step, ts }
    }
}

/// An image point, already encoded by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageValue {
    pub data: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
}

/// One file tracked into an artifact manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactFileEntry {
    pub file_path: String,
    pub destination: Option<String>,
}

/// Values that can be carried by a series point.
///
/// Floats need their own encoding so that NaN and infinities survive JSON.
pub trait SeriesPoint: Sized {
    fn serialize_point<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error>;

    fn deserialize_point<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error>;
}

impl SeriesPoint for f64 {
    fn serialize_point<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        float_repr::serialize(self, serializer)
    }

    fn deserialize_point<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        float_repr::deserialize(deserializer)
    }
}

impl SeriesPoint for String {
    fn serialize_point<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.serialize(serializer)
    }

    fn deserialize_point<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Self::deserialize(deserializer)
    }
}

impl SeriesPoint for ImageValue {
    fn serialize_point<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.serialize(serializer)
    }

    fn deserialize_point<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Self::deserialize(deserializer)
    }
}

fn serialize_point<T: SeriesPoint, S: Serializer>(value: &T, serializer: S) -> Result<S::Ok, S::Error> {
    value.serialize_point(serializer)
}

fn deserialize_point<'de, T: SeriesPoint, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<T, D::Error> {
    T::deserialize_point(deserializer)
}

/// A mutation of a single attribute.
///
/// Operations are immutable values: the path is fixed at construction and equality covers the
/// variant, the path and the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Operation {
    AssignFloat {
        path: AttributePath,
        #[serde(with = "float_repr")]
        value: f64,
    },
    AssignInt {
        path: AttributePath,
        value: i64,
    },
    AssignBool {
        path: AttributePath,
        value: bool,
    },
    AssignString {
        path: AttributePath,
        value: String,
    },
    AssignDatetime {
        path: AttributePath,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        value: DateTime<Utc>,
    },
    AssignArtifact {
        path: AttributePath,
        hash: String,
    },
    UploadFile {
        path: AttributePath,
        ext: String,
        file_path: String,
        #[serde(default)]
        clean_after_upload: bool,
    },
    UploadFileContent {
        path: AttributePath,
        ext: String,
        file_content: String,
    },
    UploadFileSet {
        path: AttributePath,
        file_globs: Vec<String>,
        reset: bool,
    },
    DeleteFiles {
        path: AttributePath,
        file_paths: Vec<String>,
    },
    LogFloats {
        path: AttributePath,
        values: Vec<LogSeriesValue<f64>>,
    },
    LogStrings {
        path: AttributePath,
        values: Vec<LogSeriesValue<String>>,
    },
    LogImages {
        path: AttributePath,
        values: Vec<LogSeriesValue<ImageValue>>,
    },
    ClearFloatLog {
        path: AttributePath,
    },
    ClearStringLog {
        path: AttributePath,
    },
    ClearImageLog {
        path: AttributePath,
    },
    ConfigFloatSeries {
        path: AttributePath,
        #[serde(with = "float_repr::option", default)]
        min: Option<f64>,
        #[serde(with = "float_repr::option", default)]
        max: Option<f64>,
        unit: Option<String>,
    },
    AddStrings {
        path: AttributePath,
        values: Vec<String>,
    },
    RemoveStrings {
        path: AttributePath,
        values: Vec<String>,
    },
    ClearStringSet {
        path: AttributePath,
    },
    DeleteAttribute {
        path: AttributePath,
    },
    TrackFilesToArtifact {
        path: AttributePath,
        project_id: String,
        entries: Vec<ArtifactFileEntry>,
    },
    ClearArtifact {
        path: AttributePath,
    },
    CopyAttribute {
        path: AttributePath,
        container_id: String,
        container_type: ContainerType,
        source_path: AttributePath,
        source_kind: CopySourceKind,
    },
}

impl Operation {
    /// Every type tag the decoder accepts, one per variant.
    pub const TAGS: &'static [&'static str] = &[
        "AssignFloat",
        "AssignInt",
        "AssignBool",
        "AssignString",
        "AssignDatetime",
        "AssignArtifact",
        "UploadFile",
        "UploadFileContent",
        "UploadFileSet",
        "DeleteFiles",
        "LogFloats",
        "LogStrings",
        "LogImages",
        "ClearFloatLog",
        "ClearStringLog",
        "ClearImageLog",
        "ConfigFloatSeries",
        "AddStrings",
        "RemoveStrings",
        "ClearStringSet",
        "DeleteAttribute",
        "TrackFilesToArtifact",
        "ClearArtifact",
        "CopyAttribute",
    ];

    pub fn path(&self) -> &AttributePath {
        match self {
            Self::AssignFloat { path, .. }
            | Self::AssignInt { path, .. }
            | Self::AssignBool { path, .. }
            | Self::AssignString { path, .. }
            | Self::AssignDatetime { path, .. }
            | Self::AssignArtifact { path, .. }
            | Self::UploadFile { path, .. }
            | Self::UploadFileContent { path, .. }
            | Self::UploadFileSet { path, .. }
            | Self::DeleteFiles { path, .. }
            | Self::LogFloats { path, .. }
            | Self::LogStrings { path, .. }
            | Self::LogImages { path, .. }
            | Self::ClearFloatLog { path }
            | Self::ClearStringLog { path }
            | Self::ClearImageLog { path }
            | Self::ConfigFloatSeries { path, .. }
            | Self::AddStrings { path, .. }
            | Self::RemoveStrings { path, .. }
            | Self::ClearStringSet { path }
            | Self::DeleteAttribute { path }
            | Self::TrackFilesToArtifact { path, .. }
            | Self::ClearArtifact { path }
            | Self::CopyAttribute { path, .. } => path,
        }
    }

    /// The variant name, identical to the type tag used on disk.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AssignFloat { .. } => "AssignFloat",
            Self::AssignInt { .. } => "AssignInt",
            Self::AssignBool { .. } => "AssignBool",
            Self::AssignString { .. } => "AssignString",
            Self::AssignDatetime { .. } => "AssignDatetime",
            Self::AssignArtifact { .. } => "AssignArtifact",
            Self::UploadFile { .. } => "UploadFile",
            Self::UploadFileContent { .. } => "UploadFileContent",
            Self::UploadFileSet { .. } => "UploadFileSet",
            Self::DeleteFiles { .. } => "DeleteFiles",
            Self::LogFloats { .. } => "LogFloats",
            Self::LogStrings { .. } => "LogStrings",
            Self::LogImages { .. } => "LogImages",
            Self::ClearFloatLog { .. } => "ClearFloatLog",
            Self::ClearStringLog { .. } => "ClearStringLog",
            Self::ClearImageLog { .. } => "ClearImageLog",
            Self::ConfigFloatSeries { .. } => "ConfigFloatSeries",
            Self::AddStrings { .. } => "AddStrings",
            Self::RemoveStrings { .. } => "RemoveStrings",
            Self::ClearStringSet { .. } => "ClearStringSet",
            Self::DeleteAttribute { .. } => "DeleteAttribute",
            Self::TrackFilesToArtifact { .. } => "TrackFilesToArtifact",
            Self::ClearArtifact { .. } => "ClearArtifact",
            Self::CopyAttribute { .. } => "CopyAttribute",
        }
    }

    /// Number of series points carried by this operation, zero for anything but a log.
    pub fn value_count(&self) -> usize {
        match self {
            Self::LogFloats { values, .. } => values.len(),
            Self::LogStrings { values, .. } => values.len(),
            Self::LogImages { values, .. } => values.len(),
            _ => 0,
        }
    }

    pub fn is_log(&self) -> bool {
        matches!(
            self,
            Self::LogFloats { .. } | Self::LogStrings { .. } | Self::LogImages { .. }
        )
    }

    /// Operations that ship file payloads and travel in the upload part of a batch.
    pub fn is_file_op(&self) -> bool {
        matches!(
            self,
            Self::UploadFile { .. } | Self::UploadFileContent { .. } | Self::UploadFileSet { .. }
        )
    }

    pub fn is_artifact_op(&self) -> bool {
        matches!(self, Self::TrackFilesToArtifact { .. })
    }

    pub fn delete(path: AttributePath) -> Self {
        Self::DeleteAttribute { path }
    }
}

impl Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.kind(), self.path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> AttributePath {
        AttributePath::parse(s).unwrap()
    }

    #[test]
    fn value_count_only_counts_log_points() {
        let log = Operation::LogStrings {
            path: path("a"),
            values: vec![
                LogSeriesValue::new("x".to_string(), None, 1.0),
                LogSeriesValue::new("y".to_string(), Some(2.0), 2.0),
            ],
        };
        assert_eq!(log.value_count(), 2);
        assert!(log.is_log());

        let assign = Operation::AssignInt {
            path: path("a"),
            value: 3,
        };
        assert_eq!(assign.value_count(), 0);
        assert!(!assign.is_log());
    }

    #[test]
    fn file_and_artifact_classification() {
        let upload = Operation::UploadFileSet {
            path: path("files"),
            file_globs: vec!["*.txt".to_string()],
            reset: false,
        };
        assert!(upload.is_file_op());
        assert!(!upload.is_artifact_op());

        let delete_files = Operation::DeleteFiles {
            path: path("files"),
            file_paths: vec!["a.txt".to_string()],
        };
        assert!(!delete_files.is_file_op());

        let track = Operation::TrackFilesToArtifact {
            path: path("art"),
            project_id: "p".to_string(),
            entries: vec![],
        };
        assert!(track.is_artifact_op());
    }

    #[test]
    fn display_names_kind_and_path() {
        let op = Operation::delete(path("sys/tags"));
        assert_eq!(op.to_string(), "DeleteAttribute(sys/tags)");
        assert_eq!(ContainerType::ModelVersion.to_string(), "model_version");
    }
}
