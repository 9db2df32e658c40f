//! On-disk home of one processor execution.

use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracklog_ops::ContainerType;

use crate::{Error, Result};

pub const METADATA_FILE_NAME: &str = "metadata.json";

/// How operations reach the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessorMode {
    Async,
    Sync,
    Offline,
}

/// Written next to the queue so that a leftover directory can be traced back to its run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    pub mode: ProcessorMode,
    pub container_id: String,
    pub container_type: ContainerType,
    /// Milliseconds since the unix epoch.
    pub created_at: i64,
    pub version: String,
}

/// The directory of a single execution:
/// `<base_dir>/<container_type>__<container_id>/exec-<unix_ms>-<pid>/`.
#[derive(Debug, Clone)]
pub struct OperationStorage {
    dir: PathBuf,
}

impl OperationStorage {
    pub fn create(
        base_dir: impl AsRef<Path>,
        container_id: &str,
        container_type: ContainerType,
    ) -> Result<Self> {
        let now = Utc::now().timestamp_millis();
        let dir = base_dir
            .as_ref()
            .join(format!("{container_type}__{container_id}"))
            .join(format!("exec-{now}-{}", std::process::id()));

        fs::create_dir_all(&dir).map_err(|source| Error::Storage {
            path: dir.clone(),
            source,
        })?;
        info!(storage_dir = ?dir, %container_type, container_id, "created operation storage");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write_metadata(
        &self,
        mode: ProcessorMode,
        container_id: &str,
        container_type: ContainerType,
    ) -> Result<ExecutionMetadata> {
        let metadata = ExecutionMetadata {
            mode,
            container_id: container_id.to_string(),
            container_type,
            created_at: Utc::now().timestamp_millis(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        let bytes = serde_json::to_vec_pretty(&metadata).map_err(Error::Metadata)?;
        let path = self.dir.join(METADATA_FILE_NAME);
        fs::write(&path, bytes).map_err(|source| Error::Storage { path, source })?;
        Ok(metadata)
    }

    /// Read back the metadata of an execution directory.
    pub fn read_metadata(dir: impl AsRef<Path>) -> Result<ExecutionMetadata> {
        let path = dir.as_ref().join(METADATA_FILE_NAME);
        let bytes = fs::read(&path).map_err(|source| Error::Storage { path, source })?;
        serde_json::from_slice(&bytes).map_err(Error::Metadata)
    }
}
