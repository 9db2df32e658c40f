//! The operation model shared by every part of the write pipeline.
//!
//! An [`Operation`] is a single mutation of one attribute, addressed by an [`AttributePath`].
//! The set of operations is closed: consumers match on [`Operation`] exhaustively, so adding a
//! variant is a compile-time checked change everywhere it matters.
//!
//! Operations are persisted with [`serialize`] and read back with [`deserialize`].

mod operation;
mod path;
mod serialize;

pub use operation::{
    ArtifactFileEntry, ContainerType, CopySourceKind, ImageValue, LogSeriesValue, Operation,
    SeriesPoint,
};
pub use path::{AttributePath, PATH_SEPARATOR};
pub use serialize::{deserialize, serialize};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("attribute path must have at least one segment")]
    EmptyPath,

    #[error("failed to serialize operation: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("malformed operation: {source}")]
    MalformedOperation {
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
