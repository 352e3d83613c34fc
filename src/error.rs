//! Typed failures for the intake pipeline.
//!
//! Per-document failures ([`ConvertError`], per-document [`ModelError`]s,
//! [`FingerprintError`]) are recorded on the record and never abort sibling
//! documents. [`ModelError::Unavailable`] aborts the remaining work of the
//! current stage. [`IndexError::Corruption`] is fatal for the run.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FingerprintError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("symbolic link loop at {0}")]
    SymlinkLoop(PathBuf),
}

/// A path that could not be examined during discovery. Recorded in the
/// scan summary; the scan continues.
#[derive(Error, Debug, Clone)]
#[error("{path}: {reason}")]
pub struct DiscoveryError {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConvertError {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("corrupt file: {0}")]
    CorruptFile(String),

    #[error("read error: {0}")]
    ReadError(String),

    #[error("converter timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    /// The model host cannot be reached or cannot serve the model at all.
    #[error("model unavailable: {0}")]
    Unavailable(String),

    #[error("model request timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed model response: {0}")]
    MalformedResponse(String),
}

impl ModelError {
    /// Systemic failures stop the stage; everything else is per-document.
    pub fn is_systemic(&self) -> bool {
        matches!(self, ModelError::Unavailable(_))
    }
}

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("index corruption: {0}")]
    Corruption(String),

    #[error("index storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("index I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("path is not valid UTF-8: {}", .0.display())]
    NonUtf8Path(PathBuf),
}

pub type IndexResult<T> = std::result::Result<T, IndexError>;
