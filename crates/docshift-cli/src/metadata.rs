//! Metadata file loading.
//!
//! The classifier identifies trace and version indices by looking their
//! names up in the `sessions` and `versions` collections. The CLI reads those
//! ids from a JSON file exported from the metadata database:
//!
//! ```json
//! { "sessions": ["5a0c2bdf19e6a1007a3f8c11"], "versions": [] }
//! ```

use std::path::{Path, PathBuf};

use docshift_core::classify::{SESSIONS_COLLECTION, VERSIONS_COLLECTION};
use docshift_core::MemoryMetadata;
use serde::Deserialize;
use thiserror::Error;

/// Dependency a metadata file stands in for.
pub const METADATA_DEPENDENCY: &str = "mongo";

/// Errors reading a metadata file.
#[derive(Debug, Error)]
pub enum MetadataFileError {
    /// The file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The file is not a valid metadata document.
    #[error("failed to parse {path}: {source}")]
    Parse {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: serde_json::Error,
    },
}

#[derive(Debug, Default, Deserialize)]
struct MetadataFile {
    #[serde(default)]
    sessions: Vec<String>,
    #[serde(default)]
    versions: Vec<String>,
}

/// Load the ids listed in `path` into an in-memory metadata store.
pub fn load_metadata(path: &Path) -> Result<MemoryMetadata, MetadataFileError> {
    let raw = std::fs::read_to_string(path).map_err(|source| MetadataFileError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let file: MetadataFile = serde_json::from_str(&raw).map_err(|source| MetadataFileError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let metadata = MemoryMetadata::new();
    for id in &file.sessions {
        metadata.add(SESSIONS_COLLECTION, id);
    }
    for id in &file.versions {
        metadata.add(VERSIONS_COLLECTION, id);
    }
    tracing::info!(
        path = %path.display(),
        sessions = file.sessions.len(),
        versions = file.versions.len(),
        "loaded metadata"
    );
    Ok(metadata)
}
