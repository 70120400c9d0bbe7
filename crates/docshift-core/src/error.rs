//! Engine error types.

use thiserror::Error;

/// Errors reported by a store client facade.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The request never produced a response.
    #[error("transport error: {0}")]
    Transport(String),

    /// The store answered with a non-success status.
    #[error("store returned status {status}: {body}")]
    Status {
        /// HTTP-style status code.
        status: u16,
        /// Response body, as returned by the store.
        body: String,
    },

    /// The response could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// The addressed index does not exist.
    #[error("index not found: {0}")]
    IndexNotFound(String),

    /// The cursor expired or was never issued.
    #[error("unknown cursor: {0}")]
    UnknownCursor(String),
}

/// Migration errors.
///
/// Lower-level components surface the first error they hit; only the
/// controller wraps errors in [`MigrationError::RolledBack`] or
/// [`MigrationError::RestoreFailed`].
#[derive(Debug, Error)]
pub enum MigrationError {
    /// The store could not be reached.
    #[error("connection error: {0}")]
    Connection(#[source] StoreError),

    /// A store request failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The secondary metadata store failed.
    #[error("metadata store error: {0}")]
    Metadata(String),

    /// A bulk write reported errors that are not capacity rejections.
    #[error("bulk write to {index} failed: {reason}")]
    BulkRejected {
        /// Destination index.
        index: String,
        /// First non-retryable item error.
        reason: String,
    },

    /// A rejected bulk item has no counterpart in the submitted page.
    #[error("bulk response for {index} rejected {doc_type}/{id}, which was never submitted")]
    UnmatchedRejection {
        /// Destination index.
        index: String,
        /// Document type of the rejected item.
        doc_type: String,
        /// Document id of the rejected item.
        id: String,
    },

    /// Capacity rejections persisted through every retry attempt.
    #[error("bulk write to {index} still rejected {remaining} documents after {attempts} attempts")]
    RetriesExhausted {
        /// Destination index.
        index: String,
        /// Number of resubmissions performed.
        attempts: u32,
        /// Documents still rejected by the last attempt.
        remaining: usize,
    },

    /// A backed-up document differs from its live counterpart.
    #[error(
        "document {doc_type}/{id} differs between {backup_index} and {live_index} at {path}: \
         expected {expected}, found {actual}"
    )]
    VerificationFailed {
        /// Backup index the document was read from.
        backup_index: String,
        /// Live index the document was compared against.
        live_index: String,
        /// Document type.
        doc_type: String,
        /// Document id.
        id: String,
        /// JSON path of the first difference.
        path: String,
        /// Value in the backup.
        expected: String,
        /// Value in the live index.
        actual: String,
    },

    /// A backed-up document is absent from the live index.
    #[error("document {doc_type}/{id} from the backup is missing in {index}")]
    MissingDocument {
        /// Live index.
        index: String,
        /// Document type.
        doc_type: String,
        /// Document id.
        id: String,
    },

    /// A backup index has no live counterpart.
    #[error("no live index found for backup {backup_index}")]
    MissingLiveIndex {
        /// Backup index name.
        backup_index: String,
    },

    /// A backup index name does not carry an original index name.
    #[error("backup index {0} does not name an original index")]
    InvalidBackupName(String),

    /// Backup and live index disagree on their document count.
    #[error("{backup_index} holds {backup_count} documents but {live_index} holds {live_count}")]
    DocumentCountMismatch {
        /// Backup index name.
        backup_index: String,
        /// Live index name.
        live_index: String,
        /// Documents in the backup.
        backup_count: u64,
        /// Documents in the live index.
        live_count: u64,
    },

    /// No registered transformer starts at the deployment's version.
    #[error("no transformer upgrades model version {version}")]
    NoTransformer {
        /// The deployment's current model version.
        version: String,
    },

    /// A pending transformer depends on a service the caller cannot provide.
    #[error("transformer {version} requires {requirement}, which is not available")]
    UnmetRequirement {
        /// The pending transformer's version step.
        version: String,
        /// The missing dependency.
        requirement: String,
    },

    /// A hit came back without its document body.
    #[error("document {doc_type}/{id} in {index} was returned without its source")]
    MissingSource {
        /// Index the hit was read from.
        index: String,
        /// Document type.
        doc_type: String,
        /// Document id.
        id: String,
    },

    /// `transform` was called without a pending transformer.
    #[error("no pending transform; call refresh first")]
    NoPendingTransform,

    /// The pipeline failed and the deployment was restored.
    #[error("migration failed and was rolled back: {cause}")]
    RolledBack {
        /// The error that triggered the rollback.
        cause: Box<MigrationError>,
    },

    /// The pipeline failed and restoring the deployment failed too.
    #[error("restore failed ({restore}) after migration error: {cause}; deployment state is unknown")]
    RestoreFailed {
        /// The error that triggered the rollback.
        cause: Box<MigrationError>,
        /// The error raised by the restore.
        restore: Box<MigrationError>,
    },

    /// A stored JSON value could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for MigrationError {
    fn from(e: serde_json::Error) -> Self {
        MigrationError::Serialization(e.to_string())
    }
}

impl MigrationError {
    /// The error that originally failed the pipeline, unwrapping rollback wrappers.
    pub fn root_cause(&self) -> &MigrationError {
        match self {
            MigrationError::RolledBack { cause } | MigrationError::RestoreFailed { cause, .. } => {
                cause.root_cause()
            }
            other => other,
        }
    }

    /// Whether the deployment was left in an unknown state.
    pub fn requires_operator(&self) -> bool {
        matches!(self, MigrationError::RestoreFailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MigrationError::RetriesExhausted {
            index: "backup_traces".to_string(),
            attempts: 5,
            remaining: 2,
        };
        assert_eq!(
            err.to_string(),
            "bulk write to backup_traces still rejected 2 documents after 5 attempts"
        );
    }

    #[test]
    fn test_verification_error_names_both_values() {
        let err = MigrationError::VerificationFailed {
            backup_index: "backup_a".to_string(),
            live_index: "a".to_string(),
            doc_type: "traces".to_string(),
            id: "1".to_string(),
            path: "score".to_string(),
            expected: "3".to_string(),
            actual: "4".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("traces/1"));
        assert!(msg.contains("expected 3"));
        assert!(msg.contains("found 4"));
    }

    #[test]
    fn test_root_cause_unwraps_rollback() {
        let err = MigrationError::RestoreFailed {
            cause: Box::new(MigrationError::RolledBack {
                cause: Box::new(MigrationError::NoPendingTransform),
            }),
            restore: Box::new(MigrationError::Metadata("down".to_string())),
        };
        assert!(matches!(err.root_cause(), MigrationError::NoPendingTransform));
        assert!(err.requires_operator());
    }
}
