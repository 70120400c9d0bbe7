//! Index classification.
//!
//! Index names are opaque identifiers with no embedded type tag. Fixed names
//! and prefixes are matched directly; anything else is probed against the
//! secondary metadata store (`sessions`, then `versions`).

use futures::future::join_all;
use tracing::{debug, warn};

use crate::store::{IndexStats, MetadataStore};

/// Exact name of the dashboard configuration index.
pub const KIBANA_INDEX: &str = ".kibana";
/// Exact name of the template index.
pub const TEMPLATE_INDEX: &str = ".template";
/// Exact name of the default index pattern index.
pub const DEFAULT_PATTERN_INDEX: &str = "default-kibana-index";
/// Prefix of backup indices.
pub const BACKUP_PREFIX: &str = "backup_";
/// Prefix of staging indices.
pub const UPGRADE_PREFIX: &str = "upgrade_";
/// Prefix of per-game indices.
pub const GAMES_PREFIX: &str = ".games";
/// Prefix of opaque value set indices.
pub const OPAQUE_VALUES_PREFIX: &str = "opaque-values-";
/// Prefix of results indices.
pub const RESULTS_PREFIX: &str = "results-";
/// Metadata collection identifying trace indices.
pub const SESSIONS_COLLECTION: &str = "sessions";
/// Metadata collection identifying version snapshot indices.
pub const VERSIONS_COLLECTION: &str = "versions";

/// Semantic category of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IndexCategory {
    /// The `.kibana` root index.
    Kibana,
    /// The `.template` index.
    Template,
    /// The default index pattern index.
    DefaultIndexPattern,
    /// A per-game index.
    Game,
    /// A per-results index.
    Results,
    /// A per-opaque-value-set index.
    OpaqueValues,
    /// A per-trace-session index.
    Trace,
    /// A per-version snapshot index.
    VersionSnapshot,
    /// A backup taken by a migration.
    Backup,
    /// A staging index of an in-progress upgrade.
    Upgrade,
    /// Anything else.
    Uncategorized,
}

impl IndexCategory {
    /// Category implied by the name alone, if any.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            KIBANA_INDEX => Some(IndexCategory::Kibana),
            TEMPLATE_INDEX => Some(IndexCategory::Template),
            DEFAULT_PATTERN_INDEX => Some(IndexCategory::DefaultIndexPattern),
            _ if name.starts_with(BACKUP_PREFIX) => Some(IndexCategory::Backup),
            _ if name.starts_with(UPGRADE_PREFIX) => Some(IndexCategory::Upgrade),
            _ if name.starts_with(GAMES_PREFIX) => Some(IndexCategory::Game),
            _ if name.starts_with(OPAQUE_VALUES_PREFIX) => Some(IndexCategory::OpaqueValues),
            _ if name.starts_with(RESULTS_PREFIX) => Some(IndexCategory::Results),
            _ => None,
        }
    }

    /// Whether indices of this category are owned by a migration run.
    pub fn is_migration_artifact(self) -> bool {
        matches!(self, IndexCategory::Backup | IndexCategory::Upgrade)
    }
}

impl std::fmt::Display for IndexCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexCategory::Kibana => write!(f, "kibana"),
            IndexCategory::Template => write!(f, "template"),
            IndexCategory::DefaultIndexPattern => write!(f, "default_index_pattern"),
            IndexCategory::Game => write!(f, "game"),
            IndexCategory::Results => write!(f, "results"),
            IndexCategory::OpaqueValues => write!(f, "opaque_values"),
            IndexCategory::Trace => write!(f, "trace"),
            IndexCategory::VersionSnapshot => write!(f, "version_snapshot"),
            IndexCategory::Backup => write!(f, "backup"),
            IndexCategory::Upgrade => write!(f, "upgrade"),
            IndexCategory::Uncategorized => write!(f, "uncategorized"),
        }
    }
}

/// Whether `name` is a valid object identifier (24 hexadecimal digits).
pub fn is_object_id(name: &str) -> bool {
    name.len() == 24 && name.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Sorts indices into categories.
pub struct IndexClassifier<'a> {
    metadata: &'a dyn MetadataStore,
}

impl<'a> IndexClassifier<'a> {
    /// Create a classifier probing `metadata`.
    pub fn new(metadata: &'a dyn MetadataStore) -> Self {
        Self { metadata }
    }

    /// Classify a single index.
    ///
    /// Probe failures are not errors: the index is filed as uncategorized.
    pub async fn classify(&self, index: &IndexStats) -> IndexCategory {
        if let Some(category) = IndexCategory::from_name(&index.index) {
            return category;
        }

        if !is_object_id(&index.index) {
            debug!(index = %index.index, "not an object id, leaving uncategorized");
            return IndexCategory::Uncategorized;
        }

        match self.probe(&index.index).await {
            Ok(category) => category,
            Err(e) => {
                warn!(index = %index.index, error = %e, "metadata probe failed, leaving uncategorized");
                IndexCategory::Uncategorized
            }
        }
    }

    async fn probe(&self, name: &str) -> Result<IndexCategory, crate::error::MigrationError> {
        if self.metadata.find_one(SESSIONS_COLLECTION, name).await?.is_some() {
            return Ok(IndexCategory::Trace);
        }
        if self.metadata.find_one(VERSIONS_COLLECTION, name).await?.is_some() {
            return Ok(IndexCategory::VersionSnapshot);
        }
        Ok(IndexCategory::Uncategorized)
    }

    /// Classify every index concurrently; each index is classified exactly once.
    pub async fn classify_all(&self, indices: Vec<IndexStats>) -> Vec<(IndexStats, IndexCategory)> {
        let categories = join_all(indices.iter().map(|index| self.classify(index))).await;
        indices.into_iter().zip(categories).collect()
    }
}
