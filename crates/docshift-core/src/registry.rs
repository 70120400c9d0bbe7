//! Run-scoped registries.
//!
//! A [`MigrationRegistry`] and an [`ExtensionFieldRegistry`] are created for
//! each controller run and passed to every stage. Concurrent stages only
//! append entries keyed by index or field name.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::{Mutex, RwLock};

use crate::classify::{IndexCategory, BACKUP_PREFIX, UPGRADE_PREFIX};
use crate::store::IndexStats;

/// Name of the backup index for `index`.
pub fn backup_name(index: &str) -> String {
    format!("{BACKUP_PREFIX}{index}")
}

/// Name of the staging index for `index`.
pub fn staging_name(index: &str) -> String {
    format!("{UPGRADE_PREFIX}{index}")
}

/// Original index named by a backup index, if any.
pub fn original_of_backup(backup: &str) -> Option<&str> {
    backup.strip_prefix(BACKUP_PREFIX).filter(|name| !name.is_empty())
}

#[derive(Debug, Default)]
struct RegistryState {
    classified: BTreeMap<String, (IndexStats, IndexCategory)>,
    backed_up: BTreeMap<String, IndexStats>,
    in_progress: BTreeMap<String, IndexStats>,
    deleted_staging: BTreeSet<String>,
    seeded: BTreeMap<String, u64>,
}

/// Classified indices plus the backups and staging indices of a run.
#[derive(Debug, Default)]
pub struct MigrationRegistry {
    state: Mutex<RegistryState>,
}

impl MigrationRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the category of an index. Later records for the same name are ignored.
    pub fn record_classification(&self, stats: IndexStats, category: IndexCategory) {
        self.state
            .lock()
            .classified
            .entry(stats.index.clone())
            .or_insert((stats, category));
    }

    /// Category recorded for an index.
    pub fn category(&self, index: &str) -> Option<IndexCategory> {
        self.state.lock().classified.get(index).map(|(_, c)| *c)
    }

    /// All indices recorded under `category`, sorted by name.
    pub fn indices_in(&self, category: IndexCategory) -> Vec<IndexStats> {
        self.state
            .lock()
            .classified
            .values()
            .filter(|(_, c)| *c == category)
            .map(|(stats, _)| stats.clone())
            .collect()
    }

    /// Every classified index with its category, sorted by name.
    pub fn classified(&self) -> Vec<(IndexStats, IndexCategory)> {
        self.state.lock().classified.values().cloned().collect()
    }

    /// Number of classified indices.
    pub fn classified_count(&self) -> usize {
        self.state.lock().classified.len()
    }

    /// Record that `source` was backed up into `backup`.
    pub fn record_backup(&self, source: &IndexStats, backup: &str) {
        self.state
            .lock()
            .backed_up
            .entry(source.index.clone())
            .or_insert_with(|| source.renamed(backup));
    }

    /// Whether `source` was backed up during this run.
    pub fn has_backup(&self, source: &str) -> bool {
        self.state.lock().backed_up.contains_key(source)
    }

    /// Backup pairs as `(source, backup)`.
    pub fn backups(&self) -> Vec<(String, IndexStats)> {
        self.state
            .lock()
            .backed_up
            .iter()
            .map(|(source, backup)| (source.clone(), backup.clone()))
            .collect()
    }

    /// Record that `source` is being rewritten into `staging`.
    ///
    /// The staging index's document count is unknown until it is listed again.
    pub fn record_staging(&self, source: &str, staging: &str) {
        self.state
            .lock()
            .in_progress
            .entry(source.to_string())
            .or_insert_with(|| IndexStats::new(staging));
    }

    /// Whether a staging index was recorded for `source`.
    pub fn has_staging(&self, source: &str) -> bool {
        self.state.lock().in_progress.contains_key(source)
    }

    /// Staging pairs as `(source, staging)`.
    pub fn staging(&self) -> Vec<(String, IndexStats)> {
        self.state
            .lock()
            .in_progress
            .iter()
            .map(|(source, staging)| (source.clone(), staging.clone()))
            .collect()
    }

    /// Record that a staging index was already deleted.
    pub fn mark_staging_deleted(&self, staging: &str) {
        self.state.lock().deleted_staging.insert(staging.to_string());
    }

    /// Staging indices that still exist.
    pub fn live_staging(&self) -> Vec<String> {
        let state = self.state.lock();
        state
            .in_progress
            .values()
            .map(|s| s.index.clone())
            .filter(|name| !state.deleted_staging.contains(name))
            .collect()
    }

    /// Record `count` documents created in `index` that have no backup counterpart.
    pub fn record_seeded(&self, index: &str, count: u64) {
        *self.state.lock().seeded.entry(index.to_string()).or_default() += count;
    }

    /// Documents created per index by the run, outside of any rewrite.
    pub fn seeded_counts(&self) -> BTreeMap<String, u64> {
        self.state.lock().seeded.clone()
    }

    /// Forget everything.
    pub fn clear(&self) {
        *self.state.lock() = RegistryState::default();
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        let state = self.state.lock();
        state.classified.is_empty()
            && state.backed_up.is_empty()
            && state.in_progress.is_empty()
            && state.deleted_staging.is_empty()
            && state.seeded.is_empty()
    }
}

/// Field names found outside the core attribute list during a run.
#[derive(Debug, Default)]
pub struct ExtensionFieldRegistry {
    names: RwLock<BTreeSet<String>>,
}

impl ExtensionFieldRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field name; returns `true` if it was not known yet.
    pub fn insert(&self, name: &str) -> bool {
        if self.names.read().contains(name) {
            return false;
        }
        self.names.write().insert(name.to_string())
    }

    /// Whether a field name was registered.
    pub fn contains(&self, name: &str) -> bool {
        self.names.read().contains(name)
    }

    /// Whether no extension was found yet.
    pub fn is_empty(&self) -> bool {
        self.names.read().is_empty()
    }

    /// Number of registered names.
    pub fn len(&self) -> usize {
        self.names.read().len()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.names.read().iter().cloned().collect()
    }

    /// Forget every name.
    pub fn clear(&self) {
        self.names.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixed_names() {
        assert_eq!(backup_name("traces"), "backup_traces");
        assert_eq!(staging_name(".kibana"), "upgrade_.kibana");
        assert_eq!(original_of_backup("backup_traces"), Some("traces"));
        assert_eq!(original_of_backup("backup_"), None);
    }

    #[test]
    fn test_classification_recorded_once() {
        let registry = MigrationRegistry::new();
        registry.record_classification(IndexStats::new("a"), IndexCategory::Trace);
        registry.record_classification(IndexStats::new("a"), IndexCategory::Uncategorized);

        assert_eq!(registry.classified_count(), 1);
        assert_eq!(registry.category("a"), Some(IndexCategory::Trace));
        assert_eq!(registry.indices_in(IndexCategory::Trace).len(), 1);
        assert_eq!(registry.classified()[0].1, IndexCategory::Trace);
    }

    #[test]
    fn test_staging_lifecycle() {
        let registry = MigrationRegistry::new();
        let source = IndexStats::new("a").with_docs_count(3);
        registry.record_staging("a", "upgrade_a");
        registry.record_staging("a", "upgrade_a");
        registry.record_backup(&source, "backup_a");

        assert_eq!(registry.staging().len(), 1);
        assert_eq!(registry.backups()[0].1.doc_count(), Some(3));
        assert!(registry.has_backup("a"));
        assert_eq!(registry.live_staging(), vec!["upgrade_a".to_string()]);

        registry.mark_staging_deleted("upgrade_a");
        assert!(registry.live_staging().is_empty());

        registry.record_seeded(".games1", 1);
        registry.record_seeded(".games1", 1);
        assert_eq!(registry.seeded_counts().get(".games1"), Some(&2));

        registry.clear();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_extension_registry() {
        let extensions = ExtensionFieldRegistry::new();
        assert!(extensions.insert("customScore"));
        assert!(!extensions.insert("customScore"));
        assert!(extensions.insert("health"));
        assert_eq!(extensions.names(), vec!["customScore", "health"]);
    }
}
