//! Model version 1 to 2: extension fields move under `ext`.
//!
//! Every index is backed up first. Trace and version snapshot documents are
//! rewritten into staging indices, saved visualizations and index patterns
//! follow the renamed fields, and each staging index then replaces its source.

use async_trait::async_trait;
use futures::future::try_join_all;
use tracing::{debug, info, warn};

use crate::classify::{IndexCategory, IndexClassifier, BACKUP_PREFIX, UPGRADE_PREFIX};
use crate::error::MigrationError;
use crate::registry::{backup_name, original_of_backup};
use crate::reindex::Reindexer;
use crate::rewrite::{default_game_visualizations, SchemaRewriter, VISUALIZATION_TYPE};
use crate::store::IndexStats;
use crate::transformer::{MigrationContext, Requirement, Transformer, TransformerVersion};
use crate::verify::{ConsistencyChecker, ExtensionExemption};

/// Relocates non-core trace fields into the `ext` container.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtensionsTransformer;

impl ExtensionsTransformer {
    /// Model version this transformer upgrades from.
    pub const ORIGIN: &'static str = "1";
    /// Model version this transformer upgrades to.
    pub const DESTINATION: &'static str = "2";

    /// Create the transformer.
    pub fn new() -> Self {
        Self
    }
}

/// Default visualizations present in a live game index but not in its backup.
async fn seeded_since_backup(ctx: &MigrationContext, live: &str, backup: &str) -> Result<u64, MigrationError> {
    let store = ctx.store();
    let mut seeded = 0;
    for (id, _) in default_game_visualizations() {
        if store.get_document(live, VISUALIZATION_TYPE, id).await?.is_some()
            && store.get_document(backup, VISUALIZATION_TYPE, id).await?.is_none()
        {
            seeded += 1;
        }
    }
    Ok(seeded)
}

/// Whether a leftover backup was cut off while it was being copied.
///
/// Later phases only ever shrink a live index or rewrite it in place, apart
/// from seeded game visualizations. A backup holding fewer documents than the
/// rest of its live index can only come from an interrupted backup phase.
async fn is_partial_backup(
    ctx: &MigrationContext,
    backup: &IndexStats,
    live: Option<&IndexStats>,
    original: &str,
) -> Result<bool, MigrationError> {
    let Some(backup_count) = backup.doc_count() else {
        return Ok(false);
    };
    if backup_count == 0 {
        return Ok(true);
    }
    let Some(live_count) = live.and_then(IndexStats::doc_count) else {
        return Ok(false);
    };

    let seeded = if IndexCategory::from_name(original) == Some(IndexCategory::Game) {
        seeded_since_backup(ctx, original, &backup.index).await?
    } else {
        0
    };
    Ok(backup_count < live_count.saturating_sub(seeded))
}

/// Delete staging indices and settle backups left behind by an interrupted run.
///
/// The model version has not moved yet, so a leftover backup holds the
/// contents its index had before the interrupted run touched it. It is
/// restored onto the index, whatever the index holds now, unless it is a
/// partial copy. Returns whether anything changed.
async fn settle_leftovers(ctx: &MigrationContext, listing: &[IndexStats]) -> Result<bool, MigrationError> {
    let store = ctx.store();
    let mut changed = false;

    let staging: Vec<String> = listing
        .iter()
        .filter(|s| s.index.starts_with(UPGRADE_PREFIX))
        .map(|s| s.index.clone())
        .collect();
    if !staging.is_empty() {
        warn!(indices = ?staging, "deleting staging indices left by an earlier run");
        store.delete_indices(&staging).await?;
        changed = true;
    }

    let reindexer = Reindexer::new(store, &ctx.config.reindex, &ctx.config.retry);
    let mut partial = Vec::new();
    for backup in listing.iter().filter(|s| s.index.starts_with(BACKUP_PREFIX)) {
        let original = original_of_backup(&backup.index)
            .ok_or_else(|| MigrationError::InvalidBackupName(backup.index.clone()))?;
        let live = listing.iter().find(|s| s.index == original);

        if is_partial_backup(ctx, backup, live, original).await? {
            warn!(
                backup = %backup.index,
                backup_docs = ?backup.doc_count(),
                live_docs = ?live.and_then(IndexStats::doc_count),
                "discarding partial backup left by an earlier run"
            );
            partial.push(backup.index.clone());
        } else {
            warn!(backup = %backup.index, index = %original, "restoring backup left by an earlier run");
            restore_backup(ctx, &reindexer, original, backup).await?;
        }
        changed = true;
    }
    if !partial.is_empty() {
        store.delete_indices(&partial).await?;
    }

    Ok(changed)
}

/// Staging indices of the run that still exist.
async fn existing_staging(ctx: &MigrationContext) -> Result<Vec<String>, MigrationError> {
    let mut existing = Vec::new();
    for staging in ctx.registry.live_staging() {
        if ctx.store().index_exists(&staging).await? {
            existing.push(staging);
        }
    }
    Ok(existing)
}

/// Replace `source` with the contents of its staging index.
async fn swap_in_staging(
    ctx: &MigrationContext,
    reindexer: &Reindexer<'_>,
    source: &str,
    staging: &IndexStats,
) -> Result<(), MigrationError> {
    let store = ctx.store();
    if store.index_exists(source).await? {
        store.delete_indices(&[source.to_string()]).await?;
    }
    reindexer.reindex(staging, source).await?;

    match store.delete_indices(&[staging.index.clone()]).await {
        Ok(()) => ctx.registry.mark_staging_deleted(&staging.index),
        Err(e) => warn!(staging = %staging.index, error = %e, "failed to delete staging index, leaving it for clean"),
    }
    debug!(index = %source, staging = %staging.index, "staging index swapped in");
    Ok(())
}

/// Put `source` back to the contents of `backup` and drop the backup.
async fn restore_backup(
    ctx: &MigrationContext,
    reindexer: &Reindexer<'_>,
    source: &str,
    backup: &IndexStats,
) -> Result<(), MigrationError> {
    let store = ctx.store();
    if store.index_exists(source).await? {
        store.delete_indices(&[source.to_string()]).await?;
    }
    reindexer.reindex(backup, source).await?;
    store.delete_indices(&[backup.index.clone()]).await?;
    info!(index = %source, backup = %backup.index, "restored from backup");
    Ok(())
}

#[async_trait]
impl Transformer for ExtensionsTransformer {
    fn version(&self) -> TransformerVersion {
        TransformerVersion::new(Self::ORIGIN, Self::DESTINATION)
    }

    fn requires(&self) -> Vec<Requirement> {
        vec![Requirement::new("mongo", "1")]
    }

    async fn backup(&self, ctx: &mut MigrationContext) -> Result<(), MigrationError> {
        let ctx = &*ctx;
        ctx.registry.clear();
        ctx.extensions.clear();

        let store = ctx.store();
        let mut listing = store.list_indices().await?;
        if settle_leftovers(ctx, &listing).await? {
            listing = store.list_indices().await?;
        }

        let classified = IndexClassifier::new(ctx.metadata()).classify_all(listing).await;
        let sources: Vec<IndexStats> = classified
            .iter()
            .filter(|(stats, category)| !category.is_migration_artifact() && stats.doc_count() != Some(0))
            .map(|(stats, _)| stats.clone())
            .collect();
        for (stats, category) in classified {
            ctx.registry.record_classification(stats, category);
        }

        let reindexer = &Reindexer::new(store, &ctx.config.reindex, &ctx.config.retry);
        let registry = &ctx.registry;
        try_join_all(sources.iter().map(|source| async move {
            let backup = backup_name(&source.index);
            reindexer.reindex(source, &backup).await?;
            registry.record_backup(source, &backup);
            Ok::<_, MigrationError>(())
        }))
        .await?;

        info!(
            classified = ctx.registry.classified_count(),
            backed_up = sources.len(),
            "backup complete"
        );
        Ok(())
    }

    async fn upgrade(&self, ctx: &mut MigrationContext) -> Result<(), MigrationError> {
        let ctx = &*ctx;
        let registry = &ctx.registry;
        let rewriter = SchemaRewriter::new(
            ctx.store(),
            &ctx.config.reindex,
            &ctx.config.retry,
            registry,
            &ctx.extensions,
        );

        // Only games with a backup can be restored to their previous contents.
        let games = registry.indices_in(IndexCategory::Game);
        try_join_all(
            games
                .iter()
                .filter(|game| registry.has_backup(&game.index))
                .map(|game| rewriter.seed_game_visualizations(game)),
        )
        .await?;

        let mut documents = registry.indices_in(IndexCategory::Trace);
        documents.extend(registry.indices_in(IndexCategory::VersionSnapshot));
        try_join_all(documents.iter().map(|index| rewriter.rewrite_documents(index))).await?;
        info!(
            indices = documents.len(),
            extensions = ?ctx.extensions.names(),
            "identified extensions"
        );

        let artifacts: Vec<(IndexStats, IndexCategory)> =
            [IndexCategory::Kibana, IndexCategory::Template, IndexCategory::Game]
                .into_iter()
                .flat_map(|category| {
                    registry
                        .indices_in(category)
                        .into_iter()
                        .map(move |stats| (stats, category))
                })
                .collect();
        try_join_all(
            artifacts
                .iter()
                .map(|(index, category)| rewriter.rewrite_artifacts(index, *category)),
        )
        .await?;

        let reindexer = Reindexer::new(ctx.store(), &ctx.config.reindex, &ctx.config.retry);
        let swaps = registry.staging();
        try_join_all(
            swaps
                .iter()
                .map(|(source, staging)| swap_in_staging(ctx, &reindexer, source, staging)),
        )
        .await?;

        info!(swapped = swaps.len(), "upgrade complete");
        Ok(())
    }

    async fn check(&self, ctx: &mut MigrationContext) -> Result<(), MigrationError> {
        let ctx = &*ctx;
        let checker = ConsistencyChecker::new(
            ctx.store(),
            &ctx.config.reindex,
            ExtensionExemption::new(&ctx.extensions),
        );
        let pairs = checker
            .check_deployment(&ctx.registry.seeded_counts())
            .await?;
        info!(pairs, "check complete");
        Ok(())
    }

    async fn clean(&self, ctx: &mut MigrationContext) -> Result<(), MigrationError> {
        let ctx = &*ctx;
        let mut to_remove: Vec<String> = ctx
            .registry
            .backups()
            .into_iter()
            .map(|(_, backup)| backup.index)
            .collect();
        to_remove.extend(existing_staging(ctx).await?);

        ctx.registry.clear();
        ctx.extensions.clear();

        if to_remove.is_empty() {
            return Ok(());
        }
        ctx.store().delete_indices(&to_remove).await?;
        info!(deleted = to_remove.len(), "clean complete");
        Ok(())
    }

    async fn restore(&self, ctx: &mut MigrationContext) -> Result<(), MigrationError> {
        let ctx = &*ctx;
        let store = ctx.store();
        let reindexer = Reindexer::new(store, &ctx.config.reindex, &ctx.config.retry);

        let backups = ctx.registry.backups();
        try_join_all(
            backups
                .iter()
                .map(|(source, backup)| restore_backup(ctx, &reindexer, source, backup)),
        )
        .await?;

        // Backups that failed or were cancelled mid-copy were never recorded.
        let mut to_remove = Vec::new();
        for (stats, category) in ctx.registry.classified() {
            if category.is_migration_artifact() || ctx.registry.has_backup(&stats.index) {
                continue;
            }
            let partial = backup_name(&stats.index);
            if store.index_exists(&partial).await? {
                to_remove.push(partial);
            }
        }
        to_remove.extend(existing_staging(ctx).await?);
        if !to_remove.is_empty() {
            store.delete_indices(&to_remove).await?;
        }

        ctx.registry.clear();
        ctx.extensions.clear();
        info!(restored = backups.len(), deleted = to_remove.len(), "restore complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::retry::RetryPolicy;
    use crate::store::{MemoryMetadata, MemoryStore};
    use serde_json::json;
    use std::sync::Arc;

    fn context(store: &Arc<MemoryStore>) -> MigrationContext {
        let config = EngineConfig::default()
            .with_page_size(2)
            .with_retry(RetryPolicy::immediate());
        MigrationContext::new(store.clone(), Arc::new(MemoryMetadata::new()), config)
    }

    #[test]
    fn test_version_and_requirements() {
        let transformer = ExtensionsTransformer::new();
        assert_eq!(transformer.version(), TransformerVersion::new("1", "2"));
        assert_eq!(transformer.requires(), vec![Requirement::new("mongo", "1")]);
    }

    #[tokio::test]
    async fn test_backup_skips_empty_indices() {
        let store = Arc::new(MemoryStore::new());
        store.insert("results-1", "results", "1", json!({"score": 1}));
        store.create_index("opaque-values-1");
        let mut ctx = context(&store);

        ExtensionsTransformer::new().backup(&mut ctx).await.unwrap();

        assert_eq!(store.doc_count("backup_results-1"), 1);
        assert!(!store.index_names().contains(&"backup_opaque-values-1".to_string()));
        assert_eq!(ctx.registry.backups().len(), 1);
        assert_eq!(ctx.registry.category("opaque-values-1"), Some(IndexCategory::OpaqueValues));
    }

    #[tokio::test]
    async fn test_backup_restores_leftover_backups() {
        let store = Arc::new(MemoryStore::new());
        store.insert("kept", "traces", "1", json!({"ext": {"name": "new"}}));
        store.insert("backup_kept", "traces", "1", json!({"name": "old"}));
        store.insert("backup_lost", "traces", "1", json!({"name": "lost"}));
        store.insert("upgrade_kept", "traces", "1", json!({}));
        let mut ctx = context(&store);

        ExtensionsTransformer::new().backup(&mut ctx).await.unwrap();

        assert!(!store.index_names().contains(&"upgrade_kept".to_string()));
        assert_eq!(store.document("kept", "traces", "1"), Some(json!({"name": "old"})));
        assert_eq!(store.document("lost", "traces", "1"), Some(json!({"name": "lost"})));
        assert_eq!(
            store.document("backup_kept", "traces", "1"),
            Some(json!({"name": "old"}))
        );
        assert_eq!(ctx.registry.backups().len(), 2);
    }

    #[tokio::test]
    async fn test_backup_restores_half_swapped_index() {
        let store = Arc::new(MemoryStore::new());
        for id in ["1", "2", "3"] {
            store.insert("backup_t", "traces", id, json!({"name": id, "score": 1}));
        }
        store.insert("t", "traces", "1", json!({"name": "1", "ext": {"score": 1}}));
        let mut ctx = context(&store);

        ExtensionsTransformer::new().backup(&mut ctx).await.unwrap();

        assert_eq!(store.doc_count("t"), 3);
        assert_eq!(
            store.document("t", "traces", "1"),
            Some(json!({"name": "1", "score": 1}))
        );
        assert_eq!(store.doc_count("backup_t"), 3);
    }

    #[tokio::test]
    async fn test_backup_discards_partial_leftover_copy() {
        let store = Arc::new(MemoryStore::new());
        for id in ["1", "2", "3"] {
            store.insert("t", "traces", id, json!({"name": id}));
        }
        store.insert("backup_t", "traces", "1", json!({"name": "1"}));
        store.create_index("backup_empty");
        let mut ctx = context(&store);

        ExtensionsTransformer::new().backup(&mut ctx).await.unwrap();

        assert_eq!(store.doc_count("t"), 3);
        assert_eq!(store.doc_count("backup_t"), 3);
        assert!(!store.index_names().contains(&"backup_empty".to_string()));
        assert!(!store.index_names().contains(&"empty".to_string()));
    }

    #[tokio::test]
    async fn test_backup_restores_seeded_game_index() {
        let store = Arc::new(MemoryStore::new());
        let game = ".games-1";
        store.insert(&format!("backup_{game}"), VISUALIZATION_TYPE, "Health", json!({"title": "old"}));
        store.insert(game, VISUALIZATION_TYPE, "Health", json!({"title": "new"}));
        for (id, body) in default_game_visualizations() {
            store.insert(game, VISUALIZATION_TYPE, id, body);
        }
        let mut ctx = context(&store);

        ExtensionsTransformer::new().backup(&mut ctx).await.unwrap();

        assert_eq!(store.doc_count(game), 1);
        assert_eq!(
            store.document(game, VISUALIZATION_TYPE, "Health"),
            Some(json!({"title": "old"}))
        );
    }

    #[tokio::test]
    async fn test_restore_removes_partial_backups() {
        let store = Arc::new(MemoryStore::new());
        store.insert("a", "traces", "1", json!({"name": "a"}));
        store.insert("b", "traces", "1", json!({"name": "b"}));
        store.fail_writes("backup_b");
        let transformer = ExtensionsTransformer::new();
        let mut ctx = context(&store);

        assert!(transformer.backup(&mut ctx).await.is_err());
        store.clear_faults();
        // Simulate a copy that was cut off after creating the index.
        store.insert("backup_b", "traces", "1", json!({"name": "b"}));

        transformer.restore(&mut ctx).await.unwrap();

        assert_eq!(store.index_names(), vec!["a".to_string(), "b".to_string()]);
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_clean_deletes_backups_and_staging() {
        let store = Arc::new(MemoryStore::new());
        store.insert("a", "traces", "1", json!({"name": "a"}));
        let transformer = ExtensionsTransformer::new();
        let mut ctx = context(&store);

        transformer.backup(&mut ctx).await.unwrap();
        ctx.registry.record_staging("a", "upgrade_a");
        store.insert("upgrade_a", "traces", "1", json!({}));

        transformer.clean(&mut ctx).await.unwrap();

        assert_eq!(store.index_names(), vec!["a".to_string()]);
        assert!(ctx.registry.is_empty());
    }
}
