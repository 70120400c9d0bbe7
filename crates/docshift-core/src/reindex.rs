//! Reindex engine.
//!
//! Copies documents between indices with cursor pagination and bulk writes.
//! Pages are processed strictly in order: a cursor is only advanced after the
//! previous page's writes were acknowledged.

use serde_json::Value;
use tracing::{debug, info};

use crate::error::MigrationError;
use crate::retry::RetryPolicy;
use crate::store::{BulkOperation, Hit, IndexStats, StoreClient};

/// Default cursor keep-alive window.
pub const DEFAULT_KEEP_ALIVE: &str = "5m";

/// Default number of documents per page.
pub const DEFAULT_PAGE_SIZE: usize = 500;

/// Pagination settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReindexConfig {
    /// Cursor keep-alive window, in the store's duration syntax.
    pub keep_alive: String,
    /// Documents per page.
    pub page_size: usize,
}

impl Default for ReindexConfig {
    fn default() -> Self {
        Self {
            keep_alive: DEFAULT_KEEP_ALIVE.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl ReindexConfig {
    /// Set the keep-alive window.
    pub fn with_keep_alive(mut self, keep_alive: impl Into<String>) -> Self {
        self.keep_alive = keep_alive.into();
        self
    }

    /// Set the page size.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }
}

/// Body of `hit`. Cursors request `_source`, so a hit without one is an error.
pub fn hit_source(hit: &Hit) -> Result<&Value, MigrationError> {
    hit.source.as_ref().ok_or_else(|| MigrationError::MissingSource {
        index: hit.index.clone(),
        doc_type: hit.doc_type.clone(),
        id: hit.id.clone(),
    })
}

/// Sequential cursor over every document of an index.
pub struct Cursor<'a> {
    store: &'a dyn StoreClient,
    index: String,
    keep_alive: String,
    page_size: usize,
    cursor_id: Option<String>,
    total: u64,
    scanned: u64,
    opened: bool,
    exhausted: bool,
}

impl<'a> Cursor<'a> {
    /// Prepare a cursor; nothing is sent until the first page is requested.
    pub fn new(store: &'a dyn StoreClient, index: &str, config: &ReindexConfig) -> Self {
        Self {
            store,
            index: index.to_string(),
            keep_alive: config.keep_alive.clone(),
            page_size: config.page_size,
            cursor_id: None,
            total: 0,
            scanned: 0,
            opened: false,
            exhausted: false,
        }
    }

    /// Fetch the next page, or `None` once the index is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<Hit>>, MigrationError> {
        if self.exhausted {
            return Ok(None);
        }

        let page = if !self.opened {
            self.opened = true;
            self.store
                .open_cursor(&self.index, &self.keep_alive, self.page_size)
                .await?
        } else {
            match self.cursor_id.clone() {
                Some(cursor_id) => match self.store.continue_cursor(&cursor_id, &self.keep_alive).await {
                    Ok(page) => page,
                    Err(e) => {
                        self.finish().await;
                        return Err(e.into());
                    }
                },
                None => {
                    self.finish().await;
                    return Ok(None);
                }
            }
        };

        if page.cursor_id.is_some() {
            self.cursor_id = page.cursor_id;
        }
        self.total = page.total;

        if page.hits.is_empty() {
            self.finish().await;
            return Ok(None);
        }

        self.scanned += page.hits.len() as u64;
        debug!(
            index = %self.index,
            scanned = self.scanned,
            total = self.total,
            "read page"
        );
        if self.scanned >= self.total || self.cursor_id.is_none() {
            self.finish().await;
        }

        Ok(Some(page.hits))
    }

    /// Documents read so far.
    pub fn scanned(&self) -> u64 {
        self.scanned
    }

    /// Total reported by the store.
    pub fn total(&self) -> u64 {
        self.total
    }

    async fn finish(&mut self) {
        self.exhausted = true;
        if let Some(cursor_id) = self.cursor_id.take() {
            if let Err(e) = self.store.clear_cursor(&cursor_id).await {
                debug!(index = %self.index, error = %e, "failed to clear cursor");
            }
        }
    }
}

/// Copies indices and writes pages with bulk retry.
pub struct Reindexer<'a> {
    store: &'a dyn StoreClient,
    config: &'a ReindexConfig,
    retry: &'a RetryPolicy,
}

impl<'a> Reindexer<'a> {
    /// Create a reindexer.
    pub fn new(store: &'a dyn StoreClient, config: &'a ReindexConfig, retry: &'a RetryPolicy) -> Self {
        Self {
            store,
            config,
            retry,
        }
    }

    /// Open a cursor over `index` with this reindexer's settings.
    pub fn cursor(&self, index: &str) -> Cursor<'a> {
        Cursor::new(self.store, index, self.config)
    }

    /// Copy every document of `source` into `destination`, keeping `{type, id}`.
    ///
    /// Returns the source index name. Sources reporting zero documents are
    /// skipped without opening a cursor.
    pub async fn reindex(&self, source: &IndexStats, destination: &str) -> Result<String, MigrationError> {
        if source.doc_count() == Some(0) {
            debug!(source = %source.index, "source is empty, nothing to copy");
            return Ok(source.index.clone());
        }

        let mut cursor = self.cursor(&source.index);
        let mut copied = 0;
        while let Some(hits) = cursor.next_page().await? {
            copied += self.write_page(destination, &hits).await?;
        }

        info!(
            source = %source.index,
            destination = %destination,
            scanned = cursor.scanned(),
            total = cursor.total(),
            copied,
            "reindexed"
        );
        Ok(source.index.clone())
    }

    /// Write a page of hits verbatim into `destination`.
    pub async fn write_page(&self, destination: &str, hits: &[Hit]) -> Result<usize, MigrationError> {
        let operations = hits
            .iter()
            .map(|hit| {
                let source = hit_source(hit)?;
                Ok(BulkOperation::index(destination, &hit.doc_type, &hit.id, source.clone()))
            })
            .collect::<Result<Vec<_>, MigrationError>>()?;
        self.write_operations(destination, operations).await
    }

    /// Submit `operations` as one bulk request, retrying capacity rejections.
    pub async fn write_operations(
        &self,
        destination: &str,
        operations: Vec<BulkOperation>,
    ) -> Result<usize, MigrationError> {
        if operations.is_empty() {
            return Ok(0);
        }

        let written = operations.len();
        let response = self.store.bulk(operations.clone()).await?;
        if response.errors {
            self.retry
                .resubmit(self.store, destination, &response, &operations)
                .await?;
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn seeded(n: usize) -> MemoryStore {
        let store = MemoryStore::new();
        for i in 0..n {
            store.insert("source", "traces", &format!("{i:03}"), json!({ "n": i }));
        }
        store
    }

    async fn stats(store: &MemoryStore, index: &str) -> IndexStats {
        store
            .list_indices()
            .await
            .unwrap()
            .into_iter()
            .find(|s| s.index == index)
            .unwrap()
    }

    #[tokio::test]
    async fn test_reindex_copies_every_document() {
        let store = seeded(7);
        let config = ReindexConfig::default().with_page_size(3);
        let retry = RetryPolicy::immediate();
        let reindexer = Reindexer::new(&store, &config, &retry);

        let source = stats(&store, "source").await;
        let name = reindexer.reindex(&source, "dest").await.unwrap();

        assert_eq!(name, "source");
        assert_eq!(store.documents("dest").len(), 7);
        assert_eq!(store.bulk_log().len(), 3);
        assert_eq!(store.open_cursors(), 0);
        assert_eq!(store.document("dest", "traces", "004"), Some(json!({ "n": 4 })));
    }

    #[tokio::test]
    async fn test_reindex_is_idempotent() {
        let store = seeded(5);
        let config = ReindexConfig::default().with_page_size(2);
        let retry = RetryPolicy::immediate();
        let reindexer = Reindexer::new(&store, &config, &retry);
        let source = stats(&store, "source").await;

        reindexer.reindex(&source, "dest").await.unwrap();
        let once = store.documents("dest");
        reindexer.reindex(&source, "dest").await.unwrap();

        assert_eq!(store.documents("dest"), once);
    }

    #[tokio::test]
    async fn test_empty_source_is_skipped() {
        let store = MemoryStore::new();
        store.create_index("empty");
        store.fail_reads("empty");
        let config = ReindexConfig::default();
        let retry = RetryPolicy::immediate();
        let reindexer = Reindexer::new(&store, &config, &retry);

        let source = stats(&store, "empty").await;
        reindexer.reindex(&source, "dest").await.unwrap();

        assert!(!store.index_exists("dest").await.unwrap());
    }

    #[tokio::test]
    async fn test_partial_rejection_is_retried() {
        let store = seeded(10);
        store.reject_document("dest", "traces", "002", 1);
        store.reject_document("dest", "traces", "008", 1);
        let config = ReindexConfig::default().with_page_size(10);
        let retry = RetryPolicy::immediate();
        let reindexer = Reindexer::new(&store, &config, &retry);

        let source = stats(&store, "source").await;
        reindexer.reindex(&source, "dest").await.unwrap();

        let log = store.bulk_log();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1], vec!["002".to_string(), "008".to_string()]);
        assert_eq!(store.doc_count("dest"), 10);
    }

    #[tokio::test]
    async fn test_whole_bulk_failure_aborts() {
        let store = seeded(4);
        store.fail_writes("dest");
        let config = ReindexConfig::default();
        let retry = RetryPolicy::immediate();
        let reindexer = Reindexer::new(&store, &config, &retry);

        let source = stats(&store, "source").await;
        let err = reindexer.reindex(&source, "dest").await.unwrap_err();
        assert!(matches!(err, MigrationError::Store(_)));
    }

    #[tokio::test]
    async fn test_cursor_error_aborts() {
        let store = seeded(4);
        store.fail_reads("source");
        let config = ReindexConfig::default();
        let retry = RetryPolicy::immediate();
        let reindexer = Reindexer::new(&store, &config, &retry);

        let source = stats(&store, "source").await;
        assert!(reindexer.reindex(&source, "dest").await.is_err());
        assert!(!store.index_exists("dest").await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_page_clears_cursor() {
        let store = seeded(4);
        let config = ReindexConfig::default().with_page_size(2);
        let mut cursor = Cursor::new(&store, "source", &config);

        assert_eq!(cursor.next_page().await.unwrap().unwrap().len(), 2);
        assert_eq!(store.open_cursors(), 1);
        store.fail_reads("source");

        assert!(cursor.next_page().await.is_err());
        assert_eq!(store.open_cursors(), 0);
        assert!(cursor.next_page().await.unwrap().is_none());
        assert_eq!(cursor.scanned(), 2);
        assert_eq!(cursor.total(), 4);
    }

    #[tokio::test]
    async fn test_hit_without_source_is_rejected() {
        let store = MemoryStore::new();
        let config = ReindexConfig::default();
        let retry = RetryPolicy::immediate();
        let reindexer = Reindexer::new(&store, &config, &retry);
        let mut hit = Hit::new("source", "traces", "1", json!({ "n": 1 }));
        hit.source = None;

        let err = reindexer.write_page("dest", &[hit]).await.unwrap_err();

        assert!(matches!(
            err,
            MigrationError::MissingSource { ref index, ref id, .. } if index == "source" && id == "1"
        ));
        assert!(store.bulk_log().is_empty());
    }
}
