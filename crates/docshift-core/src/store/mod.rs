//! Store client facade.
//!
//! The engine only drives the store's public operations: index listing,
//! cursor (scroll) searches, bulk writes, single-document reads and writes,
//! and index deletion. [`StoreClient`] is the seam; `docshift-client` provides
//! the HTTP implementation and [`memory::MemoryStore`] an in-process one.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MigrationError, StoreError};

pub use memory::{MemoryMetadata, MemoryStore};

/// Status code a store uses for capacity rejections.
pub const RETRYABLE_STATUS: u16 = 429;

/// Error type a store uses for capacity rejections.
pub const RETRYABLE_ERROR_TYPE: &str = "es_rejected_execution_exception";

/// Document type assumed when a hit carries none.
pub const DEFAULT_DOC_TYPE: &str = "_doc";

/// Shared handle to a store client.
pub type SharedStore = Arc<dyn StoreClient>;

/// Shared handle to a metadata store.
pub type SharedMetadata = Arc<dyn MetadataStore>;

/// One row of the store's index listing.
///
/// Field names follow the `_cat/indices` JSON format; counts are kept as the
/// store reports them (strings, absent for closed indices).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    /// Index name.
    pub index: String,
    /// Cluster health of the index.
    #[serde(default)]
    pub health: Option<String>,
    /// Open/closed status.
    #[serde(default)]
    pub status: Option<String>,
    /// Index UUID.
    #[serde(default)]
    pub uuid: Option<String>,
    /// Primary shard count.
    #[serde(default)]
    pub pri: Option<String>,
    /// Replica count.
    #[serde(default)]
    pub rep: Option<String>,
    /// Live document count.
    #[serde(rename = "docs.count", default)]
    pub docs_count: Option<String>,
    /// Deleted document count.
    #[serde(rename = "docs.deleted", default)]
    pub docs_deleted: Option<String>,
    /// Total store size.
    #[serde(rename = "store.size", default)]
    pub store_size: Option<String>,
    /// Primary store size.
    #[serde(rename = "pri.store.size", default)]
    pub pri_store_size: Option<String>,
}

impl IndexStats {
    /// Create stats for a named index with nothing else known.
    pub fn new(index: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            ..Default::default()
        }
    }

    /// Set the live document count.
    pub fn with_docs_count(mut self, count: u64) -> Self {
        self.docs_count = Some(count.to_string());
        self
    }

    /// Parsed live document count, if the store reported one.
    pub fn doc_count(&self) -> Option<u64> {
        self.docs_count.as_deref().and_then(|c| c.trim().parse().ok())
    }

    /// A copy of these stats under another index name.
    pub fn renamed(&self, index: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            ..self.clone()
        }
    }
}

/// A document as returned by a search or get.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    /// Index the document lives in.
    #[serde(rename = "_index")]
    pub index: String,
    /// Document type.
    #[serde(rename = "_type", default = "default_doc_type")]
    pub doc_type: String,
    /// Document id.
    #[serde(rename = "_id")]
    pub id: String,
    /// Document body.
    #[serde(rename = "_source", default)]
    pub source: Option<Value>,
}

fn default_doc_type() -> String {
    DEFAULT_DOC_TYPE.to_string()
}

impl Hit {
    /// Create a hit.
    pub fn new(
        index: impl Into<String>,
        doc_type: impl Into<String>,
        id: impl Into<String>,
        source: Value,
    ) -> Self {
        Self {
            index: index.into(),
            doc_type: doc_type.into(),
            id: id.into(),
            source: Some(source),
        }
    }

    /// Whether this hit is the document addressed by `{doc_type, id}`.
    pub fn is(&self, doc_type: &str, id: &str) -> bool {
        self.doc_type == doc_type && self.id == id
    }
}

/// One page of a cursor search.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchPage {
    /// Cursor token for the next page, if the store issued one.
    pub cursor_id: Option<String>,
    /// Total documents matched by the search.
    pub total: u64,
    /// Documents on this page.
    pub hits: Vec<Hit>,
}

/// A single `index` action of a bulk request.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkOperation {
    /// Destination index.
    pub index: String,
    /// Document type.
    pub doc_type: String,
    /// Document id.
    pub id: String,
    /// Document body.
    pub source: Value,
}

impl BulkOperation {
    /// Index `source` into `index` under `{doc_type, id}`.
    pub fn index(
        index: impl Into<String>,
        doc_type: impl Into<String>,
        id: impl Into<String>,
        source: Value,
    ) -> Self {
        Self {
            index: index.into(),
            doc_type: doc_type.into(),
            id: id.into(),
            source,
        }
    }
}

/// Response to a bulk request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkResponse {
    /// Whether any item failed.
    #[serde(default)]
    pub errors: bool,
    /// Per-item results, in request order.
    #[serde(default)]
    pub items: Vec<BulkItem>,
}

impl BulkResponse {
    /// Results of the items that failed.
    pub fn failed_items(&self) -> impl Iterator<Item = &BulkItemResult> {
        self.items
            .iter()
            .filter_map(|item| item.index.as_ref())
            .filter(|result| result.error.is_some() || result.status >= 300)
    }
}

/// One entry of a bulk response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkItem {
    /// Result of an `index` action.
    #[serde(default)]
    pub index: Option<BulkItemResult>,
}

/// Result of a single bulk action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkItemResult {
    /// Index written to.
    #[serde(rename = "_index", default)]
    pub index: Option<String>,
    /// Document type.
    #[serde(rename = "_type", default = "default_doc_type")]
    pub doc_type: String,
    /// Document id.
    #[serde(rename = "_id", default)]
    pub id: String,
    /// HTTP-style status of the action.
    #[serde(default)]
    pub status: u16,
    /// Error, if the action failed.
    #[serde(default)]
    pub error: Option<BulkItemError>,
}

impl BulkItemResult {
    /// Whether the store rejected this item for transient capacity reasons.
    pub fn is_retryable_rejection(&self) -> bool {
        self.status == RETRYABLE_STATUS
            && self
                .error
                .as_ref()
                .is_some_and(|e| e.error_type == RETRYABLE_ERROR_TYPE)
    }
}

/// Error details of a failed bulk action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkItemError {
    /// Store error type, e.g. `es_rejected_execution_exception`.
    #[serde(rename = "type", default)]
    pub error_type: String,
    /// Human-readable reason.
    #[serde(default)]
    pub reason: Option<String>,
}

/// Operations the engine consumes from the document store.
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Check that the store answers.
    async fn ping(&self) -> Result<(), StoreError>;

    /// List every index with its stats.
    async fn list_indices(&self) -> Result<Vec<IndexStats>, StoreError>;

    /// Open a cursor over all documents of `index` and return its first page.
    async fn open_cursor(
        &self,
        index: &str,
        keep_alive: &str,
        page_size: usize,
    ) -> Result<SearchPage, StoreError>;

    /// Fetch the next page of an open cursor.
    async fn continue_cursor(&self, cursor_id: &str, keep_alive: &str)
        -> Result<SearchPage, StoreError>;

    /// Release a cursor before its keep-alive expires.
    async fn clear_cursor(&self, _cursor_id: &str) -> Result<(), StoreError> {
        Ok(())
    }

    /// Return up to `size` documents of one type from `index`.
    async fn search_by_type(
        &self,
        index: &str,
        doc_type: &str,
        size: usize,
    ) -> Result<Vec<Hit>, StoreError>;

    /// Submit a bulk request.
    async fn bulk(&self, operations: Vec<BulkOperation>) -> Result<BulkResponse, StoreError>;

    /// Fetch a single document; `None` if it does not exist.
    async fn get_document(
        &self,
        index: &str,
        doc_type: &str,
        id: &str,
    ) -> Result<Option<Hit>, StoreError>;

    /// Index a single document, creating the index if needed.
    async fn put_document(
        &self,
        index: &str,
        doc_type: &str,
        id: &str,
        body: Value,
    ) -> Result<(), StoreError>;

    /// Whether an index exists.
    async fn index_exists(&self, index: &str) -> Result<bool, StoreError>;

    /// Delete several indices in a single request.
    async fn delete_indices(&self, indices: &[String]) -> Result<(), StoreError>;
}

/// Secondary metadata store used to identify opaque index names.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Find the document with `id` in `collection`.
    async fn find_one(&self, collection: &str, id: &str) -> Result<Option<Value>, MigrationError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_index_stats_from_cat_json() {
        let stats: IndexStats = serde_json::from_value(json!({
            "health": "yellow",
            "status": "open",
            "index": "index_name",
            "uuid": "L_P5yUBnRC-fzXVrtKkmpQ",
            "pri": "5",
            "rep": "1",
            "docs.count": "30",
            "docs.deleted": "0",
            "store.size": "206.1kb",
            "pri.store.size": "206.1kb"
        }))
        .unwrap();

        assert_eq!(stats.index, "index_name");
        assert_eq!(stats.doc_count(), Some(30));
        assert_eq!(stats.renamed("backup_index_name").doc_count(), Some(30));
    }

    #[test]
    fn test_closed_index_has_no_count() {
        let stats: IndexStats =
            serde_json::from_value(json!({"index": "closed", "status": "close"})).unwrap();
        assert_eq!(stats.doc_count(), None);
    }

    #[test]
    fn test_retryable_rejection() {
        let response: BulkResponse = serde_json::from_value(json!({
            "errors": true,
            "items": [
                {"index": {"_index": "a", "_type": "traces", "_id": "1", "status": 201}},
                {"index": {"_index": "a", "_type": "traces", "_id": "2", "status": 429,
                    "error": {"type": "es_rejected_execution_exception", "reason": "queue full"}}},
                {"index": {"_index": "a", "_type": "traces", "_id": "3", "status": 400,
                    "error": {"type": "mapper_parsing_exception"}}}
            ]
        }))
        .unwrap();

        let failed: Vec<_> = response.failed_items().collect();
        assert_eq!(failed.len(), 2);
        assert!(failed[0].is_retryable_rejection());
        assert!(!failed[1].is_retryable_rejection());
    }
}
