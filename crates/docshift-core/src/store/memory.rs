//! In-process store and metadata implementations.
//!
//! `MemoryStore` follows the REST store's observable semantics closely
//! enough to drive the whole migration pipeline: cursors snapshot the index
//! at open time, bulk writes auto-create indices and report per-item status,
//! and deleting a missing index fails. Faults can be scripted per document or
//! per index to exercise the retry and rollback paths.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use super::{
    BulkItem, BulkItemError, BulkItemResult, BulkOperation, BulkResponse, Hit, IndexStats,
    MetadataStore, SearchPage, StoreClient, RETRYABLE_ERROR_TYPE, RETRYABLE_STATUS,
};
use crate::error::{MigrationError, StoreError};

type DocKey = (String, String);

#[derive(Debug, Default)]
struct MemoryIndex {
    docs: BTreeMap<DocKey, Value>,
}

#[derive(Debug)]
struct OpenCursor {
    index: String,
    hits: Vec<Hit>,
    position: usize,
    page_size: usize,
}

#[derive(Debug, Default)]
struct Faults {
    offline: bool,
    rejections: HashMap<(String, String, String), u32>,
    item_failures: HashSet<(String, String, String)>,
    phantom_rejections: HashMap<String, Vec<DocKey>>,
    failed_writes: HashSet<String>,
    failed_reads: HashSet<String>,
    failed_deletes: HashSet<String>,
}

#[derive(Debug, Default)]
struct Inner {
    indices: BTreeMap<String, MemoryIndex>,
    cursors: HashMap<String, OpenCursor>,
    next_cursor: u64,
    faults: Faults,
    bulk_log: Vec<Vec<String>>,
}

impl Inner {
    fn page(&mut self, cursor_id: &str) -> Result<SearchPage, StoreError> {
        let cursor = self
            .cursors
            .get_mut(cursor_id)
            .ok_or_else(|| StoreError::UnknownCursor(cursor_id.to_string()))?;
        let end = (cursor.position + cursor.page_size).min(cursor.hits.len());
        let hits = cursor.hits[cursor.position..end].to_vec();
        cursor.position = end;
        Ok(SearchPage {
            cursor_id: Some(cursor_id.to_string()),
            total: cursor.hits.len() as u64,
            hits,
        })
    }

    fn hits(&self, index: &str) -> Result<Vec<Hit>, StoreError> {
        let stored = self
            .indices
            .get(index)
            .ok_or_else(|| StoreError::IndexNotFound(index.to_string()))?;
        Ok(stored
            .docs
            .iter()
            .map(|((doc_type, id), source)| Hit::new(index, doc_type, id, source.clone()))
            .collect())
    }

    fn check_readable(&self, index: &str) -> Result<(), StoreError> {
        if self.faults.failed_reads.contains(index) {
            return Err(StoreError::Status {
                status: 500,
                body: format!("injected read failure on {index}"),
            });
        }
        Ok(())
    }

    fn check_writable(&self, index: &str) -> Result<(), StoreError> {
        if self.faults.failed_writes.contains(index) {
            return Err(StoreError::Status {
                status: 500,
                body: format!("injected write failure on {index}"),
            });
        }
        Ok(())
    }
}

/// An in-process document store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an index with no documents.
    pub fn create_index(&self, index: &str) {
        self.inner.lock().indices.entry(index.to_string()).or_default();
    }

    /// Insert or replace a document, creating the index if needed.
    pub fn insert(&self, index: &str, doc_type: &str, id: &str, source: Value) {
        self.inner
            .lock()
            .indices
            .entry(index.to_string())
            .or_default()
            .docs
            .insert((doc_type.to_string(), id.to_string()), source);
    }

    /// Names of all indices, sorted.
    pub fn index_names(&self) -> Vec<String> {
        self.inner.lock().indices.keys().cloned().collect()
    }

    /// All documents of an index, ordered by `{type, id}`.
    pub fn documents(&self, index: &str) -> Vec<Hit> {
        self.inner.lock().hits(index).unwrap_or_default()
    }

    /// A single document body.
    pub fn document(&self, index: &str, doc_type: &str, id: &str) -> Option<Value> {
        self.inner
            .lock()
            .indices
            .get(index)
            .and_then(|i| i.docs.get(&(doc_type.to_string(), id.to_string())).cloned())
    }

    /// Number of documents in an index (0 if absent).
    pub fn doc_count(&self, index: &str) -> usize {
        self.inner
            .lock()
            .indices
            .get(index)
            .map(|i| i.docs.len())
            .unwrap_or(0)
    }

    /// Ids submitted by each bulk request so far, in order.
    pub fn bulk_log(&self) -> Vec<Vec<String>> {
        self.inner.lock().bulk_log.clone()
    }

    /// Number of cursors that were opened and not yet cleared.
    pub fn open_cursors(&self) -> usize {
        self.inner.lock().cursors.len()
    }

    /// Make `ping` fail.
    pub fn go_offline(&self) {
        self.inner.lock().faults.offline = true;
    }

    /// Reject writes of a document with a capacity error `times` times.
    pub fn reject_document(&self, index: &str, doc_type: &str, id: &str, times: u32) {
        self.inner.lock().faults.rejections.insert(
            (index.to_string(), doc_type.to_string(), id.to_string()),
            times,
        );
    }

    /// Fail every write of a document with a non-retryable item error.
    pub fn fail_document(&self, index: &str, doc_type: &str, id: &str) {
        self.inner.lock().faults.item_failures.insert((
            index.to_string(),
            doc_type.to_string(),
            id.to_string(),
        ));
    }

    /// Add a capacity rejection for a document that was never submitted to
    /// the next bulk request targeting `index`.
    pub fn inject_phantom_rejection(&self, index: &str, doc_type: &str, id: &str) {
        self.inner
            .lock()
            .faults
            .phantom_rejections
            .entry(index.to_string())
            .or_default()
            .push((doc_type.to_string(), id.to_string()));
    }

    /// Fail whole bulk requests and single writes targeting `index`.
    pub fn fail_writes(&self, index: &str) {
        self.inner.lock().faults.failed_writes.insert(index.to_string());
    }

    /// Fail cursor searches, cursor pages and gets against `index`.
    pub fn fail_reads(&self, index: &str) {
        self.inner.lock().faults.failed_reads.insert(index.to_string());
    }

    /// Fail deletion requests that include `index`.
    pub fn fail_deletes(&self, index: &str) {
        self.inner.lock().faults.failed_deletes.insert(index.to_string());
    }

    /// Remove every scripted fault.
    pub fn clear_faults(&self) {
        self.inner.lock().faults = Faults::default();
    }
}

#[async_trait]
impl StoreClient for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        if self.inner.lock().faults.offline {
            return Err(StoreError::Transport("connection refused".to_string()));
        }
        Ok(())
    }

    async fn list_indices(&self) -> Result<Vec<IndexStats>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .indices
            .iter()
            .map(|(name, index)| {
                let mut stats = IndexStats::new(name.clone()).with_docs_count(index.docs.len() as u64);
                stats.health = Some("green".to_string());
                stats.status = Some("open".to_string());
                stats.docs_deleted = Some("0".to_string());
                stats
            })
            .collect())
    }

    async fn open_cursor(
        &self,
        index: &str,
        _keep_alive: &str,
        page_size: usize,
    ) -> Result<SearchPage, StoreError> {
        let mut inner = self.inner.lock();
        inner.check_readable(index)?;
        let hits = inner.hits(index)?;
        inner.next_cursor += 1;
        let cursor_id = format!("cursor-{}", inner.next_cursor);
        inner.cursors.insert(
            cursor_id.clone(),
            OpenCursor {
                index: index.to_string(),
                hits,
                position: 0,
                page_size: page_size.max(1),
            },
        );
        inner.page(&cursor_id)
    }

    async fn continue_cursor(
        &self,
        cursor_id: &str,
        _keep_alive: &str,
    ) -> Result<SearchPage, StoreError> {
        let mut inner = self.inner.lock();
        if let Some(cursor) = inner.cursors.get(cursor_id) {
            inner.check_readable(&cursor.index)?;
        }
        inner.page(cursor_id)
    }

    async fn clear_cursor(&self, cursor_id: &str) -> Result<(), StoreError> {
        self.inner.lock().cursors.remove(cursor_id);
        Ok(())
    }

    async fn search_by_type(
        &self,
        index: &str,
        doc_type: &str,
        size: usize,
    ) -> Result<Vec<Hit>, StoreError> {
        let inner = self.inner.lock();
        inner.check_readable(index)?;
        Ok(inner
            .hits(index)?
            .into_iter()
            .filter(|hit| hit.doc_type == doc_type)
            .take(size)
            .collect())
    }

    async fn bulk(&self, operations: Vec<BulkOperation>) -> Result<BulkResponse, StoreError> {
        let mut inner = self.inner.lock();
        for op in &operations {
            inner.check_writable(&op.index)?;
        }
        inner
            .bulk_log
            .push(operations.iter().map(|op| op.id.clone()).collect());

        let mut response = BulkResponse::default();
        let mut targets = Vec::new();
        for op in operations {
            let key = (op.index.clone(), op.doc_type.clone(), op.id.clone());
            let mut result = BulkItemResult {
                index: Some(op.index.clone()),
                doc_type: op.doc_type.clone(),
                id: op.id.clone(),
                status: 201,
                error: None,
            };

            if inner.faults.item_failures.contains(&key) {
                result.status = 400;
                result.error = Some(BulkItemError {
                    error_type: "mapper_parsing_exception".to_string(),
                    reason: Some("failed to parse".to_string()),
                });
            } else if let Some(remaining) = inner.faults.rejections.get_mut(&key).filter(|r| **r > 0) {
                *remaining -= 1;
                result.status = RETRYABLE_STATUS;
                result.error = Some(BulkItemError {
                    error_type: RETRYABLE_ERROR_TYPE.to_string(),
                    reason: Some("rejected execution: queue capacity reached".to_string()),
                });
            } else {
                inner
                    .indices
                    .entry(op.index.clone())
                    .or_default()
                    .docs
                    .insert((op.doc_type, op.id), op.source);
            }

            response.errors |= result.error.is_some();
            if !targets.contains(&op.index) {
                targets.push(op.index);
            }
            response.items.push(BulkItem {
                index: Some(result),
            });
        }

        for target in targets {
            if let Some(phantoms) = inner.faults.phantom_rejections.remove(&target) {
                for (doc_type, id) in phantoms {
                    response.errors = true;
                    response.items.push(BulkItem {
                        index: Some(BulkItemResult {
                            index: Some(target.clone()),
                            doc_type,
                            id,
                            status: RETRYABLE_STATUS,
                            error: Some(BulkItemError {
                                error_type: RETRYABLE_ERROR_TYPE.to_string(),
                                reason: None,
                            }),
                        }),
                    });
                }
            }
        }

        Ok(response)
    }

    async fn get_document(
        &self,
        index: &str,
        doc_type: &str,
        id: &str,
    ) -> Result<Option<Hit>, StoreError> {
        let inner = self.inner.lock();
        inner.check_readable(index)?;
        let stored = inner
            .indices
            .get(index)
            .ok_or_else(|| StoreError::IndexNotFound(index.to_string()))?;
        Ok(stored
            .docs
            .get(&(doc_type.to_string(), id.to_string()))
            .map(|source| Hit::new(index, doc_type, id, source.clone())))
    }

    async fn put_document(
        &self,
        index: &str,
        doc_type: &str,
        id: &str,
        body: Value,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.check_writable(index)?;
        inner
            .indices
            .entry(index.to_string())
            .or_default()
            .docs
            .insert((doc_type.to_string(), id.to_string()), body);
        Ok(())
    }

    async fn index_exists(&self, index: &str) -> Result<bool, StoreError> {
        Ok(self.inner.lock().indices.contains_key(index))
    }

    async fn delete_indices(&self, indices: &[String]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        for index in indices {
            if inner.faults.failed_deletes.contains(index) {
                return Err(StoreError::Status {
                    status: 500,
                    body: format!("injected delete failure on {index}"),
                });
            }
            if !inner.indices.contains_key(index) {
                return Err(StoreError::IndexNotFound(index.clone()));
            }
        }
        for index in indices {
            inner.indices.remove(index);
        }
        Ok(())
    }
}

/// An in-process metadata store holding document ids per collection.
#[derive(Debug, Default)]
pub struct MemoryMetadata {
    collections: Mutex<HashMap<String, HashSet<String>>>,
    unavailable: Mutex<bool>,
}

impl MemoryMetadata {
    /// Create an empty metadata store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a document id to a collection.
    pub fn with_document(self, collection: &str, id: &str) -> Self {
        self.add(collection, id);
        self
    }

    /// Add a document id to a collection.
    pub fn add(&self, collection: &str, id: &str) {
        self.collections
            .lock()
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string());
    }

    /// Make every lookup fail.
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock() = unavailable;
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadata {
    async fn find_one(&self, collection: &str, id: &str) -> Result<Option<Value>, MigrationError> {
        if *self.unavailable.lock() {
            return Err(MigrationError::Metadata(format!(
                "collection {collection} is unavailable"
            )));
        }
        let found = self
            .collections
            .lock()
            .get(collection)
            .is_some_and(|ids| ids.contains(id));
        Ok(found.then(|| json!({ "_id": id })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cursor_pages_through_snapshot() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.insert("traces", "traces", &i.to_string(), json!({"n": i}));
        }

        let first = store.open_cursor("traces", "1m", 2).await.unwrap();
        assert_eq!(first.total, 5);
        assert_eq!(first.hits.len(), 2);

        // Writes after open are not visible to the cursor.
        store.insert("traces", "traces", "9", json!({"n": 9}));

        let cursor = first.cursor_id.unwrap();
        let second = store.continue_cursor(&cursor, "1m").await.unwrap();
        let third = store.continue_cursor(&cursor, "1m").await.unwrap();
        let fourth = store.continue_cursor(&cursor, "1m").await.unwrap();
        assert_eq!(second.hits.len(), 2);
        assert_eq!(third.hits.len(), 1);
        assert!(fourth.hits.is_empty());

        store.clear_cursor(&cursor).await.unwrap();
        assert_eq!(store.open_cursors(), 0);
    }

    #[tokio::test]
    async fn test_bulk_rejection_is_consumed() {
        let store = MemoryStore::new();
        store.reject_document("dest", "traces", "1", 1);

        let ops = vec![BulkOperation::index("dest", "traces", "1", json!({}))];
        let first = store.bulk(ops.clone()).await.unwrap();
        assert!(first.errors);
        assert_eq!(store.doc_count("dest"), 0);

        let second = store.bulk(ops).await.unwrap();
        assert!(!second.errors);
        assert_eq!(store.doc_count("dest"), 1);
    }

    #[tokio::test]
    async fn test_delete_missing_index_fails_atomically() {
        let store = MemoryStore::new();
        store.create_index("a");
        let result = store
            .delete_indices(&["a".to_string(), "b".to_string()])
            .await;
        assert!(matches!(result, Err(StoreError::IndexNotFound(_))));
        assert!(store.index_exists("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_metadata_lookup() {
        let metadata = MemoryMetadata::new().with_document("sessions", "abc");
        assert!(metadata.find_one("sessions", "abc").await.unwrap().is_some());
        assert!(metadata.find_one("versions", "abc").await.unwrap().is_none());

        metadata.set_unavailable(true);
        assert!(metadata.find_one("sessions", "abc").await.is_err());
    }
}
