//! Consistency checker.
//!
//! Compares every document of a backup index with its live counterpart. The
//! comparison is structural and skips the fields a migration is expected to
//! move, as decided by an [`Exemption`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use futures::future::try_join_all;
use serde_json::Value;
use tracing::{debug, info};

use crate::classify::BACKUP_PREFIX;
use crate::error::MigrationError;
use crate::registry::{original_of_backup, ExtensionFieldRegistry};
use crate::reindex::{Cursor, ReindexConfig};
use crate::rewrite::EXTENSION_FIELD;
use crate::store::{Hit, IndexStats, StoreClient};

/// Decides which object keys the differ ignores.
///
/// `depth` is 0 for the top-level keys of a document.
pub trait Exemption: Send + Sync {
    /// Whether differences under `name` are expected.
    fn is_exempt(&self, name: &str, depth: usize) -> bool;
}

/// Exempts nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoExemption;

impl Exemption for NoExemption {
    fn is_exempt(&self, _name: &str, _depth: usize) -> bool {
        false
    }
}

/// Exemptions of the extension relocation.
///
/// Registered extension names are exempt at any depth. The serialized
/// sub-documents `fields` and `visState` are exempt at the top level, as is
/// the `ext` container once any extension was registered.
pub struct ExtensionExemption<'a> {
    extensions: &'a ExtensionFieldRegistry,
}

impl<'a> ExtensionExemption<'a> {
    /// Top-level fields holding serialized, rewritten sub-documents.
    pub const SERIALIZED_FIELDS: [&'static str; 2] = ["fields", "visState"];

    /// Exempt the names in `extensions`.
    pub fn new(extensions: &'a ExtensionFieldRegistry) -> Self {
        Self { extensions }
    }
}

impl Exemption for ExtensionExemption<'_> {
    fn is_exempt(&self, name: &str, depth: usize) -> bool {
        if self.extensions.contains(name) {
            return true;
        }
        depth == 0
            && (Self::SERIALIZED_FIELDS.contains(&name)
                || (name == EXTENSION_FIELD && !self.extensions.is_empty()))
    }
}

/// First difference found between two values.
#[derive(Debug, Clone, PartialEq)]
pub struct Mismatch {
    /// Path of the differing value, e.g. `aggs[0].params.field`.
    pub path: String,
    /// Value on the expected side, `None` if absent.
    pub expected: Option<Value>,
    /// Value on the actual side, `None` if absent.
    pub actual: Option<Value>,
}

fn render(value: &Option<Value>) -> String {
    match value {
        Some(value) => value.to_string(),
        None => "<absent>".to_string(),
    }
}

impl Mismatch {
    /// Expected value as text.
    pub fn expected_text(&self) -> String {
        render(&self.expected)
    }

    /// Actual value as text.
    pub fn actual_text(&self) -> String {
        render(&self.actual)
    }
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: expected {}, found {}",
            self.path,
            self.expected_text(),
            self.actual_text()
        )
    }
}

fn child_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{parent}.{key}")
    }
}

fn numbers_equal(x: &serde_json::Number, y: &serde_json::Number) -> bool {
    x == y || matches!((x.as_f64(), y.as_f64()), (Some(a), Some(b)) if a == b)
}

/// Deep comparator over JSON values.
#[derive(Debug, Clone, Default)]
pub struct StructuralDiffer<E> {
    exemption: E,
}

impl<E: Exemption> StructuralDiffer<E> {
    /// Create a differ ignoring what `exemption` exempts.
    pub fn new(exemption: E) -> Self {
        Self { exemption }
    }

    /// First difference between `expected` and `actual`, if any.
    ///
    /// Keys only present on the actual side are differences unless exempt.
    /// Arrays compare by length, then element by element.
    pub fn diff(&self, expected: &Value, actual: &Value) -> Option<Mismatch> {
        self.diff_at("", 0, expected, actual)
    }

    fn diff_at(&self, path: &str, depth: usize, expected: &Value, actual: &Value) -> Option<Mismatch> {
        let mismatch = || {
            Some(Mismatch {
                path: if path.is_empty() { "<root>".to_string() } else { path.to_string() },
                expected: Some(expected.clone()),
                actual: Some(actual.clone()),
            })
        };

        match (expected, actual) {
            (Value::Object(x), Value::Object(y)) => {
                for (key, value) in y {
                    if !x.contains_key(key) && !self.exemption.is_exempt(key, depth) {
                        return Some(Mismatch {
                            path: child_path(path, key),
                            expected: None,
                            actual: Some(value.clone()),
                        });
                    }
                }
                for (key, value) in x {
                    if self.exemption.is_exempt(key, depth) {
                        continue;
                    }
                    let child = child_path(path, key);
                    match y.get(key) {
                        Some(other) => {
                            if let Some(found) = self.diff_at(&child, depth + 1, value, other) {
                                return Some(found);
                            }
                        }
                        None => {
                            return Some(Mismatch {
                                path: child,
                                expected: Some(value.clone()),
                                actual: None,
                            })
                        }
                    }
                }
                None
            }
            (Value::Array(x), Value::Array(y)) => {
                if x.len() != y.len() {
                    return mismatch();
                }
                x.iter()
                    .zip(y)
                    .enumerate()
                    .find_map(|(i, (a, b))| self.diff_at(&format!("{path}[{i}]"), depth + 1, a, b))
            }
            (Value::Number(x), Value::Number(y)) if numbers_equal(x, y) => None,
            _ if expected == actual => None,
            _ => mismatch(),
        }
    }
}

/// Verifies live indices against their backups.
pub struct ConsistencyChecker<'a, E> {
    store: &'a dyn StoreClient,
    config: &'a ReindexConfig,
    differ: StructuralDiffer<E>,
}

impl<'a, E: Exemption> ConsistencyChecker<'a, E> {
    /// Create a checker using `exemption` for every comparison.
    pub fn new(store: &'a dyn StoreClient, config: &'a ReindexConfig, exemption: E) -> Self {
        Self {
            store,
            config,
            differ: StructuralDiffer::new(exemption),
        }
    }

    /// Compare every document of `backup` with the same `{type, id}` in `live`.
    ///
    /// Documents of a page are fetched concurrently; the first difference or
    /// missing document fails the check. Returns the number of documents checked.
    pub async fn check(&self, backup: &str, live: &str) -> Result<u64, MigrationError> {
        let mut cursor = Cursor::new(self.store, backup, self.config);
        let mut checked = 0;

        while let Some(hits) = cursor.next_page().await? {
            try_join_all(hits.iter().map(|hit| self.check_hit(backup, live, hit))).await?;
            checked += hits.len() as u64;
        }

        debug!(backup = %backup, live = %live, checked, "backup matches live index");
        Ok(checked)
    }

    async fn check_hit(&self, backup: &str, live: &str, hit: &Hit) -> Result<(), MigrationError> {
        let current = self
            .store
            .get_document(live, &hit.doc_type, &hit.id)
            .await?
            .ok_or_else(|| MigrationError::MissingDocument {
                index: live.to_string(),
                doc_type: hit.doc_type.clone(),
                id: hit.id.clone(),
            })?;

        let expected = hit.source.clone().unwrap_or(Value::Null);
        let actual = current.source.unwrap_or(Value::Null);
        match self.differ.diff(&expected, &actual) {
            None => Ok(()),
            Some(mismatch) => Err(MigrationError::VerificationFailed {
                backup_index: backup.to_string(),
                live_index: live.to_string(),
                doc_type: hit.doc_type.clone(),
                id: hit.id.clone(),
                expected: mismatch.expected_text(),
                actual: mismatch.actual_text(),
                path: mismatch.path,
            }),
        }
    }

    /// Check every backup index of the deployment against its live index.
    ///
    /// Document counts must match before any document is compared; `added`
    /// holds the documents a run created per live index with no backup
    /// counterpart. Returns the number of pairs checked.
    pub async fn check_deployment(&self, added: &BTreeMap<String, u64>) -> Result<usize, MigrationError> {
        let listing = self.store.list_indices().await?;
        let by_name: HashMap<&str, &IndexStats> =
            listing.iter().map(|stats| (stats.index.as_str(), stats)).collect();

        let mut pairs = Vec::new();
        for backup in listing.iter().filter(|s| s.index.starts_with(BACKUP_PREFIX)) {
            let original = original_of_backup(&backup.index)
                .ok_or_else(|| MigrationError::InvalidBackupName(backup.index.clone()))?;
            let live = by_name
                .get(original)
                .ok_or_else(|| MigrationError::MissingLiveIndex {
                    backup_index: backup.index.clone(),
                })?;

            if let (Some(backup_count), Some(live_count)) = (backup.doc_count(), live.doc_count()) {
                let expected = backup_count + added.get(original).copied().unwrap_or(0);
                if expected != live_count {
                    return Err(MigrationError::DocumentCountMismatch {
                        backup_index: backup.index.clone(),
                        live_index: live.index.clone(),
                        backup_count,
                        live_count,
                    });
                }
            }
            pairs.push((backup.index.as_str(), live.index.as_str()));
        }

        try_join_all(pairs.iter().map(|(backup, live)| self.check(backup, live))).await?;

        info!(pairs = pairs.len(), "deployment matches its backups");
        Ok(pairs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn registry_with(names: &[&str]) -> ExtensionFieldRegistry {
        let extensions = ExtensionFieldRegistry::new();
        for name in names {
            extensions.insert(name);
        }
        extensions
    }

    #[test]
    fn test_identical_documents() {
        let differ = StructuralDiffer::new(NoExemption);
        let doc = json!({
            "name": "a",
            "timestamp": "2017-01-01T00:00:00.000Z",
            "tags": [1, 2, {"x": null}],
            "nested": {"ok": true}
        });
        assert_eq!(differ.diff(&doc, &doc.clone()), None);
    }

    #[test]
    fn test_reports_path_and_values() {
        let differ = StructuralDiffer::new(NoExemption);
        let mismatch = differ
            .diff(
                &json!({"aggs": [{"params": {"field": "a"}}]}),
                &json!({"aggs": [{"params": {"field": "b"}}]}),
            )
            .unwrap();

        assert_eq!(mismatch.path, "aggs[0].params.field");
        assert_eq!(mismatch.expected_text(), "\"a\"");
        assert_eq!(mismatch.actual_text(), "\"b\"");
    }

    #[test]
    fn test_array_length_and_missing_keys() {
        let differ = StructuralDiffer::new(NoExemption);
        assert!(differ.diff(&json!({"a": [1, 2]}), &json!({"a": [1]})).is_some());

        let missing = differ.diff(&json!({"a": 1, "b": 2}), &json!({"a": 1})).unwrap();
        assert_eq!(missing.path, "b");
        assert_eq!(missing.actual, None);

        let extra = differ.diff(&json!({"a": 1}), &json!({"a": 1, "c": 3})).unwrap();
        assert_eq!(extra.path, "c");
        assert_eq!(extra.expected, None);
    }

    #[test]
    fn test_numbers_compare_by_value() {
        let differ = StructuralDiffer::new(NoExemption);
        assert_eq!(differ.diff(&json!({"score": 1}), &json!({"score": 1.0})), None);
        assert!(differ.diff(&json!({"score": 1}), &json!({"score": "1"})).is_some());
    }

    #[test]
    fn test_extension_exemption() {
        let extensions = registry_with(&["customScore"]);
        let differ = StructuralDiffer::new(ExtensionExemption::new(&extensions));

        let backup = json!({"name": "a", "customScore": 7, "visState": "{}"});
        let live = json!({"name": "a", "ext": {"customScore": 7}, "visState": "{\"x\":1}"});
        assert_eq!(differ.diff(&backup, &live), None);

        let changed = json!({"name": "b", "ext": {"customScore": 7}, "visState": "{}"});
        let mismatch = differ.diff(&backup, &changed).unwrap();
        assert_eq!(mismatch.path, "name");
    }

    #[test]
    fn test_serialized_fields_only_exempt_at_top_level() {
        let extensions = ExtensionFieldRegistry::new();
        let differ = StructuralDiffer::new(ExtensionExemption::new(&extensions));

        assert_eq!(differ.diff(&json!({"fields": "[]"}), &json!({"fields": "[1]"})), None);
        assert!(differ
            .diff(&json!({"meta": {"fields": "[]"}}), &json!({"meta": {"fields": "[1]"}}))
            .is_some());
        // Without any extension the container itself is not expected.
        assert!(differ.diff(&json!({"a": 1}), &json!({"a": 1, "ext": {}})).is_some());
    }

    #[tokio::test]
    async fn test_check_passes_for_exempt_differences() {
        let store = MemoryStore::new();
        store.insert("backup_s", "traces", "1", json!({"name": "a", "customScore": 3}));
        store.insert("s", "traces", "1", json!({"name": "a", "ext": {"customScore": 3}}));
        let extensions = registry_with(&["customScore"]);
        let config = ReindexConfig::default();
        let checker = ConsistencyChecker::new(&store, &config, ExtensionExemption::new(&extensions));

        assert_eq!(checker.check("backup_s", "s").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_check_names_document_and_values() {
        let store = MemoryStore::new();
        store.insert("backup_s", "traces", "1", json!({"name": "a", "score": 3}));
        store.insert("s", "traces", "1", json!({"name": "a", "score": 4}));
        let config = ReindexConfig::default();
        let checker = ConsistencyChecker::new(&store, &config, NoExemption);

        let err = checker.check("backup_s", "s").await.unwrap_err();
        match err {
            MigrationError::VerificationFailed {
                id,
                path,
                expected,
                actual,
                ..
            } => {
                assert_eq!(id, "1");
                assert_eq!(path, "score");
                assert_eq!(expected, "3");
                assert_eq!(actual, "4");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_check_reports_missing_document() {
        let store = MemoryStore::new();
        store.insert("backup_s", "traces", "1", json!({}));
        store.insert("backup_s", "traces", "2", json!({}));
        store.insert("s", "traces", "1", json!({}));
        let config = ReindexConfig::default();
        let checker = ConsistencyChecker::new(&store, &config, NoExemption);

        let err = checker.check("backup_s", "s").await.unwrap_err();
        assert!(matches!(err, MigrationError::MissingDocument { ref id, .. } if id == "2"));
    }

    #[tokio::test]
    async fn test_deployment_counts_must_match() {
        let store = MemoryStore::new();
        store.insert("backup_s", "traces", "1", json!({}));
        store.insert("s", "traces", "1", json!({}));
        store.insert("s", "traces", "2", json!({}));
        let config = ReindexConfig::default();
        let checker = ConsistencyChecker::new(&store, &config, NoExemption);

        let err = checker.check_deployment(&BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, MigrationError::DocumentCountMismatch { live_count: 2, .. }));

        let added = BTreeMap::from([("s".to_string(), 1)]);
        assert_eq!(checker.check_deployment(&added).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_deployment_requires_live_index() {
        let store = MemoryStore::new();
        store.insert("backup_gone", "traces", "1", json!({}));
        let config = ReindexConfig::default();
        let checker = ConsistencyChecker::new(&store, &config, NoExemption);

        let err = checker.check_deployment(&BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, MigrationError::MissingLiveIndex { .. }));
    }
}
