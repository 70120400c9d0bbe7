//! Schema rewriter.
//!
//! Documents keep the fields of the core attribute list at the top level; any
//! other field moves under the `ext` container. Saved visualizations and
//! index field catalogs name document fields, so they are rewritten with the
//! same rule. All output goes to the staging index of the source, never in
//! place.

use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::classify::IndexCategory;
use crate::error::MigrationError;
use crate::registry::{staging_name, ExtensionFieldRegistry, MigrationRegistry};
use crate::reindex::{hit_source, ReindexConfig, Reindexer};
use crate::retry::RetryPolicy;
use crate::store::{BulkOperation, IndexStats, StoreClient};

/// Field names that stay at the top level of a document.
pub const CORE_ATTRIBUTES: [&str; 19] = [
    "name",
    "timestamp",
    "event",
    "target",
    "type",
    "gameplayId",
    "versionId",
    "session",
    "firstSessionStarted",
    "currentSessionStarted",
    "score",
    "success",
    "completion",
    "response",
    "stored",
    "gameplayId_hashCode",
    "event_hashCode",
    "type_hashCode",
    "target_hashCode",
];

/// Container that receives every non-core field.
pub const EXTENSION_FIELD: &str = "ext";

/// Document type of saved visualizations.
pub const VISUALIZATION_TYPE: &str = "visualization";
/// Document type of index patterns.
pub const INDEX_PATTERN_TYPE: &str = "index-pattern";
/// Document type of template index definitions.
pub const INDEX_TYPE: &str = "index";

const KEYWORD_SUFFIX: &str = ".keyword";

/// Index pattern referenced by the default game visualizations.
const DEFAULT_SEARCH_SOURCE: &str = r#"{"index":"57604f53f552624300d9caa6","query":{"query_string":{"query":"*","analyze_wildcard":true}},"filter":[]}"#;

/// Whether `name` belongs to the core attribute list.
pub fn is_core_attribute(name: &str) -> bool {
    CORE_ATTRIBUTES.contains(&name)
}

/// Move every non-core top-level field of `doc` under `ext`.
///
/// Moved names are added to `extensions`. A legacy `ext` field is not core
/// either, so it ends up nested as `ext.ext`. Non-object documents are
/// returned unchanged.
pub fn relocate_extensions(doc: &Value, extensions: &ExtensionFieldRegistry) -> Value {
    let Some(fields) = doc.as_object() else {
        return doc.clone();
    };

    let mut relocated = Map::new();
    let mut ext = Map::new();
    for (name, value) in fields {
        if is_core_attribute(name) {
            relocated.insert(name.clone(), value.clone());
        } else {
            extensions.insert(name);
            ext.insert(name.clone(), value.clone());
        }
    }

    if !ext.is_empty() {
        relocated.insert(EXTENSION_FIELD.to_string(), Value::Object(ext));
    }
    Value::Object(relocated)
}

/// New path for a field reference, or `None` when it names a core attribute
/// or its `.keyword` variant.
pub fn rewrite_field_path(field: &str) -> Option<String> {
    let base = field.strip_suffix(KEYWORD_SUFFIX).unwrap_or(field);
    if is_core_attribute(base) {
        None
    } else {
        Some(format!("{EXTENSION_FIELD}.{field}"))
    }
}

/// Parse a JSON document stored as a string field, tolerating the
/// double-escaped quotes older dashboards wrote.
fn parse_embedded(raw: &str) -> Result<Value, MigrationError> {
    serde_json::from_str(raw)
        .or_else(|_| serde_json::from_str(&raw.replace("\\\"", "\"")))
        .map_err(MigrationError::from)
}

fn with_string_field(source: &Value, field: &str, value: String) -> Value {
    let mut rewritten = source.clone();
    if let Some(fields) = rewritten.as_object_mut() {
        fields.insert(field.to_string(), Value::String(value));
    }
    rewritten
}

/// Rewrite the aggregation fields of a saved visualization.
///
/// Returns `None` when no extension has been discovered yet, when the
/// visualization has no aggregations, or when every referenced field is core.
pub fn rewrite_visualization(
    source: &Value,
    extensions: &ExtensionFieldRegistry,
) -> Result<Option<Value>, MigrationError> {
    if extensions.is_empty() {
        return Ok(None);
    }
    let Some(raw) = source.get("visState").and_then(Value::as_str) else {
        return Ok(None);
    };

    let mut vis_state = parse_embedded(raw)?;
    let Some(aggs) = vis_state.get_mut("aggs").and_then(Value::as_array_mut) else {
        return Ok(None);
    };

    let mut changed = false;
    for agg in aggs.iter_mut() {
        let Some(field) = agg.get_mut("params").and_then(|params| params.get_mut("field")) else {
            continue;
        };
        if let Some(path) = field.as_str().and_then(rewrite_field_path) {
            *field = Value::String(path);
            changed = true;
        }
    }

    if !changed {
        return Ok(None);
    }
    let encoded = serde_json::to_string(&vis_state)?;
    Ok(Some(with_string_field(source, "visState", encoded)))
}

/// Rewrite the entry names of an index pattern's field catalog.
///
/// Returns `None` when there is no catalog or every entry names a core field.
pub fn rewrite_field_catalog(source: &Value) -> Result<Option<Value>, MigrationError> {
    let Some(raw) = source.get("fields").and_then(Value::as_str) else {
        return Ok(None);
    };

    let mut catalog = parse_embedded(raw)?;
    let Some(entries) = catalog.as_array_mut() else {
        return Ok(None);
    };

    let mut changed = false;
    for entry in entries.iter_mut() {
        let Some(name) = entry.get_mut("name") else {
            continue;
        };
        if let Some(path) = name.as_str().and_then(rewrite_field_path) {
            *name = Value::String(path);
            changed = true;
        }
    }

    if !changed {
        return Ok(None);
    }
    let encoded = serde_json::to_string(&catalog)?;
    Ok(Some(with_string_field(source, "fields", encoded)))
}

/// Kind of derived artifact a document is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// A saved visualization with a `visState`.
    Visualization,
    /// An index pattern or template with a `fields` catalog.
    FieldCatalog,
}

/// Artifact kind of a document of `doc_type` stored in an index of `category`.
pub fn artifact_kind(category: IndexCategory, doc_type: &str) -> Option<ArtifactKind> {
    use IndexCategory::{Game, Kibana, Template};

    match (category, doc_type) {
        (Kibana | Game, VISUALIZATION_TYPE) => Some(ArtifactKind::Visualization),
        (Kibana | Template | Game, INDEX_PATTERN_TYPE) => Some(ArtifactKind::FieldCatalog),
        (Template | Game, INDEX_TYPE) => Some(ArtifactKind::FieldCatalog),
        _ => None,
    }
}

/// The default visualizations every game index carries, as `(id, body)`.
pub fn default_game_visualizations() -> Vec<(&'static str, Value)> {
    vec![
        (
            "TotalSessionPlayers-Cmn",
            json!({
                "title": "TotalSessionPlayers-Cmn",
                "visState": r#"{"title":"Total Session Players","type":"metric","params":{"handleNoResults":true,"fontSize":60},"aggs":[{"id":"1","type":"cardinality","schema":"metric","params":{"field":"name.keyword","customLabel":"SessionPlayers"}}],"listeners":{}}"#,
                "uiStateJSON": "{}",
                "description": "",
                "version": 1,
                "kibanaSavedObjectMeta": { "searchSourceJSON": DEFAULT_SEARCH_SOURCE },
                "author": "_default_",
                "isTeacher": true,
                "isDeveloper": true
            }),
        ),
        (
            "xAPIVerbsActivity",
            json!({
                "title": "xAPIVerbsActivity",
                "visState": r#"{"title":"xAPI Verbs Activity","type":"histogram","params":{"shareYAxis":true,"addTooltip":true,"addLegend":true,"scale":"linear","mode":"stacked","times":[],"addTimeMarker":false,"defaultYExtents":false,"setYExtents":false,"yAxis":{}},"aggs":[{"id":"1","type":"count","schema":"metric","params":{"customLabel":"Activity Count"}},{"id":"2","type":"terms","schema":"segment","params":{"field":"event.keyword","size":15,"order":"desc","orderBy":"1","customLabel":"xAPI Verb"}}],"listeners":{}}"#,
                "uiStateJSON": "{}",
                "description": "",
                "version": 1,
                "kibanaSavedObjectMeta": { "searchSourceJSON": DEFAULT_SEARCH_SOURCE },
                "author": "_default_",
                "isTeacher": false,
                "isDeveloper": true
            }),
        ),
    ]
}

/// Writes rewritten indices into their staging indices.
pub struct SchemaRewriter<'a> {
    store: &'a dyn StoreClient,
    reindexer: Reindexer<'a>,
    registry: &'a MigrationRegistry,
    extensions: &'a ExtensionFieldRegistry,
}

impl<'a> SchemaRewriter<'a> {
    /// Create a rewriter recording its staging indices in `registry`.
    pub fn new(
        store: &'a dyn StoreClient,
        config: &'a ReindexConfig,
        retry: &'a RetryPolicy,
        registry: &'a MigrationRegistry,
        extensions: &'a ExtensionFieldRegistry,
    ) -> Self {
        Self {
            store,
            reindexer: Reindexer::new(store, config, retry),
            registry,
            extensions,
        }
    }

    /// Relocate the extension fields of every document in `index` into its
    /// staging index. Returns the number of documents written.
    pub async fn rewrite_documents(&self, index: &IndexStats) -> Result<u64, MigrationError> {
        if index.doc_count() == Some(0) {
            return Ok(0);
        }

        let staging = staging_name(&index.index);
        let mut cursor = self.reindexer.cursor(&index.index);
        let mut written = 0;

        while let Some(hits) = cursor.next_page().await? {
            let operations = hits
                .iter()
                .map(|hit| {
                    Ok(BulkOperation::index(
                        &staging,
                        &hit.doc_type,
                        &hit.id,
                        relocate_extensions(hit_source(hit)?, self.extensions),
                    ))
                })
                .collect::<Result<Vec<_>, MigrationError>>()?;
            if operations.is_empty() {
                continue;
            }

            self.registry.record_staging(&index.index, &staging);
            written += self.reindexer.write_operations(&staging, operations).await? as u64;
        }

        info!(
            index = %index.index,
            staging = %staging,
            written,
            extensions = self.extensions.len(),
            "rewrote documents"
        );
        Ok(written)
    }

    /// Rewrite the visualizations and field catalogs of an artifact index.
    ///
    /// Rewritten artifacts are indexed one by one; other documents are copied
    /// through by bulk. Unchanged artifacts are only copied when the staging
    /// index exists, so an index without changes gets no staging index at all.
    pub async fn rewrite_artifacts(
        &self,
        index: &IndexStats,
        category: IndexCategory,
    ) -> Result<u64, MigrationError> {
        let staging = staging_name(&index.index);
        let mut cursor = self.reindexer.cursor(&index.index);
        let mut unchanged = Vec::new();
        let mut rewritten = 0;
        let mut written = 0;

        while let Some(hits) = cursor.next_page().await? {
            let mut copies = Vec::new();

            for hit in hits {
                let Some(kind) = artifact_kind(category, &hit.doc_type) else {
                    copies.push(hit);
                    continue;
                };

                let source = hit_source(&hit)?;
                let body = match kind {
                    ArtifactKind::Visualization => rewrite_visualization(source, self.extensions)?,
                    ArtifactKind::FieldCatalog => rewrite_field_catalog(source)?,
                };

                match body {
                    Some(body) => {
                        self.registry.record_staging(&index.index, &staging);
                        self.store
                            .put_document(&staging, &hit.doc_type, &hit.id, body)
                            .await?;
                        debug!(index = %index.index, doc_type = %hit.doc_type, id = %hit.id, "rewrote artifact");
                        rewritten += 1;
                    }
                    None => unchanged.push(hit),
                }
            }

            if !copies.is_empty() {
                self.registry.record_staging(&index.index, &staging);
                written += self.reindexer.write_page(&staging, &copies).await? as u64;
            }
        }

        if !unchanged.is_empty() && self.registry.has_staging(&index.index) {
            written += self.reindexer.write_page(&staging, &unchanged).await? as u64;
        }

        info!(
            index = %index.index,
            category = %category,
            rewritten,
            copied = written,
            "rewrote artifacts"
        );
        Ok(rewritten + written)
    }

    /// Create the default visualizations missing from a game index.
    ///
    /// Existing visualizations are left alone. Returns the number created.
    pub async fn seed_game_visualizations(&self, index: &IndexStats) -> Result<u64, MigrationError> {
        let mut created = 0;
        for (id, body) in default_game_visualizations() {
            if self
                .store
                .get_document(&index.index, VISUALIZATION_TYPE, id)
                .await?
                .is_some()
            {
                debug!(index = %index.index, id, "default visualization already present");
                continue;
            }

            self.store
                .put_document(&index.index, VISUALIZATION_TYPE, id, body)
                .await?;
            self.registry.record_seeded(&index.index, 1);
            created += 1;
        }
        Ok(created)
    }
}
