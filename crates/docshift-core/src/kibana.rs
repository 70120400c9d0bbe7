//! Default index pattern setup for a fresh dashboard index.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::classify::{DEFAULT_PATTERN_INDEX, KIBANA_INDEX};
use crate::error::{MigrationError, StoreError};
use crate::rewrite::INDEX_PATTERN_TYPE;
use crate::store::StoreClient;

/// Document type of the dashboard configuration.
pub const CONFIG_TYPE: &str = "config";

/// Time field of the default index pattern.
pub const DEFAULT_TIME_FIELD: &str = "timestamp";

// Matches the store's default search size.
const CONFIG_SEARCH_SIZE: usize = 10;

/// What [`setup_default_index_pattern`] did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum SetupOutcome {
    /// The pattern was written and made the default of config `config_id`.
    Configured {
        /// Id of the updated config document.
        config_id: String,
    },
    /// Nothing was written.
    Skipped {
        /// Number of config documents found.
        configs: usize,
    },
}

/// The default index pattern document.
pub fn default_index_pattern() -> Value {
    json!({
        "title": DEFAULT_PATTERN_INDEX,
        "timeFieldName": DEFAULT_TIME_FIELD,
        "fields": "[]",
    })
}

/// Create the default index pattern and point the dashboard config at it.
///
/// Only a dashboard index with exactly one config document is touched; any
/// other count, a missing dashboard index included, is skipped.
pub async fn setup_default_index_pattern(
    store: &dyn StoreClient,
) -> Result<SetupOutcome, MigrationError> {
    let configs = match store
        .search_by_type(KIBANA_INDEX, CONFIG_TYPE, CONFIG_SEARCH_SIZE)
        .await
    {
        Ok(hits) => hits,
        Err(StoreError::IndexNotFound(_)) => Vec::new(),
        Err(e) => return Err(e.into()),
    };

    let [config] = configs.as_slice() else {
        warn!(configs = configs.len(), "did not configure the default index pattern");
        return Ok(SetupOutcome::Skipped {
            configs: configs.len(),
        });
    };

    store
        .put_document(
            KIBANA_INDEX,
            INDEX_PATTERN_TYPE,
            DEFAULT_PATTERN_INDEX,
            default_index_pattern(),
        )
        .await?;

    let mut source = config.source.clone().unwrap_or_else(|| json!({}));
    match source.as_object_mut() {
        Some(fields) => {
            fields.insert(
                "defaultIndex".to_string(),
                Value::String(DEFAULT_PATTERN_INDEX.to_string()),
            );
        }
        None => {
            return Err(MigrationError::Serialization(format!(
                "{KIBANA_INDEX}/{CONFIG_TYPE}/{} is not an object",
                config.id
            )))
        }
    }
    store
        .put_document(KIBANA_INDEX, CONFIG_TYPE, &config.id, source)
        .await?;

    info!(config = %config.id, "default index pattern set up");
    Ok(SetupOutcome::Configured {
        config_id: config.id.clone(),
    })
}
