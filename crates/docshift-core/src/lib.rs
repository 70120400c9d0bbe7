//! docshift core - versioned schema migrations for Elasticsearch-compatible
//! document stores.
//!
//! The engine reads a deployment's model version, runs the transformer that
//! upgrades it, verifies the result against backups and rolls back on any
//! failure. The store is reached through the [`StoreClient`] facade; the
//! `docshift-client` crate provides the HTTP implementation.
//!
//! ```ignore
//! use std::sync::Arc;
//! use docshift_core::{EngineConfig, MemoryMetadata, MemoryStore, MigrationController};
//!
//! let store = Arc::new(MemoryStore::new());
//! let mut controller = MigrationController::with_builtin(
//!     store,
//!     Arc::new(MemoryMetadata::new()),
//!     EngineConfig::default(),
//! );
//! controller.connect().await?;
//! if controller.refresh().await?.version.is_some() {
//!     let run = controller.transform().await?;
//!     println!("{} -> {}: {}", run.from_version, run.to_version, run.status);
//! }
//! ```

pub mod classify;
pub mod config;
pub mod controller;
pub mod error;
pub mod kibana;
pub mod registry;
pub mod reindex;
pub mod retry;
pub mod rewrite;
pub mod state;
pub mod store;
pub mod transformer;
pub mod transformers;
pub mod verify;

pub use classify::{IndexCategory, IndexClassifier};
pub use config::EngineConfig;
pub use controller::{
    ControllerStatus, IndexedModelVersion, MigrationController, ModelVersionStore, RefreshOutcome,
};
pub use error::{MigrationError, StoreError};
pub use kibana::{setup_default_index_pattern, SetupOutcome};
pub use registry::{ExtensionFieldRegistry, MigrationRegistry};
pub use reindex::{Cursor, ReindexConfig, Reindexer};
pub use retry::RetryPolicy;
pub use rewrite::{SchemaRewriter, CORE_ATTRIBUTES};
pub use state::{MigrationRun, MigrationStatus, Phase, PhaseProgress, PhaseStatus};
pub use store::{
    BulkOperation, BulkResponse, Hit, IndexStats, MemoryMetadata, MemoryStore, MetadataStore,
    SearchPage, SharedMetadata, SharedStore, StoreClient,
};
pub use transformer::{
    MigrationContext, Requirement, SharedTransformer, Transformer, TransformerVersion,
};
pub use transformers::ExtensionsTransformer;
pub use verify::{ConsistencyChecker, Exemption, ExtensionExemption, StructuralDiffer};
