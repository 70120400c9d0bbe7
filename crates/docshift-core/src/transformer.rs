//! Transformer interface.
//!
//! A transformer upgrades a deployment from one model version to the next.
//! The controller looks transformers up by origin version and drives their
//! phases in order.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::error::MigrationError;
use crate::registry::{ExtensionFieldRegistry, MigrationRegistry};
use crate::state::Phase;
use crate::store::{MetadataStore, SharedMetadata, SharedStore, StoreClient};

/// The version pair a transformer connects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransformerVersion {
    /// Version the transformer upgrades from.
    pub origin: String,
    /// Version the transformer upgrades to.
    pub destination: String,
}

impl TransformerVersion {
    /// Create a version pair.
    pub fn new(origin: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            destination: destination.into(),
        }
    }
}

impl fmt::Display for TransformerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.origin, self.destination)
    }
}

/// An upstream dependency a transformer needs, e.g. `mongo` version `1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    /// Dependency name.
    pub name: String,
    /// Required version.
    pub version: String,
}

impl Requirement {
    /// Create a requirement.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.version)
    }
}

/// Everything one run shares between its phases.
pub struct MigrationContext {
    /// Document store.
    pub store: SharedStore,
    /// Secondary metadata store.
    pub metadata: SharedMetadata,
    /// Indices classified, backed up and staged by this run.
    pub registry: MigrationRegistry,
    /// Extension fields discovered by this run.
    pub extensions: ExtensionFieldRegistry,
    /// Engine configuration.
    pub config: EngineConfig,
}

impl MigrationContext {
    /// Create a fresh context with empty registries.
    pub fn new(store: SharedStore, metadata: SharedMetadata, config: EngineConfig) -> Self {
        Self {
            store,
            metadata,
            registry: MigrationRegistry::new(),
            extensions: ExtensionFieldRegistry::new(),
            config,
        }
    }

    /// The document store.
    pub fn store(&self) -> &dyn StoreClient {
        self.store.as_ref()
    }

    /// The metadata store.
    pub fn metadata(&self) -> &dyn MetadataStore {
        self.metadata.as_ref()
    }
}

/// A single-step model upgrade.
///
/// `backup`, `upgrade` and `check` run in that order; `restore` undoes them
/// after a failure and `clean` reclaims temporary indices after success.
#[async_trait]
pub trait Transformer: Send + Sync {
    /// Versions this transformer connects.
    fn version(&self) -> TransformerVersion;

    /// Upstream dependencies the caller should verify before running.
    fn requires(&self) -> Vec<Requirement> {
        Vec::new()
    }

    /// Copy everything the upgrade will touch.
    async fn backup(&self, ctx: &mut MigrationContext) -> Result<(), MigrationError>;

    /// Transform the deployment.
    async fn upgrade(&self, ctx: &mut MigrationContext) -> Result<(), MigrationError>;

    /// Verify the upgraded deployment against the backups.
    async fn check(&self, ctx: &mut MigrationContext) -> Result<(), MigrationError>;

    /// Delete backups and leftover staging indices.
    async fn clean(&self, ctx: &mut MigrationContext) -> Result<(), MigrationError>;

    /// Bring the deployment back to its state before `backup`.
    async fn restore(&self, ctx: &mut MigrationContext) -> Result<(), MigrationError>;

    /// Run one phase.
    async fn run_phase(&self, phase: Phase, ctx: &mut MigrationContext) -> Result<(), MigrationError> {
        match phase {
            Phase::Backup => self.backup(ctx).await,
            Phase::Upgrade => self.upgrade(ctx).await,
            Phase::Check => self.check(ctx).await,
            Phase::Clean => self.clean(ctx).await,
            Phase::Restore => self.restore(ctx).await,
        }
    }
}

/// Shared handle to a transformer.
pub type SharedTransformer = Arc<dyn Transformer>;
