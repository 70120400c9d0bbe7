//! Migration controller.
//!
//! Reads the deployment's model version, picks the transformer starting at
//! that version and runs it: backup, upgrade and check, then clean. Any
//! failure before clean triggers a restore. The model version is only written
//! once check has passed.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::error::{MigrationError, StoreError};
use crate::state::{MigrationRun, MigrationStatus, Phase};
use crate::store::{SharedMetadata, SharedStore};
use crate::transformer::{
    MigrationContext, Requirement, SharedTransformer, Transformer, TransformerVersion,
};

/// Model version of a deployment that never recorded one.
pub const INITIAL_MODEL_VERSION: &str = "1";

/// Document type of the model version document.
pub const MODEL_DOC_TYPE: &str = "version";

/// Id of the model version document.
pub const MODEL_DOC_ID: &str = "current";

/// Controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ControllerStatus {
    /// The deployment is at the target version.
    Ok = 0,
    /// A transformer must run.
    Pending = 1,
    /// No transformer upgrades the deployment's version.
    Error = 2,
}

impl ControllerStatus {
    /// Numeric status code.
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for ControllerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControllerStatus::Ok => write!(f, "ok"),
            ControllerStatus::Pending => write!(f, "pending"),
            ControllerStatus::Error => write!(f, "error"),
        }
    }
}

/// Durable storage of the deployment's model version.
#[async_trait]
pub trait ModelVersionStore: Send + Sync {
    /// Current model version.
    async fn model_version(&self) -> Result<String, MigrationError>;

    /// Record a new model version.
    async fn set_model_version(&self, version: &str) -> Result<(), MigrationError>;
}

/// Model version kept as a document in the store itself.
pub struct IndexedModelVersion {
    store: SharedStore,
    index: String,
}

impl IndexedModelVersion {
    /// Keep the version in `index`.
    pub fn new(store: SharedStore, index: impl Into<String>) -> Self {
        Self {
            store,
            index: index.into(),
        }
    }
}

fn version_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl ModelVersionStore for IndexedModelVersion {
    async fn model_version(&self) -> Result<String, MigrationError> {
        let hit = match self
            .store
            .get_document(&self.index, MODEL_DOC_TYPE, MODEL_DOC_ID)
            .await
        {
            Ok(Some(hit)) => hit,
            Ok(None) | Err(StoreError::IndexNotFound(_)) => {
                return Ok(INITIAL_MODEL_VERSION.to_string())
            }
            Err(e) => return Err(e.into()),
        };

        hit.source
            .as_ref()
            .and_then(|source| source.get("version"))
            .and_then(version_text)
            .ok_or_else(|| {
                MigrationError::Serialization(format!(
                    "{}/{}/{} has no readable version",
                    self.index, MODEL_DOC_TYPE, MODEL_DOC_ID
                ))
            })
    }

    async fn set_model_version(&self, version: &str) -> Result<(), MigrationError> {
        self.store
            .put_document(
                &self.index,
                MODEL_DOC_TYPE,
                MODEL_DOC_ID,
                json!({ "version": version }),
            )
            .await?;
        Ok(())
    }
}

/// Result of [`MigrationController::refresh`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshOutcome {
    /// Controller status after the refresh.
    pub status: ControllerStatus,
    /// The deployment's model version.
    pub current_version: String,
    /// Versions of the pending transformer, if any.
    pub version: Option<TransformerVersion>,
    /// Requirements of the pending transformer.
    pub requirements: Vec<Requirement>,
}

/// Drives transformers over a deployment.
pub struct MigrationController {
    store: SharedStore,
    metadata: SharedMetadata,
    versions: Arc<dyn ModelVersionStore>,
    transformers: Vec<SharedTransformer>,
    config: EngineConfig,
    status: ControllerStatus,
    current_version: Option<String>,
    pending: Option<SharedTransformer>,
    last_run: Option<MigrationRun>,
}

impl MigrationController {
    /// Create a controller.
    pub fn new(
        store: SharedStore,
        metadata: SharedMetadata,
        versions: Arc<dyn ModelVersionStore>,
        transformers: Vec<SharedTransformer>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            metadata,
            versions,
            transformers,
            config,
            status: ControllerStatus::Pending,
            current_version: None,
            pending: None,
            last_run: None,
        }
    }

    /// Create a controller with the built-in transformers, keeping the model
    /// version in the configured model index.
    pub fn with_builtin(store: SharedStore, metadata: SharedMetadata, config: EngineConfig) -> Self {
        let versions = Arc::new(IndexedModelVersion::new(store.clone(), config.model_index.clone()));
        Self::new(store, metadata, versions, crate::transformers::builtin(), config)
    }

    /// Current status.
    pub fn status(&self) -> ControllerStatus {
        self.status
    }

    /// Model version read by the last refresh.
    pub fn current_version(&self) -> Option<&str> {
        self.current_version.as_deref()
    }

    /// Versions of the transformer `transform` would run.
    pub fn pending_version(&self) -> Option<TransformerVersion> {
        self.pending.as_ref().map(|t| t.version())
    }

    /// Report of the last transform, successful or not.
    pub fn last_run(&self) -> Option<&MigrationRun> {
        self.last_run.as_ref()
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Check that the store answers.
    pub async fn connect(&mut self) -> Result<(), MigrationError> {
        match self.store.ping().await {
            Ok(()) => {
                info!("connected to store");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "store unreachable");
                self.status = ControllerStatus::Pending;
                self.pending = None;
                Err(MigrationError::Connection(e))
            }
        }
    }

    /// Read the model version and select the transformer to run.
    pub async fn refresh(&mut self) -> Result<RefreshOutcome, MigrationError> {
        let current = self.versions.model_version().await?;
        self.pending = None;

        if current == self.config.target_version {
            self.status = ControllerStatus::Ok;
        } else {
            self.pending = self
                .transformers
                .iter()
                .find(|t| t.version().origin == current)
                .cloned();
            self.status = if self.pending.is_some() {
                ControllerStatus::Pending
            } else {
                ControllerStatus::Error
            };
        }

        info!(
            version = %current,
            target = %self.config.target_version,
            status = %self.status,
            "refreshed model version"
        );
        self.current_version = Some(current.clone());

        Ok(RefreshOutcome {
            status: self.status,
            current_version: current,
            version: self.pending_version(),
            requirements: self
                .pending
                .as_ref()
                .map(|t| t.requires())
                .unwrap_or_default(),
        })
    }

    /// Run the pending transformer.
    ///
    /// On a failure before clean the deployment is restored and the error
    /// comes back as [`MigrationError::RolledBack`], or as
    /// [`MigrationError::RestoreFailed`] when restoring failed too. A clean
    /// failure is only a warning of the returned run.
    pub async fn transform(&mut self) -> Result<MigrationRun, MigrationError> {
        let Some(transformer) = self.pending.clone() else {
            return Err(match (self.status, &self.current_version) {
                (ControllerStatus::Error, Some(version)) => MigrationError::NoTransformer {
                    version: version.clone(),
                },
                _ => MigrationError::NoPendingTransform,
            });
        };

        let version = transformer.version();
        let mut run = MigrationRun::new(&version.origin, &version.destination);
        let mut ctx = MigrationContext::new(self.store.clone(), self.metadata.clone(), self.config.clone());
        info!(from = %version.origin, to = %version.destination, "starting transform");

        for phase in [Phase::Backup, Phase::Upgrade, Phase::Check] {
            run.start_phase(phase);
            if let Err(cause) = transformer.run_phase(phase, &mut ctx).await {
                run.fail_phase(cause.to_string());
                error!(phase = %phase, error = %cause, "phase failed, restoring");
                return Err(self.roll_back(transformer.as_ref(), &mut ctx, run, cause).await);
            }
            run.complete_phase();
            info!(phase = %phase, "phase complete");
        }
        run.extensions = ctx.extensions.names();

        run.start_phase(Phase::Clean);
        match transformer.clean(&mut ctx).await {
            Ok(()) => run.complete_phase(),
            Err(e) => {
                warn!(error = %e, "clean failed, the store may keep unused indices");
                run.fail_phase(e.to_string());
                run.warn(format!("clean failed: {e}"));
            }
        }

        if let Err(e) = self.versions.set_model_version(&version.destination).await {
            error!(error = %e, version = %version.destination, "failed to persist model version");
            run.finish(MigrationStatus::Failed);
            self.status = ControllerStatus::Error;
            self.pending = None;
            self.last_run = Some(run);
            return Err(e);
        }

        run.finish(MigrationStatus::Complete);
        info!(version = %version.destination, "transform complete");

        self.pending = None;
        self.status = if version.destination == self.config.target_version {
            ControllerStatus::Ok
        } else {
            ControllerStatus::Pending
        };
        self.current_version = Some(version.destination);
        self.last_run = Some(run.clone());
        Ok(run)
    }

    async fn roll_back(
        &mut self,
        transformer: &dyn Transformer,
        ctx: &mut MigrationContext,
        mut run: MigrationRun,
        cause: MigrationError,
    ) -> MigrationError {
        run.start_phase(Phase::Restore);
        let err = match transformer.restore(ctx).await {
            Ok(()) => {
                info!("restore complete");
                run.complete_phase();
                run.finish(MigrationStatus::RolledBack);
                MigrationError::RolledBack {
                    cause: Box::new(cause),
                }
            }
            Err(restore) => {
                error!(error = %restore, "restore failed, deployment state is unknown");
                run.fail_phase(restore.to_string());
                run.finish(MigrationStatus::Failed);
                self.status = ControllerStatus::Error;
                self.pending = None;
                MigrationError::RestoreFailed {
                    cause: Box::new(cause),
                    restore: Box::new(restore),
                }
            }
        };
        self.last_run = Some(run);
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::PhaseStatus;
    use crate::store::{MemoryMetadata, MemoryStore};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct ScriptedTransformer {
        fail_on: Option<Phase>,
        restore_fails: bool,
        calls: Mutex<Vec<Phase>>,
    }

    impl ScriptedTransformer {
        fn failing(phase: Phase) -> Self {
            Self {
                fail_on: Some(phase),
                ..Default::default()
            }
        }

        fn step(&self, phase: Phase) -> Result<(), MigrationError> {
            self.calls.lock().push(phase);
            let fails = self.fail_on == Some(phase) || (phase == Phase::Restore && self.restore_fails);
            if fails {
                Err(MigrationError::Metadata(format!("{phase} failed")))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl Transformer for ScriptedTransformer {
        fn version(&self) -> TransformerVersion {
            TransformerVersion::new("1", "2")
        }

        fn requires(&self) -> Vec<Requirement> {
            vec![Requirement::new("mongo", "1")]
        }

        async fn backup(&self, _ctx: &mut MigrationContext) -> Result<(), MigrationError> {
            self.step(Phase::Backup)
        }

        async fn upgrade(&self, _ctx: &mut MigrationContext) -> Result<(), MigrationError> {
            self.step(Phase::Upgrade)
        }

        async fn check(&self, _ctx: &mut MigrationContext) -> Result<(), MigrationError> {
            self.step(Phase::Check)
        }

        async fn clean(&self, _ctx: &mut MigrationContext) -> Result<(), MigrationError> {
            self.step(Phase::Clean)
        }

        async fn restore(&self, _ctx: &mut MigrationContext) -> Result<(), MigrationError> {
            self.step(Phase::Restore)
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        versions: Arc<IndexedModelVersion>,
        transformer: Arc<ScriptedTransformer>,
        controller: MigrationController,
    }

    fn harness(transformer: ScriptedTransformer) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let versions = Arc::new(IndexedModelVersion::new(store.clone(), ".model"));
        let transformer = Arc::new(transformer);
        let controller = MigrationController::new(
            store.clone(),
            Arc::new(MemoryMetadata::new()),
            versions.clone(),
            vec![transformer.clone()],
            EngineConfig::new("2"),
        );
        Harness {
            store,
            versions,
            transformer,
            controller,
        }
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_nothing_pending() {
        let mut h = harness(ScriptedTransformer::default());
        h.store.go_offline();

        let err = h.controller.connect().await.unwrap_err();
        assert!(matches!(err, MigrationError::Connection(_)));
        assert_eq!(h.controller.status(), ControllerStatus::Pending);
        assert_eq!(h.controller.pending_version(), None);
    }

    #[tokio::test]
    async fn test_missing_version_document_means_initial_version() {
        let h = harness(ScriptedTransformer::default());
        assert_eq!(h.versions.model_version().await.unwrap(), "1");

        h.versions.set_model_version("2").await.unwrap();
        assert_eq!(h.versions.model_version().await.unwrap(), "2");

        h.store.insert(".model", "version", "current", json!({"version": 3}));
        assert_eq!(h.versions.model_version().await.unwrap(), "3");
    }

    #[tokio::test]
    async fn test_refresh_statuses() {
        let mut h = harness(ScriptedTransformer::default());

        let outcome = h.controller.refresh().await.unwrap();
        assert_eq!(outcome.status, ControllerStatus::Pending);
        assert_eq!(outcome.version, Some(TransformerVersion::new("1", "2")));
        assert_eq!(outcome.requirements, vec![Requirement::new("mongo", "1")]);

        h.versions.set_model_version("2").await.unwrap();
        let outcome = h.controller.refresh().await.unwrap();
        assert_eq!(outcome.status, ControllerStatus::Ok);
        assert_eq!(outcome.version, None);

        h.versions.set_model_version("7").await.unwrap();
        let outcome = h.controller.refresh().await.unwrap();
        assert_eq!(outcome.status, ControllerStatus::Error);
        assert_eq!(outcome.status.code(), 2);

        let err = h.controller.transform().await.unwrap_err();
        assert!(matches!(err, MigrationError::NoTransformer { ref version } if version == "7"));
    }

    #[tokio::test]
    async fn test_transform_without_refresh() {
        let mut h = harness(ScriptedTransformer::default());
        let err = h.controller.transform().await.unwrap_err();
        assert!(matches!(err, MigrationError::NoPendingTransform));
    }

    #[tokio::test]
    async fn test_successful_transform_persists_version() {
        let mut h = harness(ScriptedTransformer::default());
        h.controller.refresh().await.unwrap();

        let run = h.controller.transform().await.unwrap();

        assert_eq!(run.status, MigrationStatus::Complete);
        assert_eq!(
            *h.transformer.calls.lock(),
            vec![Phase::Backup, Phase::Upgrade, Phase::Check, Phase::Clean]
        );
        assert_eq!(h.versions.model_version().await.unwrap(), "2");
        assert_eq!(h.controller.status(), ControllerStatus::Ok);
    }

    #[tokio::test]
    async fn test_check_failure_restores_and_keeps_version() {
        let mut h = harness(ScriptedTransformer::failing(Phase::Check));
        h.controller.refresh().await.unwrap();

        let err = h.controller.transform().await.unwrap_err();

        assert!(matches!(err, MigrationError::RolledBack { .. }));
        assert!(matches!(err.root_cause(), MigrationError::Metadata(_)));
        assert_eq!(
            *h.transformer.calls.lock(),
            vec![Phase::Backup, Phase::Upgrade, Phase::Check, Phase::Restore]
        );
        assert_eq!(h.versions.model_version().await.unwrap(), "1");

        let run = h.controller.last_run().unwrap();
        assert_eq!(run.status, MigrationStatus::RolledBack);
        assert_eq!(run.failed_phase(), Some(Phase::Check));
    }

    #[tokio::test]
    async fn test_restore_failure_takes_priority() {
        let mut h = harness(ScriptedTransformer {
            fail_on: Some(Phase::Upgrade),
            restore_fails: true,
            ..Default::default()
        });
        h.controller.refresh().await.unwrap();

        let err = h.controller.transform().await.unwrap_err();

        assert!(err.requires_operator());
        assert!(matches!(err, MigrationError::RestoreFailed { .. }));
        assert_eq!(h.controller.status(), ControllerStatus::Error);
        assert_eq!(h.versions.model_version().await.unwrap(), "1");
    }

    #[tokio::test]
    async fn test_clean_failure_is_only_a_warning() {
        let mut h = harness(ScriptedTransformer::failing(Phase::Clean));
        h.controller.refresh().await.unwrap();

        let run = h.controller.transform().await.unwrap();

        assert_eq!(run.status, MigrationStatus::Complete);
        assert_eq!(run.warnings.len(), 1);
        assert_eq!(run.phases.last().unwrap().status, PhaseStatus::Failed);
        assert_eq!(h.versions.model_version().await.unwrap(), "2");
    }
}
