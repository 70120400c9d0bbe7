//! Run state and progress reporting.
//!
//! A [`MigrationRun`] records what one controller run did. It is reported to
//! the caller and never persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    /// Run created but not started.
    Pending,
    /// Backup phase in progress.
    BackingUp,
    /// Upgrade phase in progress.
    Upgrading,
    /// Check phase in progress.
    Checking,
    /// Clean phase in progress.
    Cleaning,
    /// The new model version was persisted.
    Complete,
    /// A phase failed and the deployment was restored.
    RolledBack,
    /// A phase failed and restoring failed too, or the version could not be persisted.
    Failed,
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationStatus::Pending => write!(f, "pending"),
            MigrationStatus::BackingUp => write!(f, "backing_up"),
            MigrationStatus::Upgrading => write!(f, "upgrading"),
            MigrationStatus::Checking => write!(f, "checking"),
            MigrationStatus::Cleaning => write!(f, "cleaning"),
            MigrationStatus::Complete => write!(f, "complete"),
            MigrationStatus::RolledBack => write!(f, "rolled_back"),
            MigrationStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A transformer phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Copy every index to its backup.
    Backup,
    /// Rewrite indices and swap staging indices in.
    Upgrade,
    /// Verify live indices against their backups.
    Check,
    /// Delete backups and leftover staging indices.
    Clean,
    /// Undo a failed run from the backups.
    Restore,
}

impl Phase {
    /// Run status while this phase executes.
    pub fn running_status(self) -> MigrationStatus {
        match self {
            Phase::Backup => MigrationStatus::BackingUp,
            Phase::Upgrade => MigrationStatus::Upgrading,
            Phase::Check => MigrationStatus::Checking,
            Phase::Clean => MigrationStatus::Cleaning,
            Phase::Restore => MigrationStatus::RolledBack,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Backup => write!(f, "backup"),
            Phase::Upgrade => write!(f, "upgrade"),
            Phase::Check => write!(f, "check"),
            Phase::Clean => write!(f, "clean"),
            Phase::Restore => write!(f, "restore"),
        }
    }
}

/// Status of a single phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    /// Phase in progress.
    InProgress,
    /// Phase completed successfully.
    Complete,
    /// Phase failed.
    Failed,
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhaseStatus::InProgress => write!(f, "in_progress"),
            PhaseStatus::Complete => write!(f, "complete"),
            PhaseStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Progress of a single phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseProgress {
    /// The phase.
    pub phase: Phase,
    /// Current status.
    pub status: PhaseStatus,
    /// When the phase started.
    pub started_at: DateTime<Utc>,
    /// When the phase ended.
    pub completed_at: Option<DateTime<Utc>>,
    /// Error message if the phase failed.
    pub error: Option<String>,
}

impl PhaseProgress {
    /// Start a phase now.
    pub fn start(phase: Phase) -> Self {
        Self {
            phase,
            status: PhaseStatus::InProgress,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }

    /// Mark the phase as completed.
    pub fn complete(&mut self) {
        self.status = PhaseStatus::Complete;
        self.completed_at = Some(Utc::now());
    }

    /// Mark the phase as failed.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = PhaseStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error = Some(error.into());
    }
}

/// Report of one controller run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRun {
    /// Model version before the run.
    pub from_version: String,
    /// Model version the run upgrades to.
    pub to_version: String,
    /// Current status.
    pub status: MigrationStatus,
    /// Phases in the order they ran.
    pub phases: Vec<PhaseProgress>,
    /// Extension fields discovered by the run.
    pub extensions: Vec<String>,
    /// Non-fatal problems, such as a failed clean.
    pub warnings: Vec<String>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run ended.
    pub completed_at: Option<DateTime<Utc>>,
}

impl MigrationRun {
    /// Create a run report.
    pub fn new(from_version: impl Into<String>, to_version: impl Into<String>) -> Self {
        Self {
            from_version: from_version.into(),
            to_version: to_version.into(),
            status: MigrationStatus::Pending,
            phases: Vec::new(),
            extensions: Vec::new(),
            warnings: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Record the start of a phase.
    pub fn start_phase(&mut self, phase: Phase) {
        self.status = phase.running_status();
        self.phases.push(PhaseProgress::start(phase));
    }

    /// Mark the most recent phase as completed.
    pub fn complete_phase(&mut self) {
        if let Some(progress) = self.phases.last_mut() {
            progress.complete();
        }
    }

    /// Mark the most recent phase as failed.
    pub fn fail_phase(&mut self, error: impl Into<String>) {
        if let Some(progress) = self.phases.last_mut() {
            progress.fail(error);
        }
    }

    /// Last phase that was started.
    pub fn current_phase(&self) -> Option<Phase> {
        self.phases.last().map(|p| p.phase)
    }

    /// Phase that failed the run, if any. Clean failures are warnings, not failures.
    pub fn failed_phase(&self) -> Option<Phase> {
        self.phases
            .iter()
            .find(|p| p.status == PhaseStatus::Failed && p.phase != Phase::Clean)
            .map(|p| p.phase)
    }

    /// Add a warning.
    pub fn warn(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    /// End the run with `status`.
    pub fn finish(&mut self, status: MigrationStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
    }

    /// Whether the run has ended.
    pub fn is_finished(&self) -> bool {
        self.completed_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_lifecycle() {
        let mut run = MigrationRun::new("1", "2");
        assert_eq!(run.status, MigrationStatus::Pending);

        run.start_phase(Phase::Backup);
        assert_eq!(run.status, MigrationStatus::BackingUp);
        run.complete_phase();

        run.start_phase(Phase::Upgrade);
        run.fail_phase("bulk write failed");
        run.start_phase(Phase::Restore);
        run.complete_phase();
        run.finish(MigrationStatus::RolledBack);

        assert_eq!(run.failed_phase(), Some(Phase::Upgrade));
        assert_eq!(run.current_phase(), Some(Phase::Restore));
        assert_eq!(run.phases[1].error.as_deref(), Some("bulk write failed"));
        assert!(run.phases[0].completed_at.is_some());
        assert!(run.is_finished());
    }

    #[test]
    fn test_clean_failure_is_a_warning() {
        let mut run = MigrationRun::new("1", "2");
        run.start_phase(Phase::Clean);
        run.fail_phase("delete failed");
        run.warn("clean failed: delete failed");

        assert_eq!(run.failed_phase(), None);
        assert_eq!(run.warnings.len(), 1);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(MigrationStatus::RolledBack.to_string(), "rolled_back");
        assert_eq!(Phase::Check.to_string(), "check");
        assert_eq!(PhaseStatus::InProgress.to_string(), "in_progress");
    }

    #[test]
    fn test_run_serializes() {
        let mut run = MigrationRun::new("1", "2");
        run.start_phase(Phase::Backup);
        let json = serde_json::to_value(&run).unwrap();
        assert_eq!(json["status"], "backing_up");
        assert_eq!(json["phases"][0]["phase"], "backup");
    }
}
