//! Command implementations.
//!
//! Each command returns its report as a string formatted for the selected
//! output format; `main` prints it.

use docshift_core::{
    setup_default_index_pattern, ControllerStatus, MigrationController, MigrationError,
    MigrationRun, RefreshOutcome, SetupOutcome, StoreClient,
};
use serde::Serialize;

use crate::config::OutputFormat;

fn to_json<T: Serialize>(value: &T) -> Result<String, MigrationError> {
    Ok(serde_json::to_string_pretty(value)?)
}

fn status_text(outcome: &RefreshOutcome, target: &str) -> String {
    let mut lines = vec![
        format!("model version:  {}", outcome.current_version),
        format!("target version: {target}"),
        format!("status:         {}", outcome.status),
    ];
    if let Some(version) = &outcome.version {
        lines.push(format!("pending:        {version}"));
    }
    for requirement in &outcome.requirements {
        lines.push(format!("requires:       {requirement}"));
    }
    lines.join("\n")
}

fn run_text(run: &MigrationRun) -> String {
    let mut lines = vec![format!(
        "{} -> {}: {}",
        run.from_version, run.to_version, run.status
    )];
    if !run.extensions.is_empty() {
        lines.push(format!("  extensions: {}", run.extensions.join(", ")));
    }
    for warning in &run.warnings {
        lines.push(format!("  warning: {warning}"));
    }
    lines.join("\n")
}

/// Report the model version and the pending transformer.
pub async fn status(
    controller: &mut MigrationController,
    format: OutputFormat,
) -> Result<String, MigrationError> {
    let outcome = controller.refresh().await?;
    match format {
        OutputFormat::Json => to_json(&outcome),
        OutputFormat::Text => Ok(status_text(&outcome, &controller.config().target_version)),
    }
}

/// Fail unless every requirement of the pending transformer is available.
fn check_requirements(outcome: &RefreshOutcome, available: &[&str]) -> Result<(), MigrationError> {
    let missing = outcome
        .requirements
        .iter()
        .find(|requirement| !available.contains(&requirement.name.as_str()));
    match (missing, &outcome.version) {
        (Some(requirement), Some(version)) => Err(MigrationError::UnmetRequirement {
            version: version.to_string(),
            requirement: requirement.to_string(),
        }),
        _ => Ok(()),
    }
}

/// Run transformers until the deployment reaches the target version.
///
/// `available` names the dependencies the caller provides; a transformer
/// requiring anything else is not run.
pub async fn upgrade(
    controller: &mut MigrationController,
    format: OutputFormat,
    available: &[&str],
) -> Result<String, MigrationError> {
    let mut runs = Vec::new();
    loop {
        let outcome = controller.refresh().await?;
        match outcome.status {
            ControllerStatus::Ok => break,
            ControllerStatus::Error => {
                return Err(MigrationError::NoTransformer {
                    version: outcome.current_version,
                })
            }
            ControllerStatus::Pending => {
                check_requirements(&outcome, available)?;
                runs.push(controller.transform().await?);
            }
        }
    }

    match format {
        OutputFormat::Json => to_json(&runs),
        OutputFormat::Text if runs.is_empty() => Ok(format!(
            "already at model version {}",
            controller.config().target_version
        )),
        OutputFormat::Text => Ok(runs.iter().map(run_text).collect::<Vec<_>>().join("\n")),
    }
}

/// Create the default dashboard index pattern.
pub async fn setup_default_index(
    store: &dyn StoreClient,
    format: OutputFormat,
) -> Result<String, MigrationError> {
    store.ping().await.map_err(MigrationError::Connection)?;
    let outcome = setup_default_index_pattern(store).await?;
    match format {
        OutputFormat::Json => to_json(&outcome),
        OutputFormat::Text => Ok(match outcome {
            SetupOutcome::Configured { config_id } => {
                format!("default index pattern set on config {config_id}")
            }
            SetupOutcome::Skipped { configs } => {
                format!("found {configs} dashboard configs, default index pattern not set")
            }
        }),
    }
}
