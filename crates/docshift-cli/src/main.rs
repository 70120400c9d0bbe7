//! docshift command-line tool
//!
//! Upgrades the document model of a deployment's store, reports its model
//! version and sets up the default dashboard index pattern.

mod commands;
mod config;
mod metadata;

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use docshift_client::HttpStore;
use docshift_core::{MemoryMetadata, MigrationController, MigrationError, SharedMetadata, SharedStore};

use config::{Args, CliConfig, Command};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docshift=info,docshift_core=info,docshift_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Args::parse().into_config();

    if let Err(e) = run(config).await {
        eprintln!("Error: {}", e);
        if e
            .downcast_ref::<MigrationError>()
            .is_some_and(MigrationError::requires_operator)
        {
            eprintln!("Restoring from backup_* indices failed; they were left in place for manual recovery.");
        }
        std::process::exit(1);
    }
}

async fn run(config: CliConfig) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        url = %config.client.url,
        command = ?config.command,
        "starting docshift"
    );
    let store: SharedStore = Arc::new(HttpStore::new(config.client.clone())?);

    let output = match config.command {
        Command::SetupDefaultIndex => {
            commands::setup_default_index(store.as_ref(), config.format).await?
        }
        Command::Status | Command::Upgrade => {
            let (metadata, available): (SharedMetadata, Vec<&str>) = match &config.metadata {
                Some(path) => (
                    Arc::new(metadata::load_metadata(path)?),
                    vec![metadata::METADATA_DEPENDENCY],
                ),
                None => {
                    tracing::warn!("no metadata file given, trace and version indices will not be recognized");
                    (Arc::new(MemoryMetadata::new()), Vec::new())
                }
            };

            let mut controller = MigrationController::with_builtin(store, metadata, config.engine);
            controller.connect().await?;
            if config.command == Command::Upgrade {
                commands::upgrade(&mut controller, config.format, &available).await?
            } else {
                commands::status(&mut controller, config.format).await?
            }
        }
    };

    println!("{}", output);
    Ok(())
}
