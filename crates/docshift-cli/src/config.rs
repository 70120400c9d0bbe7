//! Command-line arguments and the configuration they produce.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use docshift_client::config::{DEFAULT_TIMEOUT, DEFAULT_URL};
use docshift_client::ClientConfig;
use docshift_core::config::{DEFAULT_MODEL_INDEX, DEFAULT_TARGET_VERSION};
use docshift_core::reindex::{DEFAULT_KEEP_ALIVE, DEFAULT_PAGE_SIZE};
use docshift_core::EngineConfig;

/// Default number of bulk resubmissions.
pub const DEFAULT_RETRIES: u32 = 5;

/// Output format of command reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    Text,
    /// JSON
    Json,
}

/// Commands.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Show the model version and the pending transformer
    Status,
    /// Run transformers until the target model version is reached
    Upgrade,
    /// Create the default dashboard index pattern
    SetupDefaultIndex,
}

/// docshift - schema migrations for Elasticsearch-compatible stores
#[derive(Parser, Debug)]
#[command(name = "docshift")]
#[command(version, about = "Schema migrations for Elasticsearch-compatible stores", long_about = None)]
pub struct Args {
    /// Store URL.
    #[arg(short = 'H', long, default_value = DEFAULT_URL)]
    pub url: String,

    /// Basic auth user name.
    #[arg(short, long)]
    pub username: Option<String>,

    /// Basic auth password.
    #[arg(short, long, requires = "username")]
    pub password: Option<String>,

    /// Request timeout in seconds.
    #[arg(long, default_value_t = DEFAULT_TIMEOUT.as_secs())]
    pub timeout: u64,

    /// JSON file listing known session and version ids.
    #[arg(short, long)]
    pub metadata: Option<PathBuf>,

    /// Model version to upgrade to.
    #[arg(long, default_value = DEFAULT_TARGET_VERSION)]
    pub target_version: String,

    /// Index holding the model version document.
    #[arg(long, default_value = DEFAULT_MODEL_INDEX)]
    pub model_index: String,

    /// Documents per cursor page.
    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
    pub page_size: usize,

    /// Cursor keep-alive window.
    #[arg(long, default_value = DEFAULT_KEEP_ALIVE)]
    pub keep_alive: String,

    /// Bulk resubmissions for capacity-rejected documents.
    #[arg(long, default_value_t = DEFAULT_RETRIES)]
    pub retries: u32,

    /// Output format.
    #[arg(long, default_value = "text", value_enum)]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

/// Everything a command needs.
#[derive(Debug, Clone)]
pub struct CliConfig {
    /// Store client configuration.
    pub client: ClientConfig,
    /// Engine configuration.
    pub engine: EngineConfig,
    /// Metadata file, if any.
    pub metadata: Option<PathBuf>,
    /// Output format.
    pub format: OutputFormat,
    /// Command to run.
    pub command: Command,
}

impl Args {
    /// Convert command-line arguments to configuration.
    pub fn into_config(self) -> CliConfig {
        let mut client = ClientConfig::new(self.url).with_timeout(Duration::from_secs(self.timeout));
        if let Some(username) = self.username {
            client = client.with_credentials(username, self.password);
        }

        let engine = EngineConfig::new(self.target_version)
            .with_model_index(self.model_index)
            .with_page_size(self.page_size)
            .with_keep_alive(self.keep_alive)
            .with_retries(self.retries);

        CliConfig {
            client,
            engine,
            metadata: self.metadata,
            format: self.format,
            command: self.command,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Args::parse_from(["docshift", "status"]).into_config();
        assert_eq!(config.command, Command::Status);
        assert_eq!(config.client, ClientConfig::default());
        assert_eq!(config.engine, EngineConfig::default());
        assert_eq!(config.format, OutputFormat::Text);
        assert!(config.metadata.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = Args::parse_from([
            "docshift",
            "-H",
            "http://search:9200",
            "-u",
            "elastic",
            "-p",
            "secret",
            "--timeout",
            "5",
            "--metadata",
            "ids.json",
            "--page-size",
            "100",
            "--retries",
            "2",
            "--format",
            "json",
            "upgrade",
        ])
        .into_config();

        assert_eq!(config.command, Command::Upgrade);
        assert_eq!(config.client.url, "http://search:9200");
        assert_eq!(config.client.username.as_deref(), Some("elastic"));
        assert_eq!(config.client.password.as_deref(), Some("secret"));
        assert_eq!(config.client.timeout, Duration::from_secs(5));
        assert_eq!(config.metadata, Some(PathBuf::from("ids.json")));
        assert_eq!(config.engine.reindex.page_size, 100);
        assert_eq!(config.engine.retry.retries, 2);
        assert_eq!(config.format, OutputFormat::Json);
    }

    #[test]
    fn test_setup_command_name() {
        let args = Args::parse_from(["docshift", "setup-default-index"]);
        assert_eq!(args.command, Command::SetupDefaultIndex);
    }

    #[test]
    fn test_password_requires_user() {
        assert!(Args::try_parse_from(["docshift", "-p", "secret", "status"]).is_err());
    }
}
