//! Client configuration.

use std::time::Duration;

/// Default store URL.
pub const DEFAULT_URL: &str = "http://127.0.0.1:9200";

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Client configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Base URL of the store (e.g., "http://127.0.0.1:9200").
    pub url: String,

    /// Request timeout.
    pub timeout: Duration,

    /// Basic auth user name.
    pub username: Option<String>,

    /// Basic auth password.
    pub password: Option<String>,
}

impl ClientConfig {
    /// Create a new client configuration for the store at `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: DEFAULT_TIMEOUT,
            username: None,
            password: None,
        }
    }

    /// Create a configuration for a store on localhost at the default port.
    pub fn localhost() -> Self {
        Self::new(DEFAULT_URL)
    }

    /// Set the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Authenticate with basic auth.
    pub fn with_credentials(mut self, username: impl Into<String>, password: Option<String>) -> Self {
        self.username = Some(username.into());
        self.password = password;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::localhost()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.url, DEFAULT_URL);
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
        assert_eq!(config.username, None);
    }

    #[test]
    fn test_config_builder() {
        let config = ClientConfig::new("https://search.internal:9243")
            .with_timeout(Duration::from_secs(5))
            .with_credentials("elastic", Some("changeme".to_string()));

        assert_eq!(config.url, "https://search.internal:9243");
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.username.as_deref(), Some("elastic"));
        assert_eq!(config.password.as_deref(), Some("changeme"));
    }
}
