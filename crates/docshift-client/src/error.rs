//! Client error types.

use docshift_core::StoreError;
use serde_json::Value;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum Error {
    /// The HTTP request failed.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The store answered with a non-success status.
    #[error("store returned status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// The response body could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// The configuration is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Name of the missing index when `body` is an `index_not_found_exception`.
pub(crate) fn missing_index(body: &str) -> Option<String> {
    let error = serde_json::from_str::<Value>(body).ok()?.get("error")?.clone();
    if error.get("type")?.as_str()? != "index_not_found_exception" {
        return None;
    }
    let index = error
        .get("index")
        .and_then(Value::as_str)
        .unwrap_or_default();
    Some(index.to_string())
}

impl From<Error> for StoreError {
    fn from(e: Error) -> Self {
        match e {
            Error::Http(e) if e.is_decode() => StoreError::Decode(e.to_string()),
            Error::Http(e) => StoreError::Transport(e.to_string()),
            Error::Status { status, body } => match missing_index(&body) {
                Some(index) if status == 404 => StoreError::IndexNotFound(index),
                _ => StoreError::Status { status, body },
            },
            Error::Decode(e) => StoreError::Decode(e.to_string()),
            Error::InvalidConfig(reason) => StoreError::Transport(reason),
        }
    }
}
