//! Retry policy for capacity-rejected bulk items.
//!
//! Only items the store rejected with a capacity error are retried; every
//! attempt resubmits exactly the documents that are still rejected.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::MigrationError;
use crate::store::{BulkOperation, BulkResponse, StoreClient};

/// Exponential backoff with jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of resubmissions.
    pub retries: u32,
    /// Geometric growth factor between attempts.
    pub factor: f64,
    /// Delay before the first resubmission.
    pub min_timeout: Duration,
    /// Upper bound for any single delay.
    pub max_timeout: Duration,
    /// Multiply each delay by a random factor in `[1, 2)`.
    pub randomize: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 5,
            factor: 3.0,
            min_timeout: Duration::from_secs(1),
            max_timeout: Duration::from_secs(60),
            randomize: true,
        }
    }
}

impl RetryPolicy {
    /// Same attempt bound as the default, with no delay between attempts.
    pub fn immediate() -> Self {
        Self {
            min_timeout: Duration::ZERO,
            max_timeout: Duration::ZERO,
            randomize: false,
            ..Self::default()
        }
    }

    /// Set the number of resubmissions.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Set the initial and maximum delay.
    pub fn with_timeouts(mut self, min: Duration, max: Duration) -> Self {
        self.min_timeout = min;
        self.max_timeout = max;
        self
    }

    /// Delay before resubmission number `attempt` (0-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter = if self.randomize {
            rand::thread_rng().gen_range(1.0..2.0)
        } else {
            1.0
        };
        let delay = self.min_timeout.as_secs_f64() * jitter * self.factor.powi(attempt as i32);
        Duration::from_secs_f64(delay.min(self.max_timeout.as_secs_f64()))
    }

    /// Resubmit the capacity-rejected items of `response` until they are all
    /// accepted or the policy is exhausted.
    ///
    /// `submitted` is the request that produced `response`; rejected items are
    /// matched back to it by `{type, id}`. Returns the number of attempts made.
    pub async fn resubmit(
        &self,
        store: &dyn StoreClient,
        destination: &str,
        response: &BulkResponse,
        submitted: &[BulkOperation],
    ) -> Result<u32, MigrationError> {
        let mut pending = rejected_operations(destination, response, submitted)?;
        let mut attempts = 0;

        while !pending.is_empty() {
            if attempts >= self.retries {
                warn!(
                    index = %destination,
                    attempts,
                    remaining = pending.len(),
                    "giving up on rejected bulk items"
                );
                return Err(MigrationError::RetriesExhausted {
                    index: destination.to_string(),
                    attempts,
                    remaining: pending.len(),
                });
            }

            let delay = self.delay_for(attempts);
            debug!(
                index = %destination,
                attempt = attempts + 1,
                rejected = pending.len(),
                delay_ms = delay.as_millis() as u64,
                "resubmitting rejected bulk items"
            );
            tokio::time::sleep(delay).await;
            attempts += 1;

            let response = store.bulk(pending.clone()).await?;
            pending = if response.errors {
                rejected_operations(destination, &response, &pending)?
            } else {
                Vec::new()
            };
        }

        Ok(attempts)
    }
}

/// The submitted operations a bulk response rejected for capacity reasons.
///
/// Any other item failure is fatal, as is a rejection that cannot be matched
/// to a submitted operation.
pub fn rejected_operations(
    destination: &str,
    response: &BulkResponse,
    submitted: &[BulkOperation],
) -> Result<Vec<BulkOperation>, MigrationError> {
    let mut rejected = Vec::new();

    for item in response.failed_items() {
        if !item.is_retryable_rejection() {
            let reason = item
                .error
                .as_ref()
                .map(|e| match &e.reason {
                    Some(reason) => format!("{}: {}", e.error_type, reason),
                    None => e.error_type.clone(),
                })
                .unwrap_or_else(|| format!("status {}", item.status));
            return Err(MigrationError::BulkRejected {
                index: destination.to_string(),
                reason: format!("{}/{}: {}", item.doc_type, item.id, reason),
            });
        }

        let operation = submitted
            .iter()
            .find(|op| op.doc_type == item.doc_type && op.id == item.id)
            .ok_or_else(|| MigrationError::UnmatchedRejection {
                index: destination.to_string(),
                doc_type: item.doc_type.clone(),
                id: item.id.clone(),
            })?;
        rejected.push(operation.clone());
    }

    if response.errors && rejected.is_empty() {
        return Err(MigrationError::BulkRejected {
            index: destination.to_string(),
            reason: "response reported errors without any failed item".to_string(),
        });
    }

    Ok(rejected)
}
