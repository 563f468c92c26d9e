//! Bounded retry of remote git operations.

use std::fmt::Display;
use std::future::Future;

use tokio::time::sleep;
use tracing::{debug, warn};
use upkeep_common::RetryPolicy;

/// Errors that can be retried.
pub trait RetryableError {
    fn is_retryable(&self) -> bool;
}

/// Run `op`, retrying external-host failures up to `policy.max_attempts`
/// times in total. Any other error is returned at once; when the attempts
/// run out the last error is returned.
pub async fn git_retry<F, Fut, T, E>(operation: &str, policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError + Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        debug!(operation, attempt, max_attempts, "git operation attempt");

        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "git operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let delay = policy.backoff_delay(attempt);
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "git operation failed with external host error, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                if err.is_retryable() {
                    warn!(operation, attempt, error = %err, "git operation retries exhausted");
                } else {
                    debug!(operation, attempt, error = %err, "git operation failed (not retryable)");
                }
                return Err(err);
            }
        }
    }
}
