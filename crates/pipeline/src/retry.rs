use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::RetryConfig;
use crate::error::SyncError;

/// Runs `op`, retrying transient failures with backoff.
///
/// Non-transient errors are returned immediately. The backoff sleep is
/// interrupted by cancellation.
pub async fn with_retries<T, F, Fut>(
    policy: &RetryConfig,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        if cancel.is_cancelled() {
            return Err(SyncError::Canceled);
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = policy.backoff.delay_for_attempt(attempt);
                debug!(
                    operation = what,
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(SyncError::Canceled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
