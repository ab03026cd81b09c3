use std::sync::Arc;
use std::time::Duration;

use labsync_protocol::VerificationState;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::RepositoryClient;
use crate::config::BackoffConfig;
use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationOutcome {
    Verified,
    Mismatched,
    TimedOut,
}

/// Polls remote verification of a staged file with exponential backoff.
pub struct VerificationPoller {
    client: Arc<dyn RepositoryClient>,
    backoff: BackoffConfig,
    cancel: CancellationToken,
}

impl VerificationPoller {
    pub fn new(
        client: Arc<dyn RepositoryClient>,
        backoff: BackoffConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            backoff,
            cancel,
        }
    }

    /// Polls until the record is verified or mismatched, or `timeout`
    /// elapses. Transient poll errors count as pending. Cancellation
    /// returns [`SyncError::Canceled`].
    pub async fn await_verification(
        &self,
        record_id: i64,
        timeout: Duration,
    ) -> Result<VerificationOutcome, SyncError> {
        let deadline = Instant::now() + timeout;
        let mut attempt = 1;
        loop {
            if self.cancel.is_cancelled() {
                return Err(SyncError::Canceled);
            }

            match self.client.poll_verification(record_id).await {
                Ok(VerificationState::Verified) => return Ok(VerificationOutcome::Verified),
                Ok(VerificationState::Mismatched) => return Ok(VerificationOutcome::Mismatched),
                Ok(VerificationState::Pending) => {}
                Err(e) if e.is_transient() => {
                    debug!(record = record_id, error = %e, "verification poll failed");
                }
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(VerificationOutcome::TimedOut);
            }
            let delay = self.backoff.delay_for_attempt(attempt).min(deadline - now);
            attempt += 1;
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(SyncError::Canceled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
