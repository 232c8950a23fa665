//! Bounded exponential backoff for pipeline stage attempts.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, warn};

use super::job::PipelineJob;
use crate::config::RetryConfig;
use crate::error::StageError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Applied to each attempt; expiry counts as a transient failure.
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn for_stage(config: &RetryConfig, stage: &str) -> Self {
        Self {
            max_attempts: config.max_attempts_for(stage),
            base_delay: Duration::from_secs(config.base_delay_seconds),
            max_delay: Duration::from_secs(config.max_delay_seconds.max(config.base_delay_seconds)),
            attempt_timeout: Duration::from_secs(config.attempt_timeout_seconds.max(1)),
        }
    }

    /// Delay before retrying after failed attempt number `attempt` (1-based):
    /// base, 2x base, 4x base, ... capped at `max_delay`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Run `operation` until it succeeds, fails permanently or exhausts the
/// policy. Exhaustion is reported as a permanent error carrying the last
/// transient message.
pub async fn retry_stage<F, Fut, T>(
    stage: &str,
    policy: &RetryPolicy,
    job: &mut PipelineJob,
    mut operation: F,
) -> Result<T, StageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StageError>>,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        job.record_attempt(stage);

        if attempt > 1 {
            debug!(
                meeting_id = job.meeting_id,
                stage, attempt, "Retrying pipeline stage"
            );
        }

        let result = match tokio::time::timeout(policy.attempt_timeout, operation()).await {
            Ok(result) => result,
            Err(_) => Err(StageError::transient(format!(
                "{} attempt timed out after {}s",
                stage,
                policy.attempt_timeout.as_secs()
            ))),
        };

        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        job.record_error(err.clone());

        if !err.is_transient() {
            return Err(err);
        }

        if attempt >= policy.max_attempts {
            error!(
                meeting_id = job.meeting_id,
                stage,
                attempt,
                error = err.message(),
                "Stage retries exhausted"
            );
            return Err(StageError::permanent(format!(
                "{} failed after {} attempts: {}",
                stage,
                attempt,
                err.message()
            )));
        }

        let delay = policy.delay_after(attempt);
        warn!(
            meeting_id = job.meeting_id,
            stage,
            attempt,
            backoff_ms = delay.as_millis() as u64,
            error = err.message(),
            "Transient stage failure, will retry after backoff"
        );
        tokio::time::sleep(delay).await;
    }
}
