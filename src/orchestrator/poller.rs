//! Bot session poller.
//!
//! Polls the remote session with exponential backoff until a predicate holds,
//! the remote reports failure, or the overall timeout elapses. It never
//! touches the meeting store.

use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::PollerConfig;
use crate::error::StageError;
use crate::providers::{BotSessionProvider, BotState, SessionHandle};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerSettings {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// Timeout for each individual remote call.
    pub call_timeout: Duration,
}

impl PollerSettings {
    pub fn from_config(config: &PollerConfig, call_timeout: Duration) -> Self {
        Self {
            initial_interval: config.initial_interval(),
            max_interval: config.max_interval(),
            call_timeout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The predicate held. Refs are only fetched once the session has ended,
    /// and stay `None` when fetching them failed.
    Reached {
        state: BotState,
        media_ref: Option<String>,
        transcript_ref: Option<String>,
        cycles: u32,
    },
    /// The remote reported a failed session.
    RemoteFailed { cycles: u32 },
    /// The overall timeout elapsed first.
    TimedOut { last_state: Option<BotState> },
}

pub struct JobPoller {
    settings: PollerSettings,
}

impl JobPoller {
    pub fn new(settings: PollerSettings) -> Self {
        Self { settings }
    }

    pub async fn poll<P>(
        &self,
        provider: &dyn BotSessionProvider,
        handle: &SessionHandle,
        timeout: Duration,
        predicate: P,
    ) -> Result<PollOutcome, StageError>
    where
        P: Fn(BotState) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut interval = self.settings.initial_interval;
        let mut last_state: Option<BotState> = None;
        let mut cycles = 0u32;

        loop {
            cycles += 1;

            match tokio::time::timeout(self.settings.call_timeout, provider.status(handle)).await {
                Ok(Ok(state)) => {
                    if last_state != Some(state) {
                        info!("Bot session {} state: {:?}", handle, state);
                    }
                    debug!("Poll cycle {} for session {}: {:?}", cycles, handle, state);
                    last_state = Some(state);

                    if state == BotState::Failed {
                        return Ok(PollOutcome::RemoteFailed { cycles });
                    }

                    if predicate(state) {
                        let (media_ref, transcript_ref) = if state == BotState::Ended {
                            self.fetch_refs(provider, handle).await
                        } else {
                            (None, None)
                        };
                        return Ok(PollOutcome::Reached {
                            state,
                            media_ref,
                            transcript_ref,
                            cycles,
                        });
                    }
                }
                Ok(Err(err)) if err.is_transient() => {
                    warn!("Transient error polling session {}: {}", handle, err);
                }
                Ok(Err(err)) => return Err(err),
                Err(_) => {
                    warn!(
                        "Status call for session {} timed out after {}s",
                        handle,
                        self.settings.call_timeout.as_secs()
                    );
                }
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    "Polling session {} timed out after {} cycles (last state: {:?})",
                    handle, cycles, last_state
                );
                return Ok(PollOutcome::TimedOut { last_state });
            }

            tokio::time::sleep(interval.min(deadline - now)).await;
            interval = interval.saturating_mul(2).min(self.settings.max_interval);
        }
    }

    async fn fetch_refs(
        &self,
        provider: &dyn BotSessionProvider,
        handle: &SessionHandle,
    ) -> (Option<String>, Option<String>) {
        let media = self
            .fetch_ref("recording", handle, provider.recording(handle))
            .await;
        let transcript = self
            .fetch_ref("transcript", handle, provider.transcript(handle))
            .await;
        (media, transcript)
    }

    async fn fetch_ref<F>(&self, what: &str, handle: &SessionHandle, call: F) -> Option<String>
    where
        F: std::future::Future<Output = Result<String, StageError>>,
    {
        match tokio::time::timeout(self.settings.call_timeout, call).await {
            Ok(Ok(reference)) => Some(reference),
            Ok(Err(err)) => {
                warn!(
                    "Could not fetch {} for session {} ({}), deferring to retrieval",
                    what, handle, err
                );
                None
            }
            Err(_) => {
                warn!(
                    "Fetching {} for session {} timed out, deferring to retrieval",
                    what, handle
                );
                None
            }
        }
    }
}
