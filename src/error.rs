//! Error taxonomy shared by the collaborators, the pipeline and the orchestrator.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Failure reported by an external collaborator or a pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    /// Network, timeout or rate limit. Retried with backoff.
    #[error("transient: {0}")]
    Transient(String),
    /// Malformed input, explicit rejection or exhausted retries.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl StageError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient(m) | Self::Permanent(m) => m,
        }
    }

    /// Classify an HTTP status: rate limits and server errors are worth retrying.
    pub fn from_http_status(status: u16, body: &str) -> Self {
        let message = format!("HTTP {}: {}", status, body.trim());
        if status == 429 || status >= 500 {
            Self::Transient(message)
        } else {
            Self::Permanent(message)
        }
    }
}

impl From<reqwest::Error> for StageError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() || err.is_builder() {
            return Self::Permanent(err.to_string());
        }
        match err.status() {
            Some(status) => Self::from_http_status(status.as_u16(), &err.to_string()),
            None => Self::Transient(err.to_string()),
        }
    }
}

/// Errors that cross the orchestrator run boundary.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Another run holds the meeting. Callers treat this as a no-op.
    #[error("meeting {0} already has an active run")]
    Conflict(i64),
    #[error("meeting {meeting_id} missed its schedule ({scheduled_time}) by more than the grace window")]
    MissedSchedule {
        meeting_id: i64,
        scheduled_time: DateTime<Utc>,
    },
    #[error("meeting {0} not found")]
    NotFound(i64),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}
