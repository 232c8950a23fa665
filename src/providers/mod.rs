//! External collaborators consumed by the orchestrator.
//!
//! Every call returns a classified [`StageError`] so the pipeline can decide
//! between retrying and failing the meeting.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StageError;
use crate::meeting::{AnalysisResult, Meeting, User};

pub mod attendee;
pub mod command;
pub mod outbox;
pub mod report;

pub use attendee::AttendeeBotProvider;
pub use command::{CommandAnalytics, CommandDelivery, CommandInsights, CommandRunner};
pub use outbox::LocalOutbox;
pub use report::MarkdownReportCompiler;

/// Opaque payload returned by the analytics and insight providers.
pub type AnalysisPayload = serde_json::Value;

/// Remote bot session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionHandle(pub String);

impl SessionHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Remote bot state as reported by the session provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotState {
    Pending,
    Joining,
    Recording,
    Ended,
    Failed,
}

impl BotState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Failed)
    }

    /// Whether the bot is in the meeting (or already left it).
    pub fn has_joined(&self) -> bool {
        matches!(self, Self::Recording | Self::Ended)
    }
}

#[async_trait]
pub trait BotSessionProvider: Send + Sync {
    async fn start(
        &self,
        meeting_url: &str,
        start_time: DateTime<Utc>,
    ) -> Result<SessionHandle, StageError>;

    async fn status(&self, handle: &SessionHandle) -> Result<BotState, StageError>;

    async fn recording(&self, handle: &SessionHandle) -> Result<String, StageError>;

    async fn transcript(&self, handle: &SessionHandle) -> Result<String, StageError>;
}

#[async_trait]
pub trait AnalyticsProvider: Send + Sync {
    async fn analyze(
        &self,
        meeting: &Meeting,
        media_ref: &str,
        transcript_ref: &str,
    ) -> Result<AnalysisPayload, StageError>;
}

#[async_trait]
pub trait InsightProvider: Send + Sync {
    async fn summarize(
        &self,
        meeting: &Meeting,
        analytics: &AnalysisPayload,
        transcript_ref: &str,
    ) -> Result<AnalysisPayload, StageError>;
}

#[async_trait]
pub trait ReportCompiler: Send + Sync {
    /// Returns a reference (path or URI) to the compiled report.
    async fn compile(
        &self,
        meeting: &Meeting,
        transcript_ref: &str,
        analytics: &AnalysisResult,
        insights: &AnalysisResult,
    ) -> Result<String, StageError>;
}

#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    /// Returns a delivery acknowledgement.
    async fn send(
        &self,
        meeting: &Meeting,
        report_ref: &str,
        recipient: &User,
    ) -> Result<String, StageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bot_state_classification() {
        assert!(BotState::Ended.is_terminal());
        assert!(BotState::Failed.is_terminal());
        assert!(!BotState::Recording.is_terminal());
        assert!(BotState::Recording.has_joined());
        assert!(!BotState::Joining.has_joined());
    }
}
