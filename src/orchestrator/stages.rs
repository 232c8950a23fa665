//! Post-recording pipeline stages.
//!
//! Each stage reads only the persisted snapshot and returns the artifacts to
//! write together with the next status. A stage whose artifact is already
//! recorded is complete and is never executed again.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::error::StageError;
use crate::meeting::{
    AnalysisKind, AnalysisResult, Artifact, FailureStage, Meeting, MeetingStatus, User,
};
use crate::providers::{
    AnalysisPayload, AnalyticsProvider, BotSessionProvider, DeliveryChannel, InsightProvider,
    ReportCompiler, SessionHandle,
};

/// Persisted state a stage works from.
#[derive(Debug, Clone)]
pub struct StageSnapshot {
    pub meeting: Meeting,
    pub analytics: Option<AnalysisResult>,
    pub insights: Option<AnalysisResult>,
    pub owner: Option<User>,
}

/// What a successful stage asks the orchestrator to persist.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutput {
    pub artifacts: Vec<Artifact>,
    pub analysis: Option<AnalysisResult>,
}

impl StageOutput {
    fn artifacts(artifacts: Vec<Artifact>) -> Self {
        Self {
            artifacts,
            analysis: None,
        }
    }
}

#[async_trait]
pub trait PipelineStage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Status the meeting is in while this stage runs.
    fn status(&self) -> MeetingStatus;

    /// Status written once the stage succeeds.
    fn next_status(&self) -> MeetingStatus;

    fn failure_stage(&self) -> FailureStage;

    fn is_complete(&self, snapshot: &StageSnapshot) -> bool;

    async fn execute(&self, snapshot: &StageSnapshot) -> Result<StageOutput, StageError>;
}

fn require<'a>(value: &'a Option<String>, what: &str) -> Result<&'a str, StageError> {
    match value.as_deref() {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(StageError::permanent(format!("Missing {}", what))),
    }
}

fn non_empty(reference: String, what: &str) -> Result<String, StageError> {
    if reference.trim().is_empty() {
        Err(StageError::permanent(format!("Provider returned an empty {}", what)))
    } else {
        Ok(reference)
    }
}

fn check_payload(payload: AnalysisPayload, what: &str) -> Result<AnalysisPayload, StageError> {
    let empty = match &payload {
        serde_json::Value::Null => true,
        serde_json::Value::Object(map) => map.is_empty(),
        serde_json::Value::Array(items) => items.is_empty(),
        serde_json::Value::String(text) => text.trim().is_empty(),
        _ => false,
    };
    if empty {
        Err(StageError::permanent(format!("{} result is empty", what)))
    } else {
        Ok(payload)
    }
}

/// Ensure media and transcript references exist, fetching any the poller
/// could not.
pub struct RetrieveMedia {
    bot: Arc<dyn BotSessionProvider>,
}

impl RetrieveMedia {
    pub fn new(bot: Arc<dyn BotSessionProvider>) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl PipelineStage for RetrieveMedia {
    fn name(&self) -> &'static str {
        "retrieve media"
    }

    fn status(&self) -> MeetingStatus {
        MeetingStatus::Retrieving
    }

    fn next_status(&self) -> MeetingStatus {
        MeetingStatus::Analyzing
    }

    fn failure_stage(&self) -> FailureStage {
        FailureStage::Retrieving
    }

    fn is_complete(&self, snapshot: &StageSnapshot) -> bool {
        let artifacts = &snapshot.meeting.artifacts;
        artifacts.media_ref.is_some() && artifacts.transcript_ref.is_some()
    }

    async fn execute(&self, snapshot: &StageSnapshot) -> Result<StageOutput, StageError> {
        let artifacts = &snapshot.meeting.artifacts;
        let handle = SessionHandle::new(require(&artifacts.bot_session, "bot session")?);
        let mut output = Vec::new();

        if artifacts.media_ref.is_none() {
            let media = non_empty(self.bot.recording(&handle).await?, "recording reference")?;
            output.push(Artifact::Media(media));
        }
        if artifacts.transcript_ref.is_none() {
            let transcript =
                non_empty(self.bot.transcript(&handle).await?, "transcript reference")?;
            output.push(Artifact::Transcript(transcript));
        }

        Ok(StageOutput::artifacts(output))
    }
}

pub struct RunAnalytics {
    provider: Arc<dyn AnalyticsProvider>,
}

impl RunAnalytics {
    pub fn new(provider: Arc<dyn AnalyticsProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl PipelineStage for RunAnalytics {
    fn name(&self) -> &'static str {
        "run analytics"
    }

    fn status(&self) -> MeetingStatus {
        MeetingStatus::Analyzing
    }

    fn next_status(&self) -> MeetingStatus {
        MeetingStatus::ExtractingInsights
    }

    fn failure_stage(&self) -> FailureStage {
        FailureStage::Analyzing
    }

    fn is_complete(&self, snapshot: &StageSnapshot) -> bool {
        snapshot.meeting.artifacts.analytics_id.is_some() && snapshot.analytics.is_some()
    }

    async fn execute(&self, snapshot: &StageSnapshot) -> Result<StageOutput, StageError> {
        let meeting = &snapshot.meeting;
        let media = require(&meeting.artifacts.media_ref, "media reference")?;
        let transcript = require(&meeting.artifacts.transcript_ref, "transcript reference")?;

        let payload = check_payload(
            self.provider.analyze(meeting, media, transcript).await?,
            "Analytics",
        )?;
        let result = AnalysisResult::new(meeting.id, AnalysisKind::Analytics, payload);

        Ok(StageOutput {
            artifacts: vec![Artifact::Analytics(result.result_id.clone())],
            analysis: Some(result),
        })
    }
}

pub struct ExtractInsights {
    provider: Arc<dyn InsightProvider>,
}

impl ExtractInsights {
    pub fn new(provider: Arc<dyn InsightProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl PipelineStage for ExtractInsights {
    fn name(&self) -> &'static str {
        "extract insights"
    }

    fn status(&self) -> MeetingStatus {
        MeetingStatus::ExtractingInsights
    }

    fn next_status(&self) -> MeetingStatus {
        MeetingStatus::Reporting
    }

    fn failure_stage(&self) -> FailureStage {
        FailureStage::ExtractingInsights
    }

    fn is_complete(&self, snapshot: &StageSnapshot) -> bool {
        snapshot.meeting.artifacts.insights_id.is_some() && snapshot.insights.is_some()
    }

    async fn execute(&self, snapshot: &StageSnapshot) -> Result<StageOutput, StageError> {
        let meeting = &snapshot.meeting;
        let transcript = require(&meeting.artifacts.transcript_ref, "transcript reference")?;
        let analytics = snapshot
            .analytics
            .as_ref()
            .ok_or_else(|| StageError::permanent("Missing analytics result"))?;

        let payload = check_payload(
            self.provider
                .summarize(meeting, &analytics.payload, transcript)
                .await?,
            "Insights",
        )?;
        let result = AnalysisResult::new(meeting.id, AnalysisKind::Insights, payload);

        Ok(StageOutput {
            artifacts: vec![Artifact::Insights(result.result_id.clone())],
            analysis: Some(result),
        })
    }
}

/// Writes the report reference without leaving `Reporting`.
pub struct CompileReport {
    compiler: Arc<dyn ReportCompiler>,
}

impl CompileReport {
    pub fn new(compiler: Arc<dyn ReportCompiler>) -> Self {
        Self { compiler }
    }
}

#[async_trait]
impl PipelineStage for CompileReport {
    fn name(&self) -> &'static str {
        "compile report"
    }

    fn status(&self) -> MeetingStatus {
        MeetingStatus::Reporting
    }

    fn next_status(&self) -> MeetingStatus {
        MeetingStatus::Reporting
    }

    fn failure_stage(&self) -> FailureStage {
        FailureStage::Reporting
    }

    fn is_complete(&self, snapshot: &StageSnapshot) -> bool {
        snapshot.meeting.artifacts.report_ref.is_some()
    }

    async fn execute(&self, snapshot: &StageSnapshot) -> Result<StageOutput, StageError> {
        let meeting = &snapshot.meeting;
        let transcript = require(&meeting.artifacts.transcript_ref, "transcript reference")?;
        let analytics = snapshot
            .analytics
            .as_ref()
            .ok_or_else(|| StageError::permanent("Missing analytics result"))?;
        let insights = snapshot
            .insights
            .as_ref()
            .ok_or_else(|| StageError::permanent("Missing insights result"))?;

        let report = non_empty(
            self.compiler
                .compile(meeting, transcript, analytics, insights)
                .await?,
            "report reference",
        )?;
        info!("Report for meeting {} compiled: {}", meeting.id, report);

        Ok(StageOutput::artifacts(vec![Artifact::Report(report)]))
    }
}

pub struct DeliverReport {
    channel: Arc<dyn DeliveryChannel>,
}

impl DeliverReport {
    pub fn new(channel: Arc<dyn DeliveryChannel>) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl PipelineStage for DeliverReport {
    fn name(&self) -> &'static str {
        "deliver report"
    }

    fn status(&self) -> MeetingStatus {
        MeetingStatus::Reporting
    }

    fn next_status(&self) -> MeetingStatus {
        MeetingStatus::Delivered
    }

    fn failure_stage(&self) -> FailureStage {
        FailureStage::Delivering
    }

    fn is_complete(&self, snapshot: &StageSnapshot) -> bool {
        snapshot.meeting.artifacts.delivery_ack.is_some()
    }

    async fn execute(&self, snapshot: &StageSnapshot) -> Result<StageOutput, StageError> {
        let meeting = &snapshot.meeting;
        let report = require(&meeting.artifacts.report_ref, "report reference")?;
        let owner = snapshot.owner.as_ref().ok_or_else(|| {
            StageError::permanent(format!(
                "Unknown owner {} for meeting {}",
                meeting.owner_hash_key, meeting.id
            ))
        })?;

        let ack = self.channel.send(meeting, report, owner).await?;
        info!(
            "Report for meeting {} delivered to {}: {}",
            meeting.id, owner.email, ack
        );

        Ok(StageOutput::artifacts(vec![Artifact::DeliveryAck(ack)]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meeting::Artifacts;
    use chrono::{DateTime, Utc};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn snapshot(artifacts: Artifacts) -> StageSnapshot {
        StageSnapshot {
            meeting: Meeting {
                id: 5,
                owner_hash_key: "owner".to_string(),
                url: "https://zoom.us/j/5".to_string(),
                title: None,
                scheduled_time: Utc::now(),
                actual_start_time: None,
                actual_end_time: None,
                status: MeetingStatus::Retrieving,
                failure: None,
                artifacts,
                created_at: String::new(),
                completed_at: None,
            },
            analytics: None,
            insights: None,
            owner: None,
        }
    }

    #[derive(Default)]
    struct CountingBot {
        recording_calls: AtomicU32,
        transcript_calls: AtomicU32,
    }

    #[async_trait]
    impl BotSessionProvider for CountingBot {
        async fn start(&self, _: &str, _: DateTime<Utc>) -> Result<SessionHandle, StageError> {
            Ok(SessionHandle::new("bot"))
        }

        async fn status(
            &self,
            _: &SessionHandle,
        ) -> Result<crate::providers::BotState, StageError> {
            Ok(crate::providers::BotState::Ended)
        }

        async fn recording(&self, _: &SessionHandle) -> Result<String, StageError> {
            self.recording_calls.fetch_add(1, Ordering::SeqCst);
            Ok("media.mp4".to_string())
        }

        async fn transcript(&self, _: &SessionHandle) -> Result<String, StageError> {
            self.transcript_calls.fetch_add(1, Ordering::SeqCst);
            Ok("  ".to_string())
        }
    }

    struct FixedAnalytics(serde_json::Value);

    #[async_trait]
    impl AnalyticsProvider for FixedAnalytics {
        async fn analyze(
            &self,
            _: &Meeting,
            _: &str,
            _: &str,
        ) -> Result<AnalysisPayload, StageError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_retrieve_media_fetches_only_missing_refs() {
        let bot = Arc::new(CountingBot::default());
        let stage = RetrieveMedia::new(bot.clone());
        let snap = snapshot(Artifacts {
            bot_session: Some("bot".to_string()),
            transcript_ref: Some("t.txt".to_string()),
            ..Default::default()
        });

        assert!(!stage.is_complete(&snap));
        let output = stage.execute(&snap).await.unwrap();
        assert_eq!(output.artifacts, vec![Artifact::Media("media.mp4".to_string())]);
        assert_eq!(bot.transcript_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_retrieve_media_rejects_empty_transcript() {
        let stage = RetrieveMedia::new(Arc::new(CountingBot::default()));
        let snap = snapshot(Artifacts {
            bot_session: Some("bot".to_string()),
            ..Default::default()
        });
        let err = stage.execute(&snap).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_retrieve_media_without_session_is_permanent() {
        let stage = RetrieveMedia::new(Arc::new(CountingBot::default()));
        let err = stage.execute(&snapshot(Artifacts::default())).await.unwrap_err();
        assert_eq!(err, StageError::permanent("Missing bot session"));
    }

    #[tokio::test]
    async fn test_run_analytics_produces_typed_result() {
        let stage = RunAnalytics::new(Arc::new(FixedAnalytics(json!({"calm": 0.5}))));
        let snap = snapshot(Artifacts {
            media_ref: Some("m".to_string()),
            transcript_ref: Some("t".to_string()),
            ..Default::default()
        });

        let output = stage.execute(&snap).await.unwrap();
        let result = output.analysis.unwrap();
        assert_eq!(result.kind, AnalysisKind::Analytics);
        assert_eq!(result.meeting_id, 5);
        assert_eq!(output.artifacts, vec![Artifact::Analytics(result.result_id)]);
    }

    #[tokio::test]
    async fn test_empty_analytics_payload_is_permanent() {
        let stage = RunAnalytics::new(Arc::new(FixedAnalytics(json!({}))));
        let snap = snapshot(Artifacts {
            media_ref: Some("m".to_string()),
            transcript_ref: Some("t".to_string()),
            ..Default::default()
        });
        assert!(!stage.execute(&snap).await.unwrap_err().is_transient());
    }

    #[test]
    fn test_reporting_stages_share_status() {
        struct NoCompiler;
        #[async_trait]
        impl ReportCompiler for NoCompiler {
            async fn compile(
                &self,
                _: &Meeting,
                _: &str,
                _: &AnalysisResult,
                _: &AnalysisResult,
            ) -> Result<String, StageError> {
                Err(StageError::permanent("unused"))
            }
        }

        let compile = CompileReport::new(Arc::new(NoCompiler));
        assert_eq!(compile.status(), MeetingStatus::Reporting);
        assert_eq!(compile.next_status(), MeetingStatus::Reporting);

        let snap = snapshot(Artifacts {
            report_ref: Some("r.md".to_string()),
            ..Default::default()
        });
        assert!(compile.is_complete(&snap));
    }
}
