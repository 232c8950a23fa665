//! In-process collaborators and a transition-logging store for lifecycle tests.

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use interview_capture::config::RetryConfig;
use interview_capture::db::{MeetingStore, SqliteMeetingStore, UpdateOutcome};
use interview_capture::error::StageError;
use interview_capture::meeting::{
    AnalysisKind, AnalysisResult, Artifact, Failure, Meeting, MeetingStatus, NewMeeting, NewUser,
    User,
};
use interview_capture::orchestrator::{
    Collaborators, Orchestrator, OrchestratorSettings, PollerSettings,
};
use interview_capture::providers::{
    AnalysisPayload, AnalyticsProvider, BotSessionProvider, BotState, DeliveryChannel,
    InsightProvider, ReportCompiler, SessionHandle,
};

#[derive(Default)]
pub struct Counter(AtomicUsize);

impl Counter {
    pub fn hit(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Bot whose status calls walk through a script; the last state repeats.
pub struct FakeBot {
    states: Mutex<VecDeque<BotState>>,
    pub starts: Counter,
    pub polls: Counter,
    pub recordings: Counter,
    pub transcripts: Counter,
}

impl FakeBot {
    pub fn new(states: Vec<BotState>) -> Self {
        Self {
            states: Mutex::new(states.into()),
            starts: Counter::default(),
            polls: Counter::default(),
            recordings: Counter::default(),
            transcripts: Counter::default(),
        }
    }

    /// Joins on the second poll and ends after three recording polls.
    pub fn happy() -> Self {
        Self::new(vec![
            BotState::Joining,
            BotState::Recording,
            BotState::Recording,
            BotState::Recording,
            BotState::Ended,
        ])
    }
}

#[async_trait]
impl BotSessionProvider for FakeBot {
    async fn start(&self, _: &str, _: DateTime<Utc>) -> Result<SessionHandle, StageError> {
        self.starts.hit();
        Ok(SessionHandle::new(format!("bot-{}", self.starts.get())))
    }

    async fn status(&self, _: &SessionHandle) -> Result<BotState, StageError> {
        self.polls.hit();
        let mut states = self.states.lock().unwrap();
        let state = if states.len() > 1 {
            states.pop_front()
        } else {
            states.front().copied()
        };
        Ok(state.unwrap_or(BotState::Pending))
    }

    async fn recording(&self, handle: &SessionHandle) -> Result<String, StageError> {
        self.recordings.hit();
        Ok(format!("media/{}.mp4", handle))
    }

    async fn transcript(&self, handle: &SessionHandle) -> Result<String, StageError> {
        self.transcripts.hit();
        Ok(format!("transcripts/{}.txt", handle))
    }
}

/// Analytics provider that replays scripted failures before succeeding.
#[derive(Default)]
pub struct FakeAnalytics {
    failures: Mutex<VecDeque<StageError>>,
    delay: Option<Duration>,
    pub calls: Counter,
}

impl FakeAnalytics {
    pub fn failing_with(failures: Vec<StageError>) -> Self {
        Self {
            failures: Mutex::new(failures.into()),
            ..Default::default()
        }
    }

    /// Succeeds, but only after `delay`.
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }
}

#[async_trait]
impl AnalyticsProvider for FakeAnalytics {
    async fn analyze(
        &self,
        _: &Meeting,
        media: &str,
        _: &str,
    ) -> Result<AnalysisPayload, StageError> {
        self.calls.hit();
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(json!({ "talk_ratio": 0.42, "media": media }))
    }
}

#[derive(Default)]
pub struct FakeInsights {
    pub calls: Counter,
}

#[async_trait]
impl InsightProvider for FakeInsights {
    async fn summarize(
        &self,
        _: &Meeting,
        _: &AnalysisPayload,
        _: &str,
    ) -> Result<AnalysisPayload, StageError> {
        self.calls.hit();
        Ok(json!({ "recommendation": "advance", "strengths": ["systems design"] }))
    }
}

#[derive(Default)]
pub struct FakeReport {
    pub calls: Counter,
}

#[async_trait]
impl ReportCompiler for FakeReport {
    async fn compile(
        &self,
        meeting: &Meeting,
        _: &str,
        _: &AnalysisResult,
        _: &AnalysisResult,
    ) -> Result<String, StageError> {
        self.calls.hit();
        Ok(format!("reports/{}-report.md", meeting.id))
    }
}

#[derive(Default)]
pub struct FakeDelivery {
    pub calls: Counter,
}

#[async_trait]
impl DeliveryChannel for FakeDelivery {
    async fn send(&self, _: &Meeting, report_ref: &str, to: &User) -> Result<String, StageError> {
        self.calls.hit();
        Ok(format!("sent {} to {}", report_ref, to.email))
    }
}

/// A successful status write seen by [`LoggingStore`].
#[derive(Debug, Clone)]
pub struct Transition {
    pub meeting_id: i64,
    pub from: MeetingStatus,
    pub to: MeetingStatus,
    pub artifacts: Vec<Artifact>,
}

/// Store wrapper that records every applied transition.
pub struct LoggingStore {
    inner: SqliteMeetingStore,
    log: Mutex<Vec<Transition>>,
}

impl LoggingStore {
    pub fn new() -> Self {
        Self {
            inner: SqliteMeetingStore::in_memory().unwrap(),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn transitions(&self, meeting_id: i64) -> Vec<Transition> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.meeting_id == meeting_id)
            .cloned()
            .collect()
    }

    fn record(
        &self,
        meeting_id: i64,
        from: MeetingStatus,
        to: MeetingStatus,
        artifacts: Vec<Artifact>,
    ) {
        self.log.lock().unwrap().push(Transition {
            meeting_id,
            from,
            to,
            artifacts,
        });
    }
}

#[async_trait]
impl MeetingStore for LoggingStore {
    async fn create(&self, meeting: NewMeeting) -> Result<Meeting> {
        self.inner.create(meeting).await
    }

    async fn get(&self, id: i64) -> Result<Option<Meeting>> {
        self.inner.get(id).await
    }

    async fn list(&self, limit: usize) -> Result<Vec<Meeting>> {
        self.inner.list(limit).await
    }

    async fn list_by_status(&self, status: MeetingStatus) -> Result<Vec<Meeting>> {
        self.inner.list_by_status(status).await
    }

    async fn list_unfinished(&self) -> Result<Vec<Meeting>> {
        self.inner.list_unfinished().await
    }

    async fn update_status_and_artifacts(
        &self,
        id: i64,
        expected: MeetingStatus,
        new: MeetingStatus,
        artifacts: Vec<Artifact>,
        analysis: Option<AnalysisResult>,
    ) -> Result<UpdateOutcome> {
        let outcome = self
            .inner
            .update_status_and_artifacts(id, expected, new, artifacts.clone(), analysis)
            .await?;
        if outcome.is_updated() {
            self.record(id, expected, new, artifacts);
        }
        Ok(outcome)
    }

    async fn fail(
        &self,
        id: i64,
        expected: MeetingStatus,
        failure: Failure,
    ) -> Result<UpdateOutcome> {
        let outcome = self.inner.fail(id, expected, failure).await?;
        if outcome.is_updated() {
            self.record(id, expected, MeetingStatus::Failed, Vec::new());
        }
        Ok(outcome)
    }

    async fn cancel(&self, id: i64, reason: &str) -> Result<UpdateOutcome> {
        self.inner.cancel(id, reason).await
    }

    async fn delete(&self, id: i64) -> Result<bool> {
        self.inner.delete(id).await
    }

    async fn analysis(
        &self,
        meeting_id: i64,
        kind: AnalysisKind,
    ) -> Result<Option<AnalysisResult>> {
        self.inner.analysis(meeting_id, kind).await
    }

    async fn owner(&self, hash_key: &str) -> Result<Option<User>> {
        self.inner.owner(hash_key).await
    }

    async fn onboard(&self, user: NewUser) -> Result<User> {
        self.inner.onboard(user).await
    }

    async fn claim_run(&self, id: i64, owner: &str, lease: chrono::Duration) -> Result<bool> {
        self.inner.claim_run(id, owner, lease).await
    }

    async fn renew_run(&self, id: i64, owner: &str, lease: chrono::Duration) -> Result<bool> {
        self.inner.renew_run(id, owner, lease).await
    }

    async fn release_run(&self, id: i64, owner: &str) -> Result<()> {
        self.inner.release_run(id, owner).await
    }
}

pub struct Harness {
    pub store: Arc<LoggingStore>,
    pub bot: Arc<FakeBot>,
    pub analytics: Arc<FakeAnalytics>,
    pub insights: Arc<FakeInsights>,
    pub report: Arc<FakeReport>,
    pub delivery: Arc<FakeDelivery>,
    pub orchestrator: Arc<Orchestrator>,
    pub owner: User,
}

pub fn test_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        grace_window: chrono::Duration::minutes(15),
        join_timeout: Duration::from_secs(120),
        recording_timeout: Duration::from_secs(600),
        poller: PollerSettings {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(4),
            call_timeout: Duration::from_secs(5),
        },
        retry: RetryConfig {
            max_attempts: 3,
            base_delay_seconds: 1,
            max_delay_seconds: 4,
            attempt_timeout_seconds: 30,
            ..Default::default()
        },
        run_lease: Duration::from_secs(60),
    }
}

impl Harness {
    pub async fn new(bot: FakeBot, analytics: FakeAnalytics) -> Self {
        Self::with_settings(bot, analytics, test_settings()).await
    }

    pub async fn with_settings(
        bot: FakeBot,
        analytics: FakeAnalytics,
        settings: OrchestratorSettings,
    ) -> Self {
        let store = Arc::new(LoggingStore::new());
        let bot = Arc::new(bot);
        let analytics = Arc::new(analytics);
        let insights = Arc::new(FakeInsights::default());
        let report = Arc::new(FakeReport::default());
        let delivery = Arc::new(FakeDelivery::default());

        let owner = store
            .onboard(NewUser {
                email: "interviewer@example.com".to_string(),
                name: Some("Robin".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            Collaborators {
                bot: bot.clone(),
                analytics: analytics.clone(),
                insights: insights.clone(),
                report: report.clone(),
                delivery: delivery.clone(),
            },
            settings,
        ));

        Self {
            store,
            bot,
            analytics,
            insights,
            report,
            delivery,
            orchestrator,
            owner,
        }
    }

    /// Another orchestrator over the same store and collaborators, standing
    /// in for a second process.
    pub fn second_orchestrator(&self) -> Orchestrator {
        Orchestrator::new(
            self.store.clone(),
            Collaborators {
                bot: self.bot.clone(),
                analytics: self.analytics.clone(),
                insights: self.insights.clone(),
                report: self.report.clone(),
                delivery: self.delivery.clone(),
            },
            test_settings(),
        )
    }

    pub async fn meeting_at(&self, scheduled_time: DateTime<Utc>) -> Meeting {
        self.store
            .create(NewMeeting {
                owner_hash_key: self.owner.hash_key.clone(),
                url: "https://zoom.us/j/85412345678".to_string(),
                title: Some("Backend engineer interview".to_string()),
                scheduled_time,
            })
            .await
            .unwrap()
    }

    pub async fn meeting_now(&self) -> Meeting {
        self.meeting_at(Utc::now()).await
    }

    pub async fn reload(&self, id: i64) -> Meeting {
        self.store.get(id).await.unwrap().unwrap()
    }

    /// Advance a meeting along the success path without running any stage.
    pub async fn force(
        &self,
        id: i64,
        from: MeetingStatus,
        to: MeetingStatus,
        artifacts: Vec<Artifact>,
        analysis: Option<AnalysisResult>,
    ) {
        let outcome = self
            .store
            .update_status_and_artifacts(id, from, to, artifacts, analysis)
            .await
            .unwrap();
        assert!(outcome.is_updated(), "forced {} -> {} was rejected", from, to);
    }
}

/// Poll the store until the meeting reaches a terminal status.
pub async fn wait_terminal(store: &dyn MeetingStore, id: i64) -> Meeting {
    for _ in 0..10_000 {
        let meeting = store.get(id).await.unwrap().unwrap();
        if meeting.status.is_terminal() {
            return meeting;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    panic!("meeting {} never reached a terminal status", id);
}
