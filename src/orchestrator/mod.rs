//! Meeting lifecycle orchestrator.
//!
//! Drives one meeting from `scheduled` to `completed` (or `failed`). Every
//! step re-reads the meeting, does its work and persists the produced
//! artifacts together with the new status in one compare-and-swap, so a run
//! can always resume from the stored record.

pub mod job;
pub mod poller;
pub mod retry;
pub mod stages;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{Config, RetryConfig};
use crate::db::{MeetingStore, UpdateOutcome};
use crate::error::{OrchestratorError, StageError};
use crate::meeting::{
    AnalysisKind, AnalysisResult, Artifact, Failure, FailureStage, Meeting, MeetingStatus,
};
use crate::providers::{
    AnalyticsProvider, BotSessionProvider, BotState, DeliveryChannel, InsightProvider,
    ReportCompiler, SessionHandle,
};
use crate::scheduler::RunTrigger;

pub use job::PipelineJob;
pub use poller::{JobPoller, PollOutcome, PollerSettings};
pub use retry::{retry_stage, RetryPolicy};
pub use stages::{
    CompileReport, DeliverReport, ExtractInsights, PipelineStage, RetrieveMedia, RunAnalytics,
    StageOutput, StageSnapshot,
};

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed(FailureStage),
    /// An operator cancelled the meeting while the run was active.
    Cancelled,
    /// The meeting was already terminal; nothing was done.
    AlreadyTerminal(MeetingStatus),
}

/// In-process registry of meetings with an active run. Runs in other
/// processes are excluded by the run lease in the store.
#[derive(Clone, Default)]
pub struct ActiveRuns {
    inner: Arc<Mutex<HashSet<i64>>>,
}

impl ActiveRuns {
    pub fn try_acquire(&self, meeting_id: i64) -> Option<RunGuard> {
        let mut active = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if active.insert(meeting_id) {
            Some(RunGuard {
                meeting_id,
                runs: self.clone(),
            })
        } else {
            None
        }
    }

    pub fn is_active(&self, meeting_id: i64) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&meeting_id)
    }
}

/// Releases the meeting when the run ends, however it ends.
pub struct RunGuard {
    meeting_id: i64,
    runs: ActiveRuns,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.runs
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.meeting_id);
    }
}

/// Keeps this process's run lease on a meeting alive, renewing it at a
/// third of the lease length until dropped.
struct LeaseHeartbeat {
    task: JoinHandle<()>,
    lost: Arc<AtomicBool>,
}

impl LeaseHeartbeat {
    fn start(
        store: Arc<dyn MeetingStore>,
        meeting_id: i64,
        owner: String,
        lease: Duration,
    ) -> Self {
        let lost = Arc::new(AtomicBool::new(false));
        let flag = lost.clone();
        let every = lease / 3;
        let renew_for = lease_duration(lease);

        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(every).await;
                match store.renew_run(meeting_id, &owner, renew_for).await {
                    Ok(true) => debug!("Renewed run lease on meeting {}", meeting_id),
                    Ok(false) => {
                        warn!("Lost run lease on meeting {}", meeting_id);
                        flag.store(true, Ordering::SeqCst);
                        break;
                    }
                    Err(e) => warn!(
                        "Failed to renew run lease on meeting {}: {:#}",
                        meeting_id, e
                    ),
                }
            }
        });

        Self { task, lost }
    }

    fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }
}

impl Drop for LeaseHeartbeat {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn lease_duration(lease: Duration) -> chrono::Duration {
    chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::minutes(2))
}

/// External collaborators a run depends on.
#[derive(Clone)]
pub struct Collaborators {
    pub bot: Arc<dyn BotSessionProvider>,
    pub analytics: Arc<dyn AnalyticsProvider>,
    pub insights: Arc<dyn InsightProvider>,
    pub report: Arc<dyn ReportCompiler>,
    pub delivery: Arc<dyn DeliveryChannel>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub grace_window: chrono::Duration,
    pub join_timeout: Duration,
    pub recording_timeout: Duration,
    pub poller: PollerSettings,
    pub retry: RetryConfig,
    /// How long a run's claim on a meeting survives without renewal.
    pub run_lease: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        let call_timeout = Duration::from_secs(config.bot.request_timeout_seconds.max(1));
        Self {
            grace_window: chrono::Duration::minutes(config.scheduler.grace_window_minutes),
            join_timeout: Duration::from_secs(config.poller.join_timeout_seconds),
            recording_timeout: Duration::from_secs(config.poller.recording_timeout_seconds),
            poller: PollerSettings::from_config(&config.poller, call_timeout),
            retry: config.retry.clone(),
            run_lease: Duration::from_secs(config.scheduler.run_lease_seconds.max(3)),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

enum StepError {
    Stage(FailureStage, StageError),
    Run(OrchestratorError),
}

impl From<OrchestratorError> for StepError {
    fn from(err: OrchestratorError) -> Self {
        Self::Run(err)
    }
}

impl From<anyhow::Error> for StepError {
    fn from(err: anyhow::Error) -> Self {
        Self::Run(OrchestratorError::Store(err))
    }
}

pub struct Orchestrator {
    store: Arc<dyn MeetingStore>,
    bot: Arc<dyn BotSessionProvider>,
    poller: JobPoller,
    stages: Vec<Box<dyn PipelineStage>>,
    settings: OrchestratorSettings,
    active: ActiveRuns,
    /// Identifies this orchestrator's runs in the store's run lease.
    run_owner: String,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn MeetingStore>,
        collaborators: Collaborators,
        settings: OrchestratorSettings,
    ) -> Self {
        let stages: Vec<Box<dyn PipelineStage>> = vec![
            Box::new(RetrieveMedia::new(collaborators.bot.clone())),
            Box::new(RunAnalytics::new(collaborators.analytics)),
            Box::new(ExtractInsights::new(collaborators.insights)),
            Box::new(CompileReport::new(collaborators.report)),
            Box::new(DeliverReport::new(collaborators.delivery)),
        ];

        Self {
            store,
            bot: collaborators.bot,
            poller: JobPoller::new(settings.poller.clone()),
            stages,
            settings,
            active: ActiveRuns::default(),
            run_owner: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn active_runs(&self) -> &ActiveRuns {
        &self.active
    }

    /// Run a meeting as far as it can go.
    ///
    /// Returns `Conflict` when another run, in this process or another one,
    /// holds the meeting. Stage failures never escape: they are recorded on
    /// the meeting and reported as `RunOutcome::Failed`.
    pub async fn run(&self, meeting_id: i64) -> Result<RunOutcome, OrchestratorError> {
        let _guard = self
            .active
            .try_acquire(meeting_id)
            .ok_or(OrchestratorError::Conflict(meeting_id))?;

        let meeting = self.load(meeting_id).await?;
        if meeting.status.is_terminal() {
            info!(
                "Meeting {} is already {}, nothing to do",
                meeting_id, meeting.status
            );
            return Ok(RunOutcome::AlreadyTerminal(meeting.status));
        }

        let claimed = self
            .store
            .claim_run(
                meeting_id,
                &self.run_owner,
                lease_duration(self.settings.run_lease),
            )
            .await?;
        if !claimed {
            let current = self.load(meeting_id).await?;
            if current.status.is_terminal() {
                return Ok(RunOutcome::AlreadyTerminal(current.status));
            }
            info!("Meeting {} is held by another run", meeting_id);
            return Err(OrchestratorError::Conflict(meeting_id));
        }

        let heartbeat = LeaseHeartbeat::start(
            self.store.clone(),
            meeting_id,
            self.run_owner.clone(),
            self.settings.run_lease,
        );
        let result = self.drive(meeting_id, &heartbeat).await;
        drop(heartbeat);

        if let Err(e) = self.store.release_run(meeting_id, &self.run_owner).await {
            warn!(
                "Failed to release run lease on meeting {}: {:#}",
                meeting_id, e
            );
        }
        result
    }

    async fn load(&self, meeting_id: i64) -> Result<Meeting, OrchestratorError> {
        self.store
            .get(meeting_id)
            .await?
            .ok_or(OrchestratorError::NotFound(meeting_id))
    }

    async fn drive(
        &self,
        meeting_id: i64,
        heartbeat: &LeaseHeartbeat,
    ) -> Result<RunOutcome, OrchestratorError> {
        let mut job = PipelineJob::new(meeting_id);

        loop {
            let meeting = self.load(meeting_id).await?;
            if meeting.status.is_terminal() {
                return Ok(Self::terminal_outcome(&meeting, &job));
            }
            if heartbeat.is_lost() {
                warn!("Meeting {}: run lease lost, stopping", meeting_id);
                return Err(OrchestratorError::Conflict(meeting_id));
            }
            job.enter(meeting.status);

            match self.step(&meeting, &mut job).await {
                Ok(()) => {}
                Err(StepError::Stage(stage, err)) => {
                    self.record_failure(&meeting, stage, &err).await?;
                }
                Err(StepError::Run(err)) => return Err(err),
            }
        }
    }

    fn terminal_outcome(meeting: &Meeting, job: &PipelineJob) -> RunOutcome {
        match (&meeting.status, &meeting.failure) {
            (MeetingStatus::Completed, _) => {
                info!(
                    "Meeting {} completed in {}s",
                    meeting.id,
                    job.elapsed().as_secs()
                );
                RunOutcome::Completed
            }
            (_, Some(failure)) if failure.stage != FailureStage::Cancelled => {
                RunOutcome::Failed(failure.stage)
            }
            _ => {
                info!("Meeting {} was cancelled, stopping run", meeting.id);
                RunOutcome::Cancelled
            }
        }
    }

    async fn step(&self, meeting: &Meeting, job: &mut PipelineJob) -> Result<(), StepError> {
        match meeting.status {
            MeetingStatus::Scheduled => self.begin(meeting).await,
            MeetingStatus::Joining => self.join(meeting, job).await,
            MeetingStatus::Recording => self.await_recording(meeting, job).await,
            MeetingStatus::Retrieving
            | MeetingStatus::Analyzing
            | MeetingStatus::ExtractingInsights
            | MeetingStatus::Reporting => self.run_stage(meeting, job).await,
            MeetingStatus::Delivered => {
                self.advance(meeting, MeetingStatus::Completed, Vec::new(), None)
                    .await
            }
            MeetingStatus::Completed | MeetingStatus::Failed => Ok(()),
        }
    }

    /// `scheduled -> joining`, unless the meeting is past its grace window.
    async fn begin(&self, meeting: &Meeting) -> Result<(), StepError> {
        let late_by = Utc::now() - meeting.scheduled_time;
        if late_by > self.settings.grace_window {
            warn!(
                "Meeting {} missed its schedule by {} minutes",
                meeting.id,
                late_by.num_minutes()
            );
            let failure = Failure::new(
                FailureStage::Missed,
                format!(
                    "Scheduled time {} passed more than {} minutes ago",
                    meeting.scheduled_time.to_rfc3339(),
                    self.settings.grace_window.num_minutes()
                ),
            );
            self.store
                .fail(meeting.id, MeetingStatus::Scheduled, failure)
                .await?;
            return Err(OrchestratorError::MissedSchedule {
                meeting_id: meeting.id,
                scheduled_time: meeting.scheduled_time,
            }
            .into());
        }

        let outcome = self
            .store
            .update_status_and_artifacts(
                meeting.id,
                MeetingStatus::Scheduled,
                MeetingStatus::Joining,
                Vec::new(),
                None,
            )
            .await?;

        match outcome {
            UpdateOutcome::Updated => {
                info!("Meeting {}: scheduled -> joining", meeting.id);
                Ok(())
            }
            UpdateOutcome::Conflict { actual } => {
                info!(
                    "Meeting {} left scheduled elsewhere (now {}), skipping",
                    meeting.id, actual
                );
                Err(OrchestratorError::Conflict(meeting.id).into())
            }
            UpdateOutcome::NotFound => Err(OrchestratorError::NotFound(meeting.id).into()),
        }
    }

    /// Dispatch the bot if needed and wait for it to join.
    async fn join(&self, meeting: &Meeting, job: &mut PipelineJob) -> Result<(), StepError> {
        let stage = FailureStage::Joining;

        let handle = match &meeting.artifacts.bot_session {
            Some(session) => SessionHandle::new(session.clone()),
            None => {
                let policy = RetryPolicy::for_stage(&self.settings.retry, stage.as_str());
                let bot = self.bot.as_ref();
                let url = meeting.url.as_str();
                let start_time = meeting.scheduled_time;
                let handle = retry_stage(stage.as_str(), &policy, job, move || {
                    bot.start(url, start_time)
                })
                .await
                .map_err(|err| StepError::Stage(stage, err))?;

                info!("Meeting {}: bot session {} started", meeting.id, handle);
                // Persist the handle first so a restart never dispatches a second bot.
                return self
                    .advance(
                        meeting,
                        MeetingStatus::Joining,
                        vec![Artifact::BotSession(handle.0)],
                        None,
                    )
                    .await;
            }
        };

        self.poll_until(
            stage,
            &handle,
            self.settings.join_timeout,
            BotState::has_joined,
            job,
        )
        .await?;

        self.advance(
            meeting,
            MeetingStatus::Recording,
            vec![Artifact::ActualStart(Utc::now())],
            None,
        )
        .await
    }

    /// Wait for the session to end and record whatever refs it produced.
    async fn await_recording(
        &self,
        meeting: &Meeting,
        job: &mut PipelineJob,
    ) -> Result<(), StepError> {
        let stage = FailureStage::Recording;
        let session = meeting.artifacts.bot_session.clone().ok_or_else(|| {
            StepError::Stage(stage, StageError::permanent("Recording without a bot session"))
        })?;
        let handle = SessionHandle::new(session);

        let outcome = self
            .poll_until(
                stage,
                &handle,
                self.settings.recording_timeout,
                BotState::is_terminal,
                job,
            )
            .await?;

        let mut artifacts = vec![Artifact::ActualEnd(Utc::now())];
        if let PollOutcome::Reached {
            media_ref,
            transcript_ref,
            ..
        } = outcome
        {
            artifacts.extend(media_ref.map(Artifact::Media));
            artifacts.extend(transcript_ref.map(Artifact::Transcript));
        }

        self.advance(meeting, MeetingStatus::Retrieving, artifacts, None)
            .await
    }

    /// Poll until `predicate` holds. Timeouts are retried up to the stage's
    /// attempt limit; a failed remote session is permanent.
    async fn poll_until(
        &self,
        stage: FailureStage,
        handle: &SessionHandle,
        timeout: Duration,
        predicate: fn(&BotState) -> bool,
        job: &mut PipelineJob,
    ) -> Result<PollOutcome, StepError> {
        let policy = RetryPolicy::for_stage(&self.settings.retry, stage.as_str());
        let max_attempts = policy.max_attempts;

        for attempt in 1..=max_attempts {
            job.record_attempt(stage.as_str());
            let outcome = self
                .poller
                .poll(self.bot.as_ref(), handle, timeout, |state| predicate(&state))
                .await
                .map_err(|err| StepError::Stage(stage, err))?;

            match outcome {
                PollOutcome::Reached { .. } => return Ok(outcome),
                PollOutcome::RemoteFailed { .. } => {
                    return Err(StepError::Stage(
                        stage,
                        StageError::permanent(format!("Bot session {} failed", handle)),
                    ));
                }
                PollOutcome::TimedOut { last_state } => {
                    let err = StageError::transient(format!(
                        "Timed out after {}s waiting on bot session {} (last state: {:?})",
                        timeout.as_secs(),
                        handle,
                        last_state
                    ));
                    warn!("{} ({}/{})", err.message(), attempt, max_attempts);
                    job.record_error(err);
                    if attempt < max_attempts {
                        tokio::time::sleep(policy.delay_after(attempt)).await;
                    }
                }
            }
        }

        let message = job
            .last_error()
            .map(|e| e.message().to_string())
            .unwrap_or_else(|| format!("Polling bot session {} timed out", handle));
        Err(StepError::Stage(
            stage,
            StageError::permanent(format!("{} after {} attempts", message, max_attempts)),
        ))
    }

    async fn snapshot(&self, meeting: &Meeting) -> Result<StageSnapshot, StepError> {
        let analytics = self.store.analysis(meeting.id, AnalysisKind::Analytics).await?;
        let insights = self.store.analysis(meeting.id, AnalysisKind::Insights).await?;
        let owner = self.store.owner(&meeting.owner_hash_key).await?;

        Ok(StageSnapshot {
            meeting: meeting.clone(),
            analytics,
            insights,
            owner,
        })
    }

    /// Run the first incomplete stage for the meeting's status, or advance
    /// past the status when every stage for it is already complete.
    async fn run_stage(&self, meeting: &Meeting, job: &mut PipelineJob) -> Result<(), StepError> {
        let snapshot = self.snapshot(meeting).await?;
        let candidates: Vec<&dyn PipelineStage> = self
            .stages
            .iter()
            .map(|stage| stage.as_ref())
            .filter(|stage| stage.status() == meeting.status)
            .collect();

        let Some(last) = candidates.last().copied() else {
            return Err(
                OrchestratorError::Store(anyhow!("No stage handles status {}", meeting.status))
                    .into(),
            );
        };

        let Some(stage) = candidates
            .iter()
            .copied()
            .find(|stage| !stage.is_complete(&snapshot))
        else {
            info!(
                "Meeting {}: {} already complete, advancing",
                meeting.id,
                last.name()
            );
            return self
                .advance(meeting, last.next_status(), Vec::new(), None)
                .await;
        };

        info!("Meeting {}: running {}", meeting.id, stage.name());
        let failure_stage = stage.failure_stage();
        let policy = RetryPolicy::for_stage(&self.settings.retry, failure_stage.as_str());
        let snapshot_ref = &snapshot;
        let output = retry_stage(failure_stage.as_str(), &policy, job, move || {
            stage.execute(snapshot_ref)
        })
        .await
        .map_err(|err| StepError::Stage(failure_stage, err))?;

        self.advance(meeting, stage.next_status(), output.artifacts, output.analysis)
            .await
    }

    /// Persist a transition. A conflict means someone else moved the meeting;
    /// the run loop re-reads it and decides what to do.
    async fn advance(
        &self,
        meeting: &Meeting,
        new: MeetingStatus,
        artifacts: Vec<Artifact>,
        analysis: Option<AnalysisResult>,
    ) -> Result<(), StepError> {
        let outcome = self
            .store
            .update_status_and_artifacts(meeting.id, meeting.status, new, artifacts, analysis)
            .await?;

        match outcome {
            UpdateOutcome::Updated => {
                if new != meeting.status {
                    info!("Meeting {}: {} -> {}", meeting.id, meeting.status, new);
                }
                Ok(())
            }
            UpdateOutcome::Conflict { actual } => {
                warn!(
                    "Meeting {} moved to {} while in {}, re-reading",
                    meeting.id, actual, meeting.status
                );
                Ok(())
            }
            UpdateOutcome::NotFound => Err(OrchestratorError::NotFound(meeting.id).into()),
        }
    }

    async fn record_failure(
        &self,
        meeting: &Meeting,
        stage: FailureStage,
        err: &StageError,
    ) -> Result<(), OrchestratorError> {
        error!(
            "Meeting {} failed at {}: {}",
            meeting.id,
            stage,
            err.message()
        );
        let outcome = self
            .store
            .fail(
                meeting.id,
                meeting.status,
                Failure::new(stage, err.message()),
            )
            .await?;

        match outcome {
            UpdateOutcome::NotFound => Err(OrchestratorError::NotFound(meeting.id)),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl RunTrigger for Orchestrator {
    async fn trigger(&self, meeting_id: i64) {
        match self.run(meeting_id).await {
            Ok(RunOutcome::Completed) => info!("Meeting {} run completed", meeting_id),
            Ok(RunOutcome::Failed(stage)) => {
                warn!("Meeting {} run ended in failure at {}", meeting_id, stage)
            }
            Ok(RunOutcome::Cancelled) => info!("Meeting {} run cancelled", meeting_id),
            Ok(RunOutcome::AlreadyTerminal(status)) => {
                info!("Meeting {} already {}, trigger ignored", meeting_id, status)
            }
            Err(OrchestratorError::Conflict(_)) => {
                info!("Meeting {} already has an active run, trigger ignored", meeting_id)
            }
            Err(err @ OrchestratorError::MissedSchedule { .. }) => warn!("{}", err),
            Err(err) => error!("Meeting {} run aborted: {:#}", meeting_id, err),
        }
    }
}
