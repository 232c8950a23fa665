//! Meeting trigger scheduler.
//!
//! A single loop task owns a queue of (deadline, meeting) entries. Commands
//! arrive over a channel; when an entry falls due the loop hands the meeting
//! to the injected [`RunTrigger`] on its own task and goes straight back to
//! waiting. The loop never performs I/O itself.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::db::MeetingStore;
use crate::meeting::{Failure, FailureStage, MeetingStatus};

/// Entry point invoked when a meeting's trigger time arrives.
#[async_trait]
pub trait RunTrigger: Send + Sync {
    async fn trigger(&self, meeting_id: i64);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub grace_window: chrono::Duration,
    pub join_offset: chrono::Duration,
}

impl SchedulerSettings {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            grace_window: chrono::Duration::minutes(config.grace_window_minutes),
            join_offset: chrono::Duration::seconds(config.join_offset_seconds),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}

/// What start-up recovery found in the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Scheduled meetings put back in the queue.
    pub requeued: Vec<i64>,
    /// Mid-pipeline meetings dispatched immediately.
    pub resumed: Vec<i64>,
    /// Scheduled meetings past the grace window, marked `failed(missed)`.
    pub missed: Vec<i64>,
}

/// Pending triggers, at most one per meeting, ordered by deadline.
#[derive(Debug, Default)]
struct TriggerQueue {
    order: BTreeSet<(Instant, i64)>,
    deadlines: HashMap<i64, Instant>,
}

impl TriggerQueue {
    /// Insert or replace the meeting's trigger.
    fn schedule(&mut self, meeting_id: i64, at: Instant) {
        if let Some(previous) = self.deadlines.insert(meeting_id, at) {
            self.order.remove(&(previous, meeting_id));
        }
        self.order.insert((at, meeting_id));
    }

    fn remove(&mut self, meeting_id: i64) -> bool {
        match self.deadlines.remove(&meeting_id) {
            Some(at) => self.order.remove(&(at, meeting_id)),
            None => false,
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.order.iter().next().map(|(at, _)| *at)
    }

    fn pop_due(&mut self, now: Instant) -> Vec<i64> {
        let mut due = Vec::new();
        while let Some(&(at, meeting_id)) = self.order.iter().next() {
            if at > now {
                break;
            }
            self.order.remove(&(at, meeting_id));
            self.deadlines.remove(&meeting_id);
            due.push(meeting_id);
        }
        due
    }

    fn pending(&self) -> Vec<(i64, Instant)> {
        self.order.iter().map(|(at, id)| (*id, *at)).collect()
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

enum Command {
    Schedule { meeting_id: i64, at: Instant },
    Unschedule { meeting_id: i64 },
    Pending(oneshot::Sender<Vec<(i64, Instant)>>),
    Stop,
}

/// Cheap, cloneable sender side of a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<Command>,
    settings: SchedulerSettings,
}

impl SchedulerHandle {
    fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| anyhow!("Scheduler is not running"))
    }

    /// Trigger a meeting as soon as possible (manual entry).
    pub fn schedule_now(&self, meeting_id: i64) -> Result<()> {
        self.send(Command::Schedule {
            meeting_id,
            at: Instant::now(),
        })
    }

    /// Trigger a meeting at its scheduled time plus the join offset. Times in
    /// the past trigger immediately.
    pub fn schedule(&self, meeting_id: i64, scheduled_time: DateTime<Utc>) -> Result<()> {
        let at = deadline_for(scheduled_time, &self.settings, Utc::now(), Instant::now());
        self.send(Command::Schedule { meeting_id, at })
    }

    pub fn unschedule(&self, meeting_id: i64) -> Result<()> {
        self.send(Command::Unschedule { meeting_id })
    }

    /// Meeting ids currently queued, earliest first.
    pub async fn pending(&self) -> Result<Vec<i64>> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Pending(tx))?;
        let entries = rx
            .await
            .map_err(|_| anyhow!("Scheduler stopped before answering"))?;
        Ok(entries.into_iter().map(|(id, _)| id).collect())
    }
}

/// Map a wall-clock trigger time onto the runtime clock.
fn deadline_for(
    scheduled_time: DateTime<Utc>,
    settings: &SchedulerSettings,
    wall_now: DateTime<Utc>,
    now: Instant,
) -> Instant {
    let delay = (scheduled_time + settings.join_offset - wall_now)
        .to_std()
        .unwrap_or(Duration::ZERO);
    now + delay
}

pub struct Scheduler {
    handle: SchedulerHandle,
    task: JoinHandle<()>,
    recovery: RecoveryReport,
}

impl Scheduler {
    /// Rebuild the queue from the store, then start the loop.
    pub async fn start(
        store: Arc<dyn MeetingStore>,
        trigger: Arc<dyn RunTrigger>,
        settings: SchedulerSettings,
    ) -> Result<Self> {
        let mut queue = TriggerQueue::default();
        let recovery = recover(store.as_ref(), &settings, &mut queue).await?;

        info!(
            "Scheduler recovered {} queued, {} resumed, {} missed",
            recovery.requeued.len(),
            recovery.resumed.len(),
            recovery.missed.len()
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_loop(queue, rx, trigger));

        Ok(Self {
            handle: SchedulerHandle { tx, settings },
            task,
            recovery,
        })
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    pub fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Stop the loop and wait for it to exit. Runs already dispatched keep
    /// going on their own tasks.
    pub async fn stop(self) -> Result<()> {
        let _ = self.handle.send(Command::Stop);
        self.task
            .await
            .map_err(|e| anyhow!("Scheduler loop panicked: {}", e))?;
        info!("Scheduler stopped");
        Ok(())
    }
}

async fn recover(
    store: &dyn MeetingStore,
    settings: &SchedulerSettings,
    queue: &mut TriggerQueue,
) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();
    let wall_now = Utc::now();
    let now = Instant::now();

    for meeting in store.list_unfinished().await? {
        if meeting.status != MeetingStatus::Scheduled {
            info!(
                "Resuming meeting {} from {}",
                meeting.id, meeting.status
            );
            queue.schedule(meeting.id, now);
            report.resumed.push(meeting.id);
            continue;
        }

        let late_by = wall_now - meeting.scheduled_time;
        if late_by > settings.grace_window {
            warn!(
                "Meeting {} missed its schedule by {} minutes while offline",
                meeting.id,
                late_by.num_minutes()
            );
            let failure = Failure::new(
                FailureStage::Missed,
                format!(
                    "Scheduled time {} elapsed by more than {} minutes before the bot could be dispatched",
                    meeting.scheduled_time.to_rfc3339(),
                    settings.grace_window.num_minutes()
                ),
            );
            store
                .fail(meeting.id, MeetingStatus::Scheduled, failure)
                .await?;
            report.missed.push(meeting.id);
            continue;
        }

        queue.schedule(
            meeting.id,
            deadline_for(meeting.scheduled_time, settings, wall_now, now),
        );
        report.requeued.push(meeting.id);
    }

    Ok(report)
}

/// Wake-up used when the queue is empty; commands interrupt it anyway.
const IDLE_WAIT: Duration = Duration::from_secs(3600);

async fn run_loop(
    mut queue: TriggerQueue,
    mut rx: mpsc::UnboundedReceiver<Command>,
    trigger: Arc<dyn RunTrigger>,
) {
    info!("Scheduler loop started with {} pending triggers", queue.len());

    loop {
        let wake_at = queue
            .next_deadline()
            .unwrap_or_else(|| Instant::now() + IDLE_WAIT);

        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Schedule { meeting_id, at }) => {
                    debug!("Queued trigger for meeting {}", meeting_id);
                    queue.schedule(meeting_id, at);
                }
                Some(Command::Unschedule { meeting_id }) => {
                    if queue.remove(meeting_id) {
                        debug!("Removed trigger for meeting {}", meeting_id);
                    }
                }
                Some(Command::Pending(reply)) => {
                    let _ = reply.send(queue.pending());
                }
                Some(Command::Stop) | None => break,
            },
            _ = tokio::time::sleep_until(wake_at) => {
                for meeting_id in queue.pop_due(Instant::now()) {
                    info!("Dispatching run for meeting {}", meeting_id);
                    let trigger = trigger.clone();
                    tokio::spawn(async move {
                        trigger.trigger(meeting_id).await;
                    });
                }
            }
        }
    }

    debug!("Scheduler loop exiting with {} pending triggers", queue.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteMeetingStore;
    use crate::meeting::NewMeeting;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTrigger {
        fired: Mutex<Vec<(i64, Instant)>>,
    }

    impl RecordingTrigger {
        fn fired(&self) -> Vec<i64> {
            self.fired.lock().unwrap().iter().map(|(id, _)| *id).collect()
        }
    }

    #[async_trait]
    impl RunTrigger for RecordingTrigger {
        async fn trigger(&self, meeting_id: i64) {
            self.fired.lock().unwrap().push((meeting_id, Instant::now()));
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_queue_dedups_per_meeting() {
        let mut queue = TriggerQueue::default();
        let now = Instant::now();
        queue.schedule(1, now + Duration::from_secs(60));
        queue.schedule(2, now + Duration::from_secs(30));
        queue.schedule(1, now + Duration::from_secs(10));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.next_deadline(), Some(now + Duration::from_secs(10)));
        assert_eq!(queue.pop_due(now + Duration::from_secs(30)), vec![1, 2]);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_deadline_applies_join_offset() {
        let settings = SchedulerSettings {
            grace_window: chrono::Duration::minutes(15),
            join_offset: chrono::Duration::seconds(-60),
        };
        let wall_now = Utc::now();
        let now = Instant::now();

        let at = deadline_for(wall_now + chrono::Duration::minutes(5), &settings, wall_now, now);
        assert_eq!(at, now + Duration::from_secs(240));

        let past = deadline_for(wall_now - chrono::Duration::minutes(5), &settings, wall_now, now);
        assert_eq!(past, now);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_at_trigger_time_once() {
        let store = Arc::new(SqliteMeetingStore::in_memory().unwrap());
        let trigger = Arc::new(RecordingTrigger::default());
        let scheduler = Scheduler::start(store, trigger.clone(), SchedulerSettings::default())
            .await
            .unwrap();
        let handle = scheduler.handle();
        let start = Instant::now();

        handle
            .schedule(7, Utc::now() + chrono::Duration::minutes(5))
            .unwrap();
        handle
            .schedule(7, Utc::now() + chrono::Duration::minutes(5))
            .unwrap();
        settle().await;
        assert_eq!(handle.pending().await.unwrap(), vec![7]);

        tokio::time::sleep(Duration::from_secs(299)).await;
        settle().await;
        assert!(trigger.fired().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(trigger.fired(), vec![7]);
        let fired_at = trigger.fired.lock().unwrap()[0].1;
        assert!(fired_at - start >= Duration::from_secs(299));

        scheduler.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_now_and_unschedule() {
        let store = Arc::new(SqliteMeetingStore::in_memory().unwrap());
        let trigger = Arc::new(RecordingTrigger::default());
        let scheduler = Scheduler::start(store, trigger.clone(), SchedulerSettings::default())
            .await
            .unwrap();
        let handle = scheduler.handle();

        handle
            .schedule(1, Utc::now() + chrono::Duration::minutes(1))
            .unwrap();
        handle.unschedule(1).unwrap();
        handle.schedule_now(2).unwrap();

        tokio::time::sleep(Duration::from_secs(120)).await;
        settle().await;
        assert_eq!(trigger.fired(), vec![2]);

        scheduler.stop().await.unwrap();
        assert!(handle.schedule_now(3).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_requeues_resumes_and_marks_missed() {
        let store = Arc::new(SqliteMeetingStore::in_memory().unwrap());
        let new_meeting = |offset_minutes: i64| NewMeeting {
            owner_hash_key: "owner".to_string(),
            url: "https://zoom.us/j/1".to_string(),
            title: None,
            scheduled_time: Utc::now() + chrono::Duration::minutes(offset_minutes),
        };

        let recent = store.create(new_meeting(-2)).await.unwrap();
        let stale = store.create(new_meeting(-20)).await.unwrap();
        let future = store.create(new_meeting(30)).await.unwrap();
        let mid = store.create(new_meeting(-60)).await.unwrap();
        store
            .update_status_and_artifacts(
                mid.id,
                MeetingStatus::Scheduled,
                MeetingStatus::Joining,
                vec![],
                None,
            )
            .await
            .unwrap();

        let trigger = Arc::new(RecordingTrigger::default());
        let settings = SchedulerSettings {
            grace_window: chrono::Duration::minutes(10),
            join_offset: chrono::Duration::zero(),
        };
        let scheduler = Scheduler::start(store.clone(), trigger.clone(), settings)
            .await
            .unwrap();

        assert_eq!(scheduler.recovery().missed, vec![stale.id]);
        assert_eq!(scheduler.recovery().resumed, vec![mid.id]);
        let mut requeued = scheduler.recovery().requeued.clone();
        requeued.sort();
        assert_eq!(requeued, vec![recent.id, future.id]);

        let stale = store.get(stale.id).await.unwrap().unwrap();
        assert_eq!(stale.status, MeetingStatus::Failed);
        assert_eq!(stale.failure.unwrap().stage, FailureStage::Missed);

        tokio::time::sleep(Duration::from_millis(10)).await;
        settle().await;
        let mut fired = trigger.fired();
        fired.sort();
        assert_eq!(fired, {
            let mut expected = vec![recent.id, mid.id];
            expected.sort();
            expected
        });

        scheduler.stop().await.unwrap();
    }
}
