use crate::api::ApiServer;
use crate::config::Config;
use crate::db::{self, MeetingStore, SqliteMeetingStore};
use crate::global;
use crate::intake::{self, InboxDirSource, Invitation, InvitationSource};
use crate::meeting::Meeting;
use crate::orchestrator::{Collaborators, Orchestrator, OrchestratorSettings, RunOutcome};
use crate::providers::{
    AttendeeBotProvider, CommandAnalytics, CommandDelivery, CommandInsights, DeliveryChannel,
    LocalOutbox, MarkdownReportCompiler,
};
use crate::scheduler::{Scheduler, SchedulerHandle, SchedulerSettings};
use anyhow::{bail, Context, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub fn open_store() -> Result<Arc<SqliteMeetingStore>> {
    Ok(Arc::new(SqliteMeetingStore::new(db::init_db()?)))
}

/// Build the production collaborators described by `config`.
pub fn build_collaborators(config: &Config) -> Result<Collaborators> {
    if config.analytics.command.trim().is_empty() {
        bail!("No analytics command configured. Set [analytics] command in the config file.");
    }
    if config.insights.command.trim().is_empty() {
        bail!("No insights command configured. Set [insights] command in the config file.");
    }

    let bot = AttendeeBotProvider::new(&config.bot, global::sessions_dir()?)?;

    let report_dir = match &config.report.output_dir {
        Some(dir) => dir.clone(),
        None => global::reports_dir()?,
    };

    let delivery: Arc<dyn DeliveryChannel> = if config.delivery.command.trim().is_empty() {
        let outbox = global::outbox_dir()?;
        info!("No delivery command configured, reports go to {:?}", outbox);
        Arc::new(LocalOutbox::new(outbox))
    } else {
        Arc::new(CommandDelivery::new(
            config.delivery.command.clone(),
            config.delivery.timeout_seconds,
        ))
    };

    Ok(Collaborators {
        bot: Arc::new(bot),
        analytics: Arc::new(CommandAnalytics::new(
            config.analytics.command.clone(),
            config.analytics.timeout_seconds,
        )),
        insights: Arc::new(CommandInsights::new(
            config.insights.command.clone(),
            config.insights.timeout_seconds,
        )),
        report: Arc::new(MarkdownReportCompiler::new(report_dir)),
        delivery,
    })
}

/// Register a meeting and run it to completion in the foreground.
pub async fn run_manual(invitation: Invitation) -> Result<Meeting> {
    let config = Config::load()?;
    let store = open_store()?;
    let orchestrator = Orchestrator::new(
        store.clone(),
        build_collaborators(&config)?,
        OrchestratorSettings::from_config(&config),
    );

    let meeting = intake::register(store.as_ref(), invitation).await?;
    info!("Starting manual run for meeting {}", meeting.id);

    match orchestrator.run(meeting.id).await? {
        RunOutcome::Completed => info!("Meeting {} completed", meeting.id),
        RunOutcome::Failed(stage) => warn!("Meeting {} failed at {}", meeting.id, stage),
        RunOutcome::Cancelled => info!("Meeting {} was cancelled", meeting.id),
        RunOutcome::AlreadyTerminal(status) => {
            info!("Meeting {} was already {}", meeting.id, status)
        }
    }

    store
        .get(meeting.id)
        .await?
        .with_context(|| format!("Meeting {} disappeared during the run", meeting.id))
}

/// Long-running service: scheduler, inbox polling and the HTTP API until ctrl-c.
pub async fn run_monitor() -> Result<()> {
    info!("Starting interview capture monitor");

    let config = Config::load()?;
    let store = open_store()?;
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        build_collaborators(&config)?,
        OrchestratorSettings::from_config(&config),
    ));

    let scheduler = Scheduler::start(
        store.clone(),
        orchestrator,
        SchedulerSettings::from_config(&config.scheduler),
    )
    .await?;
    let handle = scheduler.handle();

    let inbox_dir = match &config.monitor.inbox_dir {
        Some(dir) => dir.clone(),
        None => global::inbox_dir()?,
    };
    let source = InboxDirSource::new(inbox_dir)?;
    info!("Watching {:?} for invitations", source.dir());

    if config.api.enabled {
        let api_server = ApiServer::new(store.clone(), handle.clone(), &config);
        tokio::spawn(async move {
            if let Err(e) = api_server.start().await {
                error!("API server failed: {}", e);
            }
        });
    }

    let every = Duration::from_secs(config.monitor.poll_interval_seconds.max(1));
    watch_inbox(&source, store.as_ref(), &handle, every, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
        }
    })
    .await;
    info!("Shutdown requested");

    scheduler.stop().await
}

/// Drain `source` every `every` until `shutdown` resolves. A shutdown that
/// arrives mid-drain is honoured once the drain finishes.
pub async fn watch_inbox(
    source: &dyn InvitationSource,
    store: &dyn MeetingStore,
    scheduler: &SchedulerHandle,
    every: Duration,
    shutdown: impl Future<Output = ()>,
) {
    let mut ticker = tokio::time::interval(every);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                match intake::drain(source, store, scheduler).await {
                    Ok(created) if !created.is_empty() => {
                        info!("Scheduled {} new meeting(s) from the inbox", created.len());
                    }
                    Ok(_) => {}
                    Err(e) => error!("Failed to poll invitations: {:#}", e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::RunTrigger;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoopTrigger;

    #[async_trait]
    impl RunTrigger for NoopTrigger {
        async fn trigger(&self, _meeting_id: i64) {}
    }

    /// Inbox that takes a while to read and hands out one invitation per poll.
    #[derive(Default)]
    struct SlowInbox {
        polls: AtomicUsize,
    }

    #[async_trait]
    impl InvitationSource for SlowInbox {
        async fn poll(&self) -> Result<Vec<Invitation>> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(vec![Invitation {
                meeting_url: "https://zoom.us/j/5550001".to_string(),
                title: None,
                scheduled_time: Utc::now() + chrono::Duration::hours(1),
                owner_email: "recruiter@example.com".to_string(),
                owner_name: None,
                owner_company: None,
                owner_role: None,
            }])
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_a_drain_stops_the_watch() {
        let store = Arc::new(SqliteMeetingStore::in_memory().unwrap());
        let scheduler = Scheduler::start(
            store.clone(),
            Arc::new(NoopTrigger),
            SchedulerSettings::default(),
        )
        .await
        .unwrap();
        let inbox = SlowInbox::default();

        // Fires one second into the first ten-second drain.
        let shutdown = tokio::time::sleep(Duration::from_secs(1));
        watch_inbox(
            &inbox,
            store.as_ref(),
            &scheduler.handle(),
            Duration::from_secs(60),
            shutdown,
        )
        .await;

        assert_eq!(inbox.polls.load(Ordering::SeqCst), 1);
        assert_eq!(store.list(10).await.unwrap().len(), 1);
        scheduler.stop().await.unwrap();
    }
}
