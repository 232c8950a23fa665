//! CLI handlers for meeting inspection and administration.
//!
//! These talk to the local database directly, so they work whether or not the
//! monitor is running. A running monitor notices a cancellation the next time
//! the meeting's run re-reads it.

use anyhow::{bail, Result};

use crate::app;
use crate::cli::args::{MeetingsCliArgs, MeetingsCommand};
use crate::db::{MeetingStore, UpdateOutcome};
use crate::meeting::{AnalysisKind, Meeting, MeetingStatus};

pub async fn handle_meetings_command(args: MeetingsCliArgs) -> Result<()> {
    let store = app::open_store()?;

    match args.command {
        MeetingsCommand::List { limit, status } => list(store.as_ref(), limit, status).await,
        MeetingsCommand::Show { id } => show(store.as_ref(), id).await,
        MeetingsCommand::Cancel { id, reason } => {
            let reason = reason.unwrap_or_else(|| "Cancelled by operator".to_string());
            match store.cancel(id, &reason).await? {
                UpdateOutcome::Updated => {
                    println!("Meeting {} cancelled", id);
                    Ok(())
                }
                UpdateOutcome::Conflict { actual } => {
                    bail!("Meeting {} is already {}", id, actual)
                }
                UpdateOutcome::NotFound => bail!("Meeting {} not found", id),
            }
        }
        MeetingsCommand::Delete { id } => {
            if store.delete(id).await? {
                println!("Meeting {} deleted", id);
                Ok(())
            } else {
                bail!("Meeting {} not found", id)
            }
        }
    }
}

async fn list(store: &dyn MeetingStore, limit: usize, status: Option<String>) -> Result<()> {
    let meetings = match status {
        Some(status) => {
            let mut meetings = store.list_by_status(MeetingStatus::parse(&status)?).await?;
            meetings.truncate(limit);
            meetings
        }
        None => store.list(limit).await?,
    };

    if meetings.is_empty() {
        println!("No meetings found.");
        return Ok(());
    }

    println!("Found {} meeting(s):\n", meetings.len());
    for meeting in meetings {
        println!("{}", summary_line(&meeting));
    }

    Ok(())
}

fn summary_line(meeting: &Meeting) -> String {
    let status = match &meeting.failure {
        Some(failure) => format!("{}({})", meeting.status, failure.stage),
        None => meeting.status.to_string(),
    };
    format!(
        "#{:<5} {:<24} {:<28} {}",
        meeting.id,
        status,
        meeting.scheduled_time.format("%Y-%m-%d %H:%M UTC").to_string(),
        meeting.display_title()
    )
}

async fn show(store: &dyn MeetingStore, id: i64) -> Result<()> {
    let Some(meeting) = store.get(id).await? else {
        bail!("Meeting {} not found", id);
    };

    println!("Meeting #{}: {}", meeting.id, meeting.display_title());
    println!("URL:        {}", meeting.url);
    println!("Status:     {}", meeting.status);
    println!("Scheduled:  {}", meeting.scheduled_time.to_rfc3339());
    if let Some(start) = meeting.actual_start_time {
        println!("Started:    {}", start.to_rfc3339());
    }
    if let Some(end) = meeting.actual_end_time {
        println!("Ended:      {}", end.to_rfc3339());
    }
    if let Some(failure) = &meeting.failure {
        println!("Failed at:  {}", failure.stage);
        println!("Error:      {}", failure.message);
    }

    let artifacts = &meeting.artifacts;
    println!();
    for (label, value) in [
        ("Bot session", &artifacts.bot_session),
        ("Media", &artifacts.media_ref),
        ("Transcript", &artifacts.transcript_ref),
        ("Analytics", &artifacts.analytics_id),
        ("Insights", &artifacts.insights_id),
        ("Report", &artifacts.report_ref),
        ("Delivery", &artifacts.delivery_ack),
    ] {
        println!("{:<12}{}", format!("{}:", label), value.as_deref().unwrap_or("-"));
    }

    if let Some(insights) = store.analysis(id, AnalysisKind::Insights).await? {
        println!("\nInsights:\n{}", serde_json::to_string_pretty(&insights.payload)?);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meeting::{Failure, FailureStage};
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_summary_line_shows_failure_stage() {
        let meeting = Meeting {
            id: 3,
            owner_hash_key: "owner".to_string(),
            url: "https://zoom.us/j/1".to_string(),
            title: Some("Staff engineer loop".to_string()),
            scheduled_time: Utc.with_ymd_and_hms(2026, 3, 2, 15, 0, 0).unwrap(),
            actual_start_time: None,
            actual_end_time: None,
            status: MeetingStatus::Failed,
            failure: Some(Failure::new(FailureStage::Missed, "late")),
            artifacts: Default::default(),
            created_at: String::new(),
            completed_at: None,
        };

        let line = summary_line(&meeting);
        assert!(line.starts_with("#3"));
        assert!(line.contains("failed(missed)"));
        assert!(line.contains("2026-03-02 15:00 UTC"));
        assert!(line.ends_with("Staff engineer loop"));
    }
}
