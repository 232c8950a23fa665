//! Invitation intake: turns detected invitations and manual entries into
//! scheduled meetings.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::db::MeetingStore;
use crate::meeting::{meeting_code, validate_meeting_url, Meeting, NewMeeting, NewUser};
use crate::scheduler::SchedulerHandle;

/// A meeting invitation addressed to an interviewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invitation {
    pub meeting_url: String,
    #[serde(default)]
    pub title: Option<String>,
    pub scheduled_time: DateTime<Utc>,
    pub owner_email: String,
    #[serde(default)]
    pub owner_name: Option<String>,
    #[serde(default)]
    pub owner_company: Option<String>,
    #[serde(default)]
    pub owner_role: Option<String>,
}

impl Invitation {
    fn owner(&self) -> NewUser {
        NewUser {
            email: self.owner_email.clone(),
            name: self.owner_name.clone(),
            company: self.owner_company.clone(),
            role: self.owner_role.clone(),
        }
    }
}

/// Anything that can discover new invitations.
#[async_trait]
pub trait InvitationSource: Send + Sync {
    /// Return invitations found since the last poll.
    async fn poll(&self) -> Result<Vec<Invitation>>;
}

/// Reads `*.json` invitation files from a directory. Each file is renamed to
/// `*.json.done` once read, or `*.json.rejected` when it does not parse.
pub struct InboxDirSource {
    dir: PathBuf,
}

impl InboxDirSource {
    pub fn new(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create inbox directory {:?}", dir))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn mark(path: &Path, suffix: &str) -> Result<()> {
        let mut target = path.as_os_str().to_owned();
        target.push(suffix);
        std::fs::rename(path, &target)
            .with_context(|| format!("Failed to mark invitation file {:?}", path))
    }
}

#[async_trait]
impl InvitationSource for InboxDirSource {
    async fn poll(&self) -> Result<Vec<Invitation>> {
        let mut paths = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("Failed to read inbox directory {:?}", self.dir))?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut invitations = Vec::new();
        for path in paths {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read invitation file {:?}", path))?;

            match serde_json::from_str::<Invitation>(&contents) {
                Ok(invitation) => {
                    debug!("Read invitation from {:?}", path);
                    Self::mark(&path, ".done")?;
                    invitations.push(invitation);
                }
                Err(e) => {
                    warn!("Rejecting invitation file {:?}: {}", path, e);
                    Self::mark(&path, ".rejected")?;
                }
            }
        }

        Ok(invitations)
    }
}

/// How an invitation should be triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// At the scheduled time plus the join offset.
    AtScheduledTime,
    /// Right away (manual entry).
    Now,
}

/// Onboard the owner if needed, create the meeting and hand it to the scheduler.
pub async fn intake(
    store: &dyn MeetingStore,
    scheduler: &SchedulerHandle,
    invitation: Invitation,
    trigger: Trigger,
) -> Result<Meeting> {
    let meeting = register(store, invitation).await?;

    match trigger {
        Trigger::AtScheduledTime => scheduler.schedule(meeting.id, meeting.scheduled_time)?,
        Trigger::Now => scheduler.schedule_now(meeting.id)?,
    }

    Ok(meeting)
}

/// Validate an invitation and persist it as a `scheduled` meeting.
pub async fn register(store: &dyn MeetingStore, invitation: Invitation) -> Result<Meeting> {
    validate_meeting_url(&invitation.meeting_url)?;
    if invitation.owner_email.trim().is_empty() {
        anyhow::bail!("Invitation has no owner email");
    }

    let owner = store.onboard(invitation.owner()).await?;
    let title = invitation
        .title
        .clone()
        .filter(|t| !t.trim().is_empty())
        .or_else(|| meeting_code(&invitation.meeting_url).map(|code| format!("Meeting {}", code)));

    let meeting = store
        .create(NewMeeting {
            owner_hash_key: owner.hash_key,
            url: invitation.meeting_url.trim().to_string(),
            title,
            scheduled_time: invitation.scheduled_time,
        })
        .await?;

    info!(
        "Registered meeting {} ({}) for {} at {}",
        meeting.id,
        meeting.display_title(),
        owner.email,
        meeting.scheduled_time.to_rfc3339()
    );

    Ok(meeting)
}

/// Poll `source` once and register everything it returns. Invalid invitations
/// are logged and skipped.
pub async fn drain(
    source: &dyn InvitationSource,
    store: &dyn MeetingStore,
    scheduler: &SchedulerHandle,
) -> Result<Vec<Meeting>> {
    let mut created = Vec::new();
    for invitation in source.poll().await? {
        let url = invitation.meeting_url.clone();
        match intake(store, scheduler, invitation, Trigger::AtScheduledTime).await {
            Ok(meeting) => created.push(meeting),
            Err(e) => warn!("Skipping invitation for {}: {:#}", url, e),
        }
    }
    Ok(created)
}
