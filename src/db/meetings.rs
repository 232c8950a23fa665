//! Meeting record persistence.
//!
//! Raw SQL with rusqlite. Every status change is a compare-and-swap on the
//! current status so two writers can never both advance the same meeting.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use super::analysis::AnalysisRepository;
use crate::meeting::{
    AnalysisResult, Artifact, Artifacts, Failure, FailureStage, Meeting, MeetingStatus, NewMeeting,
};

/// Result of a compare-and-swap update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    /// The stored status no longer matched the expected one.
    Conflict { actual: MeetingStatus },
    NotFound,
}

impl UpdateOutcome {
    pub fn is_updated(&self) -> bool {
        matches!(self, Self::Updated)
    }
}

pub struct MeetingRepository;

const MEETING_COLUMNS: &str = "id, owner_hash_key, url, title, scheduled_time, actual_start_time, \
     actual_end_time, status, failure_stage, error, bot_session, media_ref, transcript_ref, \
     analytics_id, insights_id, report_ref, delivery_ack, created_at, completed_at";

/// Row as stored, before status and timestamps are parsed.
struct MeetingRow {
    id: i64,
    owner_hash_key: String,
    url: String,
    title: Option<String>,
    scheduled_time: String,
    actual_start_time: Option<String>,
    actual_end_time: Option<String>,
    status: String,
    failure_stage: Option<String>,
    error: Option<String>,
    artifacts: Artifacts,
    created_at: String,
    completed_at: Option<String>,
}

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MeetingRow> {
    Ok(MeetingRow {
        id: row.get(0)?,
        owner_hash_key: row.get(1)?,
        url: row.get(2)?,
        title: row.get(3)?,
        scheduled_time: row.get(4)?,
        actual_start_time: row.get(5)?,
        actual_end_time: row.get(6)?,
        status: row.get(7)?,
        failure_stage: row.get(8)?,
        error: row.get(9)?,
        artifacts: Artifacts {
            bot_session: row.get(10)?,
            media_ref: row.get(11)?,
            transcript_ref: row.get(12)?,
            analytics_id: row.get(13)?,
            insights_id: row.get(14)?,
            report_ref: row.get(15)?,
            delivery_ack: row.get(16)?,
        },
        created_at: row.get(17)?,
        completed_at: row.get(18)?,
    })
}

/// Fixed-width UTC form so lease times compare correctly as text.
fn lease_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("Invalid timestamp in meetings table: {}", value))?
        .with_timezone(&Utc))
}

impl TryFrom<MeetingRow> for Meeting {
    type Error = anyhow::Error;

    fn try_from(row: MeetingRow) -> Result<Self> {
        let status = MeetingStatus::parse(&row.status)?;
        let failure = match row.failure_stage.as_deref() {
            Some(stage) => Some(Failure {
                stage: FailureStage::parse(stage)?,
                message: row.error.unwrap_or_default(),
            }),
            None => None,
        };

        Ok(Meeting {
            id: row.id,
            owner_hash_key: row.owner_hash_key,
            url: row.url,
            title: row.title,
            scheduled_time: parse_time(&row.scheduled_time)?,
            actual_start_time: row.actual_start_time.as_deref().map(parse_time).transpose()?,
            actual_end_time: row.actual_end_time.as_deref().map(parse_time).transpose()?,
            status,
            failure,
            artifacts: row.artifacts,
            created_at: row.created_at,
            completed_at: row.completed_at,
        })
    }
}

impl MeetingRepository {
    /// Insert a new meeting (status = scheduled). Returns the new meeting ID.
    pub fn insert(conn: &Connection, meeting: &NewMeeting) -> Result<i64> {
        conn.execute(
            "INSERT INTO meetings (owner_hash_key, url, title, scheduled_time, status) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                meeting.owner_hash_key,
                meeting.url.trim(),
                meeting.title,
                meeting.scheduled_time.to_rfc3339(),
                MeetingStatus::Scheduled.as_str(),
            ],
        )
        .context("Failed to insert meeting")?;

        Ok(conn.last_insert_rowid())
    }

    pub fn get(conn: &Connection, id: i64) -> Result<Option<Meeting>> {
        let row = conn
            .query_row(
                &format!("SELECT {} FROM meetings WHERE id = ?1", MEETING_COLUMNS),
                params![id],
                map_row,
            )
            .optional()
            .context("Failed to query meeting")?;

        row.map(Meeting::try_from).transpose()
    }

    /// List meetings, newest scheduled first.
    pub fn list(conn: &Connection, limit: usize) -> Result<Vec<Meeting>> {
        Self::query(
            conn,
            &format!(
                "SELECT {} FROM meetings ORDER BY scheduled_time DESC, id DESC LIMIT ?1",
                MEETING_COLUMNS
            ),
            params![limit as i64],
        )
    }

    pub fn list_by_status(conn: &Connection, status: MeetingStatus) -> Result<Vec<Meeting>> {
        Self::query(
            conn,
            &format!(
                "SELECT {} FROM meetings WHERE status = ?1 ORDER BY scheduled_time ASC, id ASC",
                MEETING_COLUMNS
            ),
            params![status.as_str()],
        )
    }

    /// Meetings that have not reached a terminal status.
    pub fn list_unfinished(conn: &Connection) -> Result<Vec<Meeting>> {
        Self::query(
            conn,
            &format!(
                "SELECT {} FROM meetings WHERE status NOT IN (?1, ?2) \
                 ORDER BY scheduled_time ASC, id ASC",
                MEETING_COLUMNS
            ),
            params![
                MeetingStatus::Completed.as_str(),
                MeetingStatus::Failed.as_str()
            ],
        )
    }

    fn query(
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Meeting>> {
        let mut stmt = conn.prepare(sql).context("Failed to prepare meetings query")?;

        let rows = stmt
            .query_map(params, map_row)
            .context("Failed to query meetings")?;

        let mut meetings = Vec::new();
        for row in rows {
            meetings.push(Meeting::try_from(row?)?);
        }

        Ok(meetings)
    }

    /// Atomically move a meeting from `expected` to `new`, writing artifacts
    /// and an optional analysis result in the same transaction.
    ///
    /// Artifact columns are only filled when empty; an existing reference is
    /// never overwritten or cleared.
    pub fn advance(
        conn: &Connection,
        id: i64,
        expected: MeetingStatus,
        new: MeetingStatus,
        artifacts: &[Artifact],
        analysis: Option<&AnalysisResult>,
    ) -> Result<UpdateOutcome> {
        if new == MeetingStatus::Failed {
            bail!("Use MeetingRepository::fail to record failures");
        }
        if !expected.can_transition_to(new) {
            bail!(
                "Illegal meeting transition for {}: {} -> {}",
                id,
                expected,
                new
            );
        }
        if let Some(result) = analysis {
            if result.meeting_id != id {
                bail!(
                    "Analysis result for meeting {} passed to meeting {}",
                    result.meeting_id,
                    id
                );
            }
        }

        let mut sql = String::from("UPDATE meetings SET status = ?, updated_at = CURRENT_TIMESTAMP");
        let mut values: Vec<String> = vec![new.as_str().to_string()];

        for artifact in artifacts {
            sql.push_str(&format!(
                ", {col} = COALESCE({col}, ?)",
                col = artifact.column()
            ));
            values.push(artifact.value());
        }

        if new == MeetingStatus::Completed {
            sql.push_str(", completed_at = CURRENT_TIMESTAMP");
        }

        sql.push_str(" WHERE id = ? AND status = ?");
        values.push(id.to_string());
        values.push(expected.as_str().to_string());

        let tx = conn
            .unchecked_transaction()
            .context("Failed to begin meeting transaction")?;

        let changed = tx
            .execute(&sql, params_from_iter(values.iter()))
            .context("Failed to update meeting status")?;

        if changed == 0 {
            let outcome = Self::miss_outcome(&tx, id)?;
            tx.rollback().context("Failed to roll back meeting update")?;
            return Ok(outcome);
        }

        if let Some(result) = analysis {
            AnalysisRepository::upsert(&tx, result)?;
        }

        tx.commit().context("Failed to commit meeting update")?;
        Ok(UpdateOutcome::Updated)
    }

    /// Record a terminal failure, provided the meeting is still in `expected`.
    pub fn fail(
        conn: &Connection,
        id: i64,
        expected: MeetingStatus,
        failure: &Failure,
    ) -> Result<UpdateOutcome> {
        if expected.is_terminal() {
            bail!("Meeting {} cannot fail from terminal status {}", id, expected);
        }

        let changed = conn
            .execute(
                "UPDATE meetings SET status = ?1, failure_stage = ?2, error = ?3, \
                 updated_at = CURRENT_TIMESTAMP, completed_at = CURRENT_TIMESTAMP \
                 WHERE id = ?4 AND status = ?5",
                params![
                    MeetingStatus::Failed.as_str(),
                    failure.stage.as_str(),
                    failure.message,
                    id,
                    expected.as_str(),
                ],
            )
            .context("Failed to mark meeting as failed")?;

        if changed == 0 {
            return Self::miss_outcome(conn, id);
        }
        Ok(UpdateOutcome::Updated)
    }

    /// Force any non-terminal meeting to `failed(cancelled)`.
    pub fn cancel(conn: &Connection, id: i64, reason: &str) -> Result<UpdateOutcome> {
        let changed = conn
            .execute(
                "UPDATE meetings SET status = ?1, failure_stage = ?2, error = ?3, \
                 updated_at = CURRENT_TIMESTAMP, completed_at = CURRENT_TIMESTAMP \
                 WHERE id = ?4 AND status NOT IN (?5, ?6)",
                params![
                    MeetingStatus::Failed.as_str(),
                    FailureStage::Cancelled.as_str(),
                    reason,
                    id,
                    MeetingStatus::Completed.as_str(),
                    MeetingStatus::Failed.as_str(),
                ],
            )
            .context("Failed to cancel meeting")?;

        if changed == 0 {
            return Self::miss_outcome(conn, id);
        }
        Ok(UpdateOutcome::Updated)
    }

    /// Take the run lease on a non-terminal meeting until `until`.
    ///
    /// Succeeds when nobody holds the lease, `owner` already holds it, or the
    /// holder let it expire before `now`. Returns false otherwise.
    pub fn claim_run(
        conn: &Connection,
        id: i64,
        owner: &str,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = conn
            .execute(
                "UPDATE meetings SET run_owner = ?1, lease_until = ?2 \
                 WHERE id = ?3 AND status NOT IN (?4, ?5) \
                 AND (run_owner IS NULL OR run_owner = ?1 \
                      OR lease_until IS NULL OR lease_until < ?6)",
                params![
                    owner,
                    lease_time(until),
                    id,
                    MeetingStatus::Completed.as_str(),
                    MeetingStatus::Failed.as_str(),
                    lease_time(now),
                ],
            )
            .context("Failed to claim meeting run")?;

        Ok(changed > 0)
    }

    /// Extend a lease `owner` still holds. Returns false if it was lost.
    pub fn renew_run(
        conn: &Connection,
        id: i64,
        owner: &str,
        until: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = conn
            .execute(
                "UPDATE meetings SET lease_until = ?1 WHERE id = ?2 AND run_owner = ?3",
                params![lease_time(until), id, owner],
            )
            .context("Failed to renew meeting run lease")?;

        Ok(changed > 0)
    }

    pub fn release_run(conn: &Connection, id: i64, owner: &str) -> Result<()> {
        conn.execute(
            "UPDATE meetings SET run_owner = NULL, lease_until = NULL \
             WHERE id = ?1 AND run_owner = ?2",
            params![id, owner],
        )
        .context("Failed to release meeting run lease")?;

        Ok(())
    }

    /// Administrative reset: remove a meeting and its analysis results.
    pub fn delete(conn: &Connection, id: i64) -> Result<bool> {
        let tx = conn
            .unchecked_transaction()
            .context("Failed to begin delete transaction")?;
        AnalysisRepository::delete_for_meeting(&tx, id)?;
        let deleted = tx
            .execute("DELETE FROM meetings WHERE id = ?1", params![id])
            .context("Failed to delete meeting")?;
        tx.commit().context("Failed to commit meeting delete")?;
        Ok(deleted > 0)
    }

    fn miss_outcome(conn: &Connection, id: i64) -> Result<UpdateOutcome> {
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM meetings WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read meeting status")?;

        match status {
            Some(status) => Ok(UpdateOutcome::Conflict {
                actual: MeetingStatus::parse(&status)?,
            }),
            None => Ok(UpdateOutcome::NotFound),
        }
    }
}
