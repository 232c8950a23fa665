//! Async meeting store shared by the orchestrator, scheduler and API.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::{AnalysisRepository, MeetingRepository, UpdateOutcome, UserRepository};
use crate::meeting::{
    AnalysisKind, AnalysisResult, Artifact, Failure, Meeting, MeetingStatus, NewMeeting, NewUser,
    User,
};

/// Persistence contract used by everything that mutates meetings.
///
/// `update_status_and_artifacts` is a compare-and-swap on the current status;
/// a stale `expected` yields `UpdateOutcome::Conflict` and writes nothing.
#[async_trait]
pub trait MeetingStore: Send + Sync {
    async fn create(&self, meeting: NewMeeting) -> Result<Meeting>;

    async fn get(&self, id: i64) -> Result<Option<Meeting>>;

    async fn list(&self, limit: usize) -> Result<Vec<Meeting>>;

    async fn list_by_status(&self, status: MeetingStatus) -> Result<Vec<Meeting>>;

    async fn list_unfinished(&self) -> Result<Vec<Meeting>>;

    async fn update_status_and_artifacts(
        &self,
        id: i64,
        expected: MeetingStatus,
        new: MeetingStatus,
        artifacts: Vec<Artifact>,
        analysis: Option<AnalysisResult>,
    ) -> Result<UpdateOutcome>;

    async fn fail(&self, id: i64, expected: MeetingStatus, failure: Failure)
        -> Result<UpdateOutcome>;

    async fn cancel(&self, id: i64, reason: &str) -> Result<UpdateOutcome>;

    async fn delete(&self, id: i64) -> Result<bool>;

    async fn analysis(&self, meeting_id: i64, kind: AnalysisKind)
        -> Result<Option<AnalysisResult>>;

    async fn owner(&self, hash_key: &str) -> Result<Option<User>>;

    async fn onboard(&self, user: NewUser) -> Result<User>;

    /// Take the cross-process run lease on a meeting for `lease`.
    async fn claim_run(&self, id: i64, owner: &str, lease: chrono::Duration) -> Result<bool>;

    async fn renew_run(&self, id: i64, owner: &str, lease: chrono::Duration) -> Result<bool>;

    async fn release_run(&self, id: i64, owner: &str) -> Result<()>;
}

/// SQLite-backed store over a single shared connection. Queries run on the
/// blocking pool under the connection mutex.
#[derive(Clone)]
pub struct SqliteMeetingStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMeetingStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(super::init_db_at(path)?))
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("Failed to enable foreign keys")?;
        super::migrate(&conn)?;
        Ok(Self::new(conn))
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| anyhow::anyhow!("Database connection lock poisoned"))?;
            f(&guard)
        })
        .await
        .context("Database task failed")?
    }
}

#[async_trait]
impl MeetingStore for SqliteMeetingStore {
    async fn create(&self, meeting: NewMeeting) -> Result<Meeting> {
        self.with_conn(move |conn| {
            let id = MeetingRepository::insert(conn, &meeting)?;
            MeetingRepository::get(conn, id)?
                .with_context(|| format!("Meeting {} missing after insert", id))
        })
        .await
    }

    async fn get(&self, id: i64) -> Result<Option<Meeting>> {
        self.with_conn(move |conn| MeetingRepository::get(conn, id))
            .await
    }

    async fn list(&self, limit: usize) -> Result<Vec<Meeting>> {
        self.with_conn(move |conn| MeetingRepository::list(conn, limit))
            .await
    }

    async fn list_by_status(&self, status: MeetingStatus) -> Result<Vec<Meeting>> {
        self.with_conn(move |conn| MeetingRepository::list_by_status(conn, status))
            .await
    }

    async fn list_unfinished(&self) -> Result<Vec<Meeting>> {
        self.with_conn(MeetingRepository::list_unfinished).await
    }

    async fn update_status_and_artifacts(
        &self,
        id: i64,
        expected: MeetingStatus,
        new: MeetingStatus,
        artifacts: Vec<Artifact>,
        analysis: Option<AnalysisResult>,
    ) -> Result<UpdateOutcome> {
        self.with_conn(move |conn| {
            MeetingRepository::advance(conn, id, expected, new, &artifacts, analysis.as_ref())
        })
        .await
    }

    async fn fail(
        &self,
        id: i64,
        expected: MeetingStatus,
        failure: Failure,
    ) -> Result<UpdateOutcome> {
        self.with_conn(move |conn| MeetingRepository::fail(conn, id, expected, &failure))
            .await
    }

    async fn cancel(&self, id: i64, reason: &str) -> Result<UpdateOutcome> {
        let reason = reason.to_string();
        self.with_conn(move |conn| MeetingRepository::cancel(conn, id, &reason))
            .await
    }

    async fn delete(&self, id: i64) -> Result<bool> {
        self.with_conn(move |conn| MeetingRepository::delete(conn, id))
            .await
    }

    async fn analysis(
        &self,
        meeting_id: i64,
        kind: AnalysisKind,
    ) -> Result<Option<AnalysisResult>> {
        self.with_conn(move |conn| AnalysisRepository::get(conn, meeting_id, kind))
            .await
    }

    async fn owner(&self, hash_key: &str) -> Result<Option<User>> {
        let hash_key = hash_key.to_string();
        self.with_conn(move |conn| UserRepository::get_by_hash_key(conn, &hash_key))
            .await
    }

    async fn onboard(&self, user: NewUser) -> Result<User> {
        self.with_conn(move |conn| UserRepository::onboard(conn, &user))
            .await
    }

    async fn claim_run(&self, id: i64, owner: &str, lease: chrono::Duration) -> Result<bool> {
        let owner = owner.to_string();
        self.with_conn(move |conn| {
            let now = Utc::now();
            MeetingRepository::claim_run(conn, id, &owner, now, now + lease)
        })
        .await
    }

    async fn renew_run(&self, id: i64, owner: &str, lease: chrono::Duration) -> Result<bool> {
        let owner = owner.to_string();
        self.with_conn(move |conn| {
            MeetingRepository::renew_run(conn, id, &owner, Utc::now() + lease)
        })
        .await
    }

    async fn release_run(&self, id: i64, owner: &str) -> Result<()> {
        let owner = owner.to_string();
        self.with_conn(move |conn| MeetingRepository::release_run(conn, id, &owner))
            .await
    }
}
