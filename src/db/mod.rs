//! SQLite persistence for meetings, users and analysis results.

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;

pub mod analysis;
pub mod meetings;
pub mod store;
pub mod users;

pub use analysis::AnalysisRepository;
pub use meetings::{MeetingRepository, UpdateOutcome};
pub use store::{MeetingStore, SqliteMeetingStore};
pub use users::UserRepository;

pub fn init_db() -> Result<Connection> {
    let db_path = crate::global::db_file()?;
    init_db_at(&db_path)
}

pub fn init_db_at(db_path: &Path) -> Result<Connection> {
    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    let conn = Connection::open(db_path).context("Failed to open database connection")?;

    conn.pragma_update(None, "foreign_keys", "ON")
        .context("Failed to enable foreign keys")?;

    migrate(&conn)?;

    Ok(conn)
}

pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            email TEXT NOT NULL,
            hash_key TEXT UNIQUE NOT NULL,
            name TEXT,
            company TEXT,
            role TEXT,
            onboarded_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )
    .context("Failed to create users table")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS meetings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            owner_hash_key TEXT NOT NULL,
            url TEXT NOT NULL,
            title TEXT,
            scheduled_time TEXT NOT NULL,
            actual_start_time TEXT,
            actual_end_time TEXT,
            status TEXT NOT NULL DEFAULT 'scheduled',
            failure_stage TEXT,
            error TEXT,
            bot_session TEXT,
            media_ref TEXT,
            transcript_ref TEXT,
            analytics_id TEXT,
            insights_id TEXT,
            report_ref TEXT,
            delivery_ack TEXT,
            run_owner TEXT,
            lease_until TEXT,
            created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            completed_at TIMESTAMP
        )",
        [],
    )
    .context("Failed to create meetings table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_meetings_status ON meetings(status)",
        [],
    )
    .context("Failed to create meetings status index")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_meetings_scheduled_time ON meetings(scheduled_time)",
        [],
    )
    .context("Failed to create meetings scheduled_time index")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_meetings_owner ON meetings(owner_hash_key)",
        [],
    )
    .context("Failed to create meetings owner index")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS analysis_results (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            meeting_id INTEGER NOT NULL REFERENCES meetings(id) ON DELETE CASCADE,
            result_type TEXT NOT NULL,
            result_id TEXT NOT NULL,
            result_data TEXT NOT NULL,
            created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            UNIQUE (meeting_id, result_type)
        )",
        [],
    )
    .context("Failed to create analysis_results table")?;

    Ok(())
}
