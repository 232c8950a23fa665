//! Analysis result persistence. One row per (meeting, kind); writes replace.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::meeting::{AnalysisKind, AnalysisResult};

pub struct AnalysisRepository;

impl AnalysisRepository {
    pub fn upsert(conn: &Connection, result: &AnalysisResult) -> Result<()> {
        let data =
            serde_json::to_string(&result.payload).context("Failed to serialize analysis result")?;

        conn.execute(
            "INSERT INTO analysis_results (meeting_id, result_type, result_id, result_data) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(meeting_id, result_type) DO UPDATE SET \
             result_id = excluded.result_id, result_data = excluded.result_data, \
             created_at = CURRENT_TIMESTAMP",
            params![result.meeting_id, result.kind.as_str(), result.result_id, data],
        )
        .context("Failed to store analysis result")?;

        Ok(())
    }

    pub fn get(
        conn: &Connection,
        meeting_id: i64,
        kind: AnalysisKind,
    ) -> Result<Option<AnalysisResult>> {
        let row = conn
            .query_row(
                "SELECT result_id, result_data FROM analysis_results \
                 WHERE meeting_id = ?1 AND result_type = ?2",
                params![meeting_id, kind.as_str()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .context("Failed to query analysis result")?;

        match row {
            Some((result_id, data)) => Ok(Some(AnalysisResult {
                meeting_id,
                kind,
                result_id,
                payload: serde_json::from_str(&data)
                    .context("Stored analysis result is not valid JSON")?,
            })),
            None => Ok(None),
        }
    }

    pub fn delete_for_meeting(conn: &Connection, meeting_id: i64) -> Result<usize> {
        conn.execute(
            "DELETE FROM analysis_results WHERE meeting_id = ?1",
            params![meeting_id],
        )
        .context("Failed to delete analysis results")
    }
}
