//! In-memory bookkeeping for one orchestration run.

use std::collections::HashMap;
use tokio::time::Instant;

use crate::error::StageError;
use crate::meeting::MeetingStatus;

/// State of a single active run. Nothing here is persisted; a crashed run is
/// rebuilt from the meeting record alone.
#[derive(Debug)]
pub struct PipelineJob {
    pub meeting_id: i64,
    stage_index: usize,
    attempts: HashMap<String, u32>,
    last_error: Option<StageError>,
    started_at: Instant,
}

impl PipelineJob {
    pub fn new(meeting_id: i64) -> Self {
        Self {
            meeting_id,
            stage_index: 0,
            attempts: HashMap::new(),
            last_error: None,
            started_at: Instant::now(),
        }
    }

    /// Position on the success path of the status the run is working in.
    pub fn stage_index(&self) -> usize {
        self.stage_index
    }

    pub fn enter(&mut self, status: MeetingStatus) {
        if let Some(rank) = status.rank() {
            self.stage_index = rank;
        }
    }

    pub fn record_attempt(&mut self, stage: &str) {
        *self.attempts.entry(stage.to_string()).or_insert(0) += 1;
    }

    pub fn attempts(&self, stage: &str) -> u32 {
        self.attempts.get(stage).copied().unwrap_or(0)
    }

    pub fn record_error(&mut self, err: StageError) {
        self.last_error = Some(err);
    }

    pub fn last_error(&self) -> Option<&StageError> {
        self.last_error.as_ref()
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }
}
