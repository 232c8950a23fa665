//! Meeting status state machine.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Position of a meeting in its capture lifecycle.
///
/// The success path is strictly ordered; `Failed` is reachable from any
/// non-terminal status and carries its stage separately (see [`FailureStage`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeetingStatus {
    Scheduled,
    Joining,
    Recording,
    Retrieving,
    Analyzing,
    ExtractingInsights,
    Reporting,
    Delivered,
    Completed,
    Failed,
}

impl MeetingStatus {
    pub const SUCCESS_PATH: [MeetingStatus; 9] = [
        Self::Scheduled,
        Self::Joining,
        Self::Recording,
        Self::Retrieving,
        Self::Analyzing,
        Self::ExtractingInsights,
        Self::Reporting,
        Self::Delivered,
        Self::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Joining => "joining",
            Self::Recording => "recording",
            Self::Retrieving => "retrieving",
            Self::Analyzing => "analyzing",
            Self::ExtractingInsights => "extracting_insights",
            Self::Reporting => "reporting",
            Self::Delivered => "delivered",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "scheduled" => Self::Scheduled,
            "joining" => Self::Joining,
            "recording" => Self::Recording,
            "retrieving" => Self::Retrieving,
            "analyzing" => Self::Analyzing,
            "extracting_insights" => Self::ExtractingInsights,
            "reporting" => Self::Reporting,
            "delivered" => Self::Delivered,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => bail!("Invalid meeting status: {}", s),
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Index on the success path; `None` for `Failed`.
    pub fn rank(&self) -> Option<usize> {
        Self::SUCCESS_PATH.iter().position(|s| s == self)
    }

    pub fn next(&self) -> Option<Self> {
        let rank = self.rank()?;
        Self::SUCCESS_PATH.get(rank + 1).copied()
    }

    /// Whether a persisted `self` may be replaced by `to`.
    ///
    /// Same status (artifact-only update) and the immediate successor are
    /// allowed for non-terminal statuses, as is `Failed`.
    pub fn can_transition_to(&self, to: MeetingStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == *self || to == Self::Failed || self.next() == Some(to)
    }
}

impl std::fmt::Display for MeetingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a failed meeting stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Joining,
    Recording,
    Retrieving,
    Analyzing,
    ExtractingInsights,
    Reporting,
    Delivering,
    /// Scheduled time elapsed past the grace window before the bot was dispatched.
    Missed,
    /// Operator cancelled the meeting.
    Cancelled,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Joining => "joining",
            Self::Recording => "recording",
            Self::Retrieving => "retrieving",
            Self::Analyzing => "analyzing",
            Self::ExtractingInsights => "extracting_insights",
            Self::Reporting => "reporting",
            Self::Delivering => "delivering",
            Self::Missed => "missed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "joining" => Self::Joining,
            "recording" => Self::Recording,
            "retrieving" => Self::Retrieving,
            "analyzing" => Self::Analyzing,
            "extracting_insights" => Self::ExtractingInsights,
            "reporting" => Self::Reporting,
            "delivering" => Self::Delivering,
            "missed" => Self::Missed,
            "cancelled" => Self::Cancelled,
            _ => bail!("Invalid failure stage: {}", s),
        })
    }
}

impl std::fmt::Display for FailureStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record of a terminal failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub stage: FailureStage,
    pub message: String,
}

impl Failure {
    pub fn new(stage: FailureStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }
}
