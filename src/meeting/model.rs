//! Persisted meeting, user and analysis records.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

use super::status::{Failure, MeetingStatus};

/// One scheduled or in-progress interview capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meeting {
    pub id: i64,
    pub owner_hash_key: String,
    pub url: String,
    pub title: Option<String>,
    pub scheduled_time: DateTime<Utc>,
    pub actual_start_time: Option<DateTime<Utc>>,
    pub actual_end_time: Option<DateTime<Utc>>,
    pub status: MeetingStatus,
    pub failure: Option<Failure>,
    pub artifacts: Artifacts,
    pub created_at: String,
    pub completed_at: Option<String>,
}

impl Meeting {
    pub fn display_title(&self) -> &str {
        self.title.as_deref().unwrap_or("Untitled interview")
    }
}

/// Artifact references produced along the pipeline. Each is set at most once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifacts {
    pub bot_session: Option<String>,
    pub media_ref: Option<String>,
    pub transcript_ref: Option<String>,
    pub analytics_id: Option<String>,
    pub insights_id: Option<String>,
    pub report_ref: Option<String>,
    pub delivery_ack: Option<String>,
}

/// A single artifact write, applied together with a status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    BotSession(String),
    Media(String),
    Transcript(String),
    Analytics(String),
    Insights(String),
    Report(String),
    DeliveryAck(String),
    ActualStart(DateTime<Utc>),
    ActualEnd(DateTime<Utc>),
}

impl Artifact {
    /// Column the artifact is written to.
    pub fn column(&self) -> &'static str {
        match self {
            Self::BotSession(_) => "bot_session",
            Self::Media(_) => "media_ref",
            Self::Transcript(_) => "transcript_ref",
            Self::Analytics(_) => "analytics_id",
            Self::Insights(_) => "insights_id",
            Self::Report(_) => "report_ref",
            Self::DeliveryAck(_) => "delivery_ack",
            Self::ActualStart(_) => "actual_start_time",
            Self::ActualEnd(_) => "actual_end_time",
        }
    }

    pub fn value(&self) -> String {
        match self {
            Self::BotSession(v)
            | Self::Media(v)
            | Self::Transcript(v)
            | Self::Analytics(v)
            | Self::Insights(v)
            | Self::Report(v)
            | Self::DeliveryAck(v) => v.clone(),
            Self::ActualStart(t) | Self::ActualEnd(t) => t.to_rfc3339(),
        }
    }
}

/// Input for creating a meeting record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMeeting {
    pub owner_hash_key: String,
    pub url: String,
    pub title: Option<String>,
    pub scheduled_time: DateTime<Utc>,
}

/// Closed set of analysis result kinds stored per meeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisKind {
    Analytics,
    Insights,
}

impl AnalysisKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analytics => "analytics",
            Self::Insights => "insights",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "analytics" => Ok(Self::Analytics),
            "insights" => Ok(Self::Insights),
            _ => bail!("Invalid analysis result kind: {}", s),
        }
    }
}

/// Stored output of the analytics or insights provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub meeting_id: i64,
    pub kind: AnalysisKind,
    pub result_id: String,
    pub payload: serde_json::Value,
}

impl AnalysisResult {
    pub fn new(meeting_id: i64, kind: AnalysisKind, payload: serde_json::Value) -> Self {
        Self {
            meeting_id,
            kind,
            result_id: uuid::Uuid::new_v4().to_string(),
            payload,
        }
    }
}

/// Onboarded interviewer who owns meetings and receives reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub hash_key: String,
    pub name: Option<String>,
    pub company: Option<String>,
    pub role: Option<String>,
    pub onboarded_at: String,
}

/// Onboarding details for a new user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUser {
    pub email: String,
    pub name: Option<String>,
    pub company: Option<String>,
    pub role: Option<String>,
}

/// Stable owner key: the same address always yields the same key.
pub fn user_hash_key(email: &str) -> String {
    let normalized = email.trim().to_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn meeting_code_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/j/(\d+)").ok()).as_ref()
}

/// Extract the numeric meeting code from a join URL such as `https://zoom.us/j/123`.
pub fn meeting_code(url: &str) -> Option<String> {
    meeting_code_regex()?
        .captures(url)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Reject obviously unusable join URLs before a meeting is created.
pub fn validate_meeting_url(url: &str) -> Result<()> {
    let url = url.trim();
    if url.is_empty() {
        bail!("Meeting URL is empty");
    }
    if !(url.starts_with("https://") || url.starts_with("http://")) {
        bail!("Meeting URL must start with http:// or https://: {}", url);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_key_is_stable() {
        let a = user_hash_key("Recruiter@Example.com");
        let b = user_hash_key("  recruiter@example.com ");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, user_hash_key("other@example.com"));
    }

    #[test]
    fn test_meeting_code() {
        assert_eq!(
            meeting_code("https://us02web.zoom.us/j/85412345678?pwd=abc"),
            Some("85412345678".to_string())
        );
        assert_eq!(meeting_code("https://meet.example.com/room"), None);
    }

    #[test]
    fn test_validate_meeting_url() {
        assert!(validate_meeting_url("https://zoom.us/j/123").is_ok());
        assert!(validate_meeting_url("").is_err());
        assert!(validate_meeting_url("zoom.us/j/123").is_err());
    }

    #[test]
    fn test_analysis_kind_parse() {
        assert_eq!(AnalysisKind::parse("analytics").unwrap(), AnalysisKind::Analytics);
        assert_eq!(AnalysisKind::parse("insights").unwrap(), AnalysisKind::Insights);
        assert!(AnalysisKind::parse("Insights").is_err());
    }

    #[test]
    fn test_artifact_columns() {
        assert_eq!(Artifact::Media("m".into()).column(), "media_ref");
        assert_eq!(Artifact::Report("r".into()).value(), "r");
    }
}
