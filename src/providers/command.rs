//! Shell command collaborators for analytics, insights and delivery.
//!
//! The configured command runs under `sh -c` with:
//! - a JSON request on stdin
//! - meeting metadata in environment variables
//! - a timeout, after which the process is killed
//!
//! Stdout is the response. Exit code 75 (`EX_TEMPFAIL`) and timeouts are
//! transient; any other non-zero exit is permanent.

use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{AnalysisPayload, AnalyticsProvider, DeliveryChannel, InsightProvider};
use crate::error::StageError;
use crate::meeting::{Meeting, User};

/// Environment variable names passed to collaborator commands.
pub mod command_env {
    pub const STAGE: &str = "INTERVIEW_CAPTURE_STAGE";
    pub const MEETING_ID: &str = "INTERVIEW_CAPTURE_MEETING_ID";
    pub const MEETING_TITLE: &str = "INTERVIEW_CAPTURE_MEETING_TITLE";
    pub const MEETING_URL: &str = "INTERVIEW_CAPTURE_MEETING_URL";
    pub const MEDIA_REF: &str = "INTERVIEW_CAPTURE_MEDIA_REF";
    pub const TRANSCRIPT_REF: &str = "INTERVIEW_CAPTURE_TRANSCRIPT_REF";
    pub const REPORT_REF: &str = "INTERVIEW_CAPTURE_REPORT_REF";
    pub const RECIPIENT_EMAIL: &str = "INTERVIEW_CAPTURE_RECIPIENT_EMAIL";
}

/// Exit status a command uses to ask for a retry.
pub const EXIT_TEMPFAIL: i32 = 75;

pub struct CommandRunner {
    stage: &'static str,
    command: String,
    timeout: Duration,
}

impl CommandRunner {
    pub fn new(stage: &'static str, command: String, timeout_seconds: u64) -> Self {
        Self {
            stage,
            command,
            timeout: Duration::from_secs(timeout_seconds),
        }
    }

    /// Run the command and return its trimmed stdout.
    pub async fn run(
        &self,
        meeting: &Meeting,
        input: &serde_json::Value,
        env: &[(&str, &str)],
    ) -> Result<String, StageError> {
        info!(
            "Running {} command for meeting {}: {}",
            self.stage, meeting.id, self.command
        );

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(&self.command)
            .env(command_env::STAGE, self.stage)
            .env(command_env::MEETING_ID, meeting.id.to_string())
            .env(command_env::MEETING_TITLE, meeting.title.as_deref().unwrap_or(""))
            .env(command_env::MEETING_URL, &meeting.url);
        for (key, value) in env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                StageError::permanent(format!("Failed to spawn {} command: {}", self.stage, e))
            })?;

        let stage = self.stage;
        let request = input.to_string();
        let exchange = async move {
            if let Some(mut stdin) = child.stdin.take() {
                use tokio::io::AsyncWriteExt;
                // Commands may exit without reading their input.
                if let Err(e) = stdin.write_all(request.as_bytes()).await {
                    debug!("{} command did not read its input: {}", stage, e);
                }
            }
            child.wait_with_output().await
        };

        let output = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(StageError::transient(format!(
                    "{} command failed to execute: {}",
                    self.stage, e
                )))
            }
            Err(_) => {
                warn!(
                    "{} command timed out after {}s (process will be killed)",
                    self.stage,
                    self.timeout.as_secs()
                );
                return Err(StageError::transient(format!(
                    "{} command timed out after {}s",
                    self.stage,
                    self.timeout.as_secs()
                )));
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            let message = format!(
                "{} command exited with status {}: {}",
                self.stage,
                output.status,
                stderr.trim()
            );
            return Err(if output.status.code() == Some(EXIT_TEMPFAIL) {
                StageError::transient(message)
            } else {
                StageError::permanent(message)
            });
        }

        if !stderr.trim().is_empty() {
            debug!("{} command stderr: {}", self.stage, stderr.trim());
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Run the command and parse its stdout as a JSON payload.
    async fn run_json(
        &self,
        meeting: &Meeting,
        input: &serde_json::Value,
        env: &[(&str, &str)],
    ) -> Result<AnalysisPayload, StageError> {
        let stdout = self.run(meeting, input, env).await?;
        if stdout.is_empty() {
            return Err(StageError::permanent(format!(
                "{} command produced no output",
                self.stage
            )));
        }
        serde_json::from_str(&stdout).map_err(|e| {
            StageError::permanent(format!("{} command output is not JSON: {}", self.stage, e))
        })
    }
}

pub struct CommandAnalytics {
    runner: CommandRunner,
}

impl CommandAnalytics {
    pub fn new(command: String, timeout_seconds: u64) -> Self {
        Self {
            runner: CommandRunner::new("analytics", command, timeout_seconds),
        }
    }
}

#[async_trait]
impl AnalyticsProvider for CommandAnalytics {
    async fn analyze(
        &self,
        meeting: &Meeting,
        media_ref: &str,
        transcript_ref: &str,
    ) -> Result<AnalysisPayload, StageError> {
        let input = json!({
            "meeting_id": meeting.id,
            "title": meeting.title,
            "media_ref": media_ref,
            "transcript_ref": transcript_ref,
        });
        self.runner
            .run_json(
                meeting,
                &input,
                &[
                    (command_env::MEDIA_REF, media_ref),
                    (command_env::TRANSCRIPT_REF, transcript_ref),
                ],
            )
            .await
    }
}

pub struct CommandInsights {
    runner: CommandRunner,
}

impl CommandInsights {
    pub fn new(command: String, timeout_seconds: u64) -> Self {
        Self {
            runner: CommandRunner::new("insights", command, timeout_seconds),
        }
    }
}

#[async_trait]
impl InsightProvider for CommandInsights {
    async fn summarize(
        &self,
        meeting: &Meeting,
        analytics: &AnalysisPayload,
        transcript_ref: &str,
    ) -> Result<AnalysisPayload, StageError> {
        let input = json!({
            "meeting_id": meeting.id,
            "title": meeting.title,
            "transcript_ref": transcript_ref,
            "analytics": analytics,
        });
        self.runner
            .run_json(
                meeting,
                &input,
                &[(command_env::TRANSCRIPT_REF, transcript_ref)],
            )
            .await
    }
}

pub struct CommandDelivery {
    runner: CommandRunner,
}

impl CommandDelivery {
    pub fn new(command: String, timeout_seconds: u64) -> Self {
        Self {
            runner: CommandRunner::new("delivery", command, timeout_seconds),
        }
    }
}

#[async_trait]
impl DeliveryChannel for CommandDelivery {
    async fn send(
        &self,
        meeting: &Meeting,
        report_ref: &str,
        recipient: &User,
    ) -> Result<String, StageError> {
        let input = json!({
            "meeting_id": meeting.id,
            "title": meeting.title,
            "report_ref": report_ref,
            "recipient": {
                "email": recipient.email,
                "name": recipient.name,
            },
        });
        let stdout = self
            .runner
            .run(
                meeting,
                &input,
                &[
                    (command_env::REPORT_REF, report_ref),
                    (command_env::RECIPIENT_EMAIL, recipient.email.as_str()),
                ],
            )
            .await?;

        if stdout.is_empty() {
            Ok(format!("sent to {}", recipient.email))
        } else {
            Ok(stdout)
        }
    }
}
