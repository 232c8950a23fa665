//! Markdown interview report compiler.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::info;

use super::ReportCompiler;
use crate::error::StageError;
use crate::meeting::{meeting_code, AnalysisResult, Meeting};

/// Insight keys rendered first, in this order, with their headings.
const LEAD_SECTIONS: [(&str, &str); 4] = [
    ("recommendation", "Recommendation"),
    ("executive_summary", "Executive Summary"),
    ("strengths", "Key Strengths"),
    ("development_areas", "Areas for Development"),
];

/// Writes `<output_dir>/<owner>/<meeting id>-report.md`. Recompiling a meeting
/// overwrites its report.
pub struct MarkdownReportCompiler {
    output_dir: PathBuf,
}

impl MarkdownReportCompiler {
    pub fn new(output_dir: PathBuf) -> Self {
        Self { output_dir }
    }

    pub fn report_path(&self, meeting: &Meeting) -> PathBuf {
        self.output_dir
            .join(&meeting.owner_hash_key)
            .join(format!("{}-report.md", meeting.id))
    }
}

fn heading_for(key: &str) -> String {
    key.split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn render_value(out: &mut String, value: &Value) {
    match value {
        Value::String(text) => {
            let _ = writeln!(out, "{}\n", text.trim());
        }
        Value::Array(items) => {
            for item in items {
                match item {
                    Value::String(text) => {
                        let _ = writeln!(out, "- {}", text.trim());
                    }
                    other => {
                        let _ = writeln!(out, "- {}", other);
                    }
                }
            }
            out.push('\n');
        }
        Value::Null => out.push_str("_Not available._\n\n"),
        other => {
            let pretty = serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string());
            let _ = writeln!(out, "```json\n{}\n```\n", pretty);
        }
    }
}

fn render_insights(out: &mut String, insights: &Value) {
    let Some(map) = insights.as_object() else {
        out.push_str("## Insights\n\n");
        render_value(out, insights);
        return;
    };

    for (key, heading) in LEAD_SECTIONS {
        let _ = writeln!(out, "## {}\n", heading);
        match map.get(key) {
            Some(value) => render_value(out, value),
            None => {
                let _ = writeln!(out, "_{} not available._\n", heading);
            }
        }
    }

    for (key, value) in map {
        if LEAD_SECTIONS.iter().any(|(lead, _)| lead == key) {
            continue;
        }
        let _ = writeln!(out, "## {}\n", heading_for(key));
        render_value(out, value);
    }
}

async fn read_transcript(transcript_ref: &str) -> Option<String> {
    let path = Path::new(transcript_ref);
    if !path.is_file() {
        return None;
    }
    tokio::fs::read_to_string(path).await.ok()
}

/// Build the full markdown document for a meeting.
pub fn render_report(
    meeting: &Meeting,
    transcript: Option<&str>,
    transcript_ref: &str,
    analytics: &Value,
    insights: &Value,
) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "# Interview Analysis Report: {}\n", meeting.display_title());
    let _ = writeln!(out, "| | |\n|---|---|");
    let _ = writeln!(
        out,
        "| Interview Date | {} |",
        meeting.scheduled_time.format("%B %d, %Y %H:%M UTC")
    );
    if let Some(code) = meeting_code(&meeting.url) {
        let _ = writeln!(out, "| Meeting Code | {} |", code);
    }
    let _ = writeln!(out, "| Meeting URL | {} |", meeting.url);
    let _ = writeln!(
        out,
        "| Report Generated | {} |\n",
        Utc::now().format("%B %d, %Y %H:%M UTC")
    );

    render_insights(&mut out, insights);

    out.push_str("## Conversation Analytics\n\n");
    render_value(&mut out, analytics);

    out.push_str("## Transcript\n\n");
    match transcript {
        Some(text) if !text.trim().is_empty() => {
            let _ = writeln!(out, "```text\n{}\n```", text.trim());
        }
        _ => {
            let _ = writeln!(out, "Transcript available at `{}`.", transcript_ref);
        }
    }

    out
}

#[async_trait]
impl ReportCompiler for MarkdownReportCompiler {
    async fn compile(
        &self,
        meeting: &Meeting,
        transcript_ref: &str,
        analytics: &AnalysisResult,
        insights: &AnalysisResult,
    ) -> Result<String, StageError> {
        let transcript = read_transcript(transcript_ref).await;
        let report = render_report(
            meeting,
            transcript.as_deref(),
            transcript_ref,
            &analytics.payload,
            &insights.payload,
        );

        let path = self.report_path(meeting);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                StageError::transient(format!("Failed to create {:?}: {}", parent, e))
            })?;
        }
        tokio::fs::write(&path, report)
            .await
            .map_err(|e| StageError::transient(format!("Failed to write {:?}: {}", path, e)))?;

        info!("Compiled report for meeting {}: {:?}", meeting.id, path);
        Ok(path.to_string_lossy().to_string())
    }
}
