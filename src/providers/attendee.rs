//! Meeting bot provider backed by the Attendee REST API.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::{BotSessionProvider, BotState, SessionHandle};
use crate::config::BotConfig;
use crate::error::StageError;

#[derive(Debug, Serialize)]
struct CreateBotRequest<'a> {
    meeting_url: &'a str,
    bot_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    join_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BotResponse {
    id: String,
    state: String,
    #[serde(default)]
    transcription_state: Option<String>,
    #[serde(default)]
    recording_state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RecordingResponse {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Utterance {
    #[serde(default)]
    speaker_name: Option<String>,
    #[serde(default)]
    timestamp_ms: Option<u64>,
    #[serde(default)]
    transcription: Option<UtteranceText>,
}

#[derive(Debug, Deserialize)]
struct UtteranceText {
    #[serde(default)]
    transcript: String,
}

pub struct AttendeeBotProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    bot_name: String,
    download_timeout: Duration,
    /// Recordings and transcripts land in `<session_dir>/<bot id>/`.
    session_dir: PathBuf,
}

impl AttendeeBotProvider {
    pub fn new(config: &BotConfig, session_dir: PathBuf) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .context("bot.api_key is required for the Attendee bot provider")?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .context("Failed to build HTTP client")?;

        let endpoint = config.endpoint.trim_end_matches('/').to_string();
        info!("Initialized Attendee bot provider with endpoint: {}", endpoint);

        Ok(Self {
            client,
            endpoint,
            api_key,
            bot_name: config.bot_name.clone(),
            download_timeout: Duration::from_secs(config.download_timeout_seconds.max(1)),
            session_dir,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    fn auth_header(&self) -> String {
        format!("Token {}", self.api_key)
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, StageError> {
        let response = self
            .client
            .get(self.url(path))
            .header("Authorization", self.auth_header())
            .send()
            .await?;
        read_json(response).await
    }

    /// Stream `url` into `path`. The body goes to a `.part` file first so an
    /// interrupted download is never mistaken for a complete one.
    async fn download(&self, url: &str, path: &Path) -> Result<(), StageError> {
        // Pre-signed storage links reject the API token, so none is sent.
        let mut response = self
            .client
            .get(url)
            .timeout(self.download_timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StageError::from_http_status(status.as_u16(), &body));
        }

        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| io_error("create", dir, e))?;
        }

        let partial = path.with_extension("part");
        let mut file = tokio::fs::File::create(&partial)
            .await
            .map_err(|e| io_error("create", &partial, e))?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk)
                .await
                .map_err(|e| io_error("write", &partial, e))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| io_error("write", &partial, e))?;
        drop(file);

        if written == 0 {
            if let Err(e) = tokio::fs::remove_file(&partial).await {
                debug!("Could not remove {:?}: {}", partial, e);
            }
            return Err(StageError::permanent(format!(
                "Recording download from {} was empty",
                url
            )));
        }

        tokio::fs::rename(&partial, path)
            .await
            .map_err(|e| io_error("rename", &partial, e))?;
        debug!("Downloaded {} bytes to {:?}", written, path);
        Ok(())
    }
}

fn io_error(action: &str, path: &Path, err: std::io::Error) -> StageError {
    StageError::transient(format!("Failed to {} {:?}: {}", action, path, err))
}

async fn read_json<T: for<'de> Deserialize<'de>>(
    response: reqwest::Response,
) -> Result<T, StageError> {
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        return Err(StageError::from_http_status(status.as_u16(), &body));
    }

    serde_json::from_str(&body)
        .map_err(|e| StageError::permanent(format!("Malformed bot API response: {}", e)))
}

/// Collapse the provider's bot lifecycle into the states the poller cares
/// about. An ended bot still post-processing its transcript reads as
/// recording so the poller keeps waiting.
fn map_bot_state(state: &str, transcription_state: Option<&str>) -> BotState {
    match state {
        "ready" | "scheduled" | "staged" => BotState::Pending,
        "joining" | "waiting_room" | "joined_not_recording" => BotState::Joining,
        "joined_recording" | "joined_recording_paused" | "leaving" | "post_processing" => {
            BotState::Recording
        }
        "ended" => match transcription_state {
            Some("not_started") | Some("in_progress") => BotState::Recording,
            _ => BotState::Ended,
        },
        "fatal_error" | "data_deleted" => BotState::Failed,
        other => {
            debug!("Unrecognized bot state '{}', treating as pending", other);
            BotState::Pending
        }
    }
}

fn format_timestamp(ms: u64) -> String {
    let seconds = ms / 1000;
    format!("{:02}:{:02}:{:02}", seconds / 3600, (seconds % 3600) / 60, seconds % 60)
}

/// Render utterances as a readable conversation, one line per utterance.
fn format_transcript(utterances: &[Utterance]) -> String {
    let mut lines = Vec::new();
    for utterance in utterances {
        let text = utterance
            .transcription
            .as_ref()
            .map(|t| t.transcript.trim())
            .unwrap_or("");
        if text.is_empty() {
            continue;
        }
        let speaker = utterance.speaker_name.as_deref().unwrap_or("Unknown");
        match utterance.timestamp_ms {
            Some(ms) => lines.push(format!("[{}] {}: {}", format_timestamp(ms), speaker, text)),
            None => lines.push(format!("{}: {}", speaker, text)),
        }
    }
    lines.join("\n")
}

#[async_trait]
impl BotSessionProvider for AttendeeBotProvider {
    async fn start(
        &self,
        meeting_url: &str,
        start_time: DateTime<Utc>,
    ) -> Result<SessionHandle, StageError> {
        let join_at = (start_time > Utc::now()).then(|| start_time.to_rfc3339());
        let body = CreateBotRequest {
            meeting_url,
            bot_name: &self.bot_name,
            join_at,
        };

        info!("Creating bot for meeting URL: {}", meeting_url);

        let response = self
            .client
            .post(self.url("/bots"))
            .header("Authorization", self.auth_header())
            .json(&body)
            .send()
            .await?;
        let bot: BotResponse = read_json(response).await?;

        info!("Created bot {} (state: {})", bot.id, bot.state);
        Ok(SessionHandle::new(bot.id))
    }

    async fn status(&self, handle: &SessionHandle) -> Result<BotState, StageError> {
        let bot: BotResponse = self.get_json(&format!("/bots/{}", handle)).await?;
        debug!(
            "Bot {} state: {}, recording: {:?}, transcription: {:?}",
            bot.id, bot.state, bot.recording_state, bot.transcription_state
        );
        Ok(map_bot_state(&bot.state, bot.transcription_state.as_deref()))
    }

    /// Download the recording into local storage. The provider only hands out
    /// short-lived links, so the local path is what gets persisted.
    async fn recording(&self, handle: &SessionHandle) -> Result<String, StageError> {
        let path = self.session_dir.join(handle.as_str()).join("recording.mp4");
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!("Recording for bot {} already at {:?}", handle, path);
            return Ok(path.to_string_lossy().to_string());
        }

        let recording: RecordingResponse =
            self.get_json(&format!("/bots/{}/recording", handle)).await?;
        let url = recording
            .url
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| {
                StageError::permanent(format!("Bot {} has no recording URL", handle))
            })?;

        self.download(&url, &path).await?;
        info!("Saved recording for bot {} to {:?}", handle, path);

        Ok(path.to_string_lossy().to_string())
    }

    async fn transcript(&self, handle: &SessionHandle) -> Result<String, StageError> {
        let utterances: Vec<Utterance> =
            self.get_json(&format!("/bots/{}/transcript", handle)).await?;

        let text = format_transcript(&utterances);
        if text.is_empty() {
            return Err(StageError::permanent(format!(
                "Bot {} produced an empty transcript",
                handle
            )));
        }

        let dir = self.session_dir.join(handle.as_str());
        let path = dir.join("transcript.txt");
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StageError::transient(format!("Failed to create {:?}: {}", dir, e)))?;
        tokio::fs::write(&path, text)
            .await
            .map_err(|e| StageError::transient(format!("Failed to write {:?}: {}", path, e)))?;

        info!("Saved transcript for bot {} to {:?}", handle, path);

        Ok(path.to_string_lossy().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::get, Json};

    async fn serve(router: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    /// Bot API whose recording endpoint points at `link_path` on the same server.
    async fn recording_api(link_path: &'static str, file: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let link = format!("{}{}", base, link_path);
        let router = axum::Router::new()
            .route(
                "/bots/bot_1/recording",
                get(move || {
                    let link = link.clone();
                    async move { Json(serde_json::json!({ "url": link })) }
                }),
            )
            .merge(file);
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        base
    }

    fn provider_for(endpoint: String, dir: &Path) -> AttendeeBotProvider {
        let config = BotConfig {
            endpoint,
            api_key: Some("secret".to_string()),
            ..BotConfig::default()
        };
        AttendeeBotProvider::new(&config, dir.to_path_buf()).unwrap()
    }

    #[tokio::test]
    async fn test_recording_is_downloaded_to_local_storage() {
        let file = axum::Router::new().route("/signed/rec.mp4", get(|| async { "mp4 bytes" }));
        let base = recording_api("/signed/rec.mp4", file).await;
        let dir = tempfile::tempdir().unwrap();
        let provider = provider_for(base, dir.path());

        let media = provider
            .recording(&SessionHandle::new("bot_1"))
            .await
            .unwrap();

        let expected = dir.path().join("bot_1").join("recording.mp4");
        assert_eq!(PathBuf::from(&media), expected);
        assert_eq!(std::fs::read_to_string(&expected).unwrap(), "mp4 bytes");
        assert!(!expected.with_extension("part").exists());
    }

    #[tokio::test]
    async fn test_expired_recording_link_leaves_no_file() {
        let file = axum::Router::new().route(
            "/signed/rec.mp4",
            get(|| async { (StatusCode::FORBIDDEN, "Request has expired") }),
        );
        let base = recording_api("/signed/rec.mp4", file).await;
        let dir = tempfile::tempdir().unwrap();
        let provider = provider_for(base, dir.path());

        let err = provider
            .recording(&SessionHandle::new("bot_1"))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert!(err.message().contains("403"));
        assert!(!dir.path().join("bot_1").join("recording.mp4").exists());
    }

    #[tokio::test]
    async fn test_downloaded_recording_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let saved = dir.path().join("bot_1").join("recording.mp4");
        std::fs::create_dir_all(saved.parent().unwrap()).unwrap();
        std::fs::write(&saved, "already here").unwrap();

        // The API has no routes, so any request would fail.
        let base = serve(axum::Router::new()).await;
        let provider = provider_for(base, dir.path());

        let media = provider
            .recording(&SessionHandle::new("bot_1"))
            .await
            .unwrap();
        assert_eq!(PathBuf::from(media), saved);
    }

    #[test]
    fn test_map_bot_state() {
        assert_eq!(map_bot_state("ready", None), BotState::Pending);
        assert_eq!(map_bot_state("waiting_room", None), BotState::Joining);
        assert_eq!(map_bot_state("joined_recording", None), BotState::Recording);
        assert_eq!(map_bot_state("ended", Some("complete")), BotState::Ended);
        assert_eq!(map_bot_state("ended", Some("failed")), BotState::Ended);
        assert_eq!(map_bot_state("ended", Some("in_progress")), BotState::Recording);
        assert_eq!(map_bot_state("fatal_error", None), BotState::Failed);
        assert_eq!(map_bot_state("something_new", None), BotState::Pending);
    }

    #[test]
    fn test_format_transcript() {
        let utterances: Vec<Utterance> = serde_json::from_str(
            r#"[
                {"speaker_name": "Alice", "timestamp_ms": 65000, "transcription": {"transcript": "Tell me about yourself."}},
                {"speaker_name": "Bob", "transcription": {"transcript": "  Sure.  "}},
                {"speaker_name": "Bob", "transcription": null}
            ]"#,
        )
        .unwrap();

        assert_eq!(
            format_transcript(&utterances),
            "[00:01:05] Alice: Tell me about yourself.\nBob: Sure."
        );
    }

    #[test]
    fn test_requires_api_key() {
        let config = BotConfig::default();
        assert!(AttendeeBotProvider::new(&config, PathBuf::from("/tmp")).is_err());

        let config = BotConfig {
            api_key: Some("secret".to_string()),
            ..BotConfig::default()
        };
        let provider = AttendeeBotProvider::new(&config, PathBuf::from("/tmp")).unwrap();
        assert_eq!(provider.auth_header(), "Token secret");
        assert_eq!(provider.url("/bots"), "https://app.attendee.dev/api/v1/bots");
    }
}
