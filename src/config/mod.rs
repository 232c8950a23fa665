use crate::global;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Overrides `bot.api_key` when set.
pub const BOT_API_KEY_ENV: &str = "INTERVIEW_CAPTURE_BOT_API_KEY";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bot: BotConfig,
    pub poller: PollerConfig,
    pub retry: RetryConfig,
    pub scheduler: SchedulerConfig,
    pub analytics: CommandConfig,
    pub insights: CommandConfig,
    pub report: ReportConfig,
    pub delivery: CommandConfig,
    pub monitor: MonitorConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    /// Base URL of the meeting-bot API.
    pub endpoint: String,
    pub api_key: Option<String>,
    /// Display name the bot joins with.
    pub bot_name: String,
    /// Timeout applied to every remote call, in seconds.
    pub request_timeout_seconds: u64,
    /// Timeout for downloading a finished recording, in seconds.
    pub download_timeout_seconds: u64,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://app.attendee.dev/api/v1".to_string(),
            api_key: None,
            bot_name: "Interview Bot".to_string(),
            request_timeout_seconds: 30,
            download_timeout_seconds: 15 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub initial_interval_seconds: u64,
    pub max_interval_seconds: u64,
    /// How long to wait for the bot to be admitted and start recording.
    pub join_timeout_seconds: u64,
    /// How long to wait for a recording session to end.
    pub recording_timeout_seconds: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            initial_interval_seconds: 2,
            max_interval_seconds: 30,
            join_timeout_seconds: 15 * 60,
            recording_timeout_seconds: 4 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_seconds: u64,
    pub max_delay_seconds: u64,
    /// Upper bound on a single stage attempt, in seconds.
    pub attempt_timeout_seconds: u64,
    /// Per-stage attempt limits keyed by stage name (e.g. `analyzing = 5`).
    pub stage_max_attempts: BTreeMap<String, u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_seconds: 2,
            max_delay_seconds: 60,
            attempt_timeout_seconds: 15 * 60,
            stage_max_attempts: BTreeMap::new(),
        }
    }
}

impl RetryConfig {
    pub fn max_attempts_for(&self, stage: &str) -> u32 {
        self.stage_max_attempts
            .get(stage)
            .copied()
            .unwrap_or(self.max_attempts)
            .max(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Meetings whose scheduled time passed longer ago than this are marked missed.
    pub grace_window_minutes: i64,
    /// Delay after the scheduled start before the bot is dispatched.
    pub join_offset_seconds: i64,
    /// A run's claim on a meeting expires this long after its last renewal,
    /// letting another process take over from a crashed one.
    pub run_lease_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            grace_window_minutes: 15,
            join_offset_seconds: 0,
            run_lease_seconds: 120,
        }
    }
}

/// External command used as a collaborator (analytics, insights, delivery).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    pub command: String,
    pub timeout_seconds: u64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            timeout_seconds: 600,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Defaults to `<data_dir>/reports`.
    pub output_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Directory scanned for invitation JSON files. Defaults to `<data_dir>/inbox`.
    pub inbox_dir: Option<PathBuf>,
    pub poll_interval_seconds: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            inbox_dir: None,
            poll_interval_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 3838,
        }
    }
}

impl PollerConfig {
    pub fn initial_interval(&self) -> Duration {
        Duration::from_secs(self.initial_interval_seconds.max(1))
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_secs(self.max_interval_seconds.max(self.initial_interval_seconds).max(1))
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        if !config_path.exists() {
            info!(
                "Config file not found, creating default at {:?}",
                config_path
            );
            let config = Self::default();
            config.save()?;
            return Ok(config.with_env_overrides());
        }

        let content =
            std::fs::read_to_string(&config_path).context("Failed to read config file")?;

        let config = Self::parse(&content)?;

        info!("Loaded config from {:?}", config_path);
        Ok(config.with_env_overrides())
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, content).context("Failed to write config file")?;

        Ok(())
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(key) = std::env::var(BOT_API_KEY_ENV) {
            if !key.trim().is_empty() {
                self.bot.api_key = Some(key);
            }
        }
        self
    }

    fn config_path() -> Result<PathBuf> {
        global::config_file()
    }
}
