use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::relay::controller::RelayConfig;
use crate::relay::delivery::DeliveryConfig;

/// Errors that can occur when loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the config file.
    ReadFile { path: PathBuf, source: std::io::Error },
    /// Failed to parse JSON.
    ParseJson { path: PathBuf, source: serde_json::Error },
    /// Validation error.
    Validation(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadFile { path, source } => {
                write!(f, "failed to read config file '{}': {}", path.display(), source)
            }
            Self::ParseJson { path, source } => {
                write!(f, "failed to parse config file '{}': {}", path.display(), source)
            }
            Self::Validation(msg) => write!(f, "config validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ReadFile { source, .. } => Some(source),
            Self::ParseJson { source, .. } => Some(source),
            Self::Validation(_) => None,
        }
    }
}

#[derive(Deserialize)]
struct ConfigFile {
    telegram_bot_token: String,
    /// Base URL of the AI backend, e.g. "https://ai.example.com/v1".
    ai_endpoint: String,
    ai_api_key: String,
    /// Directory for state files (logs). Defaults to current directory.
    data_dir: Option<String>,
    /// Admission ceiling per user within the window.
    #[serde(default = "default_rate_limit_requests")]
    rate_limit_requests: usize,
    #[serde(default = "default_rate_limit_window_secs")]
    rate_limit_window_secs: u64,
    #[serde(default = "default_session_ttl_hours")]
    session_ttl_hours: u64,
    #[serde(default = "default_max_sessions")]
    max_sessions: usize,
    #[serde(default = "default_session_sweep_interval_secs")]
    session_sweep_interval_secs: u64,
    #[serde(default = "default_ai_timeout_secs")]
    ai_timeout_secs: u64,
    #[serde(default = "default_ai_attempts")]
    ai_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    backoff_base_ms: u64,
    #[serde(default = "default_typing_interval_secs")]
    typing_interval_secs: u64,
    #[serde(default = "default_max_query_chars")]
    max_query_chars: usize,
    #[serde(default = "default_caption_limit")]
    caption_limit: usize,
    #[serde(default = "default_media_batch_limit")]
    media_batch_limit: usize,
    #[serde(default = "default_inter_send_delay_ms")]
    inter_send_delay_ms: u64,
    /// Business connections the bot answers on, besides private chats.
    #[serde(default)]
    allowed_business_connections: Vec<String>,
}

fn default_rate_limit_requests() -> usize {
    20
}

fn default_rate_limit_window_secs() -> u64 {
    60
}

fn default_session_ttl_hours() -> u64 {
    24
}

fn default_max_sessions() -> usize {
    1000
}

fn default_session_sweep_interval_secs() -> u64 {
    3600
}

fn default_ai_timeout_secs() -> u64 {
    90
}

fn default_ai_attempts() -> u32 {
    2
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_typing_interval_secs() -> u64 {
    5
}

fn default_max_query_chars() -> usize {
    4000
}

fn default_caption_limit() -> usize {
    1024
}

fn default_media_batch_limit() -> usize {
    10
}

fn default_inter_send_delay_ms() -> u64 {
    300
}

pub struct Config {
    pub telegram_bot_token: String,
    pub ai_endpoint: String,
    pub ai_api_key: String,
    /// Directory for state files (logs).
    pub data_dir: PathBuf,
    pub rate_limit_requests: usize,
    pub rate_limit_window: Duration,
    pub session_ttl: Duration,
    pub max_sessions: usize,
    pub session_sweep_interval: Duration,
    pub ai_timeout: Duration,
    pub ai_attempts: u32,
    pub backoff_base: Duration,
    pub typing_interval: Duration,
    pub max_query_chars: usize,
    pub caption_limit: usize,
    pub media_batch_limit: usize,
    pub inter_send_delay: Duration,
    pub allowed_business_connections: Vec<String>,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config_path = path.as_ref().to_path_buf();
        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| ConfigError::ReadFile { path: config_path.clone(), source: e })?;
        let file: ConfigFile = serde_json::from_str(&content)
            .map_err(|e| ConfigError::ParseJson { path: config_path.clone(), source: e })?;

        if file.telegram_bot_token.is_empty() {
            return Err(ConfigError::Validation("telegram_bot_token is required".into()));
        }
        // Telegram tokens are formatted as {bot_id}:{secret} where bot_id is numeric
        let token_parts: Vec<&str> = file.telegram_bot_token.split(':').collect();
        if token_parts.len() != 2 || token_parts[0].parse::<u64>().is_err() || token_parts[1].is_empty() {
            return Err(ConfigError::Validation(
                "telegram_bot_token appears invalid (expected format: 123456789:ABCdefGHI...)".into()
            ));
        }
        if !file.ai_endpoint.starts_with("http://") && !file.ai_endpoint.starts_with("https://") {
            return Err(ConfigError::Validation(
                "ai_endpoint must be an http(s) URL".into(),
            ));
        }
        if file.ai_api_key.is_empty() {
            return Err(ConfigError::Validation("ai_api_key is required".into()));
        }
        if file.rate_limit_requests == 0 {
            return Err(ConfigError::Validation("rate_limit_requests must be at least 1".into()));
        }
        if file.ai_attempts == 0 {
            return Err(ConfigError::Validation("ai_attempts must be at least 1".into()));
        }
        // Telegram caps media groups at 10 items per call.
        if file.media_batch_limit == 0 || file.media_batch_limit > 10 {
            return Err(ConfigError::Validation(
                "media_batch_limit must be between 1 and 10".into(),
            ));
        }

        let data_dir = file
            .data_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            telegram_bot_token: file.telegram_bot_token,
            ai_endpoint: file.ai_endpoint,
            ai_api_key: file.ai_api_key,
            data_dir,
            rate_limit_requests: file.rate_limit_requests,
            rate_limit_window: Duration::from_secs(file.rate_limit_window_secs),
            session_ttl: Duration::from_secs(file.session_ttl_hours * 3600),
            max_sessions: file.max_sessions,
            session_sweep_interval: Duration::from_secs(file.session_sweep_interval_secs),
            ai_timeout: Duration::from_secs(file.ai_timeout_secs),
            ai_attempts: file.ai_attempts,
            backoff_base: Duration::from_millis(file.backoff_base_ms),
            typing_interval: Duration::from_secs(file.typing_interval_secs),
            max_query_chars: file.max_query_chars,
            caption_limit: file.caption_limit,
            media_batch_limit: file.media_batch_limit,
            inter_send_delay: Duration::from_millis(file.inter_send_delay_ms),
            allowed_business_connections: file.allowed_business_connections,
        })
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            max_query_chars: self.max_query_chars,
            ai_timeout: self.ai_timeout,
            ai_attempts: self.ai_attempts,
            backoff_base: self.backoff_base,
            typing_interval: self.typing_interval,
            allowed_business_connections: self.allowed_business_connections.clone(),
        }
    }

    pub fn delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            caption_limit: self.caption_limit,
            batch_limit: self.media_batch_limit,
            inter_send_delay: self.inter_send_delay,
        }
    }
}
