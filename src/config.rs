//! Configuration management
//!
//! Settings are read once from environment variables at startup and shared
//! read-only across the server; audio and pipeline tuning constants live
//! here as well.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::str::FromStr;

// Audio constants
pub const SAMPLE_RATE_CLIENT: u32 = 16_000;
pub const SAMPLE_RATE_STT: u32 = 24_000;
pub const FRAME_DURATION_MS: u32 = 20;
/// Samples per client frame (320 at 16 kHz / 20 ms).
pub const FRAME_SAMPLES_CLIENT: usize =
    (SAMPLE_RATE_CLIENT as usize * FRAME_DURATION_MS as usize) / 1000;
/// Samples per upstream STT frame (480 at 24 kHz / 20 ms).
pub const FRAME_SAMPLES_STT: usize =
    (SAMPLE_RATE_STT as usize * FRAME_DURATION_MS as usize) / 1000;
pub const BYTES_PER_SAMPLE: usize = 2;

/// Max frames buffered per audio channel (~4 s at 20 ms/frame).
pub const AUDIO_QUEUE_MAX_FRAMES: usize = 200;

// Aggregation tuning
pub const AGGREGATION_TIMEOUT_MS: u64 = 800;
pub const AGGREGATION_WORD_THRESHOLD: usize = 12;
pub const HINT_RATE_LIMIT_MS: u64 = 2000;

// Hint generation tuning
pub const MAX_HINT_POINTS: usize = 3;
pub const MAX_CONTEXT_TOKENS: usize = 2000;

/// Log verbosity, parsed from `LOG_LEVEL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    /// Directive string for `tracing_subscriber::EnvFilter`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARNING" | "WARN" => Ok(LogLevel::Warning),
            "ERROR" => Ok(LogLevel::Error),
            other => Err(ConfigError::InvalidLogLevel(other.to_string())),
        }
    }
}

/// Configuration errors with enough context to fix the environment.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid LOG_LEVEL '{0}', expected DEBUG, INFO, WARNING or ERROR")]
    InvalidLogLevel(String),
    #[error("invalid value for {key}: '{value}'")]
    InvalidValue { key: &'static str, value: String },
}

/// Process-wide settings, loaded from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    /// OpenAI API key for the Realtime STT endpoint.
    pub openai_api_key: String,
    /// Base URL of the OpenAI-compatible completion endpoint.
    pub ollama_base_url: String,
    /// Completion model used for hints.
    pub ollama_model: String,
    /// Base URL of the realtime STT endpoint.
    pub stt_base_url: String,
    pub server_host: String,
    pub server_port: u16,
    pub log_level: LogLevel,
    /// Root directory holding knowledge workspaces.
    pub workspaces_dir: PathBuf,
    /// When set, raw client PCM is appended per channel under
    /// `debug_audio_path` for offline inspection.
    pub debug_save_audio: bool,
    pub debug_audio_path: PathBuf,
}

impl Settings {
    /// Load settings from environment variables, applying defaults for
    /// everything except the API key.
    pub fn from_env() -> Result<Self> {
        let openai_api_key = std::env::var("OPENAI_API_KEY")
            .context("OPENAI_API_KEY is required for the realtime STT endpoint")?;

        let server_port = match std::env::var("SERVER_PORT") {
            Ok(v) => v.parse::<u16>().map_err(|_| ConfigError::InvalidValue {
                key: "SERVER_PORT",
                value: v,
            })?,
            Err(_) => 8010,
        };

        let log_level = match std::env::var("LOG_LEVEL") {
            Ok(v) => v.parse::<LogLevel>()?,
            Err(_) => LogLevel::Info,
        };

        Ok(Self {
            openai_api_key,
            ollama_base_url: env_or("OLLAMA_BASE_URL", "http://localhost:11434"),
            ollama_model: env_or("OLLAMA_MODEL", "llama3.1:8b"),
            stt_base_url: env_or("STT_BASE_URL", "wss://api.openai.com/v1/realtime"),
            server_host: env_or("SERVER_HOST", "0.0.0.0"),
            server_port,
            log_level,
            workspaces_dir: PathBuf::from(env_or("WORKSPACES_DIR", "./workspaces")),
            debug_save_audio: env_flag("DEBUG_SAVE_AUDIO"),
            debug_audio_path: PathBuf::from(env_or("DEBUG_AUDIO_PATH", "./debug_audio")),
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_flag(key: &str) -> bool {
    matches!(
        std::env::var(key).as_deref(),
        Ok("1") | Ok("true") | Ok("TRUE") | Ok("yes")
    )
}
