//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.docchat/config.json`) and environment.
//! Every section has defaults, so a missing file or `{}` is a valid config.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::retry::{Backoff, RetryPolicy};

/// Top-level client config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Backend REST and WebSocket endpoints.
    #[serde(default)]
    pub api: ApiConfig,

    /// Realtime channel reconnect settings.
    #[serde(default)]
    pub realtime: RealtimeConfig,

    /// Upload limits.
    #[serde(default)]
    pub uploads: UploadsConfig,

    /// Default retry policy for read-only calls (list, get, query).
    #[serde(default)]
    pub retry: RetryConfig,

    /// Where the access token is persisted between runs.
    #[serde(default)]
    pub session: SessionConfig,
}

/// Which backend route serves one-shot document queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueryRoute {
    /// `POST /api/documents/{id}/query` with `{ query, method }`.
    #[default]
    Documents,
    /// `POST /api/ai/query/{id}` with `{ question, method }`.
    Ai,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    /// REST base URL (default "http://localhost:8000"). Overridden by DOCCHAT_API_URL env.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// WebSocket endpoint. When unset, derived from base_url (`http` -> `ws`, path `/ws`).
    /// Overridden by DOCCHAT_WS_URL env.
    #[serde(default)]
    pub ws_url: Option<String>,

    #[serde(default)]
    pub query_route: QueryRoute,
}

fn default_base_url() -> String {
    "http://localhost:8000".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            ws_url: None,
            query_route: QueryRoute::default(),
        }
    }
}

/// Reconnect backoff for the realtime channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeConfig {
    /// First reconnect delay in ms (default 500).
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,

    /// Upper bound on reconnect delay in ms (default 30000).
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,

    /// Give up after this many consecutive failed reconnects. None = keep trying while authenticated.
    #[serde(default)]
    pub max_reconnect_attempts: Option<u32>,

    /// Capacity of the inbound event broadcast (default 256). Slow subscribers skip ahead.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_reconnect_initial_ms() -> u64 {
    500
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

fn default_event_buffer() -> usize {
    256
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            max_reconnect_attempts: None,
            event_buffer: default_event_buffer(),
        }
    }
}

impl RealtimeConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::exponential(
            Duration::from_millis(self.reconnect_initial_ms),
            Duration::from_millis(self.reconnect_max_ms),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadsConfig {
    /// Largest file accepted for upload, in bytes (default 50 MiB, the backend limit).
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
}

fn default_max_file_size() -> u64 {
    50 * 1024 * 1024
}

impl Default for UploadsConfig {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Total attempts including the first (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_initial_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_retry_max_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_initial_ms() -> u64 {
    1_000
}

fn default_retry_max_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_retry_initial_ms(),
            max_backoff_ms: default_retry_max_ms(),
        }
    }
}

impl RetryConfig {
    /// Read-path retry policy built from this section.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Backoff::exponential(
                Duration::from_millis(self.initial_backoff_ms),
                Duration::from_millis(self.max_backoff_ms),
            ),
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Token file (default ~/.docchat/access_token).
    #[serde(default)]
    pub token_path: Option<PathBuf>,
}

fn env_override(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

/// Resolve the REST base URL: env DOCCHAT_API_URL overrides config. Trailing slashes are dropped.
pub fn resolve_api_url(config: &Config) -> String {
    env_override("DOCCHAT_API_URL")
        .unwrap_or_else(|| config.api.base_url.trim().to_string())
        .trim_end_matches('/')
        .to_string()
}

/// Resolve the WebSocket endpoint: env DOCCHAT_WS_URL, then config, then derived from the REST base.
pub fn resolve_ws_url(config: &Config) -> String {
    if let Some(url) = env_override("DOCCHAT_WS_URL").or_else(|| {
        config
            .api
            .ws_url
            .as_ref()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }) {
        return url;
    }
    ws_url_from_base(&resolve_api_url(config))
}

/// `http://host:8000` -> `ws://host:8000/ws`, `https://..` -> `wss://../ws`.
pub fn ws_url_from_base(base: &str) -> String {
    let base = base.trim_end_matches('/');
    let swapped = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base.to_string()
    };
    format!("{}/ws", swapped)
}

fn docchat_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".docchat"))
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("DOCCHAT_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            docchat_dir()
                .map(|d| d.join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Resolve the token file: config override or ~/.docchat/access_token.
pub fn resolve_token_path(config: &Config) -> PathBuf {
    config.session.token_path.clone().unwrap_or_else(|| {
        docchat_dir()
            .map(|d| d.join("access_token"))
            .unwrap_or_else(|| PathBuf::from("access_token"))
    })
}

/// Load config from the given path, or the default path (DOCCHAT_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
