//! Configuration for the sync client and server components.
//!
//! All knobs are externally injected: deserialize from a config file, build
//! in code, or read from `OFFLINE_SYNC_*` environment variables via
//! [`SyncConfig::from_env`]. Nothing here is hardcoded at call sites.
//!
//! # Example
//!
//! ```
//! use offline_sync::SyncConfig;
//!
//! let config = SyncConfig {
//!     api_base: "https://api.example.com".into(),
//!     sync_interval_secs: 30,
//!     ..Default::default()
//! };
//! assert_eq!(config.max_retries, 3);
//! ```

use serde::Deserialize;
use std::time::Duration;

/// Configuration for sync behavior on both ends.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Base API origin (e.g., "https://api.example.com")
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Periodic sync trigger interval while online, seconds
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,

    /// Bounded timeout per network call, seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Retries after the initial attempt for transient failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Backoff base delay, milliseconds
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Backoff delay cap, milliseconds
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Failed-event retry cap before an entry is surfaced as dead
    #[serde(default = "default_max_event_attempts")]
    pub max_event_attempts: u32,

    /// SQLite journal path; `None` means callers supply their own store
    #[serde(default)]
    pub journal_path: Option<String>,

    #[serde(default = "default_client_version")]
    pub client_version: String,

    #[serde(default = "default_platform")]
    pub platform: String,

    /// Dispatch queue capacity before publishers see backpressure
    #[serde(default = "default_dispatch_queue_capacity")]
    pub dispatch_queue_capacity: usize,
}

fn default_api_base() -> String {
    "http://localhost:5011".to_string()
}
fn default_sync_interval_secs() -> u64 {
    30
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_max_event_attempts() -> u32 {
    3
}
fn default_client_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
fn default_platform() -> String {
    "rust".to_string()
}
fn default_dispatch_queue_capacity() -> usize {
    1024
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            sync_interval_secs: default_sync_interval_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            max_event_attempts: default_max_event_attempts(),
            journal_path: None,
            client_version: default_client_version(),
            platform: default_platform(),
            dispatch_queue_capacity: default_dispatch_queue_capacity(),
        }
    }
}

impl SyncConfig {
    /// Build a config from `OFFLINE_SYNC_*` environment variables,
    /// falling back to defaults for anything unset or unparsable.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("OFFLINE_SYNC_API_BASE") {
            config.api_base = v;
        }
        if let Some(v) = env_parse("OFFLINE_SYNC_INTERVAL_SECS") {
            config.sync_interval_secs = v;
        }
        if let Some(v) = env_parse("OFFLINE_SYNC_REQUEST_TIMEOUT_SECS") {
            config.request_timeout_secs = v;
        }
        if let Some(v) = env_parse("OFFLINE_SYNC_MAX_RETRIES") {
            config.max_retries = v;
        }
        if let Some(v) = env_parse("OFFLINE_SYNC_BACKOFF_BASE_MS") {
            config.backoff_base_ms = v;
        }
        if let Some(v) = env_parse("OFFLINE_SYNC_BACKOFF_MAX_MS") {
            config.backoff_max_ms = v;
        }
        if let Ok(v) = std::env::var("OFFLINE_SYNC_JOURNAL_PATH") {
            config.journal_path = Some(v);
        }

        config
    }

    /// Backoff base as a `Duration`.
    #[must_use]
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    /// Backoff cap as a `Duration`.
    #[must_use]
    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    /// Per-request network timeout as a `Duration`.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Periodic trigger interval as a `Duration`.
    #[must_use]
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
