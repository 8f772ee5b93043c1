//! Offline event and device record data structures.
//!
//! An [`OfflineEvent`] is one journaled mutation: created whenever the client
//! attempts a write (online or not), held Pending until the server confirms
//! it, then marked Synced (terminal) or Failed (retryable until the attempt
//! cap). The payload is opaque to the sync machinery and immutable once
//! recorded; only `status`, `attempt_count` and `error` ever change.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Journal entry lifecycle.
///
/// `Pending → Synced` is terminal. `Pending → Failed` is retryable until the
/// configured attempt cap, after which the entry is surfaced as dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventStatus {
    /// Recorded locally, not yet confirmed by the server
    Pending,
    /// Confirmed by the server (terminal, eligible for purge)
    Synced,
    /// Last sync attempt rejected this event
    Failed,
}

impl EventStatus {
    /// Terminal entries are never retried or re-marked.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Synced)
    }

    /// Storage representation used by the journal.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Synced => "synced",
            Self::Failed => "failed",
        }
    }

    /// Parse the storage representation. Unknown values are treated as
    /// pending so a journal written by a newer version still drains.
    #[must_use]
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "synced" => Self::Synced,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Synced => write!(f, "Synced"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// A mutation journaled on the client, awaiting transmission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineEvent {
    /// Client-generated id, globally unique per device: `{type}-{millis}-{suffix}`
    pub temporary_id: String,
    /// Caller-defined event kind (e.g., "access", "benefit", "api_request")
    pub event_type: String,
    /// Opaque JSON payload, immutable once recorded
    pub payload: Value,
    /// Client clock, epoch millis
    pub created_at: i64,
    /// Number of failed sync attempts so far
    pub attempt_count: u32,
    pub status: EventStatus,
    /// Last rejection reason, if any
    pub error: Option<String>,
}

impl OfflineEvent {
    /// Create a new Pending entry with a fresh temporary id.
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        let event_type = event_type.into();
        Self {
            temporary_id: new_temporary_id(&event_type),
            event_type,
            payload,
            created_at: now_millis(),
            attempt_count: 0,
            status: EventStatus::Pending,
            error: None,
        }
    }
}

/// Stable per-install identity of a client.
///
/// Created once on first run and persisted alongside the journal;
/// `last_sync_time` advances on every successful sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_id: String,
    /// Server time of the last successful sync, epoch millis
    pub last_sync_time: Option<i64>,
    pub platform: String,
    pub client_version: String,
}

impl DeviceRecord {
    /// Generate a fresh record with a new device id.
    pub fn generate(platform: impl Into<String>, client_version: impl Into<String>) -> Self {
        Self {
            device_id: format!("device-{}-{}", now_millis(), random_suffix()),
            last_sync_time: None,
            platform: platform.into(),
            client_version: client_version.into(),
        }
    }
}

/// Generate a temporary event id: `{type}-{monotonic millis}-{random suffix}`.
///
/// Unique per device as long as the suffix doesn't collide within one
/// millisecond for the same event type.
#[must_use]
pub fn new_temporary_id(event_type: &str) -> String {
    format!("{}-{}-{}", event_type, now_millis(), random_suffix())
}

/// Current wall clock as epoch millis.
#[must_use]
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn random_suffix() -> String {
    use rand::Rng;
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    (0..9)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}
