//! Wire types for the `POST /sync` protocol.
//!
//! The request carries the device identity, the last successful sync time and
//! the batch of journaled events in FIFO order. The response is keyed by
//! `temporaryId` so the client can map its local identities to the
//! server-assigned permanent ids — the same batch may be resubmitted after a
//! dropped response, so this mapping is what makes replay idempotent.
//!
//! Field names serialize camelCase to match the JSON endpoint.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::OfflineEvent;

/// One journaled event as sent over the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingEventDto {
    pub temporary_id: String,
    pub event_type: String,
    pub payload: Value,
    /// Client clock, epoch millis
    pub created_at: i64,
    pub attempt_count: u32,
}

impl From<&OfflineEvent> for PendingEventDto {
    fn from(event: &OfflineEvent) -> Self {
        Self {
            temporary_id: event.temporary_id.clone(),
            event_type: event.event_type.clone(),
            payload: event.payload.clone(),
            created_at: event.created_at,
            attempt_count: event.attempt_count,
        }
    }
}

/// Body of `POST /sync`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub device_id: String,
    /// Server time of the last successful sync; `None` on first sync
    pub last_sync_time: Option<i64>,
    /// FIFO order by `created_at`
    pub pending_events: Vec<PendingEventDto>,
    pub client_version: String,
    /// Request reference data since epoch instead of since `last_sync_time`
    #[serde(default)]
    pub full_resync: bool,
}

/// Per-event outcome, keyed by the client's temporary id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedEvent {
    pub temporary_id: String,
    pub success: bool,
    /// Server-assigned id, present when `success`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permanent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Server clock, epoch millis
    pub processed_at: i64,
}

/// One server-authoritative reference entity, opaque to the sync machinery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceItem {
    pub id: String,
    /// Free-form entity tag ("user", "space", "benefit", ...)
    pub kind: String,
    pub payload: Value,
    /// Server-side last-modified stamp, epoch millis
    pub updated_at: i64,
}

/// Reference data changed since the client's last sync.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferencePayload {
    pub items: Vec<ReferenceItem>,
}

/// Body of the `POST /sync` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    /// Server clock, epoch millis
    pub server_time: i64,
    /// Request-level success; per-event failures do not flip this
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub processed_events: Vec<ProcessedEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_to_sync: Option<ReferencePayload>,
    /// Rotated bearer token, if the server chose to renew it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_auth_token: Option<String>,
    pub last_successful_sync: i64,
}
