// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable client-side event journal.
//!
//! Every mutation attempted by the client is recorded here before any
//! network send, so a crash or connectivity loss never drops a write.
//! The coordinator drains entries oldest-first; the journal only ever
//! updates `status`, `attempt_count` and `error` on an entry, never the
//! payload.
//!
//! Two backends:
//! - [`SqliteJournal`] - persistent, survives process restart
//! - [`MemoryJournal`] - for tests and ephemeral clients

mod memory;
mod sqlite;

pub use memory::MemoryJournal;
pub use sqlite::SqliteJournal;

use async_trait::async_trait;
use thiserror::Error;

use crate::event::{DeviceRecord, OfflineEvent};
use crate::protocol::ReferenceItem;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal backend error: {0}")]
    Backend(String),

    #[error("journal serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("journal entry not found: {0}")]
    NotFound(String),
}

/// Durable journal of offline events plus device identity and the local
/// read cache of server reference data.
#[async_trait]
pub trait Journal: Send + Sync {
    /// Append a new entry. Returns only after the write is durable;
    /// callers use this as their happened-before point for the mutation.
    async fn record(&self, event: &OfflineEvent) -> Result<(), JournalError>;

    /// Entries eligible for the next sync: Pending plus Failed entries
    /// under the attempt cap, ordered by `created_at` ascending.
    async fn list_pending(&self, max_attempts: u32) -> Result<Vec<OfflineEvent>, JournalError>;

    /// Failed entries at or past the attempt cap. These are never sent
    /// again automatically; callers surface them for manual handling.
    async fn list_dead(&self, max_attempts: u32) -> Result<Vec<OfflineEvent>, JournalError>;

    /// Count of entries still awaiting confirmation.
    async fn count_pending(&self) -> Result<u64, JournalError>;

    /// Mark an entry confirmed by the server. Idempotent: re-marking a
    /// synced entry is a no-op, and a missing entry is not an error
    /// (the server may confirm a replay of an already-purged entry).
    async fn mark_synced(
        &self,
        temporary_id: &str,
        permanent_id: Option<&str>,
    ) -> Result<(), JournalError>;

    /// Mark an entry rejected and bump its attempt count. No-op for
    /// entries already terminal.
    async fn mark_failed(&self, temporary_id: &str, error: &str) -> Result<(), JournalError>;

    /// Remove synced entries. Returns the number purged.
    async fn purge_synced(&self) -> Result<u64, JournalError>;

    /// Load the device record, generating and persisting one on first call.
    async fn device(&self, platform: &str, client_version: &str)
        -> Result<DeviceRecord, JournalError>;

    /// Advance the device's last successful sync watermark (server clock).
    async fn set_last_sync_time(&self, server_time: i64) -> Result<(), JournalError>;

    /// Merge reference items pushed down by the server into the local
    /// read cache, last-write-wins by id.
    async fn merge_reference(&self, items: &[ReferenceItem]) -> Result<(), JournalError>;

    /// Read cached reference items, optionally filtered by kind.
    async fn cached_reference(&self, kind: Option<&str>)
        -> Result<Vec<ReferenceItem>, JournalError>;
}
