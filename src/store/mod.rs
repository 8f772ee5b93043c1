// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Server-side storage seams.
//!
//! Two independently-consistent stores back the server: a relational store
//! authoritative for identity (owners, device registry, idempotency records,
//! reference data) and a document store holding dependent records that
//! reference relational keys without an engine-enforced foreign key. The
//! [`crate::guard::ConsistencyGuard`] is the only code allowed to create
//! links between them.

mod memory;
mod sql;

pub use memory::{MemoryDocumentStore, MemoryRelationalStore};
pub use sql::SqlRelationalStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{ProcessedEvent, ReferenceItem};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A record whose two halves live in different storage engines. The owner
/// side is a relational key, the document side a document-store key; the
/// link must never outlive the owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossStoreLink {
    pub owner_id: i64,
    pub document_id: String,
    pub read: bool,
    pub read_at: Option<i64>,
    pub created_at: i64,
}

impl CrossStoreLink {
    #[must_use]
    pub fn new(owner_id: i64, document_id: impl Into<String>) -> Self {
        Self {
            owner_id,
            document_id: document_id.into(),
            read: false,
            read_at: None,
            created_at: crate::event::now_millis(),
        }
    }
}

/// Outcome of the atomic `(device_id, temporary_id)` claim.
///
/// `Fresh` means this call won the insert and must apply the event then
/// [`RelationalStore::complete_event`]. `Replayed` carries the recorded
/// outcome of a previous request. `InFlight` means another request from the
/// same device claimed the pair but has not completed yet.
#[derive(Debug, Clone)]
pub enum EventClaim {
    Fresh,
    Replayed(ProcessedEvent),
    InFlight,
}

/// Authoritative relational store: owners, sync devices, the idempotency
/// registry and reference data.
#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// Existence check for an owner row. The orphan sweep calls this at
    /// sweep time; implementations must not answer from a cache.
    async fn owner_exists(&self, owner_id: i64) -> Result<bool, StoreError>;

    /// Atomic check-and-insert on `(device_id, temporary_id)`. A unique
    /// constraint plus conflict handling, never read-then-write.
    async fn claim_event(
        &self,
        device_id: &str,
        temporary_id: &str,
    ) -> Result<EventClaim, StoreError>;

    /// Record the outcome for a previously claimed pair, making it
    /// available to replays.
    async fn complete_event(
        &self,
        device_id: &str,
        outcome: &ProcessedEvent,
    ) -> Result<(), StoreError>;

    /// Upsert the device registry row and advance its last sync time.
    async fn register_device_sync(
        &self,
        device_id: &str,
        owner_id: i64,
        server_time: i64,
    ) -> Result<(), StoreError>;

    /// Reference data changed since `since` (epoch millis; 0 means since
    /// epoch). Rows scoped to another owner are excluded.
    async fn reference_changed_since(
        &self,
        owner_id: i64,
        since: i64,
    ) -> Result<Vec<ReferenceItem>, StoreError>;
}

/// Document store holding dependent records and the cross-store links that
/// point them at relational owners.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn document_exists(&self, document_id: &str) -> Result<bool, StoreError>;

    /// Upsert a link. Idempotent: re-creating an existing link is the
    /// caller's recovery path after a failed write.
    async fn put_link(&self, link: &CrossStoreLink) -> Result<(), StoreError>;

    /// Returns true when a link was actually removed.
    async fn delete_link(&self, owner_id: i64, document_id: &str) -> Result<bool, StoreError>;

    async fn get_link(
        &self,
        owner_id: i64,
        document_id: &str,
    ) -> Result<Option<CrossStoreLink>, StoreError>;

    async fn links_for_owner(&self, owner_id: i64) -> Result<Vec<CrossStoreLink>, StoreError>;

    /// Set `read` and stamp `read_at`. Returns false if no such link.
    async fn mark_link_read(
        &self,
        owner_id: i64,
        document_id: &str,
        read_at: i64,
    ) -> Result<bool, StoreError>;
}
