// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Referential integrity across the dual-store split.
//!
//! The relational store is authoritative for identity; the document store
//! holds dependent records that reference relational keys with no
//! engine-enforced foreign key between them. Every cross-store link is
//! created through this guard: both endpoints are verified to exist, then
//! the link is written. The two stores cannot share a transaction, so a
//! write that fails after validation is surfaced and logged rather than
//! compensated; link creation is an idempotent upsert and the caller's
//! retry is the recovery mechanism. The orphan sweep reconciles the
//! remaining gap.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::dispatch::{DomainEvent, EventHandler, HandlerError};
use crate::event::now_millis;
use crate::metrics;
use crate::store::{CrossStoreLink, DocumentStore, RelationalStore, StoreError};

/// Event kind that triggers an orphan sweep through the dispatcher.
pub const OWNER_REMOVED_KIND: &str = "owner_removed";

#[derive(Debug, Error)]
pub enum GuardError {
    /// The relational owner does not exist; no link may point at it.
    #[error("referential integrity violation: owner {owner_id} does not exist (document {document_id})")]
    MissingOwner { owner_id: i64, document_id: String },

    /// The document does not exist; nothing to link to.
    #[error("referential integrity violation: document {document_id} does not exist (owner {owner_id})")]
    MissingDocument { owner_id: i64, document_id: String },

    /// Links exist for an owner that is gone; the sweep has not run yet.
    #[error("inconsistent state: {count} links reference missing owner {owner_id}")]
    Inconsistent { owner_id: i64, count: usize },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Validates and writes cross-store links, and sweeps orphans.
pub struct ConsistencyGuard {
    relational: Arc<dyn RelationalStore>,
    documents: Arc<dyn DocumentStore>,
}

impl ConsistencyGuard {
    pub fn new(relational: Arc<dyn RelationalStore>, documents: Arc<dyn DocumentStore>) -> Self {
        Self {
            relational,
            documents,
        }
    }

    /// Create a link after verifying both endpoints exist at validation
    /// time. Upsert semantics: re-creating an existing link succeeds.
    pub async fn create_link(
        &self,
        owner_id: i64,
        document_id: &str,
    ) -> Result<CrossStoreLink, GuardError> {
        if !self.relational.owner_exists(owner_id).await? {
            warn!(owner_id, document_id, "link rejected: owner missing");
            metrics::record_link_operation("create", "missing_owner");
            return Err(GuardError::MissingOwner {
                owner_id,
                document_id: document_id.to_string(),
            });
        }

        if !self.documents.document_exists(document_id).await? {
            warn!(owner_id, document_id, "link rejected: document missing");
            metrics::record_link_operation("create", "missing_document");
            return Err(GuardError::MissingDocument {
                owner_id,
                document_id: document_id.to_string(),
            });
        }

        let link = CrossStoreLink::new(owner_id, document_id);
        if let Err(e) = self.documents.put_link(&link).await {
            // Validation passed but the write failed. No compensating
            // delete exists across engines; surface it and let the caller
            // retry the idempotent upsert.
            error!(owner_id, document_id, error = %e, "link write failed after validation");
            metrics::record_link_operation("create", "write_failed");
            return Err(e.into());
        }

        metrics::record_link_operation("create", "success");
        Ok(link)
    }

    /// Remove a link. Returns false if it did not exist.
    pub async fn delete_link(&self, owner_id: i64, document_id: &str) -> Result<bool, GuardError> {
        let removed = self.documents.delete_link(owner_id, document_id).await?;
        metrics::record_link_operation("delete", if removed { "success" } else { "absent" });
        Ok(removed)
    }

    /// Mark a link read, stamping `read_at` with the server clock.
    pub async fn mark_read(&self, owner_id: i64, document_id: &str) -> Result<bool, GuardError> {
        Ok(self
            .documents
            .mark_link_read(owner_id, document_id, now_millis())
            .await?)
    }

    /// Delete every link whose owner no longer exists in the relational
    /// store. The existence check runs here, at sweep time; a sweep racing
    /// with owner creation must not delete links for the new owner.
    pub async fn clean_orphans(&self, owner_id: i64) -> Result<usize, GuardError> {
        if self.relational.owner_exists(owner_id).await? {
            return Ok(0);
        }

        let links = self.documents.links_for_owner(owner_id).await?;
        let mut removed = 0;
        for link in &links {
            if self.documents.delete_link(owner_id, &link.document_id).await? {
                removed += 1;
            }
        }

        if removed > 0 {
            info!(owner_id, removed, "orphan sweep removed links");
            metrics::record_orphans_removed(removed);
        }
        Ok(removed)
    }

    /// Raise [`GuardError::Inconsistent`] when links reference a missing
    /// owner. The read-only counterpart of [`Self::clean_orphans`].
    pub async fn verify_consistency(&self, owner_id: i64) -> Result<(), GuardError> {
        if self.relational.owner_exists(owner_id).await? {
            return Ok(());
        }

        let count = self.documents.links_for_owner(owner_id).await?.len();
        if count > 0 {
            return Err(GuardError::Inconsistent { owner_id, count });
        }
        Ok(())
    }
}

/// Subscribes the guard's orphan sweep to [`OWNER_REMOVED_KIND`] events,
/// so owner deletion can enqueue cleanup instead of blocking on it.
pub struct OrphanSweepHandler {
    guard: Arc<ConsistencyGuard>,
}

impl OrphanSweepHandler {
    pub fn new(guard: Arc<ConsistencyGuard>) -> Arc<Self> {
        Arc::new(Self { guard })
    }
}

#[async_trait]
impl EventHandler for OrphanSweepHandler {
    fn name(&self) -> &str {
        "orphan_sweep"
    }

    async fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        let owner_id = event.payload["ownerId"]
            .as_i64()
            .ok_or_else(|| HandlerError(format!("missing ownerId in {}", event.kind)))?;

        let removed = self
            .guard
            .clean_orphans(owner_id)
            .await
            .map_err(|e| HandlerError(e.to_string()))?;
        info!(owner_id, removed, "queued orphan sweep completed");
        Ok(())
    }
}
