//! Application seam for journaled events.
//!
//! The sync machinery moves opaque payloads; what an "access" or
//! "benefit" event actually does to the relational store is the
//! embedding server's business. It plugs in here.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::protocol::PendingEventDto;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ApplyError {
    /// Business validation rejected the event. Reported per event; never
    /// aborts the batch.
    #[error("event rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Applies one journaled event and returns the server-assigned permanent
/// id. Implementations must tolerate being skipped for replayed events:
/// the processor only calls `apply` for a fresh `(deviceId, temporaryId)`
/// claim.
#[async_trait]
pub trait EventApplier: Send + Sync {
    async fn apply(&self, owner_id: i64, event: &PendingEventDto) -> Result<String, ApplyError>;
}

/// Accepts every event and assigns a fresh UUID as its permanent id.
///
/// Useful as a starting point when all side effects hang off the
/// dispatcher, and in tests.
pub struct UuidApplier;

#[async_trait]
impl EventApplier for UuidApplier {
    async fn apply(&self, _owner_id: i64, _event: &PendingEventDto) -> Result<String, ApplyError> {
        Ok(Uuid::new_v4().to_string())
    }
}
