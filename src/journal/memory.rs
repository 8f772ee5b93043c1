//! In-memory journal backend for tests and ephemeral clients.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

use super::{Journal, JournalError};
use crate::event::{DeviceRecord, EventStatus, OfflineEvent};
use crate::protocol::ReferenceItem;

#[derive(Default)]
struct JournalState {
    events: Vec<OfflineEvent>,
    device: Option<DeviceRecord>,
    reference: HashMap<String, ReferenceItem>,
}

/// Volatile [`Journal`] backed by a mutex-guarded map.
///
/// Same observable semantics as [`super::SqliteJournal`] minus durability;
/// the integration tests run both backends against the same assertions.
pub struct MemoryJournal {
    state: Mutex<JournalState>,
}

impl MemoryJournal {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(JournalState::default()),
        }
    }

    /// Total entries, any status.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().events.is_empty()
    }
}

impl Default for MemoryJournal {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Journal for MemoryJournal {
    async fn record(&self, event: &OfflineEvent) -> Result<(), JournalError> {
        let mut state = self.state.lock();
        // temporary_id is the primary key in the durable backend
        if state
            .events
            .iter()
            .any(|e| e.temporary_id == event.temporary_id)
        {
            return Err(JournalError::Backend(format!(
                "duplicate temporary id: {}",
                event.temporary_id
            )));
        }
        state.events.push(event.clone());
        Ok(())
    }

    async fn list_pending(&self, max_attempts: u32) -> Result<Vec<OfflineEvent>, JournalError> {
        let state = self.state.lock();
        let mut pending: Vec<OfflineEvent> = state
            .events
            .iter()
            .filter(|e| match e.status {
                EventStatus::Pending => true,
                EventStatus::Failed => e.attempt_count < max_attempts,
                EventStatus::Synced => false,
            })
            .cloned()
            .collect();
        pending.sort_by_key(|e| e.created_at);
        Ok(pending)
    }

    async fn list_dead(&self, max_attempts: u32) -> Result<Vec<OfflineEvent>, JournalError> {
        let state = self.state.lock();
        let mut dead: Vec<OfflineEvent> = state
            .events
            .iter()
            .filter(|e| e.status == EventStatus::Failed && e.attempt_count >= max_attempts)
            .cloned()
            .collect();
        dead.sort_by_key(|e| e.created_at);
        Ok(dead)
    }

    async fn count_pending(&self) -> Result<u64, JournalError> {
        let state = self.state.lock();
        Ok(state
            .events
            .iter()
            .filter(|e| e.status != EventStatus::Synced)
            .count() as u64)
    }

    async fn mark_synced(
        &self,
        temporary_id: &str,
        permanent_id: Option<&str>,
    ) -> Result<(), JournalError> {
        let mut state = self.state.lock();
        if let Some(event) = state
            .events
            .iter_mut()
            .find(|e| e.temporary_id == temporary_id)
        {
            if event.status.is_terminal() {
                return Ok(());
            }
            event.status = EventStatus::Synced;
            event.error = None;
            debug!(
                temporary_id,
                permanent_id = permanent_id.unwrap_or("-"),
                "journal entry synced"
            );
        }
        Ok(())
    }

    async fn mark_failed(&self, temporary_id: &str, error: &str) -> Result<(), JournalError> {
        let mut state = self.state.lock();
        if let Some(event) = state
            .events
            .iter_mut()
            .find(|e| e.temporary_id == temporary_id)
        {
            if event.status.is_terminal() {
                return Ok(());
            }
            event.status = EventStatus::Failed;
            event.attempt_count += 1;
            event.error = Some(error.to_string());
        }
        Ok(())
    }

    async fn purge_synced(&self) -> Result<u64, JournalError> {
        let mut state = self.state.lock();
        let before = state.events.len();
        state.events.retain(|e| e.status != EventStatus::Synced);
        Ok((before - state.events.len()) as u64)
    }

    async fn device(
        &self,
        platform: &str,
        client_version: &str,
    ) -> Result<DeviceRecord, JournalError> {
        let mut state = self.state.lock();
        if state.device.is_none() {
            state.device = Some(DeviceRecord::generate(platform, client_version));
        }
        Ok(state.device.clone().unwrap())
    }

    async fn set_last_sync_time(&self, server_time: i64) -> Result<(), JournalError> {
        let mut state = self.state.lock();
        if let Some(device) = state.device.as_mut() {
            device.last_sync_time = Some(server_time);
        }
        Ok(())
    }

    async fn merge_reference(&self, items: &[ReferenceItem]) -> Result<(), JournalError> {
        let mut state = self.state.lock();
        for item in items {
            state.reference.insert(item.id.clone(), item.clone());
        }
        Ok(())
    }

    async fn cached_reference(
        &self,
        kind: Option<&str>,
    ) -> Result<Vec<ReferenceItem>, JournalError> {
        let state = self.state.lock();
        let mut items: Vec<ReferenceItem> = state
            .reference
            .values()
            .filter(|item| kind.map_or(true, |k| item.kind == k))
            .cloned()
            .collect();
        items.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(items)
    }
}
