//! In-memory store backends.
//!
//! Used by the tests and by embedded deployments that keep the whole
//! server state in one process. Concurrency-safe via `DashMap`; the
//! idempotency claim uses the map's entry API so check-and-insert is a
//! single atomic step, same contract as the SQL unique constraint.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};

use super::{CrossStoreLink, DocumentStore, EventClaim, RelationalStore, StoreError};
use crate::protocol::{ProcessedEvent, ReferenceItem};

#[derive(Debug, Clone)]
struct DeviceRow {
    owner_id: i64,
    last_sync_time: i64,
}

/// In-memory [`RelationalStore`].
pub struct MemoryRelationalStore {
    owners: DashSet<i64>,
    // None while the claim is in flight, Some once completed
    processed: DashMap<(String, String), Option<ProcessedEvent>>,
    devices: DashMap<String, DeviceRow>,
    reference: DashMap<String, (Option<i64>, ReferenceItem)>,
}

impl MemoryRelationalStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            owners: DashSet::new(),
            processed: DashMap::new(),
            devices: DashMap::new(),
            reference: DashMap::new(),
        }
    }

    pub fn add_owner(&self, owner_id: i64) {
        self.owners.insert(owner_id);
    }

    pub fn remove_owner(&self, owner_id: i64) {
        self.owners.remove(&owner_id);
    }

    /// Insert or replace a reference row. `owner_scope: None` means the row
    /// is visible to every owner.
    pub fn put_reference(&self, owner_scope: Option<i64>, item: ReferenceItem) {
        self.reference.insert(item.id.clone(), (owner_scope, item));
    }

    /// Last sync time recorded for a device, if it ever synced.
    #[must_use]
    pub fn device_last_sync(&self, device_id: &str) -> Option<i64> {
        self.devices.get(device_id).map(|d| d.last_sync_time)
    }

    /// Owner the device last synced as.
    #[must_use]
    pub fn device_owner(&self, device_id: &str) -> Option<i64> {
        self.devices.get(device_id).map(|d| d.owner_id)
    }
}

impl Default for MemoryRelationalStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelationalStore for MemoryRelationalStore {
    async fn owner_exists(&self, owner_id: i64) -> Result<bool, StoreError> {
        Ok(self.owners.contains(&owner_id))
    }

    async fn claim_event(
        &self,
        device_id: &str,
        temporary_id: &str,
    ) -> Result<EventClaim, StoreError> {
        let key = (device_id.to_string(), temporary_id.to_string());
        match self.processed.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(None);
                Ok(EventClaim::Fresh)
            }
            Entry::Occupied(slot) => match slot.get() {
                Some(outcome) => Ok(EventClaim::Replayed(outcome.clone())),
                None => Ok(EventClaim::InFlight),
            },
        }
    }

    async fn complete_event(
        &self,
        device_id: &str,
        outcome: &ProcessedEvent,
    ) -> Result<(), StoreError> {
        let key = (device_id.to_string(), outcome.temporary_id.clone());
        self.processed.insert(key, Some(outcome.clone()));
        Ok(())
    }

    async fn register_device_sync(
        &self,
        device_id: &str,
        owner_id: i64,
        server_time: i64,
    ) -> Result<(), StoreError> {
        self.devices.insert(
            device_id.to_string(),
            DeviceRow {
                owner_id,
                last_sync_time: server_time,
            },
        );
        Ok(())
    }

    async fn reference_changed_since(
        &self,
        owner_id: i64,
        since: i64,
    ) -> Result<Vec<ReferenceItem>, StoreError> {
        let mut items: Vec<ReferenceItem> = self
            .reference
            .iter()
            .filter(|entry| {
                let (scope, item) = entry.value();
                item.updated_at > since && scope.map_or(true, |o| o == owner_id)
            })
            .map(|entry| entry.value().1.clone())
            .collect();
        items.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(items)
    }
}

/// In-memory [`DocumentStore`].
pub struct MemoryDocumentStore {
    documents: DashSet<String>,
    links: DashMap<(i64, String), CrossStoreLink>,
}

impl MemoryDocumentStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            documents: DashSet::new(),
            links: DashMap::new(),
        }
    }

    pub fn add_document(&self, document_id: impl Into<String>) {
        self.documents.insert(document_id.into());
    }

    pub fn remove_document(&self, document_id: &str) {
        self.documents.remove(document_id);
    }

    /// Total links across all owners.
    #[must_use]
    pub fn link_count(&self) -> usize {
        self.links.len()
    }
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn document_exists(&self, document_id: &str) -> Result<bool, StoreError> {
        Ok(self.documents.contains(document_id))
    }

    async fn put_link(&self, link: &CrossStoreLink) -> Result<(), StoreError> {
        self.links
            .insert((link.owner_id, link.document_id.clone()), link.clone());
        Ok(())
    }

    async fn delete_link(&self, owner_id: i64, document_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .links
            .remove(&(owner_id, document_id.to_string()))
            .is_some())
    }

    async fn get_link(
        &self,
        owner_id: i64,
        document_id: &str,
    ) -> Result<Option<CrossStoreLink>, StoreError> {
        Ok(self
            .links
            .get(&(owner_id, document_id.to_string()))
            .map(|l| l.clone()))
    }

    async fn links_for_owner(&self, owner_id: i64) -> Result<Vec<CrossStoreLink>, StoreError> {
        let mut links: Vec<CrossStoreLink> = self
            .links
            .iter()
            .filter(|entry| entry.key().0 == owner_id)
            .map(|entry| entry.value().clone())
            .collect();
        links.sort_by(|a, b| a.document_id.cmp(&b.document_id));
        Ok(links)
    }

    async fn mark_link_read(
        &self,
        owner_id: i64,
        document_id: &str,
        read_at: i64,
    ) -> Result<bool, StoreError> {
        match self.links.get_mut(&(owner_id, document_id.to_string())) {
            Some(mut link) => {
                link.read = true;
                link.read_at = Some(read_at);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
