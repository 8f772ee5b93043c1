// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Offline Sync
//!
//! An offline-first event journal and sync protocol with a cross-store
//! consistency guard.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Client (device)                        │
//! │  • Journal: durable local event log (SQLite or memory)     │
//! │  • Coordinator: online-edge / timer / explicit triggers,   │
//! │    single-flight, capped exponential backoff               │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                     (POST /sync, batched FIFO)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Server (processor)                     │
//! │  • Idempotent per-event apply keyed by (device, tempId)    │
//! │  • Permanent-id assignment, reference data since watermark │
//! │  • Domain event fan-out via the dispatcher                 │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Stores + Guard                         │
//! │  • RelationalStore: owners, processed events, reference    │
//! │  • DocumentStore: cross-store links                        │
//! │  • ConsistencyGuard: dual validation + orphan sweeps       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use offline_sync::{
//!     HttpTransport, MemoryJournal, SyncConfig, SyncCoordinator,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = SyncConfig {
//!         api_base: "https://api.example.com".into(),
//!         ..Default::default()
//!     };
//!
//!     let journal = Arc::new(MemoryJournal::new());
//!     let transport = Arc::new(HttpTransport::new(&config).expect("http client"));
//!     let (online_tx, online_rx) = watch::channel(false);
//!
//!     let coordinator =
//!         SyncCoordinator::new(journal, transport, config, "bearer-token", online_rx);
//!
//!     // Record while offline; the entry is durable before this returns
//!     coordinator
//!         .record("space_access", json!({"spaceId": 3}))
//!         .await
//!         .expect("journal write");
//!
//!     // Back online: the next sync drains the journal
//!     online_tx.send(true).ok();
//!     coordinator.sync().await.expect("sync");
//! }
//! ```
//!
//! ## Modules
//!
//! - [`journal`]: durable client-side event log with a reference cache
//! - [`coordinator`]: sync triggers, retry policy, transport
//! - [`processor`]: server-side idempotent batch apply
//! - [`store`]: relational and document store traits plus backends
//! - [`guard`]: cross-store link validation and orphan sweeps
//! - [`dispatch`]: bounded in-process domain event fan-out

pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod event;
pub mod guard;
pub mod journal;
pub mod metrics;
pub mod processor;
pub mod protocol;
pub mod retry;
pub mod store;

pub use config::SyncConfig;
pub use coordinator::{
    backoff_delay, HttpTransport, SyncCoordinator, SyncError, SyncTransport, TransportError,
};
pub use dispatch::{
    DispatchError, DomainEvent, EventDispatcher, EventHandler, HandlerError, HandlerId,
};
pub use event::{DeviceRecord, EventStatus, OfflineEvent};
pub use guard::{ConsistencyGuard, GuardError, OrphanSweepHandler};
pub use journal::{Journal, JournalError, MemoryJournal, SqliteJournal};
pub use processor::{ApplyError, EventApplier, SyncProcessor, UuidApplier};
pub use protocol::{
    PendingEventDto, ProcessedEvent, ReferenceItem, ReferencePayload, SyncRequest, SyncResponse,
};
pub use retry::RetryConfig;
pub use store::{
    CrossStoreLink, DocumentStore, EventClaim, MemoryDocumentStore, MemoryRelationalStore,
    RelationalStore, SqlRelationalStore, StoreError,
};
