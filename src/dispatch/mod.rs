// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Asynchronous fan-out of domain events.
//!
//! `publish` enqueues and returns; it never runs handlers inline, so the
//! triggering request's latency and failure domain stay decoupled from
//! side effects. A single consumer drains the queue in order. For each
//! event, every currently subscribed handler runs concurrently in its own
//! task; a handler error or panic is logged with the event kind and the
//! handler's name and never reaches the publisher or the other handlers.
//!
//! The registry is an injected instance, not a global: construct one
//! dispatcher at startup and hand it to whoever publishes.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::event::now_millis;
use crate::metrics;

/// A transient server-side event. Never persisted beyond the dispatch
/// queue; consumed at most once per subscribed handler per occurrence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    pub kind: String,
    pub payload: Value,
    /// Server clock, epoch millis
    pub occurred_at: i64,
}

impl DomainEvent {
    #[must_use]
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            occurred_at: now_millis(),
        }
    }
}

#[derive(Debug, Error)]
#[error("handler error: {0}")]
pub struct HandlerError(pub String);

impl From<&str> for HandlerError {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A side-effect subscriber. `name` identifies the handler in logs.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError>;
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatch queue is full")]
    QueueFull,

    #[error("dispatcher is shut down")]
    Closed,
}

/// Opaque subscription token returned by [`EventDispatcher::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Publish/subscribe dispatcher with a bounded queue and isolated handlers.
pub struct EventDispatcher {
    registry: RwLock<HashMap<HandlerId, Arc<dyn EventHandler>>>,
    next_id: AtomicU64,
    tx: mpsc::Sender<DomainEvent>,
    // Taken once by the drain loop
    rx: Mutex<Option<mpsc::Receiver<DomainEvent>>>,
    published_by_kind: DashMap<String, u64>,
}

impl EventDispatcher {
    #[must_use]
    pub fn new(queue_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity);
        Self {
            registry: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            tx,
            rx: Mutex::new(Some(rx)),
            published_by_kind: DashMap::new(),
        }
    }

    /// Register a handler for all subsequent events.
    pub fn subscribe(&self, handler: Arc<dyn EventHandler>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        info!(handler = handler.name(), "handler subscribed");
        self.registry.write().insert(id, handler);
        id
    }

    /// Remove a handler. Returns false if the id was not registered.
    pub fn unsubscribe(&self, id: HandlerId) -> bool {
        let removed = self.registry.write().remove(&id);
        if let Some(handler) = &removed {
            info!(handler = handler.name(), "handler unsubscribed");
        }
        removed.is_some()
    }

    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.registry.read().len()
    }

    /// Enqueue an event and return immediately. Handlers run later on the
    /// drain loop.
    pub fn publish(&self, kind: impl Into<String>, payload: Value) -> Result<(), DispatchError> {
        let event = DomainEvent::new(kind, payload);
        let kind = event.kind.clone();

        match self.tx.try_send(event) {
            Ok(()) => {
                *self.published_by_kind.entry(kind).or_insert(0) += 1;
                metrics::set_dispatch_queue_depth(self.queue_len());
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(kind = %kind, "dispatch queue full, event dropped");
                Err(DispatchError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DispatchError::Closed),
        }
    }

    /// Events currently waiting in the queue.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Total events published with the given kind since startup.
    #[must_use]
    pub fn count_by_kind(&self, kind: &str) -> u64 {
        self.published_by_kind.get(kind).map(|c| *c).unwrap_or(0)
    }

    /// Drain the queue until `shutdown` flips true or every sender is
    /// dropped. Single consumer: events are dispatched in queue order,
    /// but one event's handlers run concurrently with each other.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut rx = match self.rx.lock().await.take() {
            Some(rx) => rx,
            None => {
                warn!("dispatcher drain loop already running");
                return;
            }
        };

        info!("dispatcher drain loop started");
        loop {
            tokio::select! {
                maybe_event = rx.recv() => {
                    match maybe_event {
                        Some(event) => {
                            metrics::set_dispatch_queue_depth(self.queue_len());
                            self.dispatch_one(event).await;
                        }
                        None => break,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("dispatcher drain loop stopped");
    }

    async fn dispatch_one(&self, event: DomainEvent) {
        // Snapshot under the read lock, invoke outside it
        let handlers: Vec<(String, Arc<dyn EventHandler>)> = self
            .registry
            .read()
            .values()
            .map(|h| (h.name().to_string(), h.clone()))
            .collect();

        debug!(kind = %event.kind, handlers = handlers.len(), "dispatching event");

        let mut joins = Vec::with_capacity(handlers.len());
        for (name, handler) in handlers {
            let event = event.clone();
            // Each handler gets its own task: an error or panic in one
            // never blocks the others or stalls the queue
            joins.push((name, tokio::spawn(async move {
                handler.handle(&event).await
            })));
        }

        for (name, join) in joins {
            match join.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(kind = %event.kind, handler = %name, error = %e, "handler failed");
                    metrics::record_handler_failure(&event.kind, &name);
                }
                Err(join_err) if join_err.is_panic() => {
                    error!(kind = %event.kind, handler = %name, "handler panicked");
                    metrics::record_handler_failure(&event.kind, &name);
                }
                Err(join_err) => {
                    error!(kind = %event.kind, handler = %name, error = %join_err, "handler task failed");
                }
            }
        }
    }
}
