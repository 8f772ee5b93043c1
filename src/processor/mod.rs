// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Server-side batch processor for `POST /sync`.
//!
//! Applies a device's journaled events in the order received, one outcome
//! per event. Idempotency is keyed on `(deviceId, temporaryId)`: the
//! relational store's atomic claim decides whether this submission applies
//! the event or replays a recorded outcome, so a client retrying after a
//! dropped response cannot double-apply anything. One event's failure
//! never blocks the rest of the batch; only a request-level failure
//! (device registration) flips the response's `success` flag.

mod applier;

pub use applier::{ApplyError, EventApplier, UuidApplier};

use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::dispatch::EventDispatcher;
use crate::event::now_millis;
use crate::metrics;
use crate::protocol::{PendingEventDto, ProcessedEvent, SyncRequest, SyncResponse};
use crate::store::{EventClaim, RelationalStore};

/// Event kind published for every freshly applied journal event.
pub const EVENT_APPLIED_KIND: &str = "offline_event_applied";

pub struct SyncProcessor {
    relational: Arc<dyn RelationalStore>,
    applier: Arc<dyn EventApplier>,
    dispatcher: Arc<EventDispatcher>,
}

impl SyncProcessor {
    pub fn new(
        relational: Arc<dyn RelationalStore>,
        applier: Arc<dyn EventApplier>,
        dispatcher: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            relational,
            applier,
            dispatcher,
        }
    }

    /// Process one sync request on behalf of the authenticated owner.
    #[tracing::instrument(skip(self, request), fields(device_id = %request.device_id, events = request.pending_events.len()))]
    pub async fn process(&self, request: &SyncRequest, owner_id: i64) -> SyncResponse {
        let started = Instant::now();
        let server_time = now_millis();

        // Request-level: a device that can't be registered can't sync
        if let Err(e) = self
            .relational
            .register_device_sync(&request.device_id, owner_id, server_time)
            .await
        {
            error!(device_id = %request.device_id, error = %e, "device registration failed");
            metrics::record_sync_request("failure");
            return SyncResponse {
                server_time,
                success: false,
                message: Some(format!("device registration failed: {}", e)),
                processed_events: Vec::new(),
                data_to_sync: None,
                new_auth_token: None,
                last_successful_sync: server_time,
            };
        }

        let mut processed_events = Vec::with_capacity(request.pending_events.len());
        for event in &request.pending_events {
            let outcome = self.process_one(&request.device_id, owner_id, event).await;
            metrics::record_event_processed(if outcome.success { "success" } else { "failure" });
            processed_events.push(outcome);
        }

        let since = if request.full_resync {
            0
        } else {
            request.last_sync_time.unwrap_or(0)
        };
        let data_to_sync = match self.relational.reference_changed_since(owner_id, since).await {
            Ok(items) if items.is_empty() => None,
            Ok(items) => Some(crate::protocol::ReferencePayload { items }),
            Err(e) => {
                // Events are already applied and recorded; missing reference
                // data only delays the client's cache refresh
                warn!(owner_id, error = %e, "reference delta unavailable");
                None
            }
        };

        info!(
            device_id = %request.device_id,
            applied = processed_events.iter().filter(|p| p.success).count(),
            failed = processed_events.iter().filter(|p| !p.success).count(),
            "sync request processed"
        );
        metrics::record_sync_request("success");
        metrics::record_sync_duration(started.elapsed());

        SyncResponse {
            server_time,
            success: true,
            message: None,
            processed_events,
            data_to_sync,
            // Token rotation belongs to the auth layer wrapping this processor
            new_auth_token: None,
            last_successful_sync: server_time,
        }
    }

    async fn process_one(
        &self,
        device_id: &str,
        owner_id: i64,
        event: &PendingEventDto,
    ) -> ProcessedEvent {
        let claim = match self
            .relational
            .claim_event(device_id, &event.temporary_id)
            .await
        {
            Ok(claim) => claim,
            Err(e) => {
                error!(temporary_id = %event.temporary_id, error = %e, "idempotency claim failed");
                return ProcessedEvent {
                    temporary_id: event.temporary_id.clone(),
                    success: false,
                    permanent_id: None,
                    error_message: Some(format!("claim failed: {}", e)),
                    processed_at: now_millis(),
                };
            }
        };

        match claim {
            EventClaim::Replayed(prior) => {
                // At-least-once delivery: hand back the recorded outcome verbatim
                metrics::record_replay();
                prior
            }
            EventClaim::InFlight => {
                // A concurrent request from the same device holds the claim.
                // Reported as a failure; the client retries and gets the
                // recorded outcome once the winner completes.
                warn!(temporary_id = %event.temporary_id, "duplicate submission while apply in flight");
                ProcessedEvent {
                    temporary_id: event.temporary_id.clone(),
                    success: false,
                    permanent_id: None,
                    error_message: Some("event is still being applied".into()),
                    processed_at: now_millis(),
                }
            }
            EventClaim::Fresh => {
                let outcome = match self.applier.apply(owner_id, event).await {
                    Ok(permanent_id) => ProcessedEvent {
                        temporary_id: event.temporary_id.clone(),
                        success: true,
                        permanent_id: Some(permanent_id),
                        error_message: None,
                        processed_at: now_millis(),
                    },
                    Err(e) => {
                        warn!(temporary_id = %event.temporary_id, error = %e, "event apply failed");
                        ProcessedEvent {
                            temporary_id: event.temporary_id.clone(),
                            success: false,
                            permanent_id: None,
                            error_message: Some(e.to_string()),
                            processed_at: now_millis(),
                        }
                    }
                };

                if let Err(e) = self
                    .relational
                    .complete_event(device_id, &outcome)
                    .await
                {
                    // The claim row stays in_flight; a replay will report
                    // "still being applied" until an operator intervenes
                    error!(temporary_id = %event.temporary_id, error = %e, "failed to record event outcome");
                }

                if outcome.success {
                    let publish = self.dispatcher.publish(
                        EVENT_APPLIED_KIND,
                        serde_json::json!({
                            "eventType": event.event_type,
                            "temporaryId": event.temporary_id,
                            "permanentId": outcome.permanent_id,
                            "deviceId": device_id,
                            "ownerId": owner_id,
                        }),
                    );
                    if let Err(e) = publish {
                        // Side effects are best-effort; the applied write stands
                        warn!(temporary_id = %event.temporary_id, error = %e, "domain event not enqueued");
                    }
                }

                outcome
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryRelationalStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingApplier {
        applies: AtomicUsize,
        reject_type: Option<String>,
    }

    impl CountingApplier {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                applies: AtomicUsize::new(0),
                reject_type: None,
            })
        }

        fn rejecting(event_type: &str) -> Arc<Self> {
            Arc::new(Self {
                applies: AtomicUsize::new(0),
                reject_type: Some(event_type.to_string()),
            })
        }
    }

    #[async_trait]
    impl EventApplier for CountingApplier {
        async fn apply(
            &self,
            _owner_id: i64,
            event: &PendingEventDto,
        ) -> Result<String, ApplyError> {
            if self.reject_type.as_deref() == Some(event.event_type.as_str()) {
                return Err(ApplyError::Rejected("unknown event type".into()));
            }
            let n = self.applies.fetch_add(1, Ordering::SeqCst);
            Ok(format!("perm-{}", n))
        }
    }

    fn request(events: Vec<PendingEventDto>) -> SyncRequest {
        SyncRequest {
            device_id: "dev-1".into(),
            last_sync_time: None,
            pending_events: events,
            client_version: "1.0.0".into(),
            full_resync: false,
        }
    }

    fn dto(temporary_id: &str, event_type: &str, created_at: i64) -> PendingEventDto {
        PendingEventDto {
            temporary_id: temporary_id.into(),
            event_type: event_type.into(),
            payload: json!({"t": created_at}),
            created_at,
            attempt_count: 0,
        }
    }

    fn processor(
        relational: Arc<MemoryRelationalStore>,
        applier: Arc<CountingApplier>,
    ) -> (SyncProcessor, Arc<EventDispatcher>) {
        let dispatcher = Arc::new(EventDispatcher::new(64));
        let processor = SyncProcessor::new(relational, applier, dispatcher.clone());
        (processor, dispatcher)
    }

    #[tokio::test]
    async fn test_batch_applied_in_order_with_distinct_ids() {
        let relational = Arc::new(MemoryRelationalStore::new());
        let applier = CountingApplier::new();
        let (processor, dispatcher) = processor(relational.clone(), applier.clone());

        let req = request(vec![dto("a-1", "access", 1), dto("b-2", "access", 2)]);
        let response = processor.process(&req, 7).await;

        assert!(response.success);
        assert_eq!(response.processed_events.len(), 2);
        assert_eq!(response.processed_events[0].temporary_id, "a-1");
        assert_eq!(response.processed_events[1].temporary_id, "b-2");
        assert!(response.processed_events.iter().all(|p| p.success));
        assert_ne!(
            response.processed_events[0].permanent_id,
            response.processed_events[1].permanent_id
        );

        // Device registry advanced, one domain event per applied event
        assert_eq!(relational.device_last_sync("dev-1"), Some(response.server_time));
        assert_eq!(dispatcher.count_by_kind(EVENT_APPLIED_KIND), 2);
    }

    #[tokio::test]
    async fn test_idempotent_replay_returns_identical_outcomes() {
        let relational = Arc::new(MemoryRelationalStore::new());
        let applier = CountingApplier::new();
        let (processor, _) = processor(relational, applier.clone());

        let req = request(vec![dto("a-1", "access", 1), dto("b-2", "access", 2)]);
        let first = processor.process(&req, 7).await;
        let second = processor.process(&req, 7).await;

        // Identical outcomes, no double apply
        assert_eq!(first.processed_events, second.processed_events);
        assert_eq!(applier.applies.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_one_failure_does_not_block_the_rest() {
        let relational = Arc::new(MemoryRelationalStore::new());
        let applier = CountingApplier::rejecting("bogus");
        let (processor, dispatcher) = processor(relational, applier);

        let req = request(vec![
            dto("a-1", "access", 1),
            dto("x-2", "bogus", 2),
            dto("c-3", "access", 3),
        ]);
        let response = processor.process(&req, 7).await;

        // Request-level success despite the per-event rejection
        assert!(response.success);
        assert!(response.processed_events[0].success);
        assert!(!response.processed_events[1].success);
        assert!(response.processed_events[1]
            .error_message
            .as_deref()
            .unwrap()
            .contains("unknown event type"));
        assert!(response.processed_events[2].success);

        // No domain event for the rejected one
        assert_eq!(dispatcher.count_by_kind(EVENT_APPLIED_KIND), 2);
    }

    #[tokio::test]
    async fn test_rejected_outcome_replays_rejected() {
        let relational = Arc::new(MemoryRelationalStore::new());
        let applier = CountingApplier::rejecting("bogus");
        let (processor, _) = processor(relational, applier.clone());

        let req = request(vec![dto("x-1", "bogus", 1)]);
        let first = processor.process(&req, 7).await;
        let second = processor.process(&req, 7).await;

        assert!(!first.processed_events[0].success);
        assert_eq!(first.processed_events, second.processed_events);
        // Rejection was recorded; the applier never ran a second time
        assert_eq!(applier.applies.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reference_delta_and_full_resync() {
        let relational = Arc::new(MemoryRelationalStore::new());
        relational.put_reference(
            None,
            crate::protocol::ReferenceItem {
                id: "old".into(),
                kind: "space".into(),
                payload: json!({}),
                updated_at: 10,
            },
        );
        relational.put_reference(
            None,
            crate::protocol::ReferenceItem {
                id: "new".into(),
                kind: "space".into(),
                payload: json!({}),
                updated_at: 1_000,
            },
        );
        let applier = CountingApplier::new();
        let (processor, _) = processor(relational, applier);

        let mut req = request(vec![]);
        req.last_sync_time = Some(100);
        let delta = processor.process(&req, 7).await;
        let items = delta.data_to_sync.unwrap().items;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "new");

        req.full_resync = true;
        let full = processor.process(&req, 7).await;
        assert_eq!(full.data_to_sync.unwrap().items.len(), 2);
    }
}
