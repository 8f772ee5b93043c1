// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Client-side sync coordinator.
//!
//! Decides *when* to talk to the server: on the offline-to-online edge,
//! on a periodic timer while online, and on explicit request. Exactly one
//! sync is in flight per device at any time; overlapping triggers are
//! suppressed so the same Pending batch is never submitted twice
//! concurrently. Transient failures retry with capped exponential backoff
//! and jitter; client errors abort immediately, and a 401 invalidates the
//! session without touching the retry loop.

mod backoff;
mod transport;

pub use backoff::backoff_delay;
pub use transport::{HttpTransport, SyncTransport, TransportError};

use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::journal::{Journal, JournalError};
use crate::metrics;
use crate::protocol::{PendingEventDto, SyncRequest, SyncResponse};

#[derive(Debug, Error)]
pub enum SyncError {
    /// The server answered 401. The session is invalid; the caller
    /// redirects to login rather than retrying.
    #[error("session invalidated by the server")]
    Unauthorized,

    /// The server rejected the batch (4xx). Resubmitting the same batch
    /// cannot succeed, so no retries were made.
    #[error("sync batch rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    /// Every attempt failed with a transient error; events stay Pending
    /// for the next trigger.
    #[error("sync failed after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: TransportError,
    },

    /// Non-retryable transport failure (e.g. a malformed response body).
    #[error(transparent)]
    Transport(TransportError),

    #[error(transparent)]
    Journal(#[from] JournalError),
}

/// Drives the journal through the sync protocol.
pub struct SyncCoordinator {
    journal: Arc<dyn Journal>,
    transport: Arc<dyn SyncTransport>,
    config: SyncConfig,
    auth_token: parking_lot::RwLock<String>,
    // Single-flight guard; try_lock failure means a sync is running
    in_flight: Mutex<()>,
    online: watch::Receiver<bool>,
    session_invalidated: AtomicBool,
}

impl SyncCoordinator {
    pub fn new(
        journal: Arc<dyn Journal>,
        transport: Arc<dyn SyncTransport>,
        config: SyncConfig,
        auth_token: impl Into<String>,
        online: watch::Receiver<bool>,
    ) -> Self {
        Self {
            journal,
            transport,
            config,
            auth_token: parking_lot::RwLock::new(auth_token.into()),
            in_flight: Mutex::new(()),
            online,
            session_invalidated: AtomicBool::new(false),
        }
    }

    /// Record a mutation into the journal. Usable online or offline; the
    /// entry is durable before this returns.
    pub async fn record(
        &self,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<String, JournalError> {
        let event = crate::event::OfflineEvent::new(event_type, payload);
        self.journal.record(&event).await?;
        if let Ok(count) = self.journal.count_pending().await {
            metrics::set_pending_events(count);
        }
        Ok(event.temporary_id)
    }

    /// Current bearer token (rotated by the server on sync).
    #[must_use]
    pub fn auth_token(&self) -> String {
        self.auth_token.read().clone()
    }

    /// Replace the token and clear any session invalidation, e.g. after
    /// the user logs back in.
    pub fn set_auth_token(&self, token: impl Into<String>) {
        *self.auth_token.write() = token.into();
        self.session_invalidated.store(false, Ordering::SeqCst);
    }

    /// True once the server has answered 401; the UI redirects to login.
    #[must_use]
    pub fn session_invalidated(&self) -> bool {
        self.session_invalidated.load(Ordering::SeqCst)
    }

    /// Attempt a sync now. Returns `Ok(true)` when a round trip succeeded,
    /// `Ok(false)` when nothing was attempted (offline, or another sync is
    /// already in flight).
    pub async fn sync(&self) -> Result<bool, SyncError> {
        self.sync_with(false).await
    }

    /// Like [`Self::sync`] but requests reference data since epoch
    /// instead of since the last sync.
    pub async fn sync_full(&self) -> Result<bool, SyncError> {
        self.sync_with(true).await
    }

    async fn sync_with(&self, full_resync: bool) -> Result<bool, SyncError> {
        let _guard = match self.in_flight.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("sync already in flight, suppressed");
                metrics::record_sync_attempt("suppressed");
                return Ok(false);
            }
        };

        if !*self.online.borrow() {
            // Events stay queued for the next online edge; not an error
            debug!("offline, events stay queued");
            metrics::record_sync_attempt("offline");
            return Ok(false);
        }

        let device = self
            .journal
            .device(&self.config.platform, &self.config.client_version)
            .await?;
        let pending = self
            .journal
            .list_pending(self.config.max_event_attempts)
            .await?;

        let request = SyncRequest {
            device_id: device.device_id.clone(),
            last_sync_time: device.last_sync_time,
            pending_events: pending.iter().map(PendingEventDto::from).collect(),
            client_version: self.config.client_version.clone(),
            full_resync,
        };

        info!(
            device_id = %device.device_id,
            pending = request.pending_events.len(),
            "sync attempt starting"
        );

        let mut attempt: u32 = 0;
        loop {
            let token = self.auth_token();
            match self.transport.send(&request, &token).await {
                Ok(response) if response.success => {
                    self.apply_response(&response).await?;
                    metrics::record_sync_attempt("success");
                    return Ok(true);
                }
                Ok(response) => {
                    // Request-level server failure with a 2xx envelope;
                    // same treatment as a 5xx
                    warn!(
                        message = response.message.as_deref().unwrap_or("-"),
                        "server reported sync failure"
                    );
                    let err = TransportError::Server { status: 500 };
                    if let Some(result) = self.next_attempt(&mut attempt, err).await {
                        return result;
                    }
                }
                Err(TransportError::Unauthorized) => {
                    self.session_invalidated.store(true, Ordering::SeqCst);
                    metrics::record_sync_attempt("unauthorized");
                    return Err(SyncError::Unauthorized);
                }
                Err(TransportError::Rejected { status, message }) => {
                    // A malformed batch will not become valid by resubmission
                    warn!(status, "sync batch rejected, not retrying");
                    metrics::record_sync_attempt("rejected");
                    return Err(SyncError::Rejected { status, message });
                }
                Err(err) if err.is_retryable() => {
                    if let Some(result) = self.next_attempt(&mut attempt, err).await {
                        return result;
                    }
                }
                Err(err) => {
                    metrics::record_sync_attempt("failed");
                    return Err(SyncError::Transport(err));
                }
            }
        }
    }

    /// Advance the retry loop. Returns `Some(final result)` when the loop
    /// must stop, `None` after sleeping out the backoff delay.
    async fn next_attempt(
        &self,
        attempt: &mut u32,
        err: TransportError,
    ) -> Option<Result<bool, SyncError>> {
        if *attempt >= self.config.max_retries {
            metrics::record_sync_attempt("exhausted");
            return Some(Err(SyncError::Exhausted {
                attempts: *attempt + 1,
                last: err,
            }));
        }

        if !*self.online.borrow() {
            // Connectivity lost mid-retry: stop waiting, the online edge
            // will trigger the next attempt
            info!("went offline during retry backoff, aborting");
            metrics::record_sync_attempt("offline");
            return Some(Ok(false));
        }

        let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
        let delay = backoff_delay(
            *attempt,
            self.config.backoff_base(),
            self.config.backoff_max(),
            jitter,
        );
        warn!(attempt = *attempt, error = %err, delay_ms = delay.as_millis() as u64, "transient sync failure, backing off");

        // The backoff wait itself watches connectivity: going offline
        // aborts immediately instead of sleeping out the delay and
        // burning a doomed attempt
        let mut online = self.online.clone();
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                changed = online.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if !*online.borrow() {
                        info!("went offline during retry backoff, aborting");
                        metrics::record_sync_attempt("offline");
                        return Some(Ok(false));
                    }
                }
            }
        }

        *attempt += 1;
        None
    }

    async fn apply_response(&self, response: &SyncResponse) -> Result<(), SyncError> {
        for processed in &response.processed_events {
            if processed.success {
                self.journal
                    .mark_synced(&processed.temporary_id, processed.permanent_id.as_deref())
                    .await?;
            } else {
                self.journal
                    .mark_failed(
                        &processed.temporary_id,
                        processed.error_message.as_deref().unwrap_or("rejected"),
                    )
                    .await?;
            }
        }

        if let Some(data) = &response.data_to_sync {
            self.journal.merge_reference(&data.items).await?;
        }

        self.journal.set_last_sync_time(response.server_time).await?;

        if let Some(token) = &response.new_auth_token {
            debug!("auth token rotated by server");
            *self.auth_token.write() = token.clone();
        }

        let purged = self.journal.purge_synced().await?;
        let remaining = self.journal.count_pending().await?;
        metrics::set_pending_events(remaining);
        info!(purged, remaining, "sync applied");
        Ok(())
    }

    /// Trigger loop: periodic timer while online plus the offline-to-online
    /// edge. Runs until `shutdown` flips true. Sync failures are logged
    /// here, never propagated; events stay journaled for the next trigger.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.sync_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut online = self.online.clone();
        let mut was_online = *online.borrow();

        info!(interval_secs = self.config.sync_interval_secs, "sync trigger loop started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if *online.borrow() {
                        self.try_sync_logged("timer").await;
                    }
                }
                changed = online.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let is_online = *online.borrow();
                    if is_online && !was_online {
                        info!("back online, syncing queued events");
                        self.try_sync_logged("online_edge").await;
                    }
                    was_online = is_online;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("sync trigger loop stopped");
    }

    async fn try_sync_logged(&self, trigger: &str) {
        match self.sync().await {
            Ok(true) => debug!(trigger, "sync succeeded"),
            Ok(false) => debug!(trigger, "sync skipped"),
            Err(e) => warn!(trigger, error = %e, "sync failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::now_millis;
    use crate::journal::MemoryJournal;
    use crate::protocol::ProcessedEvent;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct ScriptedTransport {
        script: SyncMutex<VecDeque<Result<SyncResponse, TransportError>>>,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<SyncResponse, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                script: SyncMutex::new(script.into()),
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            })
        }

        fn slow(script: Vec<Result<SyncResponse, TransportError>>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                script: SyncMutex::new(script.into()),
                calls: AtomicUsize::new(0),
                delay,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SyncTransport for ScriptedTransport {
        async fn send(
            &self,
            _request: &SyncRequest,
            _auth_token: &str,
        ) -> Result<SyncResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.script
                .lock()
                .pop_front()
                .unwrap_or(Err(TransportError::Network("script exhausted".into())))
        }
    }

    fn ok_response(events: &[(&str, bool)]) -> SyncResponse {
        let server_time = now_millis();
        SyncResponse {
            server_time,
            success: true,
            message: None,
            processed_events: events
                .iter()
                .map(|(temporary_id, success)| ProcessedEvent {
                    temporary_id: temporary_id.to_string(),
                    success: *success,
                    permanent_id: success.then(|| format!("perm-{}", temporary_id)),
                    error_message: (!success).then(|| "rejected".to_string()),
                    processed_at: server_time,
                })
                .collect(),
            data_to_sync: None,
            new_auth_token: None,
            last_successful_sync: server_time,
        }
    }

    fn test_config() -> SyncConfig {
        SyncConfig {
            max_retries: 3,
            backoff_base_ms: 1,
            backoff_max_ms: 5,
            ..Default::default()
        }
    }

    fn coordinator(
        journal: Arc<MemoryJournal>,
        transport: Arc<ScriptedTransport>,
        online: bool,
    ) -> (SyncCoordinator, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(online);
        let coordinator =
            SyncCoordinator::new(journal, transport, test_config(), "token-1", rx);
        (coordinator, tx)
    }

    #[tokio::test]
    async fn test_offline_events_stay_queued() {
        let journal = Arc::new(MemoryJournal::new());
        let transport = ScriptedTransport::new(vec![]);
        let (coordinator, _online) = coordinator(journal.clone(), transport.clone(), false);

        coordinator.record("access", json!({"space": 1})).await.unwrap();
        let result = coordinator.sync().await.unwrap();

        // No network attempt while offline; not an error
        assert!(!result);
        assert_eq!(transport.calls(), 0);
        assert_eq!(journal.count_pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_happy_path_marks_and_purges() {
        let journal = Arc::new(MemoryJournal::new());
        let a = crate::event::OfflineEvent::new("access", json!({"n": 1}));
        let b = crate::event::OfflineEvent::new("access", json!({"n": 2}));
        journal.record(&a).await.unwrap();
        journal.record(&b).await.unwrap();

        let transport = ScriptedTransport::new(vec![Ok(ok_response(&[
            (&a.temporary_id, true),
            (&b.temporary_id, true),
        ]))]);
        let (coordinator, _online) = coordinator(journal.clone(), transport.clone(), true);

        assert!(coordinator.sync().await.unwrap());
        assert_eq!(transport.calls(), 1);

        // Both synced and purged; watermark advanced
        assert!(journal.is_empty());
        let device = journal.device("rust", "1.0.0").await.unwrap();
        assert!(device.last_sync_time.is_some());
    }

    #[tokio::test]
    async fn test_per_event_failure_marks_failed() {
        let journal = Arc::new(MemoryJournal::new());
        let good = crate::event::OfflineEvent::new("access", json!({}));
        let bad = crate::event::OfflineEvent::new("bogus", json!({}));
        journal.record(&good).await.unwrap();
        journal.record(&bad).await.unwrap();

        let transport = ScriptedTransport::new(vec![Ok(ok_response(&[
            (&good.temporary_id, true),
            (&bad.temporary_id, false),
        ]))]);
        let (coordinator, _online) = coordinator(journal.clone(), transport, true);

        assert!(coordinator.sync().await.unwrap());

        let pending = journal.list_pending(3).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].temporary_id, bad.temporary_id);
        assert_eq!(pending[0].attempt_count, 1);
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let journal = Arc::new(MemoryJournal::new());
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Server { status: 503 }),
            Err(TransportError::Server { status: 503 }),
            Err(TransportError::Server { status: 503 }),
            Ok(ok_response(&[])),
        ]);
        let (coordinator, _online) = coordinator(journal, transport.clone(), true);

        // 503 three times, success on the 4th: max_retries=3 allows it
        assert!(coordinator.sync().await.unwrap());
        assert_eq!(transport.calls(), 4);
    }

    #[tokio::test]
    async fn test_exhausts_retries_then_fails() {
        let journal = Arc::new(MemoryJournal::new());
        let event = crate::event::OfflineEvent::new("access", json!({}));
        journal.record(&event).await.unwrap();

        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Timeout),
            Err(TransportError::Timeout),
            Err(TransportError::Timeout),
            Err(TransportError::Timeout),
        ]);
        let (coordinator, _online) = coordinator(journal.clone(), transport.clone(), true);

        match coordinator.sync().await {
            Err(SyncError::Exhausted { attempts, .. }) => assert_eq!(attempts, 4),
            other => panic!("expected exhausted, got {:?}", other.map(|_| ())),
        }
        assert_eq!(transport.calls(), 4);
        // Events remain Pending for the next trigger
        assert_eq!(journal.count_pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_client_error_aborts_without_retry() {
        let journal = Arc::new(MemoryJournal::new());
        let transport = ScriptedTransport::new(vec![Err(TransportError::Rejected {
            status: 400,
            message: "malformed batch".into(),
        })]);
        let (coordinator, _online) = coordinator(journal, transport.clone(), true);

        assert!(matches!(
            coordinator.sync().await,
            Err(SyncError::Rejected { status: 400, .. })
        ));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_unauthorized_invalidates_session() {
        let journal = Arc::new(MemoryJournal::new());
        let transport = ScriptedTransport::new(vec![Err(TransportError::Unauthorized)]);
        let (coordinator, _online) = coordinator(journal, transport, true);

        assert!(matches!(coordinator.sync().await, Err(SyncError::Unauthorized)));
        assert!(coordinator.session_invalidated());

        // Logging back in clears the flag
        coordinator.set_auth_token("token-2");
        assert!(!coordinator.session_invalidated());
        assert_eq!(coordinator.auth_token(), "token-2");
    }

    #[tokio::test]
    async fn test_concurrent_sync_is_suppressed() {
        let journal = Arc::new(MemoryJournal::new());
        let transport = ScriptedTransport::slow(
            vec![Ok(ok_response(&[])), Ok(ok_response(&[]))],
            Duration::from_millis(100),
        );
        let (coordinator, _online) = coordinator(journal, transport.clone(), true);
        let coordinator = Arc::new(coordinator);

        let first = {
            let c = coordinator.clone();
            tokio::spawn(async move { c.sync().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        // Second call while the first is mid-flight: suppressed, no request
        let second = coordinator.sync().await.unwrap();
        assert!(!second);

        assert!(first.await.unwrap().unwrap());
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_offline_mid_retry_aborts_loop() {
        let journal = Arc::new(MemoryJournal::new());
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Server { status: 503 }),
            Err(TransportError::Server { status: 503 }),
        ]);
        let (coordinator, online) = coordinator(journal, transport.clone(), true);

        let coordinator = Arc::new(coordinator);
        let c = coordinator.clone();
        let handle = tokio::spawn(async move { c.sync().await });
        // Let the first attempt fail and enter backoff, then flip offline
        tokio::task::yield_now().await;
        online.send(false).unwrap();

        let result = handle.await.unwrap().unwrap();
        assert!(!result);
        // Loop stopped early instead of burning all retries
        assert!(transport.calls() <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_interrupts_backoff_sleep() {
        let journal = Arc::new(MemoryJournal::new());
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Server { status: 503 }),
            Err(TransportError::Server { status: 503 }),
        ]);
        let (tx, rx) = watch::channel(true);
        let config = SyncConfig {
            max_retries: 3,
            // Long enough that waiting it out would be observable
            backoff_base_ms: 60_000,
            backoff_max_ms: 60_000,
            ..Default::default()
        };
        let coordinator = Arc::new(SyncCoordinator::new(
            journal, transport.clone(), config, "token-1", rx,
        ));

        let c = coordinator.clone();
        let handle = tokio::spawn(async move { c.sync().await });
        // First attempt fails and the loop enters its backoff wait
        tokio::task::yield_now().await;
        tx.send(false).unwrap();

        // The wait aborts on the connectivity flip, not after the delay:
        // a full sleep would have auto-advanced time and burned attempt 2
        assert!(!handle.await.unwrap().unwrap());
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_triggers_on_edge_and_timer() {
        let journal = Arc::new(MemoryJournal::new());
        let transport = ScriptedTransport::new(vec![
            Ok(ok_response(&[])),
            Ok(ok_response(&[])),
        ]);
        let (online_tx, online_rx) = watch::channel(false);
        let config = SyncConfig {
            sync_interval_secs: 1,
            ..Default::default()
        };
        let coordinator = Arc::new(SyncCoordinator::new(
            journal, transport.clone(), config, "token-1", online_rx,
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let c = coordinator.clone();
        let loop_handle = tokio::spawn(async move { c.run(shutdown_rx).await });

        // Timer ticks while offline never reach the transport
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(transport.calls(), 0);

        // Offline-to-online edge fires a sync immediately
        online_tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.calls(), 1);

        // The next periodic tick fires another while online
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(transport.calls() >= 2);

        // Shutdown stops the loop
        shutdown_tx.send(true).unwrap();
        loop_handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_token_rotation() {
        let journal = Arc::new(MemoryJournal::new());
        let mut response = ok_response(&[]);
        response.new_auth_token = Some("token-rotated".into());
        let transport = ScriptedTransport::new(vec![Ok(response)]);
        let (coordinator, _online) = coordinator(journal, transport, true);

        assert!(coordinator.sync().await.unwrap());
        assert_eq!(coordinator.auth_token(), "token-rotated");
    }

    #[tokio::test]
    async fn test_reference_data_merged() {
        let journal = Arc::new(MemoryJournal::new());
        let mut response = ok_response(&[]);
        response.data_to_sync = Some(crate::protocol::ReferencePayload {
            items: vec![crate::protocol::ReferenceItem {
                id: "5".into(),
                kind: "space".into(),
                payload: json!({"name": "Lab A"}),
                updated_at: 50,
            }],
        });
        let transport = ScriptedTransport::new(vec![Ok(response)]);
        let (coordinator, _online) = coordinator(journal.clone(), transport, true);

        assert!(coordinator.sync().await.unwrap());
        let cached = journal.cached_reference(Some("space")).await.unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].payload["name"], "Lab A");
    }
}
