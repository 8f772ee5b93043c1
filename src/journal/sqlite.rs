// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable SQL journal backend.
//!
//! Three small tables make up the client's local store:
//! ```sql
//! CREATE TABLE pending_events (
//!   temporary_id TEXT PRIMARY KEY,
//!   event_type TEXT NOT NULL,
//!   payload TEXT NOT NULL,       -- JSON as text (sqlx Any driver limitation)
//!   created_at INTEGER NOT NULL, -- client clock, epoch millis
//!   attempt_count INTEGER NOT NULL,
//!   status TEXT NOT NULL,        -- pending | synced | failed
//!   error TEXT
//! );
//! CREATE TABLE device_metadata (singleton_id, device_id, last_sync_time, ...);
//! CREATE TABLE reference_cache (id, kind, payload, updated_at, refreshed_at);
//! ```
//!
//! Writes are awaited to completion before `record` returns, so a mutation
//! acknowledged to the caller is on disk. WAL mode keeps reads cheap while
//! the coordinator writes status updates.

use async_trait::async_trait;
use sqlx::{any::AnyPoolOptions, AnyPool, Row};
use std::sync::Once;
use std::time::Duration;
use tracing::{debug, info};

use super::{Journal, JournalError};
use crate::event::{now_millis, DeviceRecord, EventStatus, OfflineEvent};
use crate::protocol::ReferenceItem;
use crate::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

/// The sqlx `Any` driver surfaces TEXT columns as bytes on some backends;
/// try String first, then UTF-8 bytes.
fn text_column(row: &sqlx::any::AnyRow, name: &str) -> Option<String> {
    row.try_get::<String, _>(name).ok().or_else(|| {
        row.try_get::<Vec<u8>, _>(name)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    })
}

/// Persistent [`Journal`] over a SQL connection (SQLite in the client,
/// anything sqlx `Any` speaks in tests).
pub struct SqliteJournal {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqliteJournal {
    /// Open (or create) the journal at `connection_string`, e.g.
    /// `sqlite:///var/lib/app/journal.db?mode=rwc`. Startup-mode retry:
    /// fails fast when the path or credentials are wrong.
    pub async fn new(connection_string: &str) -> Result<Self, JournalError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("journal_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(5)
                .acquire_timeout(Duration::from_secs(10))
                .connect(connection_string)
                .await
                .map_err(|e| JournalError::Backend(e.to_string()))
        })
        .await?;

        let journal = Self { pool, is_sqlite };

        if is_sqlite {
            journal.enable_wal_mode().await?;
        }

        journal.init_schema().await?;
        info!(backend = connection_string.split(':').next().unwrap_or("sql"), "journal opened");
        Ok(journal)
    }

    /// WAL mode: readers don't block the coordinator's status updates,
    /// and a single fsync per commit keeps `record` latency bounded.
    async fn enable_wal_mode(&self) -> Result<(), JournalError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| JournalError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| JournalError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    async fn init_schema(&self) -> Result<(), JournalError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS pending_events (
                temporary_id VARCHAR(128) PRIMARY KEY,
                event_type VARCHAR(64) NOT NULL,
                payload TEXT NOT NULL,
                created_at BIGINT NOT NULL,
                attempt_count BIGINT NOT NULL DEFAULT 0,
                status VARCHAR(16) NOT NULL DEFAULT 'pending',
                error TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS device_metadata (
                singleton_id BIGINT PRIMARY KEY,
                device_id VARCHAR(128) NOT NULL,
                last_sync_time BIGINT,
                platform VARCHAR(32) NOT NULL,
                client_version VARCHAR(32) NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS reference_cache (
                id VARCHAR(128) PRIMARY KEY,
                kind VARCHAR(64) NOT NULL,
                payload TEXT NOT NULL,
                updated_at BIGINT NOT NULL,
                refreshed_at BIGINT NOT NULL
            )
            "#,
        ];

        for sql in statements {
            retry("journal_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| JournalError::Backend(e.to_string()))
            })
            .await?;
        }

        Ok(())
    }

    fn row_to_event(row: &sqlx::any::AnyRow) -> Result<OfflineEvent, JournalError> {
        let temporary_id = text_column(row, "temporary_id")
            .ok_or_else(|| JournalError::Backend("missing temporary_id column".into()))?;
        let event_type = text_column(row, "event_type").unwrap_or_default();
        let payload_text = text_column(row, "payload").unwrap_or_else(|| "null".into());
        let payload = serde_json::from_str(&payload_text)?;
        let created_at: i64 = row.try_get("created_at").unwrap_or(0);
        let attempt_count: i64 = row.try_get("attempt_count").unwrap_or(0);
        let status =
            EventStatus::from_str_lossy(&text_column(row, "status").unwrap_or_default());
        let error = text_column(row, "error");

        Ok(OfflineEvent {
            temporary_id,
            event_type,
            payload,
            created_at,
            attempt_count: attempt_count as u32,
            status,
            error,
        })
    }

    async fn fetch_events(&self, sql: &str, max_attempts: u32) -> Result<Vec<OfflineEvent>, JournalError> {
        let rows = retry("journal_list", &RetryConfig::query(), || async {
            sqlx::query(sql)
                .bind(max_attempts as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| JournalError::Backend(e.to_string()))
        })
        .await?;

        rows.iter().map(Self::row_to_event).collect()
    }
}

#[async_trait]
impl Journal for SqliteJournal {
    async fn record(&self, event: &OfflineEvent) -> Result<(), JournalError> {
        let payload = serde_json::to_string(&event.payload)?;

        retry("journal_record", &RetryConfig::query(), || async {
            sqlx::query(
                "INSERT INTO pending_events \
                 (temporary_id, event_type, payload, created_at, attempt_count, status, error) \
                 VALUES (?, ?, ?, ?, ?, ?, NULL)",
            )
            .bind(&event.temporary_id)
            .bind(&event.event_type)
            .bind(&payload)
            .bind(event.created_at)
            .bind(event.attempt_count as i64)
            .bind(event.status.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| JournalError::Backend(e.to_string()))?;
            Ok::<(), JournalError>(())
        })
        .await?;

        debug!(temporary_id = %event.temporary_id, event_type = %event.event_type, "event journaled");
        Ok(())
    }

    async fn list_pending(&self, max_attempts: u32) -> Result<Vec<OfflineEvent>, JournalError> {
        self.fetch_events(
            "SELECT temporary_id, event_type, payload, created_at, attempt_count, status, error \
             FROM pending_events \
             WHERE status = 'pending' OR (status = 'failed' AND attempt_count < ?) \
             ORDER BY created_at ASC",
            max_attempts,
        )
        .await
    }

    async fn list_dead(&self, max_attempts: u32) -> Result<Vec<OfflineEvent>, JournalError> {
        self.fetch_events(
            "SELECT temporary_id, event_type, payload, created_at, attempt_count, status, error \
             FROM pending_events \
             WHERE status = 'failed' AND attempt_count >= ? \
             ORDER BY created_at ASC",
            max_attempts,
        )
        .await
    }

    async fn count_pending(&self) -> Result<u64, JournalError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM pending_events WHERE status != 'synced'")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| JournalError::Backend(e.to_string()))?;

        let count: i64 = row
            .try_get("cnt")
            .map_err(|e| JournalError::Backend(e.to_string()))?;
        Ok(count as u64)
    }

    async fn mark_synced(
        &self,
        temporary_id: &str,
        permanent_id: Option<&str>,
    ) -> Result<(), JournalError> {
        // Guarded by status: terminal entries stay terminal, and a confirm
        // for an already-purged entry matches zero rows without error.
        retry("journal_mark_synced", &RetryConfig::query(), || async {
            sqlx::query(
                "UPDATE pending_events SET status = 'synced', error = NULL \
                 WHERE temporary_id = ? AND status != 'synced'",
            )
            .bind(temporary_id)
            .execute(&self.pool)
            .await
            .map_err(|e| JournalError::Backend(e.to_string()))?;
            Ok::<(), JournalError>(())
        })
        .await?;

        debug!(temporary_id, permanent_id = permanent_id.unwrap_or("-"), "journal entry synced");
        Ok(())
    }

    async fn mark_failed(&self, temporary_id: &str, error: &str) -> Result<(), JournalError> {
        retry("journal_mark_failed", &RetryConfig::query(), || async {
            sqlx::query(
                "UPDATE pending_events \
                 SET status = 'failed', attempt_count = attempt_count + 1, error = ? \
                 WHERE temporary_id = ? AND status != 'synced'",
            )
            .bind(error)
            .bind(temporary_id)
            .execute(&self.pool)
            .await
            .map_err(|e| JournalError::Backend(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn purge_synced(&self) -> Result<u64, JournalError> {
        let result = retry("journal_purge", &RetryConfig::query(), || async {
            sqlx::query("DELETE FROM pending_events WHERE status = 'synced'")
                .execute(&self.pool)
                .await
                .map_err(|e| JournalError::Backend(e.to_string()))
        })
        .await?;

        Ok(result.rows_affected())
    }

    async fn device(
        &self,
        platform: &str,
        client_version: &str,
    ) -> Result<DeviceRecord, JournalError> {
        let row = sqlx::query(
            "SELECT device_id, last_sync_time, platform, client_version \
             FROM device_metadata WHERE singleton_id = 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| JournalError::Backend(e.to_string()))?;

        if let Some(row) = row {
            let device_id = text_column(&row, "device_id")
                .ok_or_else(|| JournalError::Backend("missing device_id column".into()))?;
            let last_sync_time: Option<i64> = row.try_get("last_sync_time").ok();
            return Ok(DeviceRecord {
                device_id,
                last_sync_time,
                platform: text_column(&row, "platform").unwrap_or_default(),
                client_version: text_column(&row, "client_version").unwrap_or_default(),
            });
        }

        let device = DeviceRecord::generate(platform, client_version);
        sqlx::query(
            "INSERT INTO device_metadata \
             (singleton_id, device_id, last_sync_time, platform, client_version) \
             VALUES (1, ?, NULL, ?, ?)",
        )
        .bind(&device.device_id)
        .bind(&device.platform)
        .bind(&device.client_version)
        .execute(&self.pool)
        .await
        .map_err(|e| JournalError::Backend(e.to_string()))?;

        info!(device_id = %device.device_id, "device record created");
        Ok(device)
    }

    async fn set_last_sync_time(&self, server_time: i64) -> Result<(), JournalError> {
        retry("journal_set_last_sync", &RetryConfig::query(), || async {
            sqlx::query("UPDATE device_metadata SET last_sync_time = ? WHERE singleton_id = 1")
                .bind(server_time)
                .execute(&self.pool)
                .await
                .map_err(|e| JournalError::Backend(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn merge_reference(&self, items: &[ReferenceItem]) -> Result<(), JournalError> {
        let sql = if self.is_sqlite {
            "INSERT INTO reference_cache (id, kind, payload, updated_at, refreshed_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
                kind = excluded.kind, \
                payload = excluded.payload, \
                updated_at = excluded.updated_at, \
                refreshed_at = excluded.refreshed_at"
        } else {
            "INSERT INTO reference_cache (id, kind, payload, updated_at, refreshed_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE \
                kind = VALUES(kind), \
                payload = VALUES(payload), \
                updated_at = VALUES(updated_at), \
                refreshed_at = VALUES(refreshed_at)"
        };

        let refreshed_at = now_millis();
        for item in items {
            let payload = serde_json::to_string(&item.payload)?;
            retry("journal_merge_reference", &RetryConfig::query(), || async {
                sqlx::query(sql)
                    .bind(&item.id)
                    .bind(&item.kind)
                    .bind(&payload)
                    .bind(item.updated_at)
                    .bind(refreshed_at)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| JournalError::Backend(e.to_string()))?;
                Ok::<(), JournalError>(())
            })
            .await?;
        }

        Ok(())
    }

    async fn cached_reference(
        &self,
        kind: Option<&str>,
    ) -> Result<Vec<ReferenceItem>, JournalError> {
        let rows = match kind {
            Some(kind) => {
                sqlx::query(
                    "SELECT id, kind, payload, updated_at FROM reference_cache \
                     WHERE kind = ? ORDER BY id",
                )
                .bind(kind)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query("SELECT id, kind, payload, updated_at FROM reference_cache ORDER BY id")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(|e| JournalError::Backend(e.to_string()))?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let id = text_column(&row, "id")
                .ok_or_else(|| JournalError::Backend("missing id column".into()))?;
            let payload_text = text_column(&row, "payload").unwrap_or_else(|| "null".into());
            items.push(ReferenceItem {
                id,
                kind: text_column(&row, "kind").unwrap_or_default(),
                payload: serde_json::from_str(&payload_text)?,
                updated_at: row.try_get("updated_at").unwrap_or(0),
            });
        }

        Ok(items)
    }
}
