// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL relational store.
//!
//! Authoritative side of the dual-store split. Schema:
//! ```sql
//! CREATE TABLE owners (id BIGINT PRIMARY KEY, name, updated_at);
//! CREATE TABLE processed_events (
//!   device_id, temporary_id,        -- composite PK = idempotency key
//!   state,                          -- in_flight | done
//!   success, permanent_id, error_message, processed_at,
//!   PRIMARY KEY (device_id, temporary_id)
//! );
//! CREATE TABLE sync_devices (device_id, owner_id, last_sync_time, PRIMARY KEY (device_id, owner_id));
//! CREATE TABLE reference_data (id PRIMARY KEY, kind, payload, owner_id, updated_at);
//! ```
//!
//! The idempotency claim is a conflict-ignoring INSERT on the composite
//! primary key: whoever's insert takes effect applies the event, every
//! other submission of the same pair reads back the recorded outcome.
//! No read-then-write, so concurrent duplicates from a retrying device
//! cannot double-apply.

use async_trait::async_trait;
use sqlx::{any::AnyPoolOptions, AnyPool, Row};
use std::sync::Once;
use std::time::Duration;
use tracing::info;

use super::{EventClaim, RelationalStore, StoreError};
use crate::protocol::{ProcessedEvent, ReferenceItem};
use crate::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

fn text_column(row: &sqlx::any::AnyRow, name: &str) -> Option<String> {
    row.try_get::<String, _>(name).ok().or_else(|| {
        row.try_get::<Vec<u8>, _>(name)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    })
}

pub struct SqlRelationalStore {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlRelationalStore {
    /// Connect with startup-mode retry and create the schema if absent.
    pub async fn new(connection_string: &str) -> Result<Self, StoreError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("relational_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(20)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))
        })
        .await?;

        let store = Self { pool, is_sqlite };

        if is_sqlite {
            store.enable_wal_mode().await?;
        }

        store.init_schema().await?;
        info!("relational store connected");
        Ok(store)
    }

    /// Get a clone of the connection pool for sharing with other components.
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    async fn enable_wal_mode(&self) -> Result<(), StoreError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS owners (
                id BIGINT PRIMARY KEY,
                name VARCHAR(255) NOT NULL,
                updated_at BIGINT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS processed_events (
                device_id VARCHAR(128) NOT NULL,
                temporary_id VARCHAR(128) NOT NULL,
                state VARCHAR(16) NOT NULL DEFAULT 'in_flight',
                success BIGINT,
                permanent_id VARCHAR(128),
                error_message TEXT,
                processed_at BIGINT,
                PRIMARY KEY (device_id, temporary_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS sync_devices (
                device_id VARCHAR(128) NOT NULL,
                owner_id BIGINT NOT NULL,
                last_sync_time BIGINT NOT NULL,
                PRIMARY KEY (device_id, owner_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS reference_data (
                id VARCHAR(128) PRIMARY KEY,
                kind VARCHAR(64) NOT NULL,
                payload TEXT NOT NULL,
                owner_id BIGINT,
                updated_at BIGINT NOT NULL
            )
            "#,
        ];

        for sql in statements {
            retry("relational_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| StoreError::Backend(e.to_string()))
            })
            .await?;
        }

        Ok(())
    }

    /// Create or replace an owner row.
    pub async fn put_owner(&self, owner_id: i64, name: &str) -> Result<(), StoreError> {
        let sql = if self.is_sqlite {
            "INSERT INTO owners (id, name, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, updated_at = excluded.updated_at"
        } else {
            "INSERT INTO owners (id, name, updated_at) VALUES (?, ?, ?) \
             ON DUPLICATE KEY UPDATE name = VALUES(name), updated_at = VALUES(updated_at)"
        };

        let now = crate::event::now_millis();
        retry("relational_put_owner", &RetryConfig::query(), || async {
            sqlx::query(sql)
                .bind(owner_id)
                .bind(name)
                .bind(now)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            Ok(())
        })
        .await
    }

    /// Delete an owner row. Callers run the orphan sweep afterwards.
    pub async fn delete_owner(&self, owner_id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM owners WHERE id = ?")
            .bind(owner_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }

    /// Insert or replace a reference row. `owner_scope: None` means
    /// visible to every owner.
    pub async fn put_reference(
        &self,
        owner_scope: Option<i64>,
        item: &ReferenceItem,
    ) -> Result<(), StoreError> {
        let sql = if self.is_sqlite {
            "INSERT INTO reference_data (id, kind, payload, owner_id, updated_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
                kind = excluded.kind, \
                payload = excluded.payload, \
                owner_id = excluded.owner_id, \
                updated_at = excluded.updated_at"
        } else {
            "INSERT INTO reference_data (id, kind, payload, owner_id, updated_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE \
                kind = VALUES(kind), \
                payload = VALUES(payload), \
                owner_id = VALUES(owner_id), \
                updated_at = VALUES(updated_at)"
        };

        let payload = serde_json::to_string(&item.payload)?;
        retry("relational_put_reference", &RetryConfig::query(), || async {
            sqlx::query(sql)
                .bind(&item.id)
                .bind(&item.kind)
                .bind(&payload)
                .bind(owner_scope)
                .bind(item.updated_at)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl RelationalStore for SqlRelationalStore {
    async fn owner_exists(&self, owner_id: i64) -> Result<bool, StoreError> {
        retry("relational_owner_exists", &RetryConfig::query(), || async {
            let row = sqlx::query("SELECT 1 FROM owners WHERE id = ? LIMIT 1")
                .bind(owner_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            Ok(row.is_some())
        })
        .await
    }

    async fn claim_event(
        &self,
        device_id: &str,
        temporary_id: &str,
    ) -> Result<EventClaim, StoreError> {
        let insert = if self.is_sqlite {
            "INSERT INTO processed_events (device_id, temporary_id, state) \
             VALUES (?, ?, 'in_flight') \
             ON CONFLICT(device_id, temporary_id) DO NOTHING"
        } else {
            "INSERT IGNORE INTO processed_events (device_id, temporary_id, state) \
             VALUES (?, ?, 'in_flight')"
        };

        let result = sqlx::query(insert)
            .bind(device_id)
            .bind(temporary_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        if result.rows_affected() > 0 {
            return Ok(EventClaim::Fresh);
        }

        // Lost the insert: the pair exists, read back its state
        let row = sqlx::query(
            "SELECT state, success, permanent_id, error_message, processed_at \
             FROM processed_events WHERE device_id = ? AND temporary_id = ?",
        )
        .bind(device_id)
        .bind(temporary_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        let state = text_column(&row, "state").unwrap_or_default();
        if state != "done" {
            return Ok(EventClaim::InFlight);
        }

        let success: i64 = row.try_get("success").unwrap_or(0);
        Ok(EventClaim::Replayed(ProcessedEvent {
            temporary_id: temporary_id.to_string(),
            success: success != 0,
            permanent_id: text_column(&row, "permanent_id"),
            error_message: text_column(&row, "error_message"),
            processed_at: row.try_get("processed_at").unwrap_or(0),
        }))
    }

    async fn complete_event(
        &self,
        device_id: &str,
        outcome: &ProcessedEvent,
    ) -> Result<(), StoreError> {
        retry("relational_complete_event", &RetryConfig::query(), || async {
            sqlx::query(
                "UPDATE processed_events \
                 SET state = 'done', success = ?, permanent_id = ?, error_message = ?, processed_at = ? \
                 WHERE device_id = ? AND temporary_id = ?",
            )
            .bind(outcome.success as i64)
            .bind(&outcome.permanent_id)
            .bind(&outcome.error_message)
            .bind(outcome.processed_at)
            .bind(device_id)
            .bind(&outcome.temporary_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn register_device_sync(
        &self,
        device_id: &str,
        owner_id: i64,
        server_time: i64,
    ) -> Result<(), StoreError> {
        let sql = if self.is_sqlite {
            "INSERT INTO sync_devices (device_id, owner_id, last_sync_time) VALUES (?, ?, ?) \
             ON CONFLICT(device_id, owner_id) DO UPDATE SET last_sync_time = excluded.last_sync_time"
        } else {
            "INSERT INTO sync_devices (device_id, owner_id, last_sync_time) VALUES (?, ?, ?) \
             ON DUPLICATE KEY UPDATE last_sync_time = VALUES(last_sync_time)"
        };

        retry("relational_register_device", &RetryConfig::query(), || async {
            sqlx::query(sql)
                .bind(device_id)
                .bind(owner_id)
                .bind(server_time)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn reference_changed_since(
        &self,
        owner_id: i64,
        since: i64,
    ) -> Result<Vec<ReferenceItem>, StoreError> {
        let rows = retry("relational_reference_delta", &RetryConfig::query(), || async {
            sqlx::query(
                "SELECT id, kind, payload, updated_at FROM reference_data \
                 WHERE updated_at > ? AND (owner_id IS NULL OR owner_id = ?) \
                 ORDER BY id",
            )
            .bind(since)
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))
        })
        .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let id = text_column(&row, "id")
                .ok_or_else(|| StoreError::Backend("missing id column".into()))?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::now_millis;
    use serde_json::json;
    use tempfile::TempDir;

    async fn open_store(dir: &TempDir) -> SqlRelationalStore {
        let path = dir.path().join("relational.db");
        let url = format!("sqlite://{}?mode=rwc", path.display());
        SqlRelationalStore::new(&url).await.unwrap()
    }

    #[tokio::test]
    async fn test_owner_lifecycle() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        assert!(!store.owner_exists(1).await.unwrap());
        store.put_owner(1, "alice").await.unwrap();
        assert!(store.owner_exists(1).await.unwrap());
        assert!(store.delete_owner(1).await.unwrap());
        assert!(!store.owner_exists(1).await.unwrap());
    }

    #[tokio::test]
    async fn test_claim_then_complete_then_replay() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        assert!(matches!(
            store.claim_event("dev-1", "t-1").await.unwrap(),
            EventClaim::Fresh
        ));
        assert!(matches!(
            store.claim_event("dev-1", "t-1").await.unwrap(),
            EventClaim::InFlight
        ));

        let outcome = ProcessedEvent {
            temporary_id: "t-1".into(),
            success: true,
            permanent_id: Some("p-42".into()),
            error_message: None,
            processed_at: now_millis(),
        };
        store.complete_event("dev-1", &outcome).await.unwrap();

        match store.claim_event("dev-1", "t-1").await.unwrap() {
            EventClaim::Replayed(prior) => {
                assert!(prior.success);
                assert_eq!(prior.permanent_id.as_deref(), Some("p-42"));
            }
            other => panic!("expected replayed outcome, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_outcome_replays_failed() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        store.claim_event("dev-1", "t-bad").await.unwrap();
        let outcome = ProcessedEvent {
            temporary_id: "t-bad".into(),
            success: false,
            permanent_id: None,
            error_message: Some("validation rejected".into()),
            processed_at: now_millis(),
        };
        store.complete_event("dev-1", &outcome).await.unwrap();

        match store.claim_event("dev-1", "t-bad").await.unwrap() {
            EventClaim::Replayed(prior) => {
                assert!(!prior.success);
                assert_eq!(prior.error_message.as_deref(), Some("validation rejected"));
            }
            other => panic!("expected replayed outcome, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_device_registry_upsert() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        store.register_device_sync("dev-1", 7, 100).await.unwrap();
        store.register_device_sync("dev-1", 7, 200).await.unwrap();

        let row = sqlx::query("SELECT last_sync_time FROM sync_devices WHERE device_id = ?")
            .bind("dev-1")
            .fetch_one(&store.pool())
            .await
            .unwrap();
        let last: i64 = row.try_get("last_sync_time").unwrap();
        assert_eq!(last, 200);
    }

    #[tokio::test]
    async fn test_reference_delta_scoped() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let item = |id: &str, updated_at: i64| ReferenceItem {
            id: id.into(),
            kind: "space".into(),
            payload: json!({"id": id}),
            updated_at,
        };

        store.put_reference(None, &item("global", 100)).await.unwrap();
        store.put_reference(Some(1), &item("mine", 100)).await.unwrap();
        store.put_reference(Some(2), &item("theirs", 100)).await.unwrap();
        store.put_reference(None, &item("stale", 10)).await.unwrap();

        let delta = store.reference_changed_since(1, 50).await.unwrap();
        let ids: Vec<&str> = delta.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["global", "mine"]);

        assert_eq!(store.reference_changed_since(1, 0).await.unwrap().len(), 3);
    }
}
