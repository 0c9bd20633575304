// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed instance store.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::{ImageStatus, InstanceStore, PersistedImage, StoreError};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// SQLite-backed [`InstanceStore`].
#[derive(Clone)]
pub struct SqliteInstanceStore {
    pool: SqlitePool,
}

impl SqliteInstanceStore {
    /// Create a store from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) a database file and run migrations.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let store = SqliteInstanceStore::from_path(".data/instances.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Database {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect(&url, 5).await
    }

    /// A private in-memory database. Uses a single connection so every query sees
    /// the same database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:", 1).await
    }

    async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| StoreError::Database {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {}: {}", url, e),
            })?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| StoreError::Database {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self { pool })
    }
}

fn parse_uuid(column: &str, raw: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(|e| StoreError::Database {
        operation: "decode".to_string(),
        details: format!("invalid uuid in {}: {}", column, e),
    })
}

#[async_trait]
impl InstanceStore for SqliteInstanceStore {
    async fn save(&self, image: &PersistedImage) -> Result<(), StoreError> {
        let snapshot = serde_json::to_string(&image.snapshot)?;
        sqlx::query(
            r#"
            INSERT INTO workflow_instances (instance_id, definition_identity, status, snapshot, saved_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(instance_id) DO UPDATE SET
                definition_identity = excluded.definition_identity,
                status = excluded.status,
                snapshot = excluded.snapshot,
                saved_at = excluded.saved_at
            "#,
        )
        .bind(image.instance_id.to_string())
        .bind(&image.definition_identity)
        .bind(image.status.as_str())
        .bind(snapshot)
        .bind(image.saved_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load(&self, instance_id: Uuid) -> Result<Option<PersistedImage>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT instance_id, definition_identity, status, snapshot, saved_at
            FROM workflow_instances
            WHERE instance_id = ?
            "#,
        )
        .bind(instance_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let raw_status: String = row.try_get("status")?;
        let status = ImageStatus::parse(&raw_status).ok_or_else(|| StoreError::Database {
            operation: "decode".to_string(),
            details: format!("unknown instance status '{}'", raw_status),
        })?;
        let raw_id: String = row.try_get("instance_id")?;
        let snapshot: String = row.try_get("snapshot")?;
        let saved_at: DateTime<Utc> = row.try_get("saved_at")?;

        Ok(Some(PersistedImage {
            instance_id: parse_uuid("instance_id", &raw_id)?,
            definition_identity: row.try_get("definition_identity")?,
            status,
            snapshot: serde_json::from_str(&snapshot)?,
            saved_at,
        }))
    }

    async fn associate_keys(&self, instance_id: Uuid, keys: &[Uuid]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for key in keys {
            let existing: Option<String> =
                sqlx::query_scalar("SELECT instance_id FROM instance_keys WHERE key = ?")
                    .bind(key.to_string())
                    .fetch_optional(&mut *tx)
                    .await?;
            if let Some(owner) = existing {
                let owner = parse_uuid("instance_keys.instance_id", &owner)?;
                if owner != instance_id {
                    return Err(StoreError::KeyConflict { key: *key, owner });
                }
                continue;
            }
            sqlx::query("INSERT INTO instance_keys (key, instance_id) VALUES (?, ?)")
                .bind(key.to_string())
                .bind(instance_id.to_string())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn disassociate_keys(&self, keys: &[Uuid]) -> Result<(), StoreError> {
        for key in keys {
            sqlx::query("DELETE FROM instance_keys WHERE key = ?")
                .bind(key.to_string())
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn lookup_key(&self, key: Uuid) -> Result<Option<Uuid>, StoreError> {
        let owner: Option<String> =
            sqlx::query_scalar("SELECT instance_id FROM instance_keys WHERE key = ?")
                .bind(key.to_string())
                .fetch_optional(&self.pool)
                .await?;
        owner
            .map(|raw| parse_uuid("instance_keys.instance_id", &raw))
            .transpose()
    }
}
