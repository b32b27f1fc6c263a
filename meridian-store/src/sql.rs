//! SQL-backed [`EntityStore`] over `sqlx`'s database-agnostic `Any` driver.
//!
//! One physical table, `entities`, backs every reconciled kind (`instance`,
//! `job`, `run`, `fleet`, ...), discriminated by the `kind` column — the SQL
//! analogue of `meridian-core`'s typed-id-per-kind approach, and what lets a
//! single generic `impl<T: Entity> EntityStore<T> for SqlStore` serve all of
//! them instead of one handwritten DAO per entity. `fourthplaces-mntogether`
//! is the pack's only `sqlx` user; it targets Postgres exclusively, so the
//! portability shim here (via `sqlx::Any`) is new, grounded directly in
//! spec §6's "SQLite and a server-grade SQL store are both acceptable."
//!
//! ```sql
//! CREATE TABLE entities (
//!   kind             TEXT        NOT NULL,
//!   id               TEXT        NOT NULL,
//!   parent_id        TEXT        NULL,
//!   data             TEXT        NOT NULL, -- JSON-serialized entity
//!   version          BIGINT      NOT NULL DEFAULT 0,
//!   deleted          BOOLEAN     NOT NULL DEFAULT FALSE,
//!   last_processed_at TIMESTAMPTZ NULL,
//!   lease_owner      TEXT        NULL,
//!   lease_until      TIMESTAMPTZ NULL,
//!   PRIMARY KEY (kind, id)
//! );
//! CREATE INDEX entities_lease_idx ON entities (kind, last_processed_at);
//! CREATE INDEX entities_parent_idx ON entities (kind, parent_id);
//! ```

use crate::entity::Entity;
use crate::error::{StoreError, StoreResult};
use crate::EntityStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::any::{install_default_drivers, AnyKind, AnyPoolOptions};
use sqlx::{AnyPool, Row};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbKind {
    Postgres,
    Sqlite,
}

/// A SQL-backed store. Safe to clone and share across reconciler tasks; the
/// underlying `AnyPool` already pools connections.
pub struct SqlStore {
    pool: AnyPool,
    kind: DbKind,
    node_id: String,
    /// SQLite has no `SELECT ... FOR UPDATE SKIP LOCKED`; a single advisory
    /// mutex gives the same "lease batches don't race" guarantee for the
    /// single-writer case spec §6 carves out for SQLite deployments.
    sqlite_lease_guard: Mutex<()>,
}

impl SqlStore {
    pub async fn connect(url: &str, node_id: impl Into<String>) -> StoreResult<Self> {
        install_default_drivers();
        let pool = AnyPoolOptions::new().max_connections(16).connect(url).await?;
        let kind = match pool.any_kind() {
            AnyKind::Postgres => DbKind::Postgres,
            AnyKind::Sqlite => DbKind::Sqlite,
            #[allow(unreachable_patterns)]
            other => {
                return Err(StoreError::InvalidId(format!("unsupported driver {other:?}")));
            }
        };
        Ok(Self {
            pool,
            kind,
            node_id: node_id.into(),
            sqlite_lease_guard: Mutex::new(()),
        })
    }

    fn row_to_entity<T: Entity>(row: &sqlx::any::AnyRow) -> StoreResult<(T, i64)> {
        let data: String = row.try_get("data")?;
        let version: i64 = row.try_get("version")?;
        Ok((serde_json::from_str(&data)?, version))
    }
}

#[async_trait]
impl<T: Entity> EntityStore<T> for SqlStore {
    async fn lease_batch(
        &self,
        stale_before: DateTime<Utc>,
        lease_ttl: chrono::Duration,
        limit: usize,
    ) -> StoreResult<Vec<T>> {
        // SQLite serializes writers itself; Postgres gets real row-level
        // concurrency via `FOR UPDATE SKIP LOCKED`, so only SQLite needs the
        // extra application-level mutex.
        let _sqlite_guard = match self.kind {
            DbKind::Sqlite => Some(self.sqlite_lease_guard.lock().await),
            DbKind::Postgres => None,
        };

        let mut tx = self.pool.begin().await?;
        let select_sql = match self.kind {
            DbKind::Postgres => {
                "SELECT id, data, version FROM entities \
                 WHERE kind = ? AND deleted = false \
                   AND (last_processed_at IS NULL OR last_processed_at < ?) \
                   AND (lease_until IS NULL OR lease_until < ?) \
                 ORDER BY last_processed_at ASC NULLS FIRST \
                 LIMIT ? FOR UPDATE SKIP LOCKED"
            }
            DbKind::Sqlite => {
                "SELECT id, data, version FROM entities \
                 WHERE kind = ? AND deleted = 0 \
                   AND (last_processed_at IS NULL OR last_processed_at < ?) \
                   AND (lease_until IS NULL OR lease_until < ?) \
                 ORDER BY last_processed_at IS NOT NULL, last_processed_at ASC \
                 LIMIT ?"
            }
        };
        let now = Utc::now();
        let rows = sqlx::query(select_sql)
            .bind(T::KIND)
            .bind(stale_before)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&mut *tx)
            .await?;

        let mut leased = Vec::with_capacity(rows.len());
        let lease_until = now + lease_ttl;
        for row in &rows {
            let (entity, _version): (T, i64) = Self::row_to_entity(row)?;
            let id: String = row.try_get("id")?;
            sqlx::query(
                "UPDATE entities SET lease_owner = ?, lease_until = ? WHERE kind = ? AND id = ?",
            )
            .bind(&self.node_id)
            .bind(lease_until)
            .bind(T::KIND)
            .bind(&id)
            .execute(&mut *tx)
            .await?;
            leased.push(entity);
        }
        tx.commit().await?;
        Ok(leased)
    }

    async fn load_by_id(&self, id: T::Id) -> StoreResult<Option<T>> {
        let row = sqlx::query("SELECT data, version FROM entities WHERE kind = ? AND id = ?")
            .bind(T::KIND)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::row_to_entity(&r).map(|(entity, _)| entity))
            .transpose()
    }

    async fn list_by_parent(&self, parent_id: &str) -> StoreResult<Vec<T>> {
        let rows = sqlx::query(
            "SELECT data, version FROM entities WHERE kind = ? AND parent_id = ? AND deleted = false",
        )
        .bind(T::KIND)
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| Self::row_to_entity(r).map(|(entity, _)| entity))
            .collect()
    }

    async fn list_all(&self) -> StoreResult<Vec<T>> {
        let rows = sqlx::query("SELECT data, version FROM entities WHERE kind = ? AND deleted = false")
            .bind(T::KIND)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| Self::row_to_entity(r).map(|(entity, _)| entity))
            .collect()
    }

    async fn update(&self, entity: &mut T, now: DateTime<Utc>) -> StoreResult<()> {
        let expected_version = entity.version();
        entity.set_last_processed_at(now);
        entity.set_version(expected_version + 1);
        let data = serde_json::to_string(entity)?;
        let result = sqlx::query(
            "UPDATE entities \
             SET data = ?, version = ?, last_processed_at = ?, deleted = ?, lease_owner = NULL, lease_until = NULL \
             WHERE kind = ? AND id = ? AND version = ?",
        )
        .bind(&data)
        .bind(expected_version + 1)
        .bind(now)
        .bind(entity.is_deleted())
        .bind(T::KIND)
        .bind(entity.id().to_string())
        .bind(expected_version)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            entity.set_version(expected_version);
            return Err(StoreError::VersionConflict);
        }
        Ok(())
    }

    async fn insert(&self, entity: &T) -> StoreResult<()> {
        let data = serde_json::to_string(entity)?;
        sqlx::query(
            "INSERT INTO entities (kind, id, parent_id, data, version, deleted, last_processed_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(T::KIND)
        .bind(entity.id().to_string())
        .bind(entity.parent_id())
        .bind(&data)
        .bind(entity.version())
        .bind(entity.is_deleted())
        .bind(entity.last_processed_at())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release_lease(&self, id: T::Id) -> StoreResult<()> {
        sqlx::query("UPDATE entities SET lease_owner = NULL, lease_until = NULL WHERE kind = ? AND id = ?")
            .bind(T::KIND)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
