//! The subset of read/write operations the reconcilers need against the
//! relational store (spec §2, §6): lease a batch of stale rows, load one by
//! id, write it back with an optimistic version check, list by parent.
//!
//! One generic [`Store`] type serves every reconciled entity kind, the way
//! `kube_runtime::reflector::store::Store<K>` is generic over the Kubernetes
//! resource type `K` — except this `Store` owns writes and leases against a
//! SQL backend instead of caching watch events in memory. A [`MemoryStore`]
//! implementing the same [`EntityStore`] trait backs hermetic tests.

mod entity;
mod error;
mod memory;
mod sql;

pub use entity::Entity;
pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use sql::{DbKind, SqlStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Implemented by both the SQL-backed [`SqlStore`] and the in-memory
/// [`MemoryStore`] test double.
#[async_trait]
pub trait EntityStore<T: Entity>: Send + Sync {
    /// Selects up to `limit` entities whose `last_processed_at` is older than
    /// `stale_before` (or unset) and that are not currently leased, leasing
    /// each one (spec §4.1 steps 1-2).
    async fn lease_batch(&self, stale_before: DateTime<Utc>, lease_ttl: chrono::Duration, limit: usize) -> StoreResult<Vec<T>>;

    async fn load_by_id(&self, id: T::Id) -> StoreResult<Option<T>>;

    async fn list_by_parent(&self, parent_id: &str) -> StoreResult<Vec<T>>;

    /// Every non-deleted row of this kind, for queries the `(kind, parent_id)`
    /// index can't serve directly — e.g. the Job reconciler's placement scan
    /// for "idle instances in this project" (spec §4.3), which filters on
    /// `project_id` and `status`, neither of which is the store's parent key.
    /// Reconcilers are expected to filter the result further in memory;
    /// bounded by one project's/run's working set in practice.
    async fn list_all(&self) -> StoreResult<Vec<T>>;

    /// Writes `entity` back, bumping `last_processed_at = now` and clearing
    /// its lease, failing with [`StoreError::VersionConflict`] if the row's
    /// version moved since it was loaded (spec §4.1 step 4, §6).
    async fn update(&self, entity: &mut T, now: DateTime<Utc>) -> StoreResult<()>;

    /// Inserts a brand new row (e.g. a retried Job, a freshly-fanned-out
    /// Run's Jobs, a Fleet's newly-created pending Instances).
    async fn insert(&self, entity: &T) -> StoreResult<()>;

    /// Releases a lease without updating `last_processed_at`, used when a
    /// handler errors out and the row should be retried sooner than a full
    /// lease TTL (spec §4.1 step 5: "leave entity for retry").
    async fn release_lease(&self, id: T::Id) -> StoreResult<()>;
}
