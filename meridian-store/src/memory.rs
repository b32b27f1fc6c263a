//! In-memory [`EntityStore`] test double, mirroring the real `SqlStore`'s
//! lease/version semantics without a database. Used by the reconciler test
//! suites in `meridian-runtime` for the concrete scenarios in spec §8.

use crate::entity::Entity;
use crate::error::{StoreError, StoreResult};
use crate::EntityStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

struct Row<T> {
    entity: T,
    lease_until: Option<DateTime<Utc>>,
}

/// Keyed by `T::Id.to_string()` since `Entity::Id` isn't required to be
/// `Hash` the same way across kinds but is always displayable.
pub struct MemoryStore<T> {
    rows: Mutex<HashMap<String, Row<T>>>,
}

impl<T> Default for MemoryStore<T> {
    fn default() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Entity> MemoryStore<T> {
    pub fn insert_sync(&self, entity: T) {
        let mut rows = self.rows.lock().expect("MemoryStore mutex poisoned");
        rows.insert(
            entity.id().to_string(),
            Row {
                entity,
                lease_until: None,
            },
        );
    }

    pub fn get_sync(&self, id: T::Id) -> Option<T>
    where
        T: Clone,
    {
        let rows = self.rows.lock().expect("MemoryStore mutex poisoned");
        rows.get(&id.to_string()).map(|r| r.entity.clone())
    }

    pub fn all_sync(&self) -> Vec<T>
    where
        T: Clone,
    {
        let rows = self.rows.lock().expect("MemoryStore mutex poisoned");
        rows.values().map(|r| r.entity.clone()).collect()
    }
}

#[async_trait]
impl<T: Entity + Clone> EntityStore<T> for MemoryStore<T> {
    async fn lease_batch(
        &self,
        stale_before: DateTime<Utc>,
        lease_ttl: chrono::Duration,
        limit: usize,
    ) -> StoreResult<Vec<T>> {
        let now = Utc::now();
        let mut rows = self.rows.lock().expect("MemoryStore mutex poisoned");
        let mut leased = Vec::new();
        for row in rows.values_mut() {
            if leased.len() >= limit {
                break;
            }
            if row.entity.is_deleted() {
                continue;
            }
            let is_leased = row.lease_until.is_some_and(|until| until > now);
            if is_leased {
                continue;
            }
            let is_stale = row.entity.last_processed_at().is_none_or(|at| at < stale_before);
            if !is_stale {
                continue;
            }
            row.lease_until = Some(now + lease_ttl);
            leased.push(row.entity.clone());
        }
        Ok(leased)
    }

    async fn load_by_id(&self, id: T::Id) -> StoreResult<Option<T>> {
        let rows = self.rows.lock().expect("MemoryStore mutex poisoned");
        Ok(rows.get(&id.to_string()).map(|r| r.entity.clone()))
    }

    async fn list_by_parent(&self, parent_id: &str) -> StoreResult<Vec<T>> {
        let rows = self.rows.lock().expect("MemoryStore mutex poisoned");
        Ok(rows
            .values()
            .filter(|r| !r.entity.is_deleted() && r.entity.parent_id().as_deref() == Some(parent_id))
            .map(|r| r.entity.clone())
            .collect())
    }

    async fn list_all(&self) -> StoreResult<Vec<T>> {
        let rows = self.rows.lock().expect("MemoryStore mutex poisoned");
        Ok(rows
            .values()
            .filter(|r| !r.entity.is_deleted())
            .map(|r| r.entity.clone())
            .collect())
    }

    async fn update(&self, entity: &mut T, now: DateTime<Utc>) -> StoreResult<()> {
        let mut rows = self.rows.lock().expect("MemoryStore mutex poisoned");
        let key = entity.id().to_string();
        let expected_version = entity.version();
        match rows.get(&key) {
            Some(existing) if existing.entity.version() != expected_version => {
                return Err(StoreError::VersionConflict)
            }
            None => return Err(StoreError::NotFound),
            Some(_) => {}
        }
        entity.set_last_processed_at(now);
        entity.set_version(expected_version + 1);
        rows.insert(
            key,
            Row {
                entity: entity.clone(),
                lease_until: None,
            },
        );
        Ok(())
    }

    async fn insert(&self, entity: &T) -> StoreResult<()> {
        let mut rows = self.rows.lock().expect("MemoryStore mutex poisoned");
        rows.insert(
            entity.id().to_string(),
            Row {
                entity: entity.clone(),
                lease_until: None,
            },
        );
        Ok(())
    }

    async fn release_lease(&self, id: T::Id) -> StoreResult<()> {
        let mut rows = self.rows.lock().expect("MemoryStore mutex poisoned");
        if let Some(row) = rows.get_mut(&id.to_string()) {
            row.lease_until = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::entities::fleet::{Fleet, FleetSpec, FleetStatus, Placement, SshHostConfig};
    use meridian_core::entities::backend::BackendKind;
    use meridian_core::ids::{FleetId, PoolId, ProjectId};
    use meridian_core::requirements::{Range, ResourcesSpec, SpotPolicy};

    fn sample_fleet() -> Fleet {
        Fleet {
            id: FleetId::new(),
            project_id: ProjectId::new(),
            pool_id: PoolId::new(),
            name: "f".into(),
            spec: FleetSpec {
                nodes: Range { min: 1, max: Some(1) },
                placement: Placement::Any,
                resources: ResourcesSpec {
                    cpu_count: Range { min: 1, max: None },
                    memory_mib: Range { min: 1, max: None },
                    disk_mib: Range { min: 1, max: None },
                    gpu: None,
                },
                backends: vec![BackendKind::Aws],
                regions: vec![],
                spot_policy: SpotPolicy::OnDemand,
                max_price: None,
                idle_duration: None,
                reservation: None,
                ssh_hosts: Vec::<SshHostConfig>::new(),
            },
            status: FleetStatus::Submitted,
            status_message: None,
            placement_group_id: None,
            created_at: Utc::now(),
            deleted: false,
            last_processed_at: None,
            version: 0,
        }
    }

    #[tokio::test]
    async fn lease_then_update_round_trips_and_bumps_version() {
        let store: MemoryStore<Fleet> = MemoryStore::default();
        let fleet = sample_fleet();
        let id = fleet.id;
        store.insert(&fleet).await.unwrap();

        let mut leased = store
            .lease_batch(Utc::now() + chrono::Duration::seconds(1), chrono::Duration::minutes(1), 10)
            .await
            .unwrap();
        assert_eq!(leased.len(), 1);
        let mut entity = leased.remove(0);
        assert_eq!(entity.version, 0);
        store.update(&mut entity, Utc::now()).await.unwrap();
        assert_eq!(entity.version, 1);

        let reloaded = store.load_by_id(id).await.unwrap().unwrap();
        assert_eq!(reloaded.version, 1);
    }

    #[tokio::test]
    async fn update_with_stale_version_conflicts() {
        let store: MemoryStore<Fleet> = MemoryStore::default();
        let fleet = sample_fleet();
        store.insert(&fleet).await.unwrap();

        let mut stale_copy = fleet.clone();
        store.update(&mut stale_copy.clone(), Utc::now()).await.unwrap();
        let err = store.update(&mut stale_copy, Utc::now()).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict));
    }

    #[tokio::test]
    async fn leased_row_is_not_leased_again_until_ttl_expires() {
        let store: MemoryStore<Fleet> = MemoryStore::default();
        store.insert(&sample_fleet()).await.unwrap();

        let first = store
            .lease_batch(Utc::now() + chrono::Duration::seconds(1), chrono::Duration::minutes(5), 10)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        let second = store
            .lease_batch(Utc::now() + chrono::Duration::seconds(1), chrono::Duration::minutes(5), 10)
            .await
            .unwrap();
        assert!(second.is_empty(), "row is still under an unexpired lease");
    }
}
