//! Process-wide periodic task runner (spec §4.1): registers `(name,
//! interval, batch_size, handler)` tuples and drives each forever, bounded
//! by a shared worker-count semaphore, until told to shut down.
//!
//! Where `kube_runtime::Controller`/`applier` is push-driven — a `Runner`
//! debounces `Stream` items keyed by object, backed by a `DelayQueue` — this
//! dispatcher is pull-driven: each task polls its store for stale rows on a
//! fixed `tokio::time::interval` and leases a batch via `SELECT ... FOR
//! UPDATE SKIP LOCKED`. The per-entity serialization the teacher gets from
//! `Runner`'s `FutureHashMap` (never two futures for the same key at once)
//! is provided here by the store-level lease instead of an in-process map.

use crate::context::ReconcileContext;
use crate::error::ReconcileError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use meridian_core::Clock;
use meridian_store::{Entity, EntityStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// A single registered handler invocation: `Ok(entity)` is written back
/// (bumping `last_processed_at`/`version`, clearing the lease); `Err` leaves
/// the lease to expire so the row is retried next tick (spec §4.1 step 5).
pub type HandlerFuture<T> = BoxFuture<'static, Result<T, ReconcileError>>;
pub type Handler<T> = Arc<dyn Fn(T, ReconcileContext) -> HandlerFuture<T> + Send + Sync>;

/// Registration for one reconciler loop.
pub struct TaskSchedule<T: Entity> {
    pub name: &'static str,
    pub interval: Duration,
    pub batch_size: usize,
    pub store: Arc<dyn EntityStore<T>>,
    pub handler: Handler<T>,
}

/// Object-safe handle the dispatcher drives; one per registered
/// [`TaskSchedule`], erasing its entity type `T`.
#[async_trait]
trait Task: Send + Sync {
    fn name(&self) -> &'static str;
    fn interval(&self) -> Duration;

    /// Leases up to `batch_size` stale rows and dispatches the handler over
    /// each concurrently, bounded by `semaphore` (spec §4.1 steps 1-4).
    async fn tick(&self, clock: Arc<dyn Clock>, ctx: ReconcileContext, semaphore: Arc<Semaphore>);
}

#[async_trait]
impl<T: Entity> Task for TaskSchedule<T> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn tick(&self, clock: Arc<dyn Clock>, ctx: ReconcileContext, semaphore: Arc<Semaphore>) {
        let now = clock.now();
        let stale_before = now - chrono::Duration::from_std(self.interval).unwrap_or(chrono::Duration::zero());
        let lease_ttl = chrono::Duration::from_std(self.interval)
            .unwrap_or(chrono::Duration::zero())
            * meridian_core::defaults::LEASE_TTL_MULTIPLIER as i32;

        let batch = match self.store.lease_batch(stale_before, lease_ttl, self.batch_size).await {
            Ok(batch) => batch,
            Err(err) => {
                tracing::error!(task = self.name, error = %err, "failed to lease batch");
                return;
            }
        };
        if batch.is_empty() {
            return;
        }

        let mut handles = Vec::with_capacity(batch.len());
        for entity in batch {
            let id = entity.id();
            let permit = semaphore.clone().acquire_owned().await.expect("semaphore never closed");
            let handler = self.handler.clone();
            let store = self.store.clone();
            let ctx = ctx.clone();
            let clock = clock.clone();
            let task_name = self.name;
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let span = tracing::info_span!("reconcile", task = task_name, entity.id = %id);
                let _enter = span.enter();
                match handler(entity, ctx).await {
                    Ok(mut updated) => {
                        if let Err(err) = store.update(&mut updated, clock.now()).await {
                            tracing::warn!(error = %err, "failed to commit reconciled entity, leaving lease to expire");
                            let _ = store.release_lease(id).await;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, terminal = err.is_terminal(), "reconcile tick failed, leaving entity for retry");
                        let _ = store.release_lease(id).await;
                    }
                }
            }));
        }
        futures::future::join_all(handles).await;
    }
}

/// The dispatcher itself: owns the registered tasks, the shared worker cap,
/// and the shutdown token. `run` never returns until `shutdown` is
/// cancelled, at which point in-flight handlers get `shutdown_grace` before
/// their leases are simply abandoned to expire naturally (spec §4.1, §5).
pub struct Dispatcher {
    tasks: Vec<Box<dyn Task>>,
    clock: Arc<dyn Clock>,
    context: ReconcileContext,
    worker_cap: usize,
    shutdown_grace: Duration,
}

impl Dispatcher {
    pub fn new(clock: Arc<dyn Clock>, context: ReconcileContext, worker_cap: usize) -> Self {
        Self {
            tasks: Vec::new(),
            clock,
            context,
            worker_cap,
            shutdown_grace: meridian_core::defaults::SHUTDOWN_GRACE,
        }
    }

    pub fn register<T: Entity>(&mut self, schedule: TaskSchedule<T>) {
        self.tasks.push(Box::new(schedule));
    }

    /// Runs every registered task forever, each on its own interval, until
    /// `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let semaphore = Arc::new(Semaphore::new(self.worker_cap));
        let mut handles = Vec::new();
        for task in self.tasks {
            let semaphore = semaphore.clone();
            let clock = self.clock.clone();
            let ctx = self.context.clone();
            let shutdown = shutdown.clone();
            let interval = task.interval();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            tracing::info!(task = task.name(), "stopping schedule, no new batches");
                            break;
                        }
                        _ = ticker.tick() => {
                            task.tick(clock.clone(), ctx.clone(), semaphore.clone()).await;
                        }
                    }
                }
            }));
        }

        shutdown.cancelled().await;
        let grace = tokio::time::sleep(self.shutdown_grace);
        tokio::select! {
            _ = futures::future::join_all(handles) => {}
            _ = grace => {
                tracing::warn!("shutdown grace period elapsed, abandoning in-flight leases");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::healthcheck::{HealthCheck, HealthCheckResult};
    use async_trait::async_trait as async_trait_attr;
    use meridian_backends::cache::OfferCache;
    use meridian_core::entities::backend::BackendKind;
    use meridian_core::entities::fleet::{Fleet, FleetSpec, FleetStatus, Placement, SshHostConfig};
    use meridian_core::entities::instance::Instance;
    use meridian_core::ids::{FleetId, PoolId, ProjectId};
    use meridian_core::requirements::{Range, ResourcesSpec, SpotPolicy};
    use meridian_core::TestClock;
    use meridian_store::MemoryStore;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NeverCheck;
    #[async_trait_attr]
    impl HealthCheck for NeverCheck {
        async fn check(&self, _instance: &Instance) -> HealthCheckResult {
            HealthCheckResult::healthy()
        }
    }

    fn test_context(clock: Arc<dyn Clock>) -> ReconcileContext {
        ReconcileContext {
            clock,
            backends: Arc::new(HashMap::new()),
            healthcheck: Arc::new(NeverCheck),
            offer_cache: Arc::new(OfferCache::new()),
        }
    }

    fn sample_fleet() -> Fleet {
        Fleet {
            id: FleetId::new(),
            project_id: ProjectId::new(),
            pool_id: PoolId::new(),
            name: "f".into(),
            spec: FleetSpec {
                nodes: Range { min: 0, max: Some(0) },
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
            created_at: chrono::Utc::now(),
            deleted: false,
            last_processed_at: None,
            version: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn tick_writes_back_a_handled_batch() {
        let clock = Arc::new(TestClock::at(chrono::Utc::now()));
        let ctx = test_context(clock.clone());
        let store: Arc<MemoryStore<Fleet>> = Arc::new(MemoryStore::default());
        store.insert_sync(sample_fleet());

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let schedule = TaskSchedule {
            name: "fleet",
            interval: Duration::from_secs(10),
            batch_size: 10,
            store: store.clone(),
            handler: Arc::new(move |mut fleet: Fleet, _ctx| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                fleet.status = FleetStatus::Active;
                Box::pin(async move { Ok(fleet) })
            }),
        };

        let task: Box<dyn Task> = Box::new(schedule);
        let semaphore = Arc::new(Semaphore::new(4));
        task.tick(clock.clone(), ctx, semaphore).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let all = store.all_sync();
        assert_eq!(all[0].status, FleetStatus::Active);
        assert_eq!(all[0].version, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_handler_leaves_entity_unleased_for_retry() {
        let clock = Arc::new(TestClock::at(chrono::Utc::now()));
        let ctx = test_context(clock.clone());
        let store: Arc<MemoryStore<Fleet>> = Arc::new(MemoryStore::default());
        store.insert_sync(sample_fleet());

        let schedule = TaskSchedule {
            name: "fleet",
            interval: Duration::from_secs(10),
            batch_size: 10,
            store: store.clone(),
            handler: Arc::new(|_fleet: Fleet, _ctx| {
                Box::pin(async move { Err(ReconcileError::Core(meridian_core::Error::Transient("boom".into()))) })
            }),
        };

        let task: Box<dyn Task> = Box::new(schedule);
        let semaphore = Arc::new(Semaphore::new(4));
        task.tick(clock.clone(), ctx.clone(), semaphore.clone()).await;

        // version unchanged, and the row is leasable again immediately.
        let all = store.all_sync();
        assert_eq!(all[0].version, 0);
        let leased = store
            .lease_batch(clock.now() + chrono::Duration::seconds(1), chrono::Duration::minutes(1), 10)
            .await
            .unwrap();
        assert_eq!(leased.len(), 1);
    }
}
