//! Instance reconciler (spec §4.2): one state-table transition per lease.

use crate::context::ReconcileContext;
use crate::error::ReconcileError;
use chrono::Utc;
use meridian_backends::InstanceConfiguration;
use meridian_core::entities::backend::BackendKind;
use meridian_core::entities::instance::{resolve_total_blocks, BlocksSpec, Instance, InstanceStatus, TerminationPolicy};
use meridian_core::{defaults, Error};

fn provision_timeout() -> chrono::Duration {
    chrono::Duration::from_std(defaults::SHIM_GRACE).expect("constant fits")
}

/// Runs exactly one transition for `instance`, per the spec §4.2 table.
/// Mutates in place; returns `Err` only for faults that should leave the
/// lease to expire (store/backend trouble unrelated to the instance's own
/// status), never for expected business conditions — those are folded into
/// the instance's own `status`/`termination_reason` fields.
pub async fn reconcile(instance: &mut Instance, ctx: &ReconcileContext) -> Result<(), ReconcileError> {
    let now = ctx.clock.now();

    match instance.status {
        InstanceStatus::Pending => reconcile_pending(instance, ctx, now).await,
        InstanceStatus::Provisioning => reconcile_provisioning(instance, ctx, now).await,
        InstanceStatus::Idle => reconcile_idle(instance, ctx, now).await,
        InstanceStatus::Busy => reconcile_busy(instance, ctx, now).await,
        InstanceStatus::Terminating => reconcile_terminating(instance, ctx, now).await,
        InstanceStatus::Terminated => Ok(()),
    }
}

async fn reconcile_pending(
    instance: &mut Instance,
    ctx: &ReconcileContext,
    now: chrono::DateTime<Utc>,
) -> Result<(), ReconcileError> {
    if now - instance.created_at > provision_timeout_for_pending() {
        instance.status = InstanceStatus::Terminated;
        instance.termination_reason = Some("Provisioning timeout expired".into());
        instance.deleted = true;
        instance.deleted_at = Some(now);
        instance.finished_at = Some(now);
        return Ok(());
    }

    if instance.is_ssh_attached() {
        // "schedule deploy": flip to provisioning now, the deploy probe
        // itself runs on the next (provisioning) tick.
        instance.status = InstanceStatus::Provisioning;
        instance.started_at = Some(now);
        return Ok(());
    }

    let offer = instance.offer.clone().ok_or_else(|| {
        ReconcileError::Core(Error::Configuration(
            "pending cloud instance has no offer selected".into(),
        ))
    })?;
    let kind = instance
        .backend_kind
        .ok_or_else(|| ReconcileError::Core(Error::Configuration("pending instance has no backend_kind".into())))?;
    let backend = ctx
        .backend(kind)
        .ok_or_else(|| ReconcileError::Core(Error::Configuration(format!("no backend configured for {}", kind.as_str()))))?;

    let config = InstanceConfiguration {
        instance_name: instance.id.to_string(),
        user_ssh_key: String::new(),
        client_token: instance.id.to_string(),
    };
    match backend.create_instance(&offer, &config).await {
        Ok(provisioning_data) => {
            instance.job_provisioning_data = Some(provisioning_data);
            instance.status = InstanceStatus::Provisioning;
            instance.started_at = Some(now);
            Ok(())
        }
        Err(meridian_backends::BackendError::NoCapacity) => {
            // Stays `pending`: the fleet/job reconciler will notice and
            // pick a different offer on a later tick.
            instance.termination_reason = Some("No capacity available for the selected offer".into());
            Ok(())
        }
        Err(other) => Err(other.into()),
    }
}

/// Provisioning timeout for `pending` uses the same grace constant as the
/// provisioning-stage shim grace (spec names both "10 min"-scale windows
/// without distinguishing a separate constant for this row).
fn provision_timeout_for_pending() -> chrono::Duration {
    provision_timeout()
}

async fn reconcile_provisioning(
    instance: &mut Instance,
    ctx: &ReconcileContext,
    now: chrono::DateTime<Utc>,
) -> Result<(), ReconcileError> {
    if instance.is_ssh_attached() && instance.shared_info.total_blocks == 0 {
        let remote = instance
            .remote_connection_info
            .clone()
            .expect("is_ssh_attached implies Some");
        let backend = ctx
            .backend(BackendKind::Local)
            .ok_or_else(|| ReconcileError::Core(Error::Configuration("no local backend configured for SSH deploy".into())))?;
        match backend.deploy(&remote).await {
            Ok(host_info) => {
                let gpu_count = host_info.gpus.iter().map(|g| g.count).sum();
                let total_blocks = resolve_total_blocks(BlocksSpec::Auto, host_info.cpu_count, gpu_count)?;
                instance.shared_info.total_blocks = total_blocks;
                instance.shared_info.busy_blocks = 0;
            }
            Err(meridian_backends::BackendError::Transient(_)) => return Ok(()),
            Err(other) => return Err(other.into()),
        }
    }

    let check = ctx.healthcheck.check(instance).await;
    if check.healthy {
        if instance.shared_info.busy_blocks > 0 {
            instance.status = InstanceStatus::Busy;
        } else {
            instance.status = InstanceStatus::Idle;
        }
        instance.termination_deadline = None;
        instance.health_status = None;
        return Ok(());
    }

    instance.health_status = check.reason;
    let started_at = instance.started_at.unwrap_or(now);
    if now - started_at > provision_timeout() {
        instance.status = InstanceStatus::Terminating;
        instance.terminating_since = Some(now);
        instance.termination_deadline = Some(now + chrono::Duration::from_std(defaults::TERMINATE_RETRY_MIN_WAIT).expect("fits"));
        instance.termination_reason = Some("Shim did not become healthy within grace period".into());
    }
    Ok(())
}

async fn reconcile_idle(
    instance: &mut Instance,
    ctx: &ReconcileContext,
    now: chrono::DateTime<Utc>,
) -> Result<(), ReconcileError> {
    if instance.shared_info.busy_blocks > 0 {
        instance.status = InstanceStatus::Busy;
        return Ok(());
    }

    let check = ctx.healthcheck.check(instance).await;
    if check.healthy {
        if instance.unreachable {
            instance.unreachable = false;
        }
        if instance.termination_deadline.is_some() {
            instance.termination_deadline = None;
        }
        instance.health_status = None;
        return Ok(());
    }

    instance.health_status = check.reason;
    if instance.termination_deadline.is_none() {
        instance.termination_deadline = Some(now + chrono::Duration::from_std(defaults::IDLE_UNHEALTHY_GRACE).expect("fits"));
    }
    if let Some(deadline) = instance.termination_deadline {
        if now > deadline {
            instance.status = InstanceStatus::Terminating;
            instance.terminating_since = Some(now);
            instance.termination_reason = Some("Termination deadline".into());
            return Ok(());
        }
    }

    if instance.termination_policy == TerminationPolicy::DestroyAfterIdle {
        if let Some(last_job) = instance.last_job_processed_at {
            let idle_for = chrono::Duration::from_std(instance.termination_idle_time).unwrap_or(chrono::Duration::zero());
            if now - last_job >= idle_for {
                instance.status = InstanceStatus::Terminated;
                instance.termination_reason = Some("Idle timeout".into());
                instance.deleted = true;
                instance.deleted_at = Some(now);
                instance.finished_at = Some(now);
            }
        }
    }
    Ok(())
}

async fn reconcile_busy(
    instance: &mut Instance,
    _ctx: &ReconcileContext,
    now: chrono::DateTime<Utc>,
) -> Result<(), ReconcileError> {
    if instance.shared_info.busy_blocks == 0 {
        instance.status = InstanceStatus::Idle;
        instance.last_job_processed_at = Some(now);
    }
    Ok(())
}

async fn reconcile_terminating(
    instance: &mut Instance,
    ctx: &ReconcileContext,
    now: chrono::DateTime<Utc>,
) -> Result<(), ReconcileError> {
    let since = instance.terminating_since.unwrap_or(now);
    let hard_deadline = since + chrono::Duration::from_std(defaults::TERMINATE_HARD_DEADLINE).expect("fits");
    let min_wait = chrono::Duration::from_std(defaults::TERMINATE_RETRY_MIN_WAIT).expect("fits");

    if let Some(last_attempt) = instance.last_job_processed_at {
        if now - last_attempt < min_wait && now < hard_deadline {
            // Too early to retry (spec: `test_terminate_not_retries_if_too_early`).
            return Ok(());
        }
    }

    let pd = instance.job_provisioning_data.clone();
    let result = match (&pd, instance.backend_kind) {
        (Some(pd), Some(kind)) => match ctx.backend(kind) {
            Some(backend) => backend.terminate_instance(pd).await,
            None => Err(meridian_backends::BackendError::Configuration(format!(
                "no backend configured for {}",
                kind.as_str()
            ))),
        },
        // SSH-attached or never actually created at the backend: nothing to tear down.
        _ => Ok(()),
    };

    instance.last_job_processed_at = Some(now);

    match result {
        Ok(()) => finalize_termination(instance, now),
        Err(meridian_backends::BackendError::NotFound) => finalize_termination(instance, now),
        Err(_) if now >= hard_deadline => {
            tracing::error!(instance.id = %instance.id, "terminate retries exhausted at hard deadline, abandoning backend row");
            finalize_termination(instance, now);
        }
        Err(_) => {
            // left `terminating`, retried next tick no sooner than `min_wait`.
        }
    }
    Ok(())
}

fn finalize_termination(instance: &mut Instance, now: chrono::DateTime<Utc>) {
    instance.status = InstanceStatus::Terminated;
    instance.deleted = true;
    instance.deleted_at = Some(now);
    instance.finished_at = Some(now);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::healthcheck::ScriptedHealthCheck;
    use meridian_backends::cache::OfferCache;
    use meridian_core::entities::instance::{Resources, SharedInfo};
    use meridian_core::ids::{InstanceId, PoolId, ProjectId};
    use meridian_core::offer::InstanceOffer;
    use meridian_core::TestClock;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn base_instance() -> Instance {
        Instance {
            id: InstanceId::new(),
            project_id: ProjectId::new(),
            pool_id: PoolId::new(),
            fleet_id: None,
            backend_id: None,
            status: InstanceStatus::Pending,
            unreachable: false,
            shared_info: SharedInfo {
                total_blocks: 1,
                busy_blocks: 0,
            },
            offer: Some(InstanceOffer {
                backend: BackendKind::Aws,
                region: "us-east-1".into(),
                instance_type_name: "g5.xlarge".into(),
                price_per_hour: 1.0,
                resources: Resources {
                    cpu_count: 4,
                    memory_mib: 16_000,
                    disk_mib: 100_000,
                    gpu: None,
                },
                spot: false,
                reservation: None,
            }),
            job_provisioning_data: None,
            remote_connection_info: None,
            termination_policy: TerminationPolicy::DestroyAfterIdle,
            termination_idle_time: std::time::Duration::from_secs(300),
            termination_deadline: None,
            termination_reason: None,
            health_status: None,
            last_job_processed_at: None,
            last_processed_at: None,
            started_at: None,
            finished_at: None,
            created_at: Utc::now(),
            volume_ids: vec![],
            price_per_hour: Some(1.0),
            total_cost: 0.0,
            deleted: false,
            deleted_at: None,
            terminating_since: None,
            backend_kind: Some(BackendKind::Aws),
            version: 0,
        }
    }

    fn context_with(clock: Arc<TestClock>, healthy: bool, reason: Option<&'static str>) -> ReconcileContext {
        ReconcileContext {
            clock,
            backends: Arc::new(HashMap::new()),
            healthcheck: Arc::new(ScriptedHealthCheck(move |_: &Instance| {
                if healthy {
                    crate::healthcheck::HealthCheckResult::healthy()
                } else {
                    crate::healthcheck::HealthCheckResult::unhealthy(reason.unwrap_or("unhealthy"))
                }
            })),
            offer_cache: Arc::new(OfferCache::new()),
        }
    }

    #[tokio::test]
    async fn shim_goes_healthy_clears_deadline_and_health_status() {
        let clock = Arc::new(TestClock::at(Utc::now()));
        let ctx = context_with(clock.clone(), true, None);
        let mut instance = base_instance();
        instance.status = InstanceStatus::Provisioning;
        instance.started_at = Some(clock.now());
        instance.termination_deadline = Some(clock.now() + chrono::Duration::days(1));
        instance.health_status = Some("ssh connect problem".into());

        reconcile(&mut instance, &ctx).await.unwrap();

        assert_eq!(instance.status, InstanceStatus::Idle);
        assert!(instance.termination_deadline.is_none());
        assert!(instance.health_status.is_none());
    }

    #[tokio::test]
    async fn shim_stays_unhealthy_past_grace_moves_to_terminating() {
        let clock = Arc::new(TestClock::at(Utc::now()));
        let ctx = context_with(clock.clone(), false, Some("still down"));
        let mut instance = base_instance();
        instance.status = InstanceStatus::Provisioning;
        instance.started_at = Some(clock.now() - chrono::Duration::minutes(20));

        reconcile(&mut instance, &ctx).await.unwrap();

        assert_eq!(instance.status, InstanceStatus::Terminating);
        assert!(instance.termination_deadline.is_some());
        assert!(instance.termination_reason.is_some());
    }

    #[tokio::test]
    async fn idle_timeout_terminates_after_destroy_after_idle_window() {
        let clock = Arc::new(TestClock::at(Utc::now()));
        let ctx = context_with(clock.clone(), true, None);
        let mut instance = base_instance();
        instance.status = InstanceStatus::Idle;
        instance.termination_idle_time = std::time::Duration::from_secs(300);
        instance.last_job_processed_at = Some(clock.now() - chrono::Duration::minutes(19));

        reconcile(&mut instance, &ctx).await.unwrap();

        assert_eq!(instance.status, InstanceStatus::Terminated);
        assert_eq!(instance.termination_reason.as_deref(), Some("Idle timeout"));
    }

    #[tokio::test]
    async fn unreachable_flag_clears_silently_on_next_healthy_check() {
        let clock = Arc::new(TestClock::at(Utc::now()));
        let ctx = context_with(clock.clone(), true, None);
        let mut instance = base_instance();
        instance.status = InstanceStatus::Idle;
        instance.unreachable = true;

        reconcile(&mut instance, &ctx).await.unwrap();

        assert!(!instance.unreachable);
        assert_eq!(instance.status, InstanceStatus::Idle, "no separate user-visible transition");
    }

    #[tokio::test]
    async fn block_auto_resolves_to_gpu_count_after_ssh_deploy() {
        use async_trait::async_trait;
        use meridian_backends::{BackendResult, ComputeBackend};
        use meridian_core::entities::instance::{GpuResource, HostInfo, RemoteConnectionInfo};
        use meridian_core::entities::sibling::{PlacementGroup, Volume};
        use meridian_core::ids::{PlacementGroupId, VolumeId};
        use meridian_core::offer::InstanceOfferWithAvailability;
        use meridian_core::requirements::Requirements;

        struct FakeLocal;
        #[async_trait]
        impl ComputeBackend for FakeLocal {
            fn kind(&self) -> BackendKind {
                BackendKind::Local
            }
            async fn get_offers(&self, _r: &Requirements) -> BackendResult<Vec<InstanceOfferWithAvailability>> {
                Ok(vec![])
            }
            async fn create_instance(
                &self,
                _o: &InstanceOffer,
                _c: &meridian_backends::InstanceConfiguration,
            ) -> BackendResult<meridian_core::entities::instance::JobProvisioningData> {
                unreachable!()
            }
            async fn terminate_instance(&self, _p: &meridian_core::entities::instance::JobProvisioningData) -> BackendResult<()> {
                Ok(())
            }
            async fn update_provisioning_data(
                &self,
                p: &meridian_core::entities::instance::JobProvisioningData,
            ) -> BackendResult<meridian_core::entities::instance::JobProvisioningData> {
                Ok(p.clone())
            }
            async fn create_placement_group(
                &self,
                _c: &meridian_backends::PlacementGroupConfiguration,
            ) -> BackendResult<PlacementGroup> {
                unreachable!()
            }
            async fn delete_placement_group(&self, _id: PlacementGroupId) -> BackendResult<()> {
                Ok(())
            }
            async fn create_volume(&self, _c: &meridian_backends::VolumeConfiguration) -> BackendResult<Volume> {
                unreachable!()
            }
            async fn delete_volume(&self, _id: VolumeId) -> BackendResult<()> {
                Ok(())
            }
            async fn attach_volume(&self, _v: &Volume, _p: &meridian_core::entities::instance::JobProvisioningData) -> BackendResult<()> {
                Ok(())
            }
            async fn detach_volume(&self, _v: &Volume, _p: &meridian_core::entities::instance::JobProvisioningData) -> BackendResult<()> {
                Ok(())
            }
            async fn request_logs(
                &self,
                _p: &meridian_core::entities::instance::JobProvisioningData,
                _tail: u32,
            ) -> BackendResult<Vec<meridian_backends::LogFrame>> {
                Ok(vec![])
            }
            async fn deploy(&self, _remote: &RemoteConnectionInfo) -> BackendResult<HostInfo> {
                Ok(HostInfo {
                    cpu_count: 64,
                    memory_mib: 256_000,
                    disk_mib: 2_000_000,
                    gpus: vec![GpuResource {
                        vendor: "nvidia".into(),
                        name: "h100".into(),
                        count: 8,
                        memory_mib: Some(80_000),
                    }],
                })
            }
        }

        let clock = Arc::new(TestClock::at(Utc::now()));
        let mut backends: HashMap<BackendKind, Arc<dyn ComputeBackend>> = HashMap::new();
        backends.insert(BackendKind::Local, Arc::new(FakeLocal));
        let ctx = ReconcileContext {
            clock: clock.clone(),
            backends: Arc::new(backends),
            healthcheck: Arc::new(ScriptedHealthCheck(|_: &Instance| crate::healthcheck::HealthCheckResult::healthy())),
            offer_cache: Arc::new(OfferCache::new()),
        };

        let mut instance = base_instance();
        instance.offer = None;
        instance.backend_kind = None;
        instance.status = InstanceStatus::Provisioning;
        instance.started_at = Some(clock.now());
        instance.shared_info = SharedInfo {
            total_blocks: 0,
            busy_blocks: 0,
        };
        instance.remote_connection_info = Some(meridian_core::entities::instance::RemoteConnectionInfo {
            host: "1.2.3.4".into(),
            port: 22,
            ssh_user: "root".into(),
            ssh_keys: vec!["key".into()],
        });

        reconcile(&mut instance, &ctx).await.unwrap();

        assert_eq!(instance.shared_info.total_blocks, 8);
        assert_eq!(instance.shared_info.busy_blocks, 0);
        assert_eq!(instance.status, InstanceStatus::Idle);
    }

    #[tokio::test]
    async fn terminate_retry_with_late_success() {
        use async_trait::async_trait;
        use meridian_backends::{BackendError, BackendResult, ComputeBackend};
        use meridian_core::entities::sibling::{PlacementGroup, Volume};
        use meridian_core::ids::{PlacementGroupId, VolumeId};
        use meridian_core::offer::InstanceOfferWithAvailability;
        use meridian_core::requirements::Requirements;
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct FlakyBackend {
            calls: AtomicUsize,
        }
        #[async_trait]
        impl ComputeBackend for FlakyBackend {
            fn kind(&self) -> BackendKind {
                BackendKind::Aws
            }
            async fn get_offers(&self, _r: &Requirements) -> BackendResult<Vec<InstanceOfferWithAvailability>> {
                Ok(vec![])
            }
            async fn create_instance(
                &self,
                _o: &InstanceOffer,
                _c: &meridian_backends::InstanceConfiguration,
            ) -> BackendResult<meridian_core::entities::instance::JobProvisioningData> {
                unreachable!()
            }
            async fn terminate_instance(&self, _p: &meridian_core::entities::instance::JobProvisioningData) -> BackendResult<()> {
                let n = self.calls.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Err(BackendError::Transient("still draining".into()))
                } else {
                    Ok(())
                }
            }
            async fn update_provisioning_data(
                &self,
                p: &meridian_core::entities::instance::JobProvisioningData,
            ) -> BackendResult<meridian_core::entities::instance::JobProvisioningData> {
                Ok(p.clone())
            }
            async fn create_placement_group(
                &self,
                _c: &meridian_backends::PlacementGroupConfiguration,
            ) -> BackendResult<PlacementGroup> {
                unreachable!()
            }
            async fn delete_placement_group(&self, _id: PlacementGroupId) -> BackendResult<()> {
                Ok(())
            }
            async fn create_volume(&self, _c: &meridian_backends::VolumeConfiguration) -> BackendResult<Volume> {
                unreachable!()
            }
            async fn delete_volume(&self, _id: VolumeId) -> BackendResult<()> {
                Ok(())
            }
            async fn attach_volume(&self, _v: &Volume, _p: &meridian_core::entities::instance::JobProvisioningData) -> BackendResult<()> {
                Ok(())
            }
            async fn detach_volume(&self, _v: &Volume, _p: &meridian_core::entities::instance::JobProvisioningData) -> BackendResult<()> {
                Ok(())
            }
            async fn request_logs(
                &self,
                _p: &meridian_core::entities::instance::JobProvisioningData,
                _tail: u32,
            ) -> BackendResult<Vec<meridian_backends::LogFrame>> {
                Ok(vec![])
            }
        }

        let clock = Arc::new(TestClock::at(Utc::now()));
        let mut backends: HashMap<BackendKind, Arc<dyn ComputeBackend>> = HashMap::new();
        backends.insert(BackendKind::Aws, Arc::new(FlakyBackend { calls: AtomicUsize::new(0) }));
        let ctx = ReconcileContext {
            clock: clock.clone(),
            backends: Arc::new(backends),
            healthcheck: Arc::new(ScriptedHealthCheck(|_: &Instance| crate::healthcheck::HealthCheckResult::healthy())),
            offer_cache: Arc::new(OfferCache::new()),
        };

        let mut instance = base_instance();
        instance.status = InstanceStatus::Terminating;
        instance.terminating_since = Some(clock.now());
        instance.job_provisioning_data = Some(meridian_core::entities::instance::JobProvisioningData {
            hostname: "h".into(),
            ssh_port: 22,
            ssh_user: "root".into(),
            ssh_proxy: None,
            instance_id_at_backend: "i-1".into(),
            internal_ip: None,
            public_ip: None,
        });

        // t0: first attempt fails, stays terminating.
        reconcile(&mut instance, &ctx).await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Terminating);
        let t0 = instance.last_job_processed_at.unwrap();

        // t0 + 3s: too early, no retry attempted (call count unchanged).
        clock.advance(chrono::Duration::seconds(3));
        reconcile(&mut instance, &ctx).await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Terminating);
        assert_eq!(instance.last_job_processed_at.unwrap(), t0, "too early: no new attempt recorded");

        // t0 + 2min: retry succeeds.
        clock.advance(chrono::Duration::seconds(117));
        reconcile(&mut instance, &ctx).await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Terminated);
        assert!(instance.deleted);
    }
}
