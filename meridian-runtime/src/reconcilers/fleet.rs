//! Fleet reconciler (spec §4.5): converges the live instance count toward
//! `spec.nodes`, drives the placement-group lifecycle for `cluster` fleets,
//! and creates one pending instance per configured SSH host for attached
//! fleets.

use crate::context::ReconcileContext;
use crate::error::ReconcileError;
use chrono::{DateTime, Utc};
use meridian_backends::offer::collect_offers;
use meridian_core::entities::backend::BackendKind;
use meridian_core::entities::fleet::{Fleet, FleetStatus, Placement};
use meridian_core::entities::instance::{
    Instance, InstanceStatus, RemoteConnectionInfo, SharedInfo, TerminationPolicy,
};
use meridian_core::entities::run::Run;
use meridian_core::ids::InstanceId;
use meridian_core::offer::InstanceOfferWithAvailability;
use meridian_core::requirements::Requirements;
use meridian_core::{defaults, Error};
use meridian_store::EntityStore;

fn requirements_for(fleet: &Fleet) -> Requirements {
    Requirements {
        resources: fleet.spec.resources.clone(),
        spot_policy: fleet.spec.spot_policy,
        backends: fleet.spec.backends.clone(),
        regions: fleet.spec.regions.clone(),
        max_price: fleet.spec.max_price,
        reservation: fleet.spec.reservation.clone(),
        placement_group_name: None,
    }
}

fn new_cloud_instance(fleet: &Fleet, offer: &InstanceOfferWithAvailability, now: DateTime<Utc>) -> Instance {
    Instance {
        id: InstanceId::new(),
        project_id: fleet.project_id,
        pool_id: fleet.pool_id,
        fleet_id: Some(fleet.id),
        backend_id: None,
        status: InstanceStatus::Pending,
        unreachable: false,
        shared_info: SharedInfo {
            total_blocks: 0,
            busy_blocks: 0,
        },
        offer: Some(offer.offer.clone()),
        job_provisioning_data: None,
        remote_connection_info: None,
        termination_policy: TerminationPolicy::DestroyAfterIdle,
        termination_idle_time: fleet.spec.idle_duration.unwrap_or(defaults::DEFAULT_TERMINATION_IDLE_TIME),
        termination_deadline: None,
        termination_reason: None,
        health_status: None,
        last_job_processed_at: None,
        last_processed_at: None,
        started_at: None,
        finished_at: None,
        created_at: now,
        volume_ids: vec![],
        price_per_hour: Some(offer.offer.price_per_hour),
        total_cost: 0.0,
        deleted: false,
        deleted_at: None,
        terminating_since: None,
        backend_kind: Some(offer.offer.backend),
        version: 0,
    }
}

fn new_ssh_instance(fleet: &Fleet, host: &meridian_core::entities::fleet::SshHostConfig, now: DateTime<Utc>) -> Instance {
    Instance {
        id: InstanceId::new(),
        project_id: fleet.project_id,
        pool_id: fleet.pool_id,
        fleet_id: Some(fleet.id),
        backend_id: None,
        status: InstanceStatus::Pending,
        unreachable: false,
        shared_info: SharedInfo {
            total_blocks: 0,
            busy_blocks: 0,
        },
        offer: None,
        job_provisioning_data: None,
        remote_connection_info: Some(RemoteConnectionInfo {
            host: host.hostname.clone(),
            port: host.port,
            ssh_user: host.ssh_user.clone(),
            ssh_keys: host.ssh_keys.clone(),
        }),
        termination_policy: TerminationPolicy::KeepAlive,
        termination_idle_time: fleet.spec.idle_duration.unwrap_or(defaults::DEFAULT_TERMINATION_IDLE_TIME),
        termination_deadline: None,
        termination_reason: None,
        health_status: None,
        last_job_processed_at: None,
        last_processed_at: None,
        started_at: None,
        finished_at: None,
        created_at: now,
        volume_ids: vec![],
        price_per_hour: None,
        total_cost: 0.0,
        deleted: false,
        deleted_at: None,
        terminating_since: None,
        backend_kind: Some(BackendKind::Local),
        version: 0,
    }
}

fn is_live(instance: &Instance) -> bool {
    !matches!(instance.status, InstanceStatus::Terminated) && !instance.deleted
}

pub async fn reconcile(
    fleet: &mut Fleet,
    ctx: &ReconcileContext,
    instance_store: &dyn EntityStore<Instance>,
    run_store: &dyn EntityStore<Run>,
) -> Result<(), ReconcileError> {
    let now = ctx.clock.now();
    match fleet.status {
        FleetStatus::Submitted => create_initial_instances(fleet, ctx, instance_store, now).await,
        FleetStatus::Active => converge(fleet, ctx, instance_store, run_store, now).await,
        FleetStatus::Terminating => drain(fleet, ctx, instance_store, now).await,
        FleetStatus::Terminated | FleetStatus::Failed => Ok(()),
    }
}

/// spec §3 invariant 5 / §8 scenarios 1-2: "a fleet is deleted iff it has no
/// live instances and no active runs referencing it" — independent of
/// `ssh_hosts`/`nodes.max`.
async fn has_active_runs(fleet: &Fleet, run_store: &dyn EntityStore<Run>) -> Result<bool, ReconcileError> {
    let runs = run_store.list_by_parent(&fleet.id.to_string()).await?;
    Ok(runs.iter().any(|r| !r.status.is_terminal()))
}

async fn create_initial_instances(
    fleet: &mut Fleet,
    ctx: &ReconcileContext,
    instance_store: &dyn EntityStore<Instance>,
    now: DateTime<Utc>,
) -> Result<(), ReconcileError> {
    if !fleet.spec.ssh_hosts.is_empty() {
        for host in &fleet.spec.ssh_hosts {
            instance_store.insert(&new_ssh_instance(fleet, host, now)).await?;
        }
        fleet.status = FleetStatus::Active;
        return Ok(());
    }

    let target = fleet.spec.nodes.min;
    if target == 0 {
        fleet.status = FleetStatus::Active;
        return Ok(());
    }

    let offers = offers_for(fleet, ctx).await?;

    if fleet.spec.placement == Placement::Cluster {
        let Some((backend, region)) = offers.first().map(|o| (o.offer.backend, o.offer.region.clone())) else {
            abort_fleet(fleet, "no offer available to seed the placement group".into());
            return Ok(());
        };
        let clustered: Vec<&InstanceOfferWithAvailability> = offers
            .iter()
            .filter(|o| o.offer.backend == backend && o.offer.region == region)
            .collect();
        if (clustered.len() as u32) < target {
            abort_fleet(fleet, format!("only {} of {target} required offers share a placement group", clustered.len()));
            return Ok(());
        }
        let backend_adapter = ctx
            .backend(backend)
            .ok_or_else(|| ReconcileError::Core(Error::Configuration(format!("no backend configured for {}", backend.as_str()))))?;
        let group = backend_adapter
            .create_placement_group(&meridian_backends::PlacementGroupConfiguration {
                name: fleet.id.to_string(),
                region: region.clone(),
                backend,
            })
            .await?;
        fleet.placement_group_id = Some(group.id);
        for offer in clustered.into_iter().take(target as usize) {
            instance_store.insert(&new_cloud_instance(fleet, offer, now)).await?;
        }
    } else {
        if (offers.len() as u32) < target {
            tracing::warn!(fleet.id = %fleet.id, have = offers.len(), want = target, "not enough offers to reach desired node count yet");
        }
        for offer in offers.iter().take(target as usize) {
            instance_store.insert(&new_cloud_instance(fleet, offer, now)).await?;
        }
    }

    fleet.status = FleetStatus::Active;
    Ok(())
}

fn abort_fleet(fleet: &mut Fleet, reason: String) {
    // Partial cluster placement is treated as a whole-fleet failure rather
    // than a partial success (resolved open question): nothing was created
    // yet at this point (offers were only queried, not consumed), so
    // aborting here just means never reaching `active`.
    fleet.status = FleetStatus::Failed;
    fleet.status_message = Some(reason);
}

async fn offers_for(fleet: &Fleet, ctx: &ReconcileContext) -> Result<Vec<InstanceOfferWithAvailability>, ReconcileError> {
    let requirements = requirements_for(fleet);
    let backend_refs: Vec<(&dyn meridian_backends::ComputeBackend, bool)> =
        ctx.backends.values().map(|b| (b.as_ref(), true)).collect();
    let offers = collect_offers(&backend_refs, &requirements, &ctx.offer_cache, defaults::OFFER_TOP_K).await?;
    Ok(offers)
}

async fn converge(
    fleet: &mut Fleet,
    ctx: &ReconcileContext,
    instance_store: &dyn EntityStore<Instance>,
    run_store: &dyn EntityStore<Run>,
    now: DateTime<Utc>,
) -> Result<(), ReconcileError> {
    let children = instance_store.list_by_parent(&fleet.id.to_string()).await?;
    let live: Vec<&Instance> = children.iter().filter(|i| is_live(i)).collect();

    if live.is_empty() && !has_active_runs(fleet, run_store).await? {
        // No live instances and nothing still referencing it: GC it.
        fleet.status = FleetStatus::Terminated;
        fleet.deleted = true;
        return Ok(());
    }

    let min = fleet.spec.nodes.min;
    if (live.len() as u32) < min && fleet.spec.ssh_hosts.is_empty() {
        let short = min - live.len() as u32;
        let offers = offers_for(fleet, ctx).await?;
        for offer in offers.iter().take(short as usize) {
            instance_store.insert(&new_cloud_instance(fleet, offer, now)).await?;
        }
    }

    if let Some(max) = fleet.spec.nodes.max {
        if (live.len() as u32) > max {
            let excess = live.len() as u32 - max;
            let mut candidates: Vec<&Instance> = live.clone();
            candidates.sort_by(|a, b| b.unreachable.cmp(&a.unreachable).then(a.created_at.cmp(&b.created_at)));
            for instance in candidates.into_iter().take(excess as usize) {
                let mut instance = instance.clone();
                instance.status = InstanceStatus::Terminating;
                instance.terminating_since = Some(now);
                instance.termination_reason = Some("fleet scaled down".into());
                instance_store.update(&mut instance, now).await?;
            }
        }
    }
    Ok(())
}

async fn drain(
    fleet: &mut Fleet,
    ctx: &ReconcileContext,
    instance_store: &dyn EntityStore<Instance>,
    now: DateTime<Utc>,
) -> Result<(), ReconcileError> {
    let children = instance_store.list_by_parent(&fleet.id.to_string()).await?;
    let mut any_live = false;
    for instance in children {
        if !is_live(&instance) {
            continue;
        }
        any_live = true;
        if instance.status != InstanceStatus::Terminating {
            let mut instance = instance;
            instance.status = InstanceStatus::Terminating;
            instance.terminating_since = Some(now);
            instance.termination_reason = Some("fleet terminating".into());
            instance_store.update(&mut instance, now).await?;
        }
    }

    if any_live {
        return Ok(());
    }

    if let Some(group_id) = fleet.placement_group_id {
        if let Some(backend_kind) = fleet.spec.backends.first().copied() {
            if let Some(backend) = ctx.backend(backend_kind) {
                backend.delete_placement_group(group_id).await?;
            }
        }
        fleet.placement_group_id = None;
    }

    fleet.status = FleetStatus::Terminated;
    fleet.deleted = true;
    Ok(())
}
