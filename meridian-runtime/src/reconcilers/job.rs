//! Job reconciler and placement (spec §4.3): the state machine for one
//! (node, replica) execution attempt, plus the instance-match predicate used
//! to place it.

use crate::context::ReconcileContext;
use crate::error::ReconcileError;
use crate::ports::allocate_ports;
use chrono::Utc;
use meridian_core::entities::instance::{Instance, InstanceStatus, JobProvisioningData};
use meridian_core::entities::job::{Job, JobRuntimeData, JobStatus};
use meridian_core::entities::run::Run;
use meridian_core::ids::ProjectId;
use meridian_core::requirements::Requirements;
use meridian_core::Error;
use meridian_store::EntityStore;
use std::collections::BTreeSet;
use std::sync::Arc;

/// The extra state the Job reconciler needs beyond the leased `Job` row and
/// the ambient [`ReconcileContext`]: the Instance store (to find/claim a
/// placement target) and the owning Run (for requirements/placement policy,
/// immutable after submit per spec §3).
pub struct JobDeps {
    pub instance_store: Arc<dyn EntityStore<Instance>>,
    pub run: Run,
}

/// True iff `instance` can host one more block of `job`'s declared resources
/// under `requirements` (spec §4.3 items (a)-(f)).
pub fn instance_matches(instance: &Instance, project_id: ProjectId, requirements: &Requirements) -> bool {
    if instance.project_id != project_id {
        return false;
    }
    if instance.status != InstanceStatus::Idle && instance.status != InstanceStatus::Busy {
        return false;
    }
    if instance.shared_info.residual_blocks() < 1 {
        return false;
    }

    // SSH-attached instances have no synthetic `offer` (their host resources
    // come from the one-time `deploy` probe, not a catalog entry) — the
    // per-block resource range is meaningless there, so only cloud-backed
    // instances are checked against `requirements.resources`. An SSH host's
    // fitness is the operator's responsibility when they attach it.
    if let Some(offer) = &instance.offer {
        let per_block = offer.resources.per_block(instance.shared_info.total_blocks);
        let spec = &requirements.resources;
        if !spec.cpu_count.contains(per_block.cpu_count) {
            return false;
        }
        if !spec.memory_mib.contains(per_block.memory_mib) {
            return false;
        }
        if !spec.disk_mib.contains(per_block.disk_mib) {
            return false;
        }
    }
    if !requirements.backends.is_empty() {
        match instance.backend_kind {
            Some(kind) if requirements.backends.contains(&kind) => {}
            _ => return false,
        }
    }
    if !requirements.regions.is_empty() {
        match instance.offer.as_ref().map(|o| o.region.as_str()) {
            Some(region) if requirements.regions.contains(&region.to_string()) => {}
            _ => return false,
        }
    }
    if let Some(max_price) = requirements.max_price {
        if instance.price_per_hour.is_some_and(|p| p > max_price) {
            return false;
        }
    }
    if let Some(reservation) = &requirements.reservation {
        let matches = instance.offer.as_ref().and_then(|o| o.reservation.as_deref()) == Some(reservation.as_str());
        if !matches {
            return false;
        }
    }
    true
}

/// Per-block shares the job consumes once placed (spec §4.3's
/// `job_runtime_data`).
fn compute_runtime_data(job: &Job, instance: &Instance) -> JobRuntimeData {
    let block = instance.offer.as_ref().map(|o| o.resources.per_block(instance.shared_info.total_blocks));
    let (cpu_count, memory_mib, gpu_count) = match block {
        Some(b) => (b.cpu_count, b.memory_mib, b.gpu.map_or(0, |g| g.count)),
        None => (0, 0, 0),
    };
    let bound: BTreeSet<u16> = BTreeSet::new(); // fresh instance namespace; real deployments track bound ports per-instance
    let ports = allocate_ports(&job.job_spec.ports, &bound).unwrap_or_default();
    JobRuntimeData {
        cpu_count,
        memory_mib,
        gpu_count,
        port_mappings: ports,
        volumes: job.job_spec.volume_mounts.iter().map(|(id, _)| *id).collect(),
    }
}

fn synthesize_provisioning_data(instance: &Instance) -> Option<JobProvisioningData> {
    instance.job_provisioning_data.clone()
}

/// Runs exactly one transition for `job` (spec §4.3).
pub async fn reconcile(job: &mut Job, ctx: &ReconcileContext, deps: &JobDeps) -> Result<(), ReconcileError> {
    let now = ctx.clock.now();

    match job.status {
        JobStatus::Submitted => reconcile_submitted(job, deps, now).await,
        JobStatus::Provisioning => reconcile_provisioning(job, deps).await,
        JobStatus::Pulling => {
            job.status = JobStatus::Running;
            Ok(())
        }
        JobStatus::Running => reconcile_running(job, deps).await,
        JobStatus::Terminating | JobStatus::Terminated | JobStatus::Aborted | JobStatus::Failed | JobStatus::Done => {
            Ok(())
        }
    }
}

async fn reconcile_submitted(job: &mut Job, deps: &JobDeps, now: chrono::DateTime<Utc>) -> Result<(), ReconcileError> {
    if job.instance_assigned {
        job.status = JobStatus::Provisioning;
        return Ok(());
    }

    let requirements = deps.run.spec.requirements.clone();
    let candidates = deps.instance_store.list_all().await?;
    let mut matching: Vec<Instance> = candidates
        .into_iter()
        .filter(|i| instance_matches(i, deps.run.project_id, &requirements))
        .collect();
    matching.sort_by(|a, b| a.id.0.cmp(&b.id.0));

    let Some(mut instance) = matching.into_iter().next() else {
        // No capacity right now; stays `submitted` for a later tick (or a
        // sibling Fleet/offer-engine-driven provision to land an instance).
        return Ok(());
    };

    instance.shared_info.busy_blocks += 1;
    if instance.shared_info.busy_blocks > instance.shared_info.total_blocks {
        return Err(ReconcileError::Core(Error::ConstraintViolation(format!(
            "placing job {} would push instance {} busy_blocks above total_blocks",
            job.id, instance.id
        ))));
    }
    if instance.status == InstanceStatus::Idle {
        instance.status = InstanceStatus::Busy;
    }

    job.job_runtime_data = Some(compute_runtime_data(job, &instance));
    job.job_provisioning_data = synthesize_provisioning_data(&instance);
    job.instance_id = Some(instance.id);
    job.instance_assigned = true;
    job.status = JobStatus::Provisioning;

    deps.instance_store.update(&mut instance, now).await?;
    Ok(())
}

async fn reconcile_provisioning(job: &mut Job, deps: &JobDeps) -> Result<(), ReconcileError> {
    let Some(instance_id) = job.instance_id else {
        return Ok(());
    };
    let instance = deps.instance_store.load_by_id(instance_id).await?;
    match instance {
        Some(instance) if matches!(instance.status, InstanceStatus::Idle | InstanceStatus::Busy) => {
            job.status = JobStatus::Pulling;
        }
        Some(_) => {} // still pending/provisioning on the instance side
        None => {
            job.status = JobStatus::Failed;
            job.termination_reason = Some(meridian_core::entities::job::TerminationReason::FailedToStart);
            job.status_message = Some("assigned instance no longer exists".into());
        }
    }
    Ok(())
}

/// While `running`, the only signal this reconciler has for "the job is no
/// longer alive" is its host instance disappearing out from under it — there
/// is no in-scope mechanism for observing a container's own exit code (spec
/// §4.3's `job_runtime_data` stops at placement). Losing the instance to spot
/// preemption or an unhealthy teardown is folded into
/// `interrupted_by_no_capacity`, the one reason the Run reconciler's retry
/// policy can act on (spec §4.4).
async fn reconcile_running(job: &mut Job, deps: &JobDeps) -> Result<(), ReconcileError> {
    let Some(instance_id) = job.instance_id else {
        return Ok(());
    };
    let instance = deps.instance_store.load_by_id(instance_id).await?;
    let lost = match &instance {
        None => true,
        Some(i) => matches!(i.status, InstanceStatus::Terminating | InstanceStatus::Terminated),
    };
    if lost {
        job.status = JobStatus::Terminated;
        job.termination_reason = Some(meridian_core::entities::job::TerminationReason::InterruptedByNoCapacity);
        job.status_message = Some("host instance was reclaimed".into());
        job.instance_assigned = false;
    }
    Ok(())
}

/// Tears a terminal job down: decrements the instance's `busy_blocks` and
/// clears the job's instance linkage (spec §4.3 "terminating" row). Called
/// by whatever drives the job into a terminal status (user stop, exit-code
/// failure, successful completion) — modeled as a separate step so the Run
/// reconciler's cascade-terminate can invoke it directly without going
/// through the lease/tick machinery twice.
pub async fn release_instance(job: &mut Job, instance_store: &dyn EntityStore<Instance>, now: chrono::DateTime<Utc>) -> Result<(), ReconcileError> {
    let Some(instance_id) = job.instance_id else {
        return Ok(());
    };
    if let Some(mut instance) = instance_store.load_by_id(instance_id).await? {
        instance.shared_info.busy_blocks = instance.shared_info.busy_blocks.saturating_sub(1);
        if instance.shared_info.busy_blocks == 0 && instance.status == InstanceStatus::Busy {
            instance.status = InstanceStatus::Idle;
            instance.last_job_processed_at = Some(now);
        }
        instance_store.update(&mut instance, now).await?;
    }
    job.instance_id = None;
    job.instance_assigned = false;
    Ok(())
}
