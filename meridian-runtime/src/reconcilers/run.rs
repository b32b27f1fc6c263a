//! Run reconciler (spec §4.4): fans a submitted Run out into `nodes *
//! replicas` Jobs, aggregates their statuses back onto the Run, retries a
//! job that lost its instance to preemption within the retry window, and
//! cascades a user-requested stop down onto every still-active child.

use crate::error::ReconcileError;
use crate::reconcilers::job;
use chrono::{DateTime, Utc};
use meridian_core::entities::instance::Instance;
use meridian_core::entities::job::{Job, JobSpec, JobStatus, TerminationReason};
use meridian_core::entities::run::{Run, RunStatus};
use meridian_store::EntityStore;
use std::sync::Arc;

/// Extra state the Run reconciler needs beyond the leased `Run` row: the Job
/// store (to fan out/read/retry children) and the Instance store (passed
/// through to [`job::release_instance`] for cascade-stop). `run.spec.job_spec`
/// is what every fanned-out Job is stamped with.
pub struct RunDeps {
    pub job_store: Arc<dyn EntityStore<Job>>,
    pub instance_store: Arc<dyn EntityStore<Instance>>,
}

fn new_job(run: &Run, job_num: u32, replica_num: u32, submission_num: u32, job_spec: JobSpec) -> Job {
    Job {
        id: meridian_core::ids::JobId::new(),
        run_id: run.id,
        job_num,
        replica_num,
        submission_num,
        status: JobStatus::Submitted,
        job_spec,
        job_provisioning_data: None,
        job_runtime_data: None,
        instance_id: None,
        instance_assigned: false,
        termination_reason: None,
        status_message: None,
        last_processed_at: None,
        created_at: Utc::now(),
        version: 0,
    }
}

pub async fn reconcile(run: &mut Run, ctx_now: DateTime<Utc>, deps: &RunDeps) -> Result<(), ReconcileError> {
    match run.status {
        RunStatus::Submitted | RunStatus::Pending => fan_out(run, deps).await,
        RunStatus::Provisioning | RunStatus::Starting | RunStatus::Running => {
            advance_from_children(run, ctx_now, deps).await
        }
        RunStatus::Terminating => cascade_stop(run, ctx_now, deps).await,
        RunStatus::Terminated | RunStatus::Done | RunStatus::Failed | RunStatus::Aborted => Ok(()),
    }
}

/// Idempotent: if children already exist (a retried tick after a crash
/// mid-fanout), does nothing but advance the status.
async fn fan_out(run: &mut Run, deps: &RunDeps) -> Result<(), ReconcileError> {
    let existing = deps.job_store.list_by_parent(&run.id.to_string()).await?;
    if existing.is_empty() {
        for job_num in 0..run.spec.nodes {
            for replica_num in 0..run.spec.replicas {
                let job = new_job(run, job_num, replica_num, 0, run.spec.job_spec.clone());
                deps.job_store.insert(&job).await?;
            }
        }
    }
    run.status = RunStatus::Provisioning;
    Ok(())
}

async fn advance_from_children(run: &mut Run, now: DateTime<Utc>, deps: &RunDeps) -> Result<(), ReconcileError> {
    let children = deps.job_store.list_by_parent(&run.id.to_string()).await?;
    if children.is_empty() {
        return Ok(());
    }

    // A non-retryable terminal failure on any slot fails the whole run.
    for child in &children {
        if matches!(child.status, JobStatus::Failed | JobStatus::Aborted) {
            run.status = RunStatus::Failed;
            run.status_message = child.status_message.clone();
            run.processing_finished = true;
            return Ok(());
        }
    }

    // A job that lost its instance is either retried (new Job row, same
    // slot, `submission_num + 1`) within the policy window, or — once the
    // window has lapsed without a fresh retry landing — turns into a run
    // failure.
    let mut retried_any = false;
    for child in &children {
        if child.status != JobStatus::Terminated {
            continue;
        }
        let Some(reason) = child.termination_reason else {
            continue;
        };
        if !run.spec.retry.permits(reason) {
            run.status = RunStatus::Failed;
            run.status_message = Some(format!("job {} terminated ({reason:?}) and is not retryable", child.id));
            run.processing_finished = true;
            return Ok(());
        }
        let already_retried = children
            .iter()
            .any(|c| c.job_num == child.job_num && c.replica_num == child.replica_num && c.submission_num > child.submission_num);
        if already_retried {
            continue;
        }
        let deadline = child.created_at + chrono::Duration::from_std(run.spec.retry.window()).unwrap_or(chrono::Duration::zero());
        if now > deadline {
            run.status = RunStatus::Failed;
            run.status_message = Some(format!("job {} exceeded its retry window", child.id));
            run.processing_finished = true;
            return Ok(());
        }
        let retry = new_job(run, child.job_num, child.replica_num, child.submission_num + 1, child.job_spec.clone());
        deps.job_store.insert(&retry).await?;
        retried_any = true;
    }
    if retried_any {
        return Ok(());
    }

    let live = current_attempts(&children);

    if live.iter().all(|c| c.status == JobStatus::Done) {
        run.status = RunStatus::Done;
        run.processing_finished = true;
        return Ok(());
    }

    if live.iter().any(|c| c.status == JobStatus::Running) {
        run.status = RunStatus::Running;
    } else if live.iter().any(|c| matches!(c.status, JobStatus::Provisioning | JobStatus::Pulling)) {
        run.status = RunStatus::Starting;
    }
    Ok(())
}

/// For each (job_num, replica_num) slot, the highest-`submission_num` row —
/// retried slots leave earlier attempts behind as terminal history.
fn current_attempts(children: &[Job]) -> Vec<&Job> {
    let mut by_slot: std::collections::BTreeMap<(u32, u32), &Job> = std::collections::BTreeMap::new();
    for child in children {
        let slot = child.slot();
        match by_slot.get(&slot) {
            Some(existing) if existing.submission_num >= child.submission_num => {}
            _ => {
                by_slot.insert(slot, child);
            }
        }
    }
    by_slot.into_values().collect()
}

async fn cascade_stop(run: &mut Run, now: DateTime<Utc>, deps: &RunDeps) -> Result<(), ReconcileError> {
    let mut children = deps.job_store.list_by_parent(&run.id.to_string()).await?;
    for child in &mut children {
        if child.status.is_terminal() {
            continue;
        }
        job::release_instance(child, deps.instance_store.as_ref(), now).await?;
        child.status = JobStatus::Aborted;
        child.termination_reason = Some(TerminationReason::Aborted);
        deps.job_store.update(child, now).await?;
    }
    if children.iter().all(|c| c.status.is_terminal()) {
        run.status = RunStatus::Terminated;
        run.processing_finished = true;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::entities::fleet::Placement;
    use meridian_core::entities::job::PortMapping;
    use meridian_core::entities::run::{RetryPolicy, RunSpec};
    use meridian_core::ids::{ProjectId, RunId};
    use meridian_core::requirements::{Range, Requirements, ResourcesSpec, SpotPolicy};
    use meridian_store::MemoryStore;
    use std::collections::BTreeMap;

    fn job_spec() -> JobSpec {
        JobSpec {
            image: "alpine".into(),
            commands: vec![],
            env: BTreeMap::new(),
            ports: BTreeMap::from([(8000u16, PortMapping::Auto)]),
            resources: ResourcesSpec {
                cpu_count: Range { min: 1, max: None },
                memory_mib: Range { min: 1, max: None },
                disk_mib: Range { min: 1, max: None },
                gpu: None,
            },
            volume_mounts: vec![],
        }
    }

    fn sample_run(nodes: u32, replicas: u32, retry: RetryPolicy) -> Run {
        Run {
            id: RunId::new(),
            project_id: ProjectId::new(),
            fleet_id: None,
            spec: RunSpec {
                nodes,
                replicas,
                placement: Placement::Any,
                requirements: Requirements {
                    resources: ResourcesSpec {
                        cpu_count: Range { min: 1, max: None },
                        memory_mib: Range { min: 1, max: None },
                        disk_mib: Range { min: 1, max: None },
                        gpu: None,
                    },
                    spot_policy: SpotPolicy::Auto,
                    backends: vec![],
                    regions: vec![],
                    max_price: None,
                    reservation: None,
                    placement_group_name: None,
                },
                spot_policy: SpotPolicy::Auto,
                retry,
                job_spec: job_spec(),
            },
            status: RunStatus::Submitted,
            status_message: None,
            submitted_at: Utc::now(),
            processing_finished: false,
            last_processed_at: None,
            version: 0,
        }
    }

    fn deps() -> (RunDeps, Arc<MemoryStore<Job>>, Arc<MemoryStore<Instance>>) {
        let job_store: Arc<MemoryStore<Job>> = Arc::new(MemoryStore::default());
        let instance_store: Arc<MemoryStore<Instance>> = Arc::new(MemoryStore::default());
        (
            RunDeps {
                job_store: job_store.clone(),
                instance_store: instance_store.clone(),
            },
            job_store,
            instance_store,
        )
    }

    #[tokio::test]
    async fn submitted_run_fans_out_nodes_times_replicas_jobs() {
        let (deps, job_store, _) = deps();
        let mut run = sample_run(2, 3, RetryPolicy::Simple(true));

        reconcile(&mut run, Utc::now(), &deps).await.unwrap();

        assert_eq!(run.status, RunStatus::Provisioning);
        let jobs = job_store.all_sync();
        assert_eq!(jobs.len(), 6);
    }

    #[tokio::test]
    async fn fan_out_is_idempotent_on_a_retried_tick() {
        let (deps, job_store, _) = deps();
        let mut run = sample_run(1, 1, RetryPolicy::Simple(true));
        reconcile(&mut run, Utc::now(), &deps).await.unwrap();
        reconcile(&mut run, Utc::now(), &deps).await.unwrap();
        assert_eq!(job_store.all_sync().len(), 1);
    }

    #[tokio::test]
    async fn a_failed_job_fails_the_whole_run() {
        let (deps, job_store, _) = deps();
        let run_id = RunId::new();
        let mut run = sample_run(1, 1, RetryPolicy::Simple(true));
        run.id = run_id;
        run.status = RunStatus::Provisioning;
        let mut j = new_job(&run, 0, 0, 0, job_spec());
        j.status = JobStatus::Failed;
        job_store.insert_sync(j);

        reconcile(&mut run, Utc::now(), &deps).await.unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.processing_finished);
    }

    #[tokio::test]
    async fn all_jobs_done_marks_the_run_done() {
        let (deps, job_store, _) = deps();
        let mut run = sample_run(1, 2, RetryPolicy::Simple(true));
        run.status = RunStatus::Running;
        let mut j0 = new_job(&run, 0, 0, 0, job_spec());
        j0.status = JobStatus::Done;
        let mut j1 = new_job(&run, 0, 1, 0, job_spec());
        j1.status = JobStatus::Done;
        job_store.insert_sync(j0);
        job_store.insert_sync(j1);

        reconcile(&mut run, Utc::now(), &deps).await.unwrap();

        assert_eq!(run.status, RunStatus::Done);
        assert!(run.processing_finished);
    }

    #[tokio::test]
    async fn no_capacity_interruption_spawns_a_retry_job_within_the_window() {
        let (deps, job_store, _) = deps();
        let mut run = sample_run(1, 1, RetryPolicy::Simple(true));
        run.status = RunStatus::Running;
        let mut j = new_job(&run, 0, 0, 0, job_spec());
        j.status = JobStatus::Terminated;
        j.termination_reason = Some(TerminationReason::InterruptedByNoCapacity);
        j.created_at = Utc::now();
        job_store.insert_sync(j);

        reconcile(&mut run, Utc::now(), &deps).await.unwrap();

        let jobs = job_store.all_sync();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().any(|j| j.submission_num == 1));
        assert_eq!(run.status, RunStatus::Running, "run stays running while the retry lands");
    }

    #[tokio::test]
    async fn no_capacity_past_retry_window_fails_the_run() {
        let (deps, job_store, _) = deps();
        let mut run = sample_run(1, 1, RetryPolicy::Simple(true));
        run.status = RunStatus::Running;
        let mut j = new_job(&run, 0, 0, 0, job_spec());
        j.status = JobStatus::Terminated;
        j.termination_reason = Some(TerminationReason::InterruptedByNoCapacity);
        j.created_at = Utc::now() - chrono::Duration::minutes(10);
        job_store.insert_sync(j);

        reconcile(&mut run, Utc::now(), &deps).await.unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(job_store.all_sync().len(), 1, "no retry spawned past the window");
    }

    #[tokio::test]
    async fn terminating_cascades_abort_to_every_active_job_then_terminates() {
        let (deps, job_store, instance_store) = deps();
        let mut run = sample_run(1, 1, RetryPolicy::Simple(true));
        run.status = RunStatus::Terminating;
        let mut j = new_job(&run, 0, 0, 0, job_spec());
        j.status = JobStatus::Running;
        job_store.insert_sync(j);

        reconcile(&mut run, Utc::now(), &deps).await.unwrap();

        let jobs = job_store.all_sync();
        assert_eq!(jobs[0].status, JobStatus::Aborted);
        assert_eq!(run.status, RunStatus::Terminated);
        assert!(run.processing_finished);
        let _ = instance_store.all_sync();
    }

    #[tokio::test]
    async fn retried_slots_replacement_completing_still_marks_the_run_done() {
        let (deps, job_store, _) = deps();
        let mut run = sample_run(1, 1, RetryPolicy::Simple(true));
        run.status = RunStatus::Running;
        // The original attempt lost its instance and was superseded by a
        // retry; it sits forever at `Terminated`, not `Done`.
        let mut original = new_job(&run, 0, 0, 0, job_spec());
        original.status = JobStatus::Terminated;
        original.termination_reason = Some(TerminationReason::InterruptedByNoCapacity);
        let mut retry = new_job(&run, 0, 0, 1, job_spec());
        retry.status = JobStatus::Done;
        job_store.insert_sync(original);
        job_store.insert_sync(retry);

        reconcile(&mut run, Utc::now(), &deps).await.unwrap();

        assert_eq!(run.status, RunStatus::Done, "only the latest attempt per slot counts toward done");
        assert!(run.processing_finished);
    }

    #[tokio::test]
    async fn one_job_running_marks_the_run_running_even_if_another_slot_is_still_provisioning() {
        let (deps, job_store, _) = deps();
        let mut run = sample_run(2, 1, RetryPolicy::Simple(true));
        run.status = RunStatus::Provisioning;
        let mut j0 = new_job(&run, 0, 0, 0, job_spec());
        j0.status = JobStatus::Running;
        let mut j1 = new_job(&run, 1, 0, 0, job_spec());
        j1.status = JobStatus::Provisioning;
        job_store.insert_sync(j0);
        job_store.insert_sync(j1);

        reconcile(&mut run, Utc::now(), &deps).await.unwrap();

        assert_eq!(run.status, RunStatus::Running, "any job running takes priority over the starting rule");
    }
}
