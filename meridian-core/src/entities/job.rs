use crate::ids::{InstanceId, JobId, RunId, VolumeId};
use crate::requirements::ResourcesSpec;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Submitted,
    Provisioning,
    Pulling,
    Running,
    Terminating,
    Terminated,
    Aborted,
    Failed,
    Done,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Terminated | JobStatus::Aborted | JobStatus::Failed | JobStatus::Done
        )
    }

    pub fn is_active(self) -> bool {
        matches!(
            self,
            JobStatus::Provisioning | JobStatus::Pulling | JobStatus::Running
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    InterruptedByNoCapacity,
    FailedToStart,
    ContainerExitedWithError,
    ScalingDown,
    Aborted,
}

impl TerminationReason {
    /// Only certain reasons make a failed job eligible for a Run-level retry
    /// (spec §4.4): spot preemption / no-capacity, never exit-code failures.
    pub fn is_retryable(self) -> bool {
        matches!(self, TerminationReason::InterruptedByNoCapacity)
    }
}

/// How a `declared_port` should be exposed on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortMapping {
    Auto,
    Explicit(u16),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub image: String,
    pub commands: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub ports: BTreeMap<u16, PortMapping>,
    pub resources: ResourcesSpec,
    pub volume_mounts: Vec<(VolumeId, String)>,
}

/// cpu/gpu/memory shares, port mappings, and volume attachments computed at
/// placement time (spec §4.3). `volumes` supplements the distilled spec: see
/// SPEC_FULL.md §4.3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRuntimeData {
    pub cpu_count: u32,
    pub memory_mib: u64,
    pub gpu_count: u32,
    pub port_mappings: BTreeMap<u16, u16>,
    pub volumes: Vec<VolumeId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub run_id: RunId,
    pub job_num: u32,
    pub replica_num: u32,
    pub submission_num: u32,
    pub status: JobStatus,
    pub job_spec: JobSpec,
    pub job_provisioning_data: Option<crate::entities::instance::JobProvisioningData>,
    pub job_runtime_data: Option<JobRuntimeData>,
    pub instance_id: Option<InstanceId>,
    pub instance_assigned: bool,
    pub termination_reason: Option<TerminationReason>,
    pub status_message: Option<String>,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub version: i64,
}

impl Job {
    /// Identifies the (node, replica) slot this Job is an attempt at,
    /// irrespective of `submission_num` (spec §3: "retries create a new Job
    /// row").
    pub fn slot(&self) -> (u32, u32) {
        (self.job_num, self.replica_num)
    }
}
