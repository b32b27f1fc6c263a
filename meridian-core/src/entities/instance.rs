use crate::entities::backend::BackendKind;
use crate::ids::{BackendId, FleetId, InstanceId, PoolId, ProjectId, VolumeId};
use crate::offer::InstanceOffer;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuResource {
    pub vendor: String,
    pub name: String,
    pub count: u32,
    pub memory_mib: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    pub cpu_count: u32,
    pub memory_mib: u64,
    pub disk_mib: u64,
    pub gpu: Option<GpuResource>,
}

impl Resources {
    fn gpu_count(&self) -> u32 {
        self.gpu.as_ref().map_or(0, |g| g.count)
    }

    /// The resources available to a single block once `total_blocks` equal
    /// slices are carved out of this instance (spec §3, §4.3 item (c)).
    pub fn per_block(&self, total_blocks: u32) -> Resources {
        assert!(total_blocks > 0, "total_blocks must be resolved before slicing");
        Resources {
            cpu_count: self.cpu_count / total_blocks,
            memory_mib: self.memory_mib / total_blocks,
            disk_mib: self.disk_mib / total_blocks,
            gpu: self.gpu.as_ref().map(|g| GpuResource {
                vendor: g.vendor.clone(),
                name: g.name.clone(),
                count: g.count / total_blocks,
                memory_mib: g.memory_mib,
            }),
        }
    }
}

/// What the user (or fleet default) asked `total_blocks` to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlocksSpec {
    Auto,
    Explicit(u32),
}

/// Resolves `total_blocks` against an instance's actual CPU/GPU counts.
///
/// `auto` collapses to `gpu_count` when there are 2 or more GPUs, else 1.
/// An explicit `n` is only accepted when both `cpus` and `gpus` are evenly
/// divisible by it (spec §4.2, §8 boundary behavior).
pub fn resolve_total_blocks(spec: BlocksSpec, cpus: u32, gpus: u32) -> Result<u32> {
    match spec {
        BlocksSpec::Auto => Ok(if gpus >= 2 { gpus } else { 1 }),
        BlocksSpec::Explicit(n) => {
            if n == 0 {
                return Err(Error::ConstraintViolation("total_blocks must be at least 1".into()));
            }
            if cpus % n != 0 || gpus % n != 0 {
                return Err(Error::ConstraintViolation(format!(
                    "total_blocks={n} does not evenly divide cpus={cpus} or gpus={gpus}"
                )));
            }
            Ok(n)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedInfo {
    pub total_blocks: u32,
    pub busy_blocks: u32,
}

impl SharedInfo {
    pub fn residual_blocks(&self) -> u32 {
        self.total_blocks.saturating_sub(self.busy_blocks)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Provisioning,
    Idle,
    Busy,
    Terminating,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationPolicy {
    DestroyAfterIdle,
    KeepAlive,
}

/// Connection details a backend returns after `create_instance`, copied into
/// a placed Job's `job_provisioning_data` at placement time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProvisioningData {
    pub hostname: String,
    pub ssh_port: u16,
    pub ssh_user: String,
    pub ssh_proxy: Option<String>,
    pub instance_id_at_backend: String,
    pub internal_ip: Option<String>,
    pub public_ip: Option<String>,
}

/// Connection info for an SSH-attached instance, supplied by the user
/// instead of returned by a `create_instance` call. `ssh_keys` is plural:
/// `original_source` models a list, not a single key, per host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConnectionInfo {
    pub host: String,
    pub port: u16,
    pub ssh_user: String,
    pub ssh_keys: Vec<String>,
}

/// Host facts the SSH `deploy` step reports back on success, used to resolve
/// `total_blocks = auto` for SSH-attached instances (spec §4.2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostInfo {
    pub cpu_count: u32,
    pub memory_mib: u64,
    pub disk_mib: u64,
    pub gpus: Vec<GpuResource>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub project_id: ProjectId,
    pub pool_id: PoolId,
    pub fleet_id: Option<FleetId>,
    pub backend_id: Option<BackendId>,
    pub status: InstanceStatus,
    pub unreachable: bool,
    pub shared_info: SharedInfo,
    pub offer: Option<InstanceOffer>,
    pub job_provisioning_data: Option<JobProvisioningData>,
    pub remote_connection_info: Option<RemoteConnectionInfo>,
    pub termination_policy: TerminationPolicy,
    pub termination_idle_time: std::time::Duration,
    pub termination_deadline: Option<DateTime<Utc>>,
    pub termination_reason: Option<String>,
    pub health_status: Option<String>,
    pub last_job_processed_at: Option<DateTime<Utc>>,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub volume_ids: Vec<VolumeId>,
    pub price_per_hour: Option<f64>,
    pub total_cost: f64,
    pub deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    /// First `terminating` attempt's timestamp, for the 16-minute hard
    /// deadline on termination retries (spec §4.2).
    pub terminating_since: Option<DateTime<Utc>>,
    pub backend_kind: Option<BackendKind>,
    /// Optimistic-concurrency counter bumped by the store on every
    /// `update()` (spec §6).
    pub version: i64,
}

impl Instance {
    /// Invariant 1 (spec §3, §8): `busy ⇒` there is a job assigned here in an
    /// active status. Checked by the reconciler before committing a
    /// transition away from `busy`, not enforced structurally here.
    pub fn is_busy(&self) -> bool {
        self.status == InstanceStatus::Busy
    }

    pub fn is_ssh_attached(&self) -> bool {
        self.remote_connection_info.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_collapses_to_one_below_two_gpus() {
        assert_eq!(resolve_total_blocks(BlocksSpec::Auto, 8, 0).unwrap(), 1);
        assert_eq!(resolve_total_blocks(BlocksSpec::Auto, 8, 1).unwrap(), 1);
    }

    #[test]
    fn auto_uses_gpu_count_at_two_or_more() {
        assert_eq!(resolve_total_blocks(BlocksSpec::Auto, 64, 8).unwrap(), 8);
        assert_eq!(resolve_total_blocks(BlocksSpec::Auto, 16, 2).unwrap(), 2);
    }

    #[test]
    fn explicit_requires_divisibility_of_both_cpu_and_gpu() {
        assert!(resolve_total_blocks(BlocksSpec::Explicit(4), 8, 8).is_ok());
        assert!(resolve_total_blocks(BlocksSpec::Explicit(3), 8, 8).is_err());
        assert!(resolve_total_blocks(BlocksSpec::Explicit(4), 9, 8).is_err());
    }

    #[test]
    fn per_block_divides_every_dimension() {
        let r = Resources {
            cpu_count: 32,
            memory_mib: 64_000,
            disk_mib: 100_000,
            gpu: Some(GpuResource {
                vendor: "nvidia".into(),
                name: "h100".into(),
                count: 8,
                memory_mib: Some(80_000),
            }),
        };
        let block = r.per_block(8);
        assert_eq!(block.cpu_count, 4);
        assert_eq!(block.gpu.unwrap().count, 1);
    }
}
