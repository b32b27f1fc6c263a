//! SSH-attached hosts: no cloud API, just an SSH control connection. Offers
//! are not enumerated — these instances are pre-registered with
//! `remote_connection_info` and placed directly by the fleet reconciler.

use crate::{BackendError, BackendResult, ComputeBackend, InstanceConfiguration, LogFrame, PlacementGroupConfiguration, VolumeConfiguration};
use async_trait::async_trait;
use meridian_core::entities::backend::BackendKind;
use meridian_core::entities::instance::{HostInfo, JobProvisioningData, RemoteConnectionInfo};
use meridian_core::entities::sibling::{PlacementGroup, Volume};
use meridian_core::ids::{PlacementGroupId, VolumeId};
use meridian_core::offer::InstanceOfferWithAvailability;
use meridian_core::requirements::Requirements;
use tokio::process::Command;

/// Runs the `ssh ... -N -f -L local:host:remote` control-connection form the
/// SSH control path uses for port-forwarding onto attached hosts.
pub struct LocalBackend;

impl LocalBackend {
    pub fn new() -> Self {
        Self
    }

    /// Establishes one forwarded local port against a remote host/port,
    /// matching the SSH control path: `-o StrictHostKeyChecking=no -o
    /// UserKnownHostsFile=/dev/null -i <key> -N -f -L local:host:remote`.
    pub async fn forward_port(&self, remote: &RemoteConnectionInfo, local_port: u16, remote_port: u16, key_path: &str) -> BackendResult<()> {
        let status = Command::new("ssh")
            .arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg("UserKnownHostsFile=/dev/null")
            .arg("-i")
            .arg(key_path)
            .arg("-N")
            .arg("-f")
            .arg("-p")
            .arg(remote.port.to_string())
            .arg("-L")
            .arg(format!("{local_port}:127.0.0.1:{remote_port}"))
            .arg(format!("{}@{}", remote.ssh_user, remote.host))
            .status()
            .await
            .map_err(|e| BackendError::Transient(e.to_string()))?;
        if status.success() {
            Ok(())
        } else {
            Err(BackendError::Transient(format!("ssh exited with {status}")))
        }
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ComputeBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn get_offers(&self, _requirements: &Requirements) -> BackendResult<Vec<InstanceOfferWithAvailability>> {
        // SSH-attached hosts are pre-registered, not offered; nothing to rank.
        Ok(Vec::new())
    }

    async fn create_instance(
        &self,
        _offer: &meridian_core::offer::InstanceOffer,
        _config: &InstanceConfiguration,
    ) -> BackendResult<JobProvisioningData> {
        Err(BackendError::Configuration(
            "local backend instances are attached by the user, not created".into(),
        ))
    }

    async fn terminate_instance(&self, _provisioning_data: &JobProvisioningData) -> BackendResult<()> {
        // Nothing to tear down on the cloud side; the instance reconciler
        // simply stops polling it.
        Ok(())
    }

    async fn update_provisioning_data(&self, provisioning_data: &JobProvisioningData) -> BackendResult<JobProvisioningData> {
        Ok(provisioning_data.clone())
    }

    async fn create_placement_group(&self, _config: &PlacementGroupConfiguration) -> BackendResult<PlacementGroup> {
        Err(BackendError::Configuration(
            "local backend has no cluster placement concept".into(),
        ))
    }

    async fn delete_placement_group(&self, _id: PlacementGroupId) -> BackendResult<()> {
        Ok(())
    }

    async fn create_volume(&self, _config: &VolumeConfiguration) -> BackendResult<Volume> {
        Err(BackendError::Configuration("local backend does not manage volumes".into()))
    }

    async fn delete_volume(&self, _id: VolumeId) -> BackendResult<()> {
        Ok(())
    }

    async fn attach_volume(&self, _volume: &Volume, _provisioning_data: &JobProvisioningData) -> BackendResult<()> {
        Err(BackendError::Configuration("local backend does not manage volumes".into()))
    }

    async fn detach_volume(&self, _volume: &Volume, _provisioning_data: &JobProvisioningData) -> BackendResult<()> {
        Ok(())
    }

    async fn request_logs(&self, _provisioning_data: &JobProvisioningData, _tail: u32) -> BackendResult<Vec<LogFrame>> {
        Err(BackendError::Configuration(
            "local backend log retrieval runs through the on-host agent, not this adapter".into(),
        ))
    }

    async fn deploy(&self, remote: &RemoteConnectionInfo) -> BackendResult<HostInfo> {
        let output = Command::new("ssh")
            .arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg("UserKnownHostsFile=/dev/null")
            .arg("-p")
            .arg(remote.port.to_string())
            .arg(format!("{}@{}", remote.ssh_user, remote.host))
            .arg("nproc && free -m && df -m / && (nvidia-smi -L || true)")
            .output()
            .await
            .map_err(|e| BackendError::Transient(e.to_string()))?;
        if !output.status.success() {
            return Err(BackendError::Transient(format!(
                "deploy probe failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        parse_host_info(&String::from_utf8_lossy(&output.stdout))
    }
}

fn parse_host_info(stdout: &str) -> BackendResult<HostInfo> {
    let mut lines = stdout.lines();
    let cpu_count: u32 = lines
        .next()
        .and_then(|l| l.trim().parse().ok())
        .ok_or_else(|| BackendError::Transient("deploy probe: missing nproc output".into()))?;
    let memory_mib: u64 = lines
        .find(|l| l.starts_with("Mem:"))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| BackendError::Transient("deploy probe: missing free output".into()))?;
    Ok(HostInfo {
        cpu_count,
        memory_mib,
        disk_mib: 0,
        gpus: Vec::new(),
    })
}
