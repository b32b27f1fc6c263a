//! Cloud compute adapters and the offer engine that ranks what they report.
//!
//! [`ComputeBackend`] is the one interface every cloud/self-hosted adapter
//! implements; [`offer`] merges and ranks what they return; [`cache`] and
//! [`retry`] are the shared plumbing every adapter is built on top of.

pub mod backends;
pub mod cache;
mod error;
pub mod offer;
pub mod retry;

pub use error::{BackendError, BackendResult};

use async_trait::async_trait;
use meridian_core::entities::instance::{HostInfo, JobProvisioningData, RemoteConnectionInfo};
use meridian_core::entities::sibling::{PlacementGroup, Volume};
use meridian_core::ids::{PlacementGroupId, VolumeId};
use meridian_core::offer::InstanceOfferWithAvailability;
use meridian_core::requirements::Requirements;
use serde::{Deserialize, Serialize};

/// What the reconcilers ask an adapter to build, independent of backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfiguration {
    pub instance_name: String,
    pub user_ssh_key: String,
    pub client_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementGroupConfiguration {
    pub name: String,
    pub region: String,
    pub backend: meridian_core::entities::backend::BackendKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeConfiguration {
    pub name: String,
    pub region: String,
    pub size_mib: u64,
    pub client_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogFrame {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub message: Vec<u8>,
}

/// The adapter every cloud/self-hosted backend implements. One call, one
/// bounded-latency HTTP (or SSH) round trip; adapters handle their own
/// 429/backoff internally via [`retry`] and never retry indefinitely.
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    fn kind(&self) -> meridian_core::entities::backend::BackendKind;

    async fn get_offers(&self, requirements: &Requirements) -> BackendResult<Vec<InstanceOfferWithAvailability>>;

    async fn create_instance(
        &self,
        offer: &meridian_core::offer::InstanceOffer,
        config: &InstanceConfiguration,
    ) -> BackendResult<JobProvisioningData>;

    async fn terminate_instance(&self, provisioning_data: &JobProvisioningData) -> BackendResult<()>;

    async fn update_provisioning_data(
        &self,
        provisioning_data: &JobProvisioningData,
    ) -> BackendResult<JobProvisioningData>;

    async fn create_placement_group(
        &self,
        config: &PlacementGroupConfiguration,
    ) -> BackendResult<PlacementGroup>;

    async fn delete_placement_group(&self, id: PlacementGroupId) -> BackendResult<()>;

    async fn create_volume(&self, config: &VolumeConfiguration) -> BackendResult<Volume>;

    async fn delete_volume(&self, id: VolumeId) -> BackendResult<()>;

    async fn attach_volume(&self, volume: &Volume, provisioning_data: &JobProvisioningData) -> BackendResult<()>;

    async fn detach_volume(&self, volume: &Volume, provisioning_data: &JobProvisioningData) -> BackendResult<()>;

    async fn request_logs(&self, provisioning_data: &JobProvisioningData, tail: u32) -> BackendResult<Vec<LogFrame>>;

    /// Only implemented by SSH-attached backends: the first provisioning
    /// cycle's "deploy" step, which also reports host facts used to resolve
    /// `total_blocks = auto`.
    async fn deploy(&self, _remote: &RemoteConnectionInfo) -> BackendResult<HostInfo> {
        Err(BackendError::Configuration(
            "this backend does not support SSH deploy".into(),
        ))
    }
}
