//! `BackendKind::Federated`: another meridian deployment, addressed through
//! its own HTTP API rather than a native cloud SDK. Structurally this is the
//! same shape as [`super::RestBackend`], but the wire format matches
//! meridian's own run/offer types one-for-one instead of a cloud's.

use crate::retry::with_backoff;
use crate::{
    BackendError, BackendResult, ComputeBackend, InstanceConfiguration, LogFrame,
    PlacementGroupConfiguration, VolumeConfiguration,
};
use async_trait::async_trait;
use meridian_core::defaults::CALL_DEADLINE;
use meridian_core::entities::backend::BackendKind;
use meridian_core::entities::instance::JobProvisioningData;
use meridian_core::entities::sibling::{PlacementGroup, Volume};
use meridian_core::ids::{PlacementGroupId, VolumeId};
use meridian_core::offer::InstanceOfferWithAvailability;
use meridian_core::requirements::Requirements;
use reqwest::StatusCode;

pub struct FederatedBackend {
    client: reqwest::Client,
    base_url: String,
    bearer_token: String,
}

impl FederatedBackend {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, bearer_token: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            bearer_token: bearer_token.into(),
        }
    }

    async fn call_json<T: serde::de::DeserializeOwned>(&self, path: &str, body: &impl serde::Serialize) -> BackendResult<T> {
        with_backoff(CALL_DEADLINE, || async {
            let response = self
                .client
                .post(format!("{}{}", self.base_url, path))
                .bearer_auth(&self.bearer_token)
                .json(body)
                .send()
                .await
                .map_err(|e| BackendError::Transient(e.to_string()))?;
            match response.status() {
                StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
                    Err(BackendError::Transient(format!("{}", response.status())))
                }
                status if status.is_server_error() => Err(BackendError::Transient(format!("{status}"))),
                StatusCode::NOT_FOUND => Err(BackendError::NotFound),
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    Err(BackendError::Configuration("federated backend rejected credentials".into()))
                }
                status if !status.is_success() => {
                    Err(BackendError::Configuration(format!("unexpected status {status}")))
                }
                _ => response
                    .json()
                    .await
                    .map_err(|e| BackendError::Transient(e.to_string())),
            }
        })
        .await
    }
}

#[async_trait]
impl ComputeBackend for FederatedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Federated
    }

    async fn get_offers(&self, requirements: &Requirements) -> BackendResult<Vec<InstanceOfferWithAvailability>> {
        self.call_json("/api/runs/get_offers", requirements).await
    }

    async fn create_instance(
        &self,
        offer: &meridian_core::offer::InstanceOffer,
        config: &InstanceConfiguration,
    ) -> BackendResult<JobProvisioningData> {
        #[derive(serde::Serialize)]
        struct Req<'a> {
            offer: &'a meridian_core::offer::InstanceOffer,
            config: &'a InstanceConfiguration,
        }
        self.call_json("/api/runs/create_instance", &Req { offer, config }).await
    }

    async fn terminate_instance(&self, provisioning_data: &JobProvisioningData) -> BackendResult<()> {
        let _: serde_json::Value = self.call_json("/api/runs/stop", provisioning_data).await?;
        Ok(())
    }

    async fn update_provisioning_data(&self, provisioning_data: &JobProvisioningData) -> BackendResult<JobProvisioningData> {
        self.call_json("/api/runs/get", provisioning_data).await
    }

    async fn create_placement_group(&self, _config: &PlacementGroupConfiguration) -> BackendResult<PlacementGroup> {
        Err(BackendError::Configuration(
            "a federated meridian backend does not expose placement groups across the trust boundary".into(),
        ))
    }

    async fn delete_placement_group(&self, _id: PlacementGroupId) -> BackendResult<()> {
        Ok(())
    }

    async fn create_volume(&self, config: &VolumeConfiguration) -> BackendResult<Volume> {
        self.call_json("/api/project/volumes/create", config).await
    }

    async fn delete_volume(&self, id: VolumeId) -> BackendResult<()> {
        let _: serde_json::Value = self.call_json("/api/project/volumes/delete", &id.to_string()).await?;
        Ok(())
    }

    async fn attach_volume(&self, volume: &Volume, provisioning_data: &JobProvisioningData) -> BackendResult<()> {
        #[derive(serde::Serialize)]
        struct Req<'a> {
            volume: &'a Volume,
            provisioning_data: &'a JobProvisioningData,
        }
        let _: serde_json::Value = self
            .call_json("/api/project/volumes/attach", &Req { volume, provisioning_data })
            .await?;
        Ok(())
    }

    async fn detach_volume(&self, volume: &Volume, provisioning_data: &JobProvisioningData) -> BackendResult<()> {
        #[derive(serde::Serialize)]
        struct Req<'a> {
            volume: &'a Volume,
            provisioning_data: &'a JobProvisioningData,
        }
        let _: serde_json::Value = self
            .call_json("/api/project/volumes/detach", &Req { volume, provisioning_data })
            .await?;
        Ok(())
    }

    async fn request_logs(&self, provisioning_data: &JobProvisioningData, tail: u32) -> BackendResult<Vec<LogFrame>> {
        #[derive(serde::Serialize)]
        struct Req<'a> {
            provisioning_data: &'a JobProvisioningData,
            tail: u32,
        }
        self.call_json("/api/runs/logs", &Req { provisioning_data, tail }).await
    }
}
