//! Shared HTTP plumbing for the REST-style cloud adapters (every
//! [`crate::backends`] module except `local` and `federated`, which talk SSH
//! and the meridian API respectively). Each cloud differs only in base URL,
//! region, and `BackendKind` — the request/response shapes and backoff
//! behavior are identical, so they're factored out here once.

use crate::retry::with_backoff;
use crate::{
    BackendError, BackendResult, ComputeBackend, InstanceConfiguration, LogFrame,
    PlacementGroupConfiguration, VolumeConfiguration,
};
use async_trait::async_trait;
use meridian_core::defaults::CALL_DEADLINE;
use meridian_core::entities::backend::BackendKind;
use meridian_core::entities::instance::JobProvisioningData;
use meridian_core::entities::sibling::{PlacementGroup, SiblingStatus, Volume};
use meridian_core::ids::{FleetId, PlacementGroupId, VolumeId};
use meridian_core::offer::InstanceOfferWithAvailability;
use meridian_core::requirements::Requirements;
use reqwest::StatusCode;

pub struct RestBackend {
    kind: BackendKind,
    client: reqwest::Client,
    base_url: String,
    region: String,
}

impl RestBackend {
    pub fn new(
        kind: BackendKind,
        client: reqwest::Client,
        base_url: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            client,
            base_url: base_url.into(),
            region: region.into(),
        }
    }

    async fn call_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &impl serde::Serialize,
    ) -> BackendResult<T> {
        with_backoff(CALL_DEADLINE, || async {
            let response = self
                .client
                .post(format!("{}{}", self.base_url, path))
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
impl ComputeBackend for RestBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn get_offers(&self, requirements: &Requirements) -> BackendResult<Vec<InstanceOfferWithAvailability>> {
        self.call_json("/offers", requirements).await
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
            region: &'a str,
        }
        self.call_json(
            "/instances",
            &Req {
                offer,
                config,
                region: &self.region,
            },
        )
        .await
    }

    async fn terminate_instance(&self, provisioning_data: &JobProvisioningData) -> BackendResult<()> {
        let _: serde_json::Value = self.call_json("/instances/terminate", provisioning_data).await?;
        Ok(())
    }

    async fn update_provisioning_data(
        &self,
        provisioning_data: &JobProvisioningData,
    ) -> BackendResult<JobProvisioningData> {
        self.call_json("/instances/describe", provisioning_data).await
    }

    async fn create_placement_group(&self, config: &PlacementGroupConfiguration) -> BackendResult<PlacementGroup> {
        #[derive(serde::Deserialize)]
        struct Resp {
            provisioning_data: String,
        }
        let resp: Resp = self.call_json("/placement-groups", config).await?;
        Ok(PlacementGroup {
            id: PlacementGroupId::new(),
            fleet_id: FleetId::new(),
            backend: self.kind,
            region: config.region.clone(),
            status: SiblingStatus::Active,
            provisioning_data: Some(resp.provisioning_data),
        })
    }

    async fn delete_placement_group(&self, id: PlacementGroupId) -> BackendResult<()> {
        let _: serde_json::Value = self.call_json("/placement-groups/delete", &id.to_string()).await?;
        Ok(())
    }

    async fn create_volume(&self, config: &VolumeConfiguration) -> BackendResult<Volume> {
        self.call_json("/volumes", config).await
    }

    async fn delete_volume(&self, id: VolumeId) -> BackendResult<()> {
        let _: serde_json::Value = self.call_json("/volumes/delete", &id.to_string()).await?;
        Ok(())
    }

    async fn attach_volume(&self, volume: &Volume, provisioning_data: &JobProvisioningData) -> BackendResult<()> {
        #[derive(serde::Serialize)]
        struct Req<'a> {
            volume: &'a Volume,
            provisioning_data: &'a JobProvisioningData,
        }
        let _: serde_json::Value = self
            .call_json("/volumes/attach", &Req { volume, provisioning_data })
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
            .call_json("/volumes/detach", &Req { volume, provisioning_data })
            .await?;
        Ok(())
    }

    async fn request_logs(&self, provisioning_data: &JobProvisioningData, tail: u32) -> BackendResult<Vec<LogFrame>> {
        #[derive(serde::Serialize)]
        struct Req<'a> {
            provisioning_data: &'a JobProvisioningData,
            tail: u32,
        }
        self.call_json("/logs", &Req { provisioning_data, tail }).await
    }
}
