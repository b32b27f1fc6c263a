//! Volume, PlacementGroup, Gateway and RepoCreds — sibling reconcilers with
//! the same `submitted -> active -> terminating -> terminated` shape as
//! Instance (spec §3). Their reconcile loops are out of scope (managed by
//! sibling reconcilers elsewhere); only the shapes the Instance/Fleet
//! reconcilers read and write live here.

use crate::entities::backend::BackendKind;
use crate::ids::{BackendId, FleetId, GatewayId, InstanceId, PlacementGroupId, ProjectId, RepoCredsId, VolumeId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiblingStatus {
    Submitted,
    Active,
    Terminating,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub id: VolumeId,
    pub project_id: ProjectId,
    pub backend_id: BackendId,
    pub size_mib: u64,
    pub status: SiblingStatus,
    pub attached_to: Option<InstanceId>,
}

/// One per `(backend, region)` for a cluster-placement fleet (spec §4.5).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementGroup {
    pub id: PlacementGroupId,
    pub fleet_id: FleetId,
    pub backend: BackendKind,
    pub region: String,
    pub status: SiblingStatus,
    pub provisioning_data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gateway {
    pub id: GatewayId,
    pub project_id: ProjectId,
    pub status: SiblingStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoCreds {
    pub id: RepoCredsId,
    pub project_id: ProjectId,
    pub status: SiblingStatus,
}
