use crate::entities::backend::BackendKind;
use crate::ids::{FleetId, PlacementGroupId, PoolId, ProjectId};
use crate::requirements::{Range, ResourcesSpec, SpotPolicy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    Any,
    Cluster,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FleetStatus {
    Submitted,
    Active,
    Terminating,
    Terminated,
    Failed,
}

/// A fleet composed entirely of pre-attached SSH hosts never asks the offer
/// engine for anything; the Fleet reconciler just creates `pending` instances
/// carrying `remote_connection_info` for each configured host. Dropped by the
/// spec's distillation, present in `original_source/.../models/fleets.py`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SshHostConfig {
    pub hostname: String,
    pub port: u16,
    pub ssh_user: String,
    pub ssh_keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetSpec {
    pub nodes: Range<u32>,
    pub placement: Placement,
    pub resources: ResourcesSpec,
    pub backends: Vec<BackendKind>,
    pub regions: Vec<String>,
    pub spot_policy: SpotPolicy,
    pub max_price: Option<f64>,
    #[serde(with = "humantime_duration_opt", default)]
    pub idle_duration: Option<Duration>,
    pub reservation: Option<String>,
    pub ssh_hosts: Vec<SshHostConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fleet {
    pub id: FleetId,
    pub project_id: ProjectId,
    pub pool_id: PoolId,
    pub name: String,
    pub spec: FleetSpec,
    pub status: FleetStatus,
    pub status_message: Option<String>,
    pub placement_group_id: Option<PlacementGroupId>,
    pub created_at: DateTime<Utc>,
    pub deleted: bool,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub version: i64,
}

impl Fleet {
    /// Invariant 5 (spec §3): `fleet.deleted ⇒` every child instance
    /// terminated. This helper only checks the `Fleet`-local half of that
    /// (it cannot see instances); the reconciler checks the rest.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, FleetStatus::Terminated | FleetStatus::Failed)
    }
}

mod humantime_duration_opt {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        value.map(|d| d.as_secs()).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}
