use crate::ids::{PoolId, ProjectId};

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Pool {
    pub id: PoolId,
    pub project_id: ProjectId,
    pub name: String,
    pub deleted: bool,
}

/// Name of the pool auto-created for a project, mirrored on `Fleet.pool_id`
/// when a fleet spec doesn't name one explicitly.
pub const DEFAULT_POOL_NAME: &str = "default-pool";
