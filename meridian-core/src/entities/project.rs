use crate::ids::ProjectId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Logical tenant. Owns fleets, runs, instances, volumes, pools, SSH keys.
/// Every child entity carries `project_id`; deletion of a `Project` is soft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub deleted: bool,
}
