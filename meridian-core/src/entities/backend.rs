use crate::ids::{BackendId, ProjectId};
use serde::{Deserialize, Serialize};

/// The set of cloud/self-hosted adapters the core demands a `ComputeBackend`
/// implementation for. `Local` is an unmanaged SSH-attached pool; `Federated`
/// is another meridian deployment used as a nested backend (spec §3's
/// `dstack` kind, generalized: a backend that is itself an orchestrator).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Aws,
    Azure,
    Gcp,
    DataCrunch,
    Lambda,
    Local,
    Nebius,
    TensorDock,
    VastAi,
    Federated,
}

impl BackendKind {
    pub const ALL: [BackendKind; 10] = [
        BackendKind::Aws,
        BackendKind::Azure,
        BackendKind::Gcp,
        BackendKind::DataCrunch,
        BackendKind::Lambda,
        BackendKind::Local,
        BackendKind::Nebius,
        BackendKind::TensorDock,
        BackendKind::VastAi,
        BackendKind::Federated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Aws => "aws",
            BackendKind::Azure => "azure",
            BackendKind::Gcp => "gcp",
            BackendKind::DataCrunch => "datacrunch",
            BackendKind::Lambda => "lambda",
            BackendKind::Local => "local",
            BackendKind::Nebius => "nebius",
            BackendKind::TensorDock => "tensordock",
            BackendKind::VastAi => "vastai",
            BackendKind::Federated => "federated",
        }
    }
}

/// A configured credential + region set bound to a project. Credentials
/// themselves are opaque to the core — `credentials_ref` points at wherever
/// the (out-of-scope) secrets store keeps the encrypted blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backend {
    pub id: BackendId,
    pub project_id: ProjectId,
    pub kind: BackendKind,
    pub regions: Vec<String>,
    pub credentials_ref: String,
    pub deleted: bool,
}
