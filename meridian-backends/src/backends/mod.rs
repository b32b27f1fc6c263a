//! One constructor per `BackendKind` (except `local` and `federated`, which
//! have their own shapes). Each wraps [`rest::RestBackend`] — the HTTP
//! request/response shapes and backoff behavior are identical across clouds,
//! differing only in base URL, region, and which `BackendKind` errors/logs
//! get tagged with.

mod rest;

pub mod federated;
pub mod local;

pub use federated::FederatedBackend;
pub use local::LocalBackend;
pub use rest::RestBackend;

use meridian_core::entities::backend::BackendKind;

pub fn aws(client: reqwest::Client, base_url: impl Into<String>, region: impl Into<String>) -> RestBackend {
    RestBackend::new(BackendKind::Aws, client, base_url, region)
}

pub fn azure(client: reqwest::Client, base_url: impl Into<String>, region: impl Into<String>) -> RestBackend {
    RestBackend::new(BackendKind::Azure, client, base_url, region)
}

pub fn gcp(client: reqwest::Client, base_url: impl Into<String>, region: impl Into<String>) -> RestBackend {
    RestBackend::new(BackendKind::Gcp, client, base_url, region)
}

pub fn lambda(client: reqwest::Client, base_url: impl Into<String>, region: impl Into<String>) -> RestBackend {
    RestBackend::new(BackendKind::Lambda, client, base_url, region)
}

pub fn nebius(client: reqwest::Client, base_url: impl Into<String>, region: impl Into<String>) -> RestBackend {
    RestBackend::new(BackendKind::Nebius, client, base_url, region)
}

pub fn tensordock(client: reqwest::Client, base_url: impl Into<String>, region: impl Into<String>) -> RestBackend {
    RestBackend::new(BackendKind::TensorDock, client, base_url, region)
}

pub fn datacrunch(client: reqwest::Client, base_url: impl Into<String>, region: impl Into<String>) -> RestBackend {
    RestBackend::new(BackendKind::DataCrunch, client, base_url, region)
}

pub fn vastai(client: reqwest::Client, base_url: impl Into<String>, region: impl Into<String>) -> RestBackend {
    RestBackend::new(BackendKind::VastAi, client, base_url, region)
}
