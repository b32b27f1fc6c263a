//! `MeridianConfig`: environment + optional TOML file, matching the
//! teacher's `Kubeconfig`/`Config` loader shape in `kube-client/src/config` —
//! a plain `serde`-deserializable struct with `#[serde(default)]` fields,
//! loaded from a file and then overridden by a handful of env vars for the
//! values operators most often want to set per-deployment without editing a
//! checked-in file (the store DSN, backend credentials).

use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use meridian_core::entities::backend::BackendKind;

fn default_store_dsn() -> String {
    std::env::var("MERIDIAN_DATABASE_URL").unwrap_or_else(|_| "sqlite::memory:".to_string())
}

fn default_worker_cap() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4) * 4
}

fn default_node_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "meridian-node".to_string())
}

/// One reconciler task's polling cadence and batch size, as registered with
/// [`meridian_runtime::dispatcher::Dispatcher::register`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub interval_secs: u64,
    pub batch_size: usize,
}

impl ScheduleConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            batch_size: 50,
        }
    }
}

/// How to reach one configured `ComputeBackend` adapter. `base_url` and
/// `region` are unused for [`BackendKind::Local`]; `bearer_token` is only
/// read for [`BackendKind::Federated`].
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub bearer_token: Option<String>,
}

/// The instance shim's HTTP healthcheck endpoint shape (spec §4.2's injected
/// `(instance) -> {healthy, reason}`): `GET http://{host}:{port}{path}`
/// against the instance's provisioned hostname.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub port: u16,
    pub path: String,
    pub timeout_secs: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            port: 9999,
            path: "/healthz".to_string(),
            timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MeridianConfig {
    /// Identifies this process in logs; has no bearing on lease ownership
    /// (leases are row-level, not node-level — see `meridian-store`).
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default = "default_store_dsn")]
    pub store_dsn: String,
    /// Shared worker-count cap across every registered reconciler task
    /// (spec.md §4.1's "bounded-concurrency handlers"). Defaults to
    /// `cpu_count * 4`, per SPEC_FULL.md §4.1.
    #[serde(default = "default_worker_cap")]
    pub worker_cap: usize,

    pub instance_schedule: ScheduleConfig,
    pub job_schedule: ScheduleConfig,
    pub run_schedule: ScheduleConfig,
    pub fleet_schedule: ScheduleConfig,

    pub healthcheck: HealthCheckConfig,

    pub backends: HashMap<BackendKind, BackendConfig>,
}

impl Default for MeridianConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            store_dsn: default_store_dsn(),
            worker_cap: default_worker_cap(),
            instance_schedule: ScheduleConfig::default(),
            job_schedule: ScheduleConfig::default(),
            run_schedule: ScheduleConfig::default(),
            fleet_schedule: ScheduleConfig {
                interval_secs: 10,
                batch_size: 20,
            },
            healthcheck: HealthCheckConfig::default(),
            backends: HashMap::new(),
        }
    }
}

impl MeridianConfig {
    /// Loads from `path` if given (TOML), falling back to defaults/env when
    /// absent, mirroring `kube-client`'s "explicit kubeconfig path, else
    /// fall back to the ambient environment" precedence.
    pub fn load(path: Option<&std::path::Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .map_err(|e| anyhow::anyhow!("reading config file {}: {e}", path.display()))?;
                toml::from_str(&raw).map_err(|e| anyhow::anyhow!("parsing config file {}: {e}", path.display()))?
            }
            None => MeridianConfig::default(),
        };
        if let Ok(dsn) = std::env::var("MERIDIAN_DATABASE_URL") {
            config.store_dsn = dsn;
        }
        Ok(config)
    }
}
