use async_trait::async_trait;
use meridian_core::entities::instance::Instance;
use std::time::Duration;

/// What the instance reconciler learns from polling the shim (spec.md §4.2's
/// injected `(instance) -> {healthy, reason}` function).
#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    pub healthy: bool,
    pub reason: Option<String>,
}

impl HealthCheckResult {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            reason: None,
        }
    }

    pub fn unhealthy(reason: impl Into<String>) -> Self {
        Self {
            healthy: false,
            reason: Some(reason.into()),
        }
    }
}

#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self, instance: &Instance) -> HealthCheckResult;
}

/// A [`HealthCheck`] driven entirely by a closure, for tests that need a
/// scripted sequence of results rather than real shim polling.
pub struct ScriptedHealthCheck<F>(pub F);

#[async_trait]
impl<F> HealthCheck for ScriptedHealthCheck<F>
where
    F: Fn(&Instance) -> HealthCheckResult + Send + Sync + 'static,
{
    async fn check(&self, instance: &Instance) -> HealthCheckResult {
        (self.0)(instance)
    }
}

/// Production [`HealthCheck`]: polls the on-host shim's HTTP endpoint
/// (spec.md §4.2's injected `(instance) -> {healthy, reason}` function,
/// concretely `GET http://{host}:{port}{path}` per `MeridianConfig`).
/// SSH-attached instances are probed over their `remote_connection_info`
/// host; cloud instances use the hostname the backend returned at create
/// time.
pub struct ShimHealthCheck {
    client: reqwest::Client,
    port: u16,
    path: String,
}

impl ShimHealthCheck {
    pub fn new(port: u16, path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("reqwest client builds with a fixed timeout"),
            port,
            path: path.into(),
        }
    }

    fn host_for(&self, instance: &Instance) -> Option<String> {
        if let Some(pd) = &instance.job_provisioning_data {
            return Some(pd.public_ip.clone().unwrap_or_else(|| pd.hostname.clone()));
        }
        instance.remote_connection_info.as_ref().map(|r| r.host.clone())
    }
}

#[async_trait]
impl HealthCheck for ShimHealthCheck {
    async fn check(&self, instance: &Instance) -> HealthCheckResult {
        let Some(host) = self.host_for(instance) else {
            return HealthCheckResult::unhealthy("no reachable address yet");
        };
        let url = format!("http://{host}:{}{}", self.port, self.path);
        match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => HealthCheckResult::healthy(),
            Ok(resp) => HealthCheckResult::unhealthy(format!("shim returned {}", resp.status())),
            Err(err) => HealthCheckResult::unhealthy(err.to_string()),
        }
    }
}
