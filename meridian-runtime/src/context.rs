use crate::HealthCheck;
use meridian_backends::cache::OfferCache;
use meridian_backends::ComputeBackend;
use meridian_core::entities::backend::BackendKind;
use meridian_core::Clock;
use std::collections::HashMap;
use std::sync::Arc;

/// Everything a reconcile function needs besides the entity it was handed
/// and the stores it reads/writes: the injected clock, the backend registry
/// (`BackendKind -> factory(config, credentials)` from spec.md §9), the
/// shared offer cache, and the healthcheck function.
#[derive(Clone)]
pub struct ReconcileContext {
    pub clock: Arc<dyn Clock>,
    pub backends: Arc<HashMap<BackendKind, Arc<dyn ComputeBackend>>>,
    pub healthcheck: Arc<dyn HealthCheck>,
    pub offer_cache: Arc<OfferCache>,
}

impl ReconcileContext {
    pub fn backend(&self, kind: BackendKind) -> Option<Arc<dyn ComputeBackend>> {
        self.backends.get(&kind).cloned()
    }
}
