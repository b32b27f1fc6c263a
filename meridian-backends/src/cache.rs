//! Process-local, per-backend offer cache (spec §5's "shared resource
//! policy"): a single mutex guarding a map keyed by `(backend, requirements
//! hash)`, TTL [`meridian_core::defaults::OFFER_CACHE_TTL`].

use meridian_core::entities::backend::BackendKind;
use meridian_core::offer::InstanceOfferWithAvailability;
use meridian_core::requirements::Requirements;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::Instant;

fn hash_requirements(requirements: &Requirements) -> u64 {
    // `Requirements` doesn't derive `Hash` (it carries `f64`s), so hash its
    // canonical JSON form instead.
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    serde_json::to_string(requirements)
        .expect("Requirements always serializes")
        .hash(&mut hasher);
    hasher.finish()
}

struct Entry {
    offers: Vec<InstanceOfferWithAvailability>,
    cached_at: Instant,
}

pub struct OfferCache {
    ttl: std::time::Duration,
    entries: Mutex<HashMap<(BackendKind, u64), Entry>>,
}

impl OfferCache {
    pub fn new() -> Self {
        Self {
            ttl: meridian_core::defaults::OFFER_CACHE_TTL,
            entries: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    fn with_ttl(ttl: std::time::Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, backend: BackendKind, requirements: &Requirements) -> Option<Vec<InstanceOfferWithAvailability>> {
        let key = (backend, hash_requirements(requirements));
        let entries = self.entries.lock().expect("OfferCache mutex poisoned");
        entries.get(&key).and_then(|entry| {
            if entry.cached_at.elapsed() < self.ttl {
                Some(entry.offers.clone())
            } else {
                None
            }
        })
    }

    pub fn put(&self, backend: BackendKind, requirements: &Requirements, offers: Vec<InstanceOfferWithAvailability>) {
        let key = (backend, hash_requirements(requirements));
        let mut entries = self.entries.lock().expect("OfferCache mutex poisoned");
        entries.insert(
            key,
            Entry {
                offers,
                cached_at: Instant::now(),
            },
        );
    }
}

impl Default for OfferCache {
    fn default() -> Self {
        Self::new()
    }
}
