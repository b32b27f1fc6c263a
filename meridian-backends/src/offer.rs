//! Merges offers from every enabled backend, filters by [`Requirements`],
//! and ranks the survivors into a deterministic top-K list.

use crate::cache::OfferCache;
use crate::{BackendResult, ComputeBackend};
use meridian_core::offer::{Availability, InstanceOfferWithAvailability};
use meridian_core::requirements::Requirements;
use std::cmp::Ordering;

fn matches(offer: &InstanceOfferWithAvailability, requirements: &Requirements) -> bool {
    let res = &offer.offer.resources;
    let spec = &requirements.resources;
    if !spec.cpu_count.contains(res.cpu_count) {
        return false;
    }
    if !spec.memory_mib.contains(res.memory_mib) {
        return false;
    }
    if !spec.disk_mib.contains(res.disk_mib) {
        return false;
    }
    match (&spec.gpu, &res.gpu) {
        (Some(want), Some(have)) => {
            if !want.count.contains(have.count) {
                return false;
            }
            if want.vendor.as_deref().is_some_and(|v| v != have.vendor) {
                return false;
            }
            if want.name.as_deref().is_some_and(|n| n != have.name) {
                return false;
            }
        }
        (Some(want), None) => {
            if !want.count.contains(0) {
                return false;
            }
        }
        (None, _) => {}
    }
    if !requirements.backends.is_empty() && !requirements.backends.contains(&offer.offer.backend) {
        return false;
    }
    if !requirements.regions.is_empty() && !requirements.regions.contains(&offer.offer.region) {
        return false;
    }
    match requirements.max_price {
        Some(ceiling) if offer.offer.price_per_hour > ceiling => return false,
        _ => {}
    }
    if let Some(reservation) = &requirements.reservation {
        if offer.offer.reservation.as_deref() != Some(reservation.as_str()) {
            return false;
        }
    }
    true
}

/// Total order for ranking: capacity first (anything but `no_capacity`
/// ahead of it), then `available` before `idle` before `no_quota`, then
/// cheaper first, then stable by `(backend, region, instance_type_name)`.
fn cmp_offers(a: &InstanceOfferWithAvailability, b: &InstanceOfferWithAvailability) -> Ordering {
    let has_capacity_a = a.availability != Availability::NoCapacity;
    let has_capacity_b = b.availability != Availability::NoCapacity;
    has_capacity_b
        .cmp(&has_capacity_a)
        .then(a.availability.cmp(&b.availability))
        .then(a.offer.price_per_hour.total_cmp(&b.offer.price_per_hour))
        .then(a.offer.backend.as_str().cmp(b.offer.backend.as_str()))
        .then(a.offer.region.cmp(&b.offer.region))
        .then(a.offer.instance_type_name.cmp(&b.offer.instance_type_name))
}

/// Fetches offers from every backend in `requirements.backends` (or all of
/// `backends` when empty), going through `cache` first, filters and ranks
/// them, and returns the top `top_k`.
pub async fn collect_offers(
    backends: &[(&dyn ComputeBackend, bool)],
    requirements: &Requirements,
    cache: &OfferCache,
    top_k: usize,
) -> BackendResult<Vec<InstanceOfferWithAvailability>> {
    let mut merged = Vec::new();
    for (backend, enabled) in backends {
        if !enabled {
            continue;
        }
        let kind = backend.kind();
        if !requirements.backends.is_empty() && !requirements.backends.contains(&kind) {
            continue;
        }
        let offers = match cache.get(kind, requirements) {
            Some(cached) => cached,
            None => {
                let fetched = backend.get_offers(requirements).await?;
                cache.put(kind, requirements, fetched.clone());
                fetched
            }
        };
        merged.extend(offers);
    }

    merged.retain(|offer| matches(offer, requirements));
    merged.sort_by(cmp_offers);
    merged.truncate(top_k);
    Ok(merged)
}
