//! Candidate `(backend, region, instance type, price, availability)` tuples
//! produced by `ComputeBackend::get_offers_cached` and consumed by the offer
//! engine (spec §4.6) and the Job reconciler's placement step (spec §4.3).

use crate::entities::backend::BackendKind;
use crate::entities::instance::Resources;
use serde::{Deserialize, Serialize};

/// Whether an offer can actually be fulfilled right now. Ranking in spec §4.6
/// step 3 treats these as a strict priority order, so the variant order here
/// is meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Available,
    Idle,
    NoQuota,
    NoCapacity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceOffer {
    pub backend: BackendKind,
    pub region: String,
    pub instance_type_name: String,
    pub price_per_hour: f64,
    pub resources: Resources,
    pub spot: bool,
    pub reservation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceOfferWithAvailability {
    pub offer: InstanceOffer,
    pub availability: Availability,
}
