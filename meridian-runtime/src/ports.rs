//! Pure port-allocation helper for jobs placed on `local`/SSH-attached
//! instances (spec §4.3 "Port allocation"). No I/O: given a job's declared
//! ports and a view of what's already bound locally, produces an injective
//! `declared -> host` map or fails on an explicit collision.

use meridian_core::entities::job::PortMapping;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortAllocationError {
    #[error("explicit port {requested} for declared port {declared} collides with an already-bound port")]
    Collision { declared: u16, requested: u16 },

    #[error("no free port found starting from {start} (searched {tried} ports)")]
    Exhausted { start: u16, tried: u32 },
}

/// Allocates host ports for a job's declared ports against `bound`, the set
/// of host ports already in use (by other jobs on the same instance).
///
/// Explicit mappings are validated first — a request colliding with another
/// explicit request or with `bound` is rejected outright. `auto` entries are
/// then resolved in declared-port order, probing upward from the declared
/// port until a free one is found, skipping both `bound` and every mapping
/// already chosen in this call. Deterministic: the same inputs always
/// produce the same map (spec §8's port-allocator idempotence law).
pub fn allocate_ports(
    declared: &BTreeMap<u16, PortMapping>,
    bound: &BTreeSet<u16>,
) -> Result<BTreeMap<u16, u16>, PortAllocationError> {
    let mut taken: BTreeSet<u16> = bound.clone();
    let mut result = BTreeMap::new();

    for (&declared_port, mapping) in declared {
        if let PortMapping::Explicit(requested) = mapping {
            if taken.contains(requested) {
                return Err(PortAllocationError::Collision {
                    declared: declared_port,
                    requested: *requested,
                });
            }
            taken.insert(*requested);
            result.insert(declared_port, *requested);
        }
    }

    for (&declared_port, mapping) in declared {
        if matches!(mapping, PortMapping::Auto) {
            let mut candidate = declared_port;
            let mut tried = 0u32;
            loop {
                if !taken.contains(&candidate) {
                    taken.insert(candidate);
                    result.insert(declared_port, candidate);
                    break;
                }
                tried += 1;
                candidate = candidate.checked_add(1).ok_or(PortAllocationError::Exhausted {
                    start: declared_port,
                    tried,
                })?;
                if tried > u16::MAX as u32 {
                    return Err(PortAllocationError::Exhausted {
                        start: declared_port,
                        tried,
                    });
                }
            }
        }
    }

    Ok(result)
}
