use crate::ids::InstanceId;
use thiserror::Error;

/// Result alias used throughout the reconciler crates.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The error taxonomy a reconciler tick can observe.
///
/// These are *kinds*, not a grab-bag of every failure a backend can throw;
/// `meridian-backends::BackendError` and `meridian-store::StoreError` both
/// convert into this via `#[from]`, so reconcilers match on one enum
/// regardless of where the failure originated.
#[derive(Debug, Error)]
pub enum Error {
    /// The backend rejected provisioning because no instance was available.
    /// Surfaces on a Job as `termination_reason = interrupted_by_no_capacity`.
    #[error("no capacity available for the requested offer")]
    CapacityExhausted,

    /// Rate limit, 5xx, or timeout. Already retried with backoff inside the
    /// adapter; reaching here means the deadline was exceeded and the caller
    /// should simply leave the entity for the next tick.
    #[error("transient backend fault: {0}")]
    Transient(String),

    /// Invalid credentials, malformed spec, missing permission. Terminal for
    /// the entity: the reconciler marks it `failed` with this message and
    /// stops processing.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The backend reports the resource no longer exists. Treated as a
    /// successful terminate/delete, not a failure.
    #[error("instance {0} not found at backend")]
    NotFoundAtBackend(InstanceId),

    /// An invariant (e.g. `busy_blocks > total_blocks`) is about to be
    /// broken. Fatal: no repair is attempted, the entity is marked `failed`.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error(transparent)]
    Store(#[from] StoreErrorProxy),
}

/// `meridian-store::StoreError` converts through this newtype so
/// `meridian-core` does not need to depend on `meridian-store` (which would
/// be a cycle: the store depends on the entity types defined here).
#[derive(Debug, Error)]
#[error("{0}")]
pub struct StoreErrorProxy(pub String);
