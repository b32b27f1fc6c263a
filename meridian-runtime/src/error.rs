use thiserror::Error;

/// Errors a reconciler tick can observe, composed from every crate below this
/// one so a handler can `?`-propagate regardless of origin. Never escapes a
/// tick handler to the dispatcher: the dispatcher only sees `Result`, logs
/// `Err`, and leaves the entity's lease to expire.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Core(#[from] meridian_core::Error),

    #[error(transparent)]
    Store(#[from] meridian_store::StoreError),

    #[error(transparent)]
    Backend(#[from] meridian_backends::BackendError),
}

impl ReconcileError {
    /// Configuration errors and constraint violations are sticky: the
    /// reconciler marks the entity `failed` and never retries it. Everything
    /// else (transient faults, version conflicts, no-capacity) is left for
    /// the next tick.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReconcileError::Core(meridian_core::Error::Configuration(_))
                | ReconcileError::Core(meridian_core::Error::ConstraintViolation(_))
                | ReconcileError::Backend(meridian_backends::BackendError::Configuration(_))
        )
    }
}
