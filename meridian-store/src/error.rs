use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("row not found")]
    NotFound,

    /// The row was mutated (or leased by another worker) between load and
    /// write. The reconciler should simply re-read and retry next tick
    /// rather than treat this as a hard failure (spec §5: "a Run reconciler
    /// may observe a stale Job snapshot; it re-reads ... and re-evaluates on
    /// the next tick if it loses an optimistic-version check").
    #[error("optimistic version check failed")]
    VersionConflict,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("invalid id: {0}")]
    InvalidId(String),
}

impl From<StoreError> for meridian_core::Error {
    fn from(err: StoreError) -> Self {
        meridian_core::Error::Store(meridian_core::StoreErrorProxy(err.to_string()))
    }
}
