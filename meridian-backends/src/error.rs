use thiserror::Error;

pub type BackendResult<T> = Result<T, BackendError>;

/// The adapter-facing error kinds a `ComputeBackend` call can surface. Only
/// `NoCapacity` and `Transient` are expected operating conditions; the others
/// are reconciler-terminal.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("no instance available for the requested offer")]
    NoCapacity,

    #[error("transient backend fault: {0}")]
    Transient(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("instance not found at backend")]
    NotFound,

    #[error("request exceeded its deadline")]
    DeadlineExceeded,
}

impl From<BackendError> for meridian_core::Error {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::NoCapacity => meridian_core::Error::CapacityExhausted,
            BackendError::Transient(msg) => meridian_core::Error::Transient(msg),
            BackendError::Configuration(msg) => meridian_core::Error::Configuration(msg),
            BackendError::NotFound => {
                meridian_core::Error::Transient("instance not found at backend".into())
            }
            BackendError::DeadlineExceeded => {
                meridian_core::Error::Transient("call exceeded its deadline".into())
            }
        }
    }
}
