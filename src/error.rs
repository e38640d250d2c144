use thiserror::Error as ThisError;

pub type OpaqueError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(ThisError, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("failed to resolve {0}")]
    ResolutionFailure(String),
    #[error("echo request buffer unavailable")]
    AllocationFailure,
    #[error("session cancelled before the target was resolved")]
    Cancelled,
    #[error("Response timeout")]
    ResponseTimeout,
    #[error("{0}")]
    Opaque(#[from] OpaqueError),
}
pub type Result<T> = std::result::Result<T, Error>;
