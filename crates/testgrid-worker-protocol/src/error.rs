use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkerError {
    #[error("worker configuration error: {0}")]
    Configuration(String),
    #[error("job setup failed: {0}")]
    Setup(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("{0}")]
    InvalidState(String),
    #[error("attempt to start job without ID and job info")]
    MissingJobId,
}
