use thiserror::Error;

pub type Result<T> = std::result::Result<T, JobError>;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("query {handle} finished with status {status}: {message}")]
    BackendQuery {
        handle: String,
        status: String,
        message: String,
    },

    #[error("query backend unavailable: {0}")]
    Backend(String),

    #[error("metastore error: {0}")]
    Store(String),

    #[error("job already registered: {0}")]
    DuplicateJob(String),

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("model artifact error: {0}")]
    Artifact(String),

    #[error("worker pool error: {0}")]
    Pool(#[from] std::io::Error),

    #[error("submission queue is closed: {0}")]
    QueueClosed(String),

    #[error("training task aborted: {0}")]
    Training(String),

    #[error("job cancelled")]
    Cancelled,
}

impl JobError {
    /// Error code used on the HTTP surface.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_FAILED",
            Self::BackendQuery { .. } => "QUERY_FAILED",
            Self::Backend(_) => "BACKEND_UNAVAILABLE",
            Self::Store(_) => "STORE_UNAVAILABLE",
            Self::DuplicateJob(_) => "DUPLICATE_JOB",
            Self::NotFound(_) => "JOB_NOT_FOUND",
            Self::Artifact(_) => "ARTIFACT_FAILED",
            Self::Pool(_) => "WORKER_POOL_FAILED",
            Self::QueueClosed(_) => "QUEUE_CLOSED",
            Self::Training(_) => "TRAINING_FAILED",
            Self::Cancelled => "JOB_CANCELLED",
        }
    }

    pub(crate) fn store(err: impl std::fmt::Display) -> Self {
        Self::Store(format!("{err:#}"))
    }

    pub(crate) fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend(format!("{err:#}"))
    }
}
