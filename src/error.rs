use thiserror::Error;

use crate::backends::BackendError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown task {0}")]
    UnknownTask(String),

    #[error("handler {0} is already registered")]
    DuplicateHandler(String),

    #[error(transparent)]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Cron(#[from] cron::error::Error),

    #[error("task failed: {0}")]
    TaskFailed(String),

    #[error("timed out waiting for task result")]
    ResultTimeout,

    #[error("invalid configuration: {0}")]
    Config(String),
}
