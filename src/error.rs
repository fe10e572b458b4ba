use thiserror::Error;

use crate::executor::ExecutionError;
use crate::job::{JobId, JobState};

#[derive(Error, Debug)]
pub enum SimforgeError {
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Job {id} is {state}, operation not allowed")]
    IllegalState { id: JobId, state: JobState },

    #[error("Job queue is full")]
    QueueFull,

    #[error("Execution failed: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, SimforgeError>;
