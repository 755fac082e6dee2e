use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::scheduler::job::{JobId, JobStatus, NodeId};

#[derive(Error, Debug)]
pub enum FarmError {
    #[error("Invalid job: {0}")]
    Validation(String),

    #[error("Job already exists: {0}")]
    DuplicateJob(JobId),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Cannot {action} job {job_id} while it is {status}")]
    InvalidState {
        job_id: JobId,
        status: JobStatus,
        action: &'static str,
    },

    #[error("Invalid job transition {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("Renderer exited with code {exit_code:?}: {detail}")]
    RendererCrashed {
        exit_code: Option<i32>,
        detail: String,
    },

    #[error("Renderer made no progress for {0:?}")]
    RendererTimedOut(Duration),

    #[error("Render cancelled")]
    RendererCancelled,

    #[error("Renderer finished but output is missing: {0}")]
    OutputMissing(String),

    #[error("Compositor failed: {0}")]
    Compositor(String),

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Node offline: {0}")]
    NodeOffline(String),

    #[error("Farm API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("Queue snapshot {path:?} is unreadable ({reason}), preserved as {preserved_at:?}")]
    StateCorruption {
        path: PathBuf,
        preserved_at: PathBuf,
        reason: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FarmError {
    /// Network failures worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            FarmError::Network(_) => true,
            FarmError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for FarmError {
    fn from(err: reqwest::Error) -> Self {
        FarmError::Network(err.to_string())
    }
}

impl From<zip::result::ZipError> for FarmError {
    fn from(err: zip::result::ZipError) -> Self {
        FarmError::Transfer(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FarmError>;
