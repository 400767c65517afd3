use std::time::Duration;

use basesync_core::{ErrorReport, Phase};
use basesync_storage::TransportError;
use thiserror::Error;

use crate::queue::QueueError;

/// Fatal cycle errors. Rate-limit responses never surface here.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The transport failed without a structured response.
    #[error(transparent)]
    Transport(TransportError),
    #[error("resource {resource} page {page}: failure (status {status}: {body})")]
    Status {
        resource: String,
        page: u32,
        status: u16,
        body: serde_json::Value,
    },
    #[error("queued request exceeded its {0:?} timeout")]
    TaskTimeout(Duration),
    #[error("queued request aborted: {0}")]
    TaskAborted(String),
    #[error("transform failed: {0:#}")]
    Transform(anyhow::Error),
}

impl SyncError {
    pub fn phase(&self) -> Phase {
        match self {
            Self::Transform(_) => Phase::Parsing,
            _ => Phase::Fetching,
        }
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport::from_error(self, Some(self.phase()))
    }
}

impl From<QueueError<SyncError>> for SyncError {
    fn from(err: QueueError<SyncError>) -> Self {
        match err {
            QueueError::Task(err) => err,
            QueueError::Timeout(limit) => Self::TaskTimeout(limit),
            QueueError::Aborted(reason) => Self::TaskAborted(reason),
        }
    }
}
