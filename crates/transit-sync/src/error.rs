//! Run errors and the cancellation/timeout wrapper around collaborator calls.

use std::time::Duration;

use thiserror::Error;
use transit_adapters::AdapterError;
use transit_storage::{Cancelled, StoreError};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("configuration missing: {0}")]
    ConfigurationMissing(String),
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error("run cancelled")]
    Cancelled,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("a sync run is already active ({0})")]
    AlreadyRunning(uuid::Uuid),
    #[error("run failed: {0}")]
    RunFailure(String),
}

impl SyncError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }

    /// Turns anything but cancellation into a failure that stops the run.
    pub fn halting(self, context: &str) -> SyncError {
        match self {
            SyncError::Cancelled | SyncError::RunFailure(_) => self,
            other => SyncError::RunFailure(format!("{context}: {other}")),
        }
    }
}

impl From<Cancelled> for SyncError {
    fn from(_: Cancelled) -> Self {
        SyncError::Cancelled
    }
}

impl From<AdapterError> for SyncError {
    fn from(err: AdapterError) -> Self {
        SyncError::SourceUnavailable(err.to_string())
    }
}

/// Runs a collaborator call under the run's cancellation token and a timeout.
pub(crate) async fn guard_call<T, E, F>(
    cancel: &tokio_util::sync::CancellationToken,
    operation: &'static str,
    after: Duration,
    call: F,
) -> Result<T, SyncError>
where
    F: std::future::Future<Output = Result<T, E>>,
    E: Into<SyncError>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(SyncError::Cancelled),
        outcome = tokio::time::timeout(after, call) => match outcome {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(SyncError::Timeout { operation, after }),
        },
    }
}
