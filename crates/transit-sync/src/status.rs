//! Run state, summaries and the handle returned for background runs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::batch::{BatchProgress, ProgressSnapshot};
use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Idle,
    CollectingNames,
    FetchingDetails,
    Grouping,
    EnrichingCoordinates,
    Persisting,
    Completed,
    Error,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Error | RunState::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    FullSync,
    CoordinateSupplement,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub name_pages: usize,
    pub names_collected: usize,
    pub detail_lookups: usize,
    pub detail_failures: usize,
    pub observations: usize,
    pub groups: usize,
    pub resolved_from_sources: usize,
    pub resolved_by_geocoder: usize,
    pub unresolved: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub persist_failures: usize,
    pub suspected_duplicates: Vec<String>,
    /// Sources left out of this run because their key is unset.
    pub skipped_sources: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SupplementSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total: usize,
    pub updated: usize,
    pub not_found: usize,
    pub failed: usize,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOutcome {
    FullSync(SyncRunSummary),
    CoordinateSupplement(SupplementSummary),
}

/// Point-in-time view of the orchestrator, published on a watch channel.
#[derive(Debug, Clone, Serialize)]
pub struct RunStatus {
    pub run_id: Option<Uuid>,
    pub kind: Option<RunKind>,
    pub state: RunState,
    pub message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub progress: ProgressSnapshot,
    pub outcome: Option<RunOutcome>,
}

impl RunStatus {
    pub fn idle() -> Self {
        Self {
            run_id: None,
            kind: None,
            state: RunState::Idle,
            message: None,
            started_at: None,
            finished_at: None,
            progress: ProgressSnapshot::default(),
            outcome: None,
        }
    }

    pub fn started(run_id: Uuid, kind: RunKind, state: RunState) -> Self {
        Self {
            run_id: Some(run_id),
            kind: Some(kind),
            state,
            started_at: Some(Utc::now()),
            ..Self::idle()
        }
    }
}

pub struct SyncHandle {
    pub run_id: Uuid,
    pub status: watch::Receiver<RunStatus>,
    pub progress: Arc<BatchProgress>,
    pub cancel: CancellationToken,
    pub join: JoinHandle<Result<RunOutcome, SyncError>>,
}

impl SyncHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn status(&self) -> RunStatus {
        let mut status = self.status.borrow().clone();
        status.progress = self.progress.snapshot();
        status
    }

    pub async fn wait(self) -> Result<RunOutcome, SyncError> {
        self.join
            .await
            .map_err(|err| SyncError::RunFailure(format!("run task failed: {err}")))?
    }
}
