//! Run outcome tracking and the consecutive-failure breaker for scheduled ingestion.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::pipeline::IngestionReport;
use crate::IngestError;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LastRun {
    pub run_id: Option<Uuid>,
    pub finished_at: DateTime<Utc>,
    pub succeeded: bool,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

#[derive(Debug, Clone, Default)]
pub struct HealthState {
    pub consecutive_failures: u32,
    pub scheduler_disabled: bool,
    pub last_run: Option<LastRun>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    /// `ok`, `degraded` after a failed run, or `disabled` once the breaker trips.
    pub status: &'static str,
    pub consecutive_failures: u32,
    pub max_consecutive_failures: u32,
    pub scheduler_disabled: bool,
    pub last_run: Option<LastRun>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug)]
pub struct IngestionHealth {
    max_consecutive_failures: u32,
    state: RwLock<HealthState>,
}

impl IngestionHealth {
    pub fn new(max_consecutive_failures: u32) -> Self {
        Self {
            max_consecutive_failures: max_consecutive_failures.max(1),
            state: RwLock::new(HealthState::default()),
        }
    }

    pub fn max_consecutive_failures(&self) -> u32 {
        self.max_consecutive_failures
    }

    pub async fn record_success(&self, report: &IngestionReport) {
        let mut state = self.state.write().await;
        state.consecutive_failures = 0;
        state.last_error = None;
        state.last_success_at = Some(report.finished_at);
        state.last_run = Some(LastRun {
            run_id: Some(report.run_id),
            finished_at: report.finished_at,
            succeeded: true,
            inserted: report.upsert.inserted,
            updated: report.upsert.updated,
            unchanged: report.upsert.unchanged,
        });
    }

    /// Returns the failure streak including this one.
    pub async fn record_failure(&self, err: &IngestError) -> u32 {
        let mut state = self.state.write().await;
        state.consecutive_failures += 1;
        state.last_error = Some(err.to_string());
        let (inserted, updated, unchanged) = match err {
            IngestError::BatchesFailed { committed, .. } => {
                (committed.inserted, committed.updated, committed.unchanged)
            }
            IngestError::Fetch(_) => (0, 0, 0),
        };
        state.last_run = Some(LastRun {
            run_id: None,
            finished_at: Utc::now(),
            succeeded: false,
            inserted,
            updated,
            unchanged,
        });
        state.consecutive_failures
    }

    pub async fn tripped(&self) -> bool {
        self.state.read().await.consecutive_failures >= self.max_consecutive_failures
    }

    pub async fn mark_disabled(&self) {
        self.state.write().await.scheduler_disabled = true;
    }

    pub async fn is_disabled(&self) -> bool {
        self.state.read().await.scheduler_disabled
    }

    pub async fn status(&self) -> HealthStatus {
        let state = self.state.read().await.clone();
        let status = if state.scheduler_disabled {
            "disabled"
        } else if state.consecutive_failures > 0 {
            "degraded"
        } else {
            "ok"
        };
        HealthStatus {
            status,
            consecutive_failures: state.consecutive_failures,
            max_consecutive_failures: self.max_consecutive_failures,
            scheduler_disabled: state.scheduler_disabled,
            last_run: state.last_run,
            last_success_at: state.last_success_at,
            last_error: state.last_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::UpsertOutcome;
    use navsync_storage::FetchError;

    fn fetch_failure() -> IngestError {
        IngestError::Fetch(FetchError::HttpStatus {
            status: 502,
            url: "https://www.amfiindia.com/spages/NAVAll.txt".into(),
        })
    }

    #[tokio::test]
    async fn trips_after_consecutive_failures() {
        let health = IngestionHealth::new(3);
        assert_eq!(health.record_failure(&fetch_failure()).await, 1);
        assert_eq!(health.record_failure(&fetch_failure()).await, 2);
        assert!(!health.tripped().await);
        assert_eq!(health.status().await.status, "degraded");

        assert_eq!(health.record_failure(&fetch_failure()).await, 3);
        assert!(health.tripped().await);

        health.mark_disabled().await;
        let status = health.status().await;
        assert_eq!(status.status, "disabled");
        assert!(status.scheduler_disabled);
        assert!(status.last_error.unwrap().contains("502"));
    }

    #[tokio::test]
    async fn partial_commit_counts_are_kept_on_failure() {
        let health = IngestionHealth::new(2);
        let err = IngestError::BatchesFailed {
            failed: 1,
            total: 4,
            first: "write conflict".into(),
            committed: UpsertOutcome {
                inserted: 3000,
                batches: 4,
                written: 3000,
                ..UpsertOutcome::default()
            },
        };
        health.record_failure(&err).await;
        let last = health.status().await.last_run.unwrap();
        assert!(!last.succeeded);
        assert_eq!(last.inserted, 3000);
    }

    #[test]
    fn zero_threshold_is_clamped() {
        assert_eq!(IngestionHealth::new(0).max_consecutive_failures(), 1);
    }
}
