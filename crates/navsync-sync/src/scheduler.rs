use std::sync::Arc;

use anyhow::{Context, Result};
use navsync_storage::FeedSource;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::health::IngestionHealth;
use crate::pipeline::{FeedCache, IngestionPipeline, IngestionReport};
use crate::IngestError;

/// One scheduled ingestion: a pipeline, where it fetches from, the cache it
/// keeps between runs, and the health it reports into.
pub struct IngestionJob {
    pipeline: Arc<IngestionPipeline>,
    source: Arc<dyn FeedSource>,
    cache: Mutex<FeedCache>,
    health: Arc<IngestionHealth>,
}

impl IngestionJob {
    pub fn new(
        pipeline: Arc<IngestionPipeline>,
        source: Arc<dyn FeedSource>,
        cache: FeedCache,
        health: Arc<IngestionHealth>,
    ) -> Self {
        Self {
            pipeline,
            source,
            cache: Mutex::new(cache),
            health,
        }
    }

    pub fn health(&self) -> Arc<IngestionHealth> {
        self.health.clone()
    }

    /// Run one cycle and record its outcome. Overlapping calls queue on the cache lock.
    pub async fn run(&self) -> Result<IngestionReport, IngestError> {
        let mut cache = self.cache.lock().await;
        match self.pipeline.run_cycle(self.source.as_ref(), &mut cache).await {
            Ok(report) => {
                info!(
                    run_id = %report.run_id,
                    inserted = report.upsert.inserted,
                    updated = report.upsert.updated,
                    unchanged = report.upsert.unchanged,
                    from_cache = report.from_cache,
                    "ingestion run succeeded"
                );
                self.health.record_success(&report).await;
                Ok(report)
            }
            Err(err) => {
                let streak = self.health.record_failure(&err).await;
                error!(
                    error = %err,
                    consecutive_failures = streak,
                    max = self.health.max_consecutive_failures(),
                    "ingestion run failed"
                );
                Err(err)
            }
        }
    }

    /// A scheduled tick. Returns `true` when the breaker tripped on this run and
    /// the job should stop firing.
    pub async fn tick(&self) -> bool {
        if self.health.is_disabled().await {
            warn!("ingestion disabled after repeated failures; skipping tick");
            return false;
        }
        if self.run().await.is_ok() || !self.health.tripped().await {
            return false;
        }
        self.health.mark_disabled().await;
        true
    }
}

async fn scheduled_tick(job: Arc<IngestionJob>, job_id: Uuid, sched: JobScheduler) {
    if !job.tick().await {
        return;
    }
    error!(
        max = job.health.max_consecutive_failures(),
        "ingestion failure limit reached; removing scheduled job until restart"
    );
    if let Err(err) = sched.remove(&job_id).await {
        error!(error = %err, "failed to remove scheduled ingestion job");
    }
}

pub async fn build_scheduler(job: Arc<IngestionJob>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let scheduled = Job::new_async(cron, move |job_id, sched| {
        let job = job.clone();
        Box::pin(scheduled_tick(job, job_id, sched))
    })
    .with_context(|| format!("creating ingestion job for cron {cron}"))?;
    sched.add(scheduled).await.context("adding ingestion job")?;
    Ok(sched)
}
