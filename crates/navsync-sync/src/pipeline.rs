use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use navsync_feed::{FeedParser, ParseStats};
use navsync_storage::{FeedSnapshot, FeedSource, IngestStore};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::engine::{UpsertConfig, UpsertEngine, UpsertOutcome};
use crate::resolver::{CategoryResolver, ResolveStats};
use crate::IngestError;

/// Last fetched feed body, reused until it is older than `ttl`.
#[derive(Debug, Clone)]
pub struct FeedCache {
    snapshot: Option<FeedSnapshot>,
    ttl: Duration,
}

impl FeedCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            snapshot: None,
            ttl,
        }
    }

    pub fn snapshot(&self) -> Option<&FeedSnapshot> {
        self.snapshot.as_ref()
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.snapshot.as_ref().is_some_and(|s| {
            let age = (now - s.fetched_at).to_std().unwrap_or_default();
            age < self.ttl
        })
    }

    /// Take the cached snapshot if it is still fresh; a stale one is discarded.
    pub fn take_fresh(&mut self, now: DateTime<Utc>) -> Option<FeedSnapshot> {
        if self.is_fresh(now) {
            self.snapshot.take()
        } else {
            self.snapshot = None;
            None
        }
    }

    pub fn store(&mut self, snapshot: FeedSnapshot) {
        self.snapshot = Some(snapshot);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestionReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub feed_digest: String,
    pub fetched_at: DateTime<Utc>,
    pub from_cache: bool,
    pub parse: ParseStats,
    pub categories: ResolveStats,
    pub upsert: UpsertOutcome,
}

pub struct IngestionPipeline {
    parser: FeedParser,
    resolver: CategoryResolver,
    engine: UpsertEngine,
}

impl IngestionPipeline {
    pub fn new(store: Arc<dyn IngestStore>, parser: FeedParser, upsert: UpsertConfig) -> Self {
        Self {
            parser,
            resolver: CategoryResolver::new(store.clone()),
            engine: UpsertEngine::new(store, upsert),
        }
    }

    /// Parse, resolve categories, and upsert one feed body.
    pub async fn ingest(&self, snapshot: &FeedSnapshot) -> Result<IngestionReport, IngestError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("ingest_run", %run_id, digest = %snapshot.digest);

        async {
            let parsed = self.parser.parse(&snapshot.body);
            info!(
                lines = parsed.stats.lines,
                entries = parsed.stats.entries,
                headers = parsed.headers.len(),
                dropped = parsed.stats.dropped.total(),
                "feed parsed"
            );
            if parsed.entries.is_empty() {
                warn!("feed produced no entries");
            }

            let categories = self.resolver.resolve(&parsed.headers).await;
            let funds = categories.attach(parsed.entries);
            let upsert = self.engine.upsert(funds).await?;

            Ok(IngestionReport {
                run_id,
                started_at,
                finished_at: Utc::now(),
                feed_digest: snapshot.digest.clone(),
                fetched_at: snapshot.fetched_at,
                from_cache: false,
                parse: parsed.stats,
                categories: categories.stats,
                upsert,
            })
        }
        .instrument(span)
        .await
    }

    /// Fetch only when `cache` is stale, then ingest. The snapshot goes back into
    /// the cache whether or not ingestion succeeds.
    pub async fn run_cycle(
        &self,
        source: &dyn FeedSource,
        cache: &mut FeedCache,
    ) -> Result<IngestionReport, IngestError> {
        let (snapshot, from_cache) = match cache.take_fresh(Utc::now()) {
            Some(snapshot) => {
                info!(fetched_at = %snapshot.fetched_at, "reusing cached feed");
                (snapshot, true)
            }
            None => {
                let snapshot = source.fetch_feed().await?;
                info!(bytes = snapshot.body.len(), digest = %snapshot.digest, "feed fetched");
                (snapshot, false)
            }
        };

        let result = self.ingest(&snapshot).await;
        cache.store(snapshot);
        result.map(|report| IngestionReport {
            from_cache,
            ..report
        })
    }
}
