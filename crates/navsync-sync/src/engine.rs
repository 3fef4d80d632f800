//! Change-aware batched upserts under a concurrency ceiling.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use navsync_core::{FundSnapshot, FundUpsert, ResolvedFund, UpsertKind};
use navsync_storage::{IngestStore, StoreError};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, Instrument};

use crate::IngestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertConfig {
    pub batch_size: usize,
    pub concurrency: usize,
}

impl Default for UpsertConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct UpsertOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub batches: usize,
    pub noop_batches: usize,
    /// Operations submitted across all bulk writes.
    pub written: usize,
}

impl UpsertOutcome {
    fn absorb(&mut self, batch: &BatchReport) {
        self.inserted += batch.inserted;
        self.updated += batch.updated;
        self.unchanged += batch.unchanged;
        self.written += batch.written;
        if batch.written == 0 {
            self.noop_batches += 1;
        }
    }
}

/// Write operations for one batch, plus how many entries needed none.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BatchPlan {
    pub ops: Vec<FundUpsert>,
    pub unchanged: usize,
}

/// Diff a batch against its stored projections. New ISINs become inserts, ISINs
/// whose nav, nav date or category moved become updates, the rest emit nothing.
pub fn plan_batch(
    batch: Vec<ResolvedFund>,
    existing: &[FundSnapshot],
    written_at: DateTime<Utc>,
) -> BatchPlan {
    let by_isin = existing
        .iter()
        .map(|s| (s.isin.as_str(), s))
        .collect::<HashMap<_, _>>();

    let mut plan = BatchPlan::default();
    for fund in batch {
        let kind = match by_isin.get(fund.isin.as_str()) {
            None => UpsertKind::Insert,
            Some(stored) if fund.matches(stored) => {
                plan.unchanged += 1;
                continue;
            }
            Some(_) => UpsertKind::Update,
        };
        plan.ops.push(FundUpsert {
            kind,
            fund,
            written_at,
        });
    }
    plan
}

#[derive(Debug, Clone, Copy, Default)]
struct BatchReport {
    inserted: usize,
    updated: usize,
    unchanged: usize,
    written: usize,
}

#[derive(Debug)]
struct BatchFailure {
    index: usize,
    error: StoreError,
}

pub struct UpsertEngine {
    store: Arc<dyn IngestStore>,
    config: UpsertConfig,
}

impl UpsertEngine {
    pub fn new(store: Arc<dyn IngestStore>, config: UpsertConfig) -> Self {
        Self { store, config }
    }

    /// Persist `funds` in contiguous batches, at most `concurrency` in flight.
    ///
    /// Every batch runs to completion even when a sibling fails; batches that
    /// committed stay committed. The call fails if any batch failed.
    pub async fn upsert(&self, funds: Vec<ResolvedFund>) -> Result<UpsertOutcome, IngestError> {
        let written_at = Utc::now();
        let batches = split_batches(funds, self.config.batch_size);
        let total = batches.len();
        let mut outcome = UpsertOutcome {
            batches: total,
            ..UpsertOutcome::default()
        };
        if total == 0 {
            return Ok(outcome);
        }

        let slots = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for (index, batch) in batches.into_iter().enumerate() {
            let permit = slots
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore not closed");
            let store = self.store.clone();
            let span = info_span!("upsert_batch", batch = index, size = batch.len());
            tasks.spawn(
                async move {
                    let _permit = permit;
                    run_batch(store.as_ref(), index, batch, written_at).await
                }
                .instrument(span),
            );
        }

        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(report)) => outcome.absorb(&report),
                Ok(Err(failure)) => {
                    error!(batch = failure.index, error = %failure.error, "upsert batch failed");
                    failures.push(failure.error.to_string());
                }
                Err(join_err) => {
                    error!(error = %join_err, "upsert batch task aborted");
                    failures.push(format!("batch task aborted: {join_err}"));
                }
            }
        }

        if let Some(first) = failures.first() {
            return Err(IngestError::BatchesFailed {
                failed: failures.len(),
                total,
                first: first.clone(),
                committed: outcome,
            });
        }

        info!(
            inserted = outcome.inserted,
            updated = outcome.updated,
            unchanged = outcome.unchanged,
            batches = outcome.batches,
            noop_batches = outcome.noop_batches,
            "upsert complete"
        );
        Ok(outcome)
    }
}

fn split_batches(mut funds: Vec<ResolvedFund>, batch_size: usize) -> Vec<Vec<ResolvedFund>> {
    let batch_size = batch_size.max(1);
    let mut batches = Vec::with_capacity(funds.len().div_ceil(batch_size));
    while !funds.is_empty() {
        let rest = funds.split_off(batch_size.min(funds.len()));
        batches.push(funds);
        funds = rest;
    }
    batches
}

async fn run_batch(
    store: &dyn IngestStore,
    index: usize,
    batch: Vec<ResolvedFund>,
    written_at: DateTime<Utc>,
) -> Result<BatchReport, BatchFailure> {
    let fail = |error| BatchFailure { index, error };

    let isins = batch.iter().map(|f| f.isin.clone()).collect::<Vec<_>>();
    let existing = store.find_fund_snapshots(&isins).await.map_err(fail)?;
    let plan = plan_batch(batch, &existing, written_at);

    if plan.ops.is_empty() {
        debug!(unchanged = plan.unchanged, "batch has no changes");
        return Ok(BatchReport {
            unchanged: plan.unchanged,
            ..BatchReport::default()
        });
    }

    let result = store.bulk_write(&plan.ops).await.map_err(fail)?;
    debug!(
        inserted = result.inserted,
        modified = result.modified,
        unchanged = plan.unchanged,
        "batch written"
    );
    Ok(BatchReport {
        inserted: result.inserted,
        updated: result.modified,
        unchanged: plan.unchanged,
        written: plan.ops.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use navsync_core::AmfiCategory;
    use navsync_storage::{BulkWriteResult, CategoryInsert, MemoryStore};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use uuid::Uuid;

    fn fund(isin: &str, nav: f64) -> ResolvedFund {
        ResolvedFund {
            isin: isin.to_string(),
            name: format!("Fund {isin}"),
            nav,
            nav_date: NaiveDate::from_ymd_opt(2026, 10, 16).unwrap(),
            category_id: None,
        }
    }

    fn funds(count: usize) -> Vec<ResolvedFund> {
        (0..count).map(|i| fund(&format!("INF{i:09}"), 10.0 + i as f64)).collect()
    }

    /// Counts concurrent bulk calls and holds each one open long enough for
    /// siblings to pile up.
    #[derive(Default)]
    struct GaugedStore {
        inner: MemoryStore,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl GaugedStore {
        async fn gauge<T>(&self, fut: impl std::future::Future<Output = T>) -> T {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            let out = fut.await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            out
        }
    }

    #[async_trait]
    impl IngestStore for GaugedStore {
        async fn find_category_by_name(&self, name: &str) -> Result<Option<AmfiCategory>, StoreError> {
            self.inner.find_category_by_name(name).await
        }
        async fn insert_category(&self, category: &AmfiCategory) -> Result<CategoryInsert, StoreError> {
            self.inner.insert_category(category).await
        }
        async fn find_fund_snapshots(&self, isins: &[String]) -> Result<Vec<FundSnapshot>, StoreError> {
            self.gauge(self.inner.find_fund_snapshots(isins)).await
        }
        async fn bulk_write(&self, ops: &[FundUpsert]) -> Result<BulkWriteResult, StoreError> {
            self.gauge(self.inner.bulk_write(ops)).await
        }
    }

    /// Fails any bulk write that contains the poisoned ISIN.
    struct PoisonedStore {
        inner: MemoryStore,
        poisoned_isin: String,
    }

    #[async_trait]
    impl IngestStore for PoisonedStore {
        async fn find_category_by_name(&self, name: &str) -> Result<Option<AmfiCategory>, StoreError> {
            self.inner.find_category_by_name(name).await
        }
        async fn insert_category(&self, category: &AmfiCategory) -> Result<CategoryInsert, StoreError> {
            self.inner.insert_category(category).await
        }
        async fn find_fund_snapshots(&self, isins: &[String]) -> Result<Vec<FundSnapshot>, StoreError> {
            self.inner.find_fund_snapshots(isins).await
        }
        async fn bulk_write(&self, ops: &[FundUpsert]) -> Result<BulkWriteResult, StoreError> {
            if ops.iter().any(|op| op.fund.isin == self.poisoned_isin) {
                return Err(StoreError::BulkWrite {
                    failed: 1,
                    attempted: ops.len(),
                    first: "write conflict".into(),
                });
            }
            self.inner.bulk_write(ops).await
        }
    }

    #[test]
    fn plan_emits_nothing_for_matching_records() {
        let existing = vec![FundSnapshot {
            isin: "INF000000001".into(),
            nav: 10.5,
            nav_date: NaiveDate::from_ymd_opt(2026, 10, 16).unwrap(),
            category_id: None,
        }];
        let plan = plan_batch(vec![fund("INF000000001", 10.5)], &existing, Utc::now());
        assert!(plan.ops.is_empty());
        assert_eq!(plan.unchanged, 1);

        let plan = plan_batch(vec![fund("INF000000001", 10.6)], &existing, Utc::now());
        assert_eq!(plan.ops.len(), 1);
        assert_eq!(plan.ops[0].kind, UpsertKind::Update);
        assert_eq!(plan.ops[0].fund.isin, "INF000000001");
        assert_eq!(plan.ops[0].fund.nav, 10.6);
    }

    #[test]
    fn plan_detects_new_isins_and_category_moves() {
        let existing = vec![FundSnapshot {
            isin: "INF000000001".into(),
            nav: 10.5,
            nav_date: NaiveDate::from_ymd_opt(2026, 10, 16).unwrap(),
            category_id: None,
        }];
        let mut moved = fund("INF000000001", 10.5);
        moved.category_id = Some(Uuid::new_v4());
        let plan = plan_batch(vec![moved, fund("INF000000002", 11.0)], &existing, Utc::now());
        let kinds = plan.ops.iter().map(|op| op.kind).collect::<Vec<_>>();
        assert_eq!(kinds, vec![UpsertKind::Update, UpsertKind::Insert]);
    }

    #[test]
    fn batches_are_contiguous_and_bounded() {
        let batches = split_batches(funds(7), 3);
        let sizes = batches.iter().map(Vec::len).collect::<Vec<_>>();
        assert_eq!(sizes, vec![3, 3, 1]);
        assert_eq!(batches[1][0].isin, "INF000000003");
        assert!(split_batches(Vec::new(), 3).is_empty());
    }

    #[tokio::test]
    async fn second_identical_run_writes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let engine = UpsertEngine::new(store.clone(), UpsertConfig { batch_size: 4, concurrency: 2 });

        let first = engine.upsert(funds(10)).await.unwrap();
        assert_eq!(first.inserted, 10);
        assert_eq!(first.batches, 3);

        let second = engine.upsert(funds(10)).await.unwrap();
        assert_eq!(second.written, 0);
        assert_eq!(second.inserted + second.updated, 0);
        assert_eq!(second.unchanged, 10);
        assert_eq!(second.noop_batches, 3);
    }

    #[tokio::test]
    async fn changed_nav_updates_only_that_isin() {
        let store = Arc::new(MemoryStore::new());
        let engine = UpsertEngine::new(store.clone(), UpsertConfig::default());
        engine.upsert(vec![fund("INF000000001", 10.5), fund("INF000000002", 20.0)]).await.unwrap();
        let created = store.fund("INF000000001").await.unwrap().created_at;

        let outcome = engine
            .upsert(vec![fund("INF000000001", 10.6), fund("INF000000002", 20.0)])
            .await
            .unwrap();
        assert_eq!(outcome.updated, 1);
        assert_eq!(outcome.unchanged, 1);
        assert_eq!(outcome.written, 1);

        let stored = store.fund("INF000000001").await.unwrap();
        assert_eq!(stored.nav, 10.6);
        assert_eq!(stored.created_at, created);
        assert!(stored.updated_at >= created);
    }

    async fn peak_in_flight(concurrency: usize) -> usize {
        let store = Arc::new(GaugedStore::default());
        let engine = UpsertEngine::new(store.clone(), UpsertConfig { batch_size: 2, concurrency });

        let outcome = engine.upsert(funds(10)).await.unwrap();
        assert_eq!(outcome.batches, 5);
        assert_eq!(outcome.inserted, 10);
        store.peak.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn fills_but_never_exceeds_concurrency_ceiling() {
        assert_eq!(peak_in_flight(2).await, 2);
    }

    #[tokio::test]
    async fn concurrency_ceiling_tracks_config() {
        assert_eq!(peak_in_flight(1).await, 1);
        assert_eq!(peak_in_flight(3).await, 3);
        // More slots than batches: every batch runs at once.
        assert_eq!(peak_in_flight(8).await, 5);
    }

    #[tokio::test]
    async fn failed_batch_fails_run_but_siblings_commit() {
        let store = Arc::new(PoisonedStore {
            inner: MemoryStore::new(),
            poisoned_isin: "INF000000004".into(),
        });
        let engine = UpsertEngine::new(store.clone(), UpsertConfig { batch_size: 3, concurrency: 2 });

        let err = engine.upsert(funds(9)).await.unwrap_err();
        match err {
            IngestError::BatchesFailed { failed, total, committed, .. } => {
                assert_eq!(failed, 1);
                assert_eq!(total, 3);
                assert_eq!(committed.inserted, 6);
            }
            other => panic!("unexpected error: {other}"),
        }

        let stored = store.inner.funds().await;
        assert_eq!(stored.len(), 6);
        assert!(store.inner.fund("INF000000000").await.is_some());
        assert!(store.inner.fund("INF000000008").await.is_some());
        assert!(store.inner.fund("INF000000004").await.is_none());
    }
}
