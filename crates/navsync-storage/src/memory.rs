//! In-process store with the same semantics as the Postgres store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use navsync_core::{
    AmfiCategory, AmfiCategorySummary, CategoryStatus, FundSnapshot, FundUpsert, Page, PageQuery,
    Pagination, StoredFund,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{BulkWriteResult, CategoryInsert, IngestStore, QueryStore, StoreError};

#[derive(Debug, Default)]
struct MemoryState {
    categories: BTreeMap<Uuid, AmfiCategory>,
    funds: BTreeMap<String, StoredFund>,
}

impl MemoryState {
    fn category_name(&self, id: Option<Uuid>) -> Option<String> {
        id.and_then(|id| self.categories.get(&id))
            .map(|c| c.name.clone())
    }

    fn with_category_name(&self, fund: &StoredFund) -> StoredFund {
        StoredFund {
            category_name: self.category_name(fund.category_id),
            ..fund.clone()
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fund(&self, isin: &str) -> Option<StoredFund> {
        let state = self.state.read().await;
        state.funds.get(isin).map(|f| state.with_category_name(f))
    }

    pub async fn funds(&self) -> Vec<StoredFund> {
        let state = self.state.read().await;
        state
            .funds
            .values()
            .map(|f| state.with_category_name(f))
            .collect()
    }

    pub async fn categories(&self) -> Vec<AmfiCategory> {
        let state = self.state.read().await;
        let mut out = state.categories.values().cloned().collect::<Vec<_>>();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

fn contains_ci(haystack: &str, needle_lower: &str) -> bool {
    haystack.to_lowercase().contains(needle_lower)
}

fn paginate<T>(items: Vec<T>, query: &PageQuery) -> Page<T> {
    let pagination = Pagination::new(query.page, query.limit, items.len() as u64);
    let data = items
        .into_iter()
        .skip(usize::try_from(pagination.offset()).unwrap_or(usize::MAX))
        .take(usize::try_from(pagination.limit).unwrap_or(usize::MAX))
        .collect();
    Page { data, pagination }
}

#[async_trait]
impl IngestStore for MemoryStore {
    async fn find_category_by_name(&self, name: &str) -> Result<Option<AmfiCategory>, StoreError> {
        let state = self.state.read().await;
        Ok(state.categories.values().find(|c| c.name == name).cloned())
    }

    async fn insert_category(&self, category: &AmfiCategory) -> Result<CategoryInsert, StoreError> {
        let mut state = self.state.write().await;
        if state.categories.values().any(|c| c.name == category.name) {
            return Ok(CategoryInsert::AlreadyExists);
        }
        state.categories.insert(category.id, category.clone());
        Ok(CategoryInsert::Created(category.id))
    }

    async fn find_fund_snapshots(&self, isins: &[String]) -> Result<Vec<FundSnapshot>, StoreError> {
        let state = self.state.read().await;
        Ok(isins
            .iter()
            .filter_map(|isin| state.funds.get(isin))
            .map(|f| FundSnapshot {
                isin: f.isin.clone(),
                nav: f.nav,
                nav_date: f.nav_date,
                category_id: f.category_id,
            })
            .collect())
    }

    async fn bulk_write(&self, ops: &[FundUpsert]) -> Result<BulkWriteResult, StoreError> {
        let mut state = self.state.write().await;
        let mut result = BulkWriteResult::default();
        for op in ops {
            let fund = &op.fund;
            match state.funds.get_mut(&fund.isin) {
                Some(existing) => {
                    existing.name = fund.name.clone();
                    existing.nav = fund.nav;
                    existing.nav_date = fund.nav_date;
                    existing.category_id = fund.category_id;
                    existing.updated_at = op.written_at;
                    result.modified += 1;
                }
                None => {
                    state.funds.insert(
                        fund.isin.clone(),
                        StoredFund {
                            isin: fund.isin.clone(),
                            name: fund.name.clone(),
                            nav: fund.nav,
                            nav_date: fund.nav_date,
                            category_id: fund.category_id,
                            category_name: None,
                            created_at: op.written_at,
                            updated_at: op.written_at,
                        },
                    );
                    result.inserted += 1;
                }
            }
        }
        Ok(result)
    }
}

#[async_trait]
impl QueryStore for MemoryStore {
    async fn list_funds(&self, query: &PageQuery) -> Result<Page<StoredFund>, StoreError> {
        let state = self.state.read().await;
        let needle = query.search.as_deref().map(str::to_lowercase);
        let mut matched = state
            .funds
            .values()
            .map(|f| state.with_category_name(f))
            .filter(|f| match &needle {
                None => true,
                Some(n) => {
                    contains_ci(&f.name, n)
                        || contains_ci(&f.isin, n)
                        || f.category_name.as_deref().is_some_and(|c| contains_ci(c, n))
                }
            })
            .collect::<Vec<_>>();
        matched.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.isin.cmp(&b.isin)));
        Ok(paginate(matched, query))
    }

    async fn count_funds(&self) -> Result<u64, StoreError> {
        Ok(self.state.read().await.funds.len() as u64)
    }

    async fn list_categories(
        &self,
        query: &PageQuery,
    ) -> Result<Page<AmfiCategorySummary>, StoreError> {
        let state = self.state.read().await;
        let needle = query.search.as_deref().map(str::to_lowercase);
        let mut matched = Vec::new();
        for category in state.categories.values() {
            let members = state
                .funds
                .values()
                .filter(|f| f.category_id == Some(category.id))
                .collect::<Vec<_>>();
            let hit = match &needle {
                None => true,
                Some(n) => {
                    contains_ci(&category.name, n)
                        || members
                            .iter()
                            .any(|f| contains_ci(&f.name, n) || contains_ci(&f.isin, n))
                }
            };
            if hit {
                matched.push(AmfiCategorySummary {
                    category: category.clone(),
                    fund_count: members.len() as u64,
                });
            }
        }
        matched.sort_by(|a, b| a.category.name.cmp(&b.category.name));
        Ok(paginate(matched, query))
    }

    async fn get_category(&self, id: Uuid) -> Result<Option<AmfiCategory>, StoreError> {
        Ok(self.state.read().await.categories.get(&id).cloned())
    }

    async fn update_category_status(
        &self,
        id: Uuid,
        status: CategoryStatus,
    ) -> Result<Option<AmfiCategory>, StoreError> {
        let mut state = self.state.write().await;
        Ok(state.categories.get_mut(&id).map(|c| {
            c.status = status;
            c.clone()
        }))
    }

    async fn link_instrument_category(
        &self,
        id: Uuid,
        instrument_category: Uuid,
    ) -> Result<Option<AmfiCategory>, StoreError> {
        let mut state = self.state.write().await;
        Ok(state.categories.get_mut(&id).map(|c| {
            c.linked_instrument_category = Some(instrument_category);
            c.status = CategoryStatus::Set;
            c.clone()
        }))
    }
}
