//! Core domain model for the AMFI NAV ingestion pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "navsync-core";

/// One well-formed data row of the feed, still carrying its section header by name.
///
/// The category is a pending reference: the parser knows which header was active
/// when the row was read, and the resolver later turns that name into an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedEntry {
    pub isin: String,
    pub name: String,
    pub nav: f64,
    pub nav_date: NaiveDate,
    pub category: Option<String>,
}

impl FeedEntry {
    pub fn resolve(self, category_id: Option<Uuid>) -> ResolvedFund {
        ResolvedFund {
            isin: self.isin,
            name: self.name,
            nav: self.nav,
            nav_date: self.nav_date,
            category_id,
        }
    }
}

/// Handoff contract from the category resolver into the upsert engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedFund {
    pub isin: String,
    pub name: String,
    pub nav: f64,
    pub nav_date: NaiveDate,
    pub category_id: Option<Uuid>,
}

impl ResolvedFund {
    /// True when the stored projection already matches this fund's tracked fields.
    pub fn matches(&self, existing: &FundSnapshot) -> bool {
        self.nav == existing.nav
            && self.nav_date == existing.nav_date
            && self.category_id == existing.category_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CategoryStatus {
    Set,
    #[default]
    Unset,
}

impl CategoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CategoryStatus::Set => "set",
            CategoryStatus::Unset => "unset",
        }
    }
}

impl fmt::Display for CategoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown category status `{0}` (expected `set` or `unset`)")]
pub struct UnknownCategoryStatus(pub String);

impl FromStr for CategoryStatus {
    type Err = UnknownCategoryStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "set" => Ok(CategoryStatus::Set),
            "unset" => Ok(CategoryStatus::Unset),
            other => Err(UnknownCategoryStatus(other.to_string())),
        }
    }
}

/// Classification group published by the feed's section headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AmfiCategory {
    pub id: Uuid,
    pub name: String,
    pub status: CategoryStatus,
    pub linked_instrument_category: Option<Uuid>,
}

impl AmfiCategory {
    /// A freshly discovered header: unset and unlinked.
    pub fn discovered(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            status: CategoryStatus::Unset,
            linked_instrument_category: None,
        }
    }
}

/// Category row as listed by the query API, with the number of funds attached to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AmfiCategorySummary {
    #[serde(flatten)]
    pub category: AmfiCategory,
    pub fund_count: u64,
}

/// Persisted fund, keyed by ISIN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredFund {
    pub isin: String,
    pub name: String,
    pub nav: f64,
    pub nav_date: NaiveDate,
    pub category_id: Option<Uuid>,
    pub category_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The projection of a stored fund the upsert engine diffs against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundSnapshot {
    pub isin: String,
    pub nav: f64,
    pub nav_date: NaiveDate,
    pub category_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertKind {
    /// No stored record was seen for the ISIN when the batch was read.
    Insert,
    /// A stored record exists and at least one tracked field differs.
    Update,
}

/// One write of an unordered bulk write. Always an upsert keyed by ISIN;
/// `created_at` is only ever written when the row is actually inserted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundUpsert {
    pub kind: UpsertKind,
    pub fund: ResolvedFund,
    pub written_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page: u64,
    pub limit: u64,
    pub total: u64,
    pub total_pages: u64,
    pub has_next: bool,
    pub has_prev: bool,
}

impl Pagination {
    pub fn new(page: u64, limit: u64, total: u64) -> Self {
        let page = page.max(1);
        let limit = limit.max(1);
        let skip = (page - 1).saturating_mul(limit);
        Self {
            page,
            limit,
            total,
            total_pages: total.div_ceil(limit),
            has_next: skip.saturating_add(limit) < total,
            has_prev: skip > 0,
        }
    }

    pub fn offset(&self) -> u64 {
        (self.page.max(1) - 1).saturating_mul(self.limit)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub pagination: Pagination,
}

/// Paging + optional case-insensitive substring filter.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PageQuery {
    pub page: u64,
    pub limit: u64,
    pub search: Option<String>,
}

impl PageQuery {
    pub fn new(page: u64, limit: u64, search: Option<String>) -> Self {
        let search = search
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        Self {
            page: page.max(1),
            limit: limit.max(1),
            search,
        }
    }

    pub fn offset(&self) -> u64 {
        (self.page.max(1) - 1).saturating_mul(self.limit.max(1))
    }
}
