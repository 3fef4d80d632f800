//! Find-or-create of AMFI categories for the headers a parse pass discovered.

use std::collections::HashMap;
use std::sync::Arc;

use navsync_core::{AmfiCategory, FeedEntry, ResolvedFund};
use navsync_storage::{CategoryInsert, IngestStore, StoreError};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ResolveStats {
    pub created: usize,
    pub existing: usize,
    /// Insert hit the unique index (another writer got there first) and the
    /// category was re-read.
    pub recovered_conflicts: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ResolvedCategories {
    ids: HashMap<String, Uuid>,
    pub stats: ResolveStats,
}

impl ResolvedCategories {
    pub fn id_for(&self, header: Option<&str>) -> Option<Uuid> {
        header.and_then(|h| self.ids.get(h).copied())
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Swap each entry's pending header for the persisted id. Entries whose header
    /// is missing or failed to resolve get no category.
    pub fn attach(&self, entries: Vec<FeedEntry>) -> Vec<ResolvedFund> {
        entries
            .into_iter()
            .map(|entry| {
                let id = self.id_for(entry.category.as_deref());
                entry.resolve(id)
            })
            .collect()
    }
}

enum Resolution {
    Existing(Uuid),
    Created(Uuid),
    Recovered(Uuid),
}

pub struct CategoryResolver {
    store: Arc<dyn IngestStore>,
}

impl CategoryResolver {
    pub fn new(store: Arc<dyn IngestStore>) -> Self {
        Self { store }
    }

    /// One find-or-create per distinct header. A header that cannot be resolved is
    /// logged and left out of the mapping rather than failing the run.
    pub async fn resolve(&self, headers: &[String]) -> ResolvedCategories {
        let mut resolved = ResolvedCategories::default();
        for header in headers {
            if resolved.ids.contains_key(header) {
                continue;
            }
            match self.find_or_create(header).await {
                Ok(resolution) => {
                    let id = match resolution {
                        Resolution::Existing(id) => {
                            resolved.stats.existing += 1;
                            id
                        }
                        Resolution::Created(id) => {
                            info!(category = %header, %id, "created AMFI category");
                            resolved.stats.created += 1;
                            id
                        }
                        Resolution::Recovered(id) => {
                            debug!(category = %header, %id, "category created concurrently; re-read");
                            resolved.stats.recovered_conflicts += 1;
                            id
                        }
                    };
                    resolved.ids.insert(header.clone(), id);
                }
                Err(err) => {
                    warn!(category = %header, error = %err, "category resolution failed");
                    resolved.stats.failed += 1;
                }
            }
        }
        resolved
    }

    async fn find_or_create(&self, name: &str) -> Result<Resolution, StoreError> {
        if let Some(existing) = self.store.find_category_by_name(name).await? {
            return Ok(Resolution::Existing(existing.id));
        }

        match self
            .store
            .insert_category(&AmfiCategory::discovered(name))
            .await?
        {
            CategoryInsert::Created(id) => Ok(Resolution::Created(id)),
            CategoryInsert::AlreadyExists => self
                .store
                .find_category_by_name(name)
                .await?
                .map(|c| Resolution::Recovered(c.id))
                .ok_or_else(|| {
                    StoreError::InvalidData(format!(
                        "category `{name}` conflicted on insert but cannot be read back"
                    ))
                }),
        }
    }
}
