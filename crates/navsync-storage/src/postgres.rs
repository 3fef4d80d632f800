//! Postgres-backed store.

use async_trait::async_trait;
use navsync_core::{
    AmfiCategory, AmfiCategorySummary, CategoryStatus, FundSnapshot, FundUpsert, Page, PageQuery,
    Pagination, StoredFund,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    like_pattern, BulkWriteResult, CategoryInsert, IngestStore, QueryStore, StoreError,
};

const UPSERT_FUND_SQL: &str = r#"
    INSERT INTO mutual_funds (isin, name, nav, nav_date, amfi_category_id, created_at, updated_at)
    VALUES ($1, $2, $3, $4, $5, $6, $6)
    ON CONFLICT (isin) DO UPDATE
       SET name = EXCLUDED.name,
           nav = EXCLUDED.nav,
           nav_date = EXCLUDED.nav_date,
           amfi_category_id = EXCLUDED.amfi_category_id,
           updated_at = EXCLUDED.updated_at
    RETURNING (xmax = 0) AS inserted
"#;

const FUND_FILTER_SQL: &str = r#"
    ($1::text IS NULL
      OR f.name ILIKE $1
      OR f.isin ILIKE $1
      OR c.name ILIKE $1)
"#;

const CATEGORY_FILTER_SQL: &str = r#"
    ($1::text IS NULL
      OR c.name ILIKE $1
      OR EXISTS (
           SELECT 1
             FROM mutual_funds f
            WHERE f.amfi_category_id = c.id
              AND (f.name ILIKE $1 OR f.isin ILIKE $1)))
"#;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn category_from_row(row: &PgRow) -> Result<AmfiCategory, StoreError> {
    let status: String = row.try_get("status")?;
    let status = status
        .parse::<CategoryStatus>()
        .map_err(|err| StoreError::InvalidData(err.to_string()))?;
    Ok(AmfiCategory {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        status,
        linked_instrument_category: row.try_get("linked_instrument_category_id")?,
    })
}

fn fund_from_row(row: &PgRow) -> Result<StoredFund, StoreError> {
    Ok(StoredFund {
        isin: row.try_get("isin")?,
        name: row.try_get("name")?,
        nav: row.try_get("nav")?,
        nav_date: row.try_get("nav_date")?,
        category_id: row.try_get("amfi_category_id")?,
        category_name: row.try_get("category_name")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl IngestStore for PgStore {
    async fn find_category_by_name(&self, name: &str) -> Result<Option<AmfiCategory>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, status, linked_instrument_category_id
              FROM amfi_categories
             WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(category_from_row).transpose()
    }

    async fn insert_category(&self, category: &AmfiCategory) -> Result<CategoryInsert, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO amfi_categories (id, name, status, linked_instrument_category_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (name) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(category.id)
        .bind(&category.name)
        .bind(category.status.as_str())
        .bind(category.linked_instrument_category)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(CategoryInsert::Created(row.try_get("id")?)),
            None => Ok(CategoryInsert::AlreadyExists),
        }
    }

    async fn find_fund_snapshots(&self, isins: &[String]) -> Result<Vec<FundSnapshot>, StoreError> {
        if isins.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT isin, nav, nav_date, amfi_category_id
              FROM mutual_funds
             WHERE isin = ANY($1)
            "#,
        )
        .bind(isins)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(FundSnapshot {
                isin: row.try_get("isin")?,
                nav: row.try_get("nav")?,
                nav_date: row.try_get("nav_date")?,
                category_id: row.try_get("amfi_category_id")?,
            });
        }
        Ok(out)
    }

    async fn bulk_write(&self, ops: &[FundUpsert]) -> Result<BulkWriteResult, StoreError> {
        let mut result = BulkWriteResult::default();
        if ops.is_empty() {
            return Ok(result);
        }

        let mut conn = self.pool.acquire().await?;
        let mut failed = 0usize;
        let mut first_error: Option<String> = None;

        for op in ops {
            let outcome = sqlx::query(UPSERT_FUND_SQL)
                .bind(&op.fund.isin)
                .bind(&op.fund.name)
                .bind(op.fund.nav)
                .bind(op.fund.nav_date)
                .bind(op.fund.category_id)
                .bind(op.written_at)
                .fetch_one(&mut *conn)
                .await
                .and_then(|row| row.try_get::<bool, _>("inserted"));

            match outcome {
                Ok(true) => result.inserted += 1,
                Ok(false) => result.modified += 1,
                Err(err) => {
                    warn!(isin = %op.fund.isin, error = %err, "fund upsert failed");
                    failed += 1;
                    first_error.get_or_insert_with(|| err.to_string());
                }
            }
        }

        debug!(
            inserted = result.inserted,
            modified = result.modified,
            failed,
            "bulk write finished"
        );

        match first_error {
            Some(first) => Err(StoreError::BulkWrite {
                failed,
                attempted: ops.len(),
                first,
            }),
            None => Ok(result),
        }
    }
}

#[async_trait]
impl QueryStore for PgStore {
    async fn list_funds(&self, query: &PageQuery) -> Result<Page<StoredFund>, StoreError> {
        let pattern = query.search.as_deref().map(like_pattern);
        let list_sql = format!(
            r#"
            SELECT f.isin, f.name, f.nav, f.nav_date, f.amfi_category_id,
                   c.name AS category_name, f.created_at, f.updated_at
              FROM mutual_funds f
              LEFT JOIN amfi_categories c ON c.id = f.amfi_category_id
             WHERE {FUND_FILTER_SQL}
             ORDER BY f.name, f.isin
             LIMIT $2 OFFSET $3
            "#
        );
        let count_sql = format!(
            r#"
            SELECT COUNT(*) AS total
              FROM mutual_funds f
              LEFT JOIN amfi_categories c ON c.id = f.amfi_category_id
             WHERE {FUND_FILTER_SQL}
            "#
        );

        let rows_fut = sqlx::query(&list_sql)
            .bind(pattern.as_deref())
            .bind(to_i64(query.limit))
            .bind(to_i64(query.offset()))
            .fetch_all(&self.pool);
        let count_fut = sqlx::query(&count_sql)
            .bind(pattern.as_deref())
            .fetch_one(&self.pool);
        let (rows, count_row) = tokio::try_join!(rows_fut, count_fut)?;

        let total: i64 = count_row.try_get("total")?;
        let data = rows.iter().map(fund_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(Page {
            data,
            pagination: Pagination::new(query.page, query.limit, total.max(0) as u64),
        })
    }

    async fn count_funds(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM mutual_funds")
            .fetch_one(&self.pool)
            .await?;
        let total: i64 = row.try_get("total")?;
        Ok(total.max(0) as u64)
    }

    async fn list_categories(
        &self,
        query: &PageQuery,
    ) -> Result<Page<AmfiCategorySummary>, StoreError> {
        let pattern = query.search.as_deref().map(like_pattern);
        let list_sql = format!(
            r#"
            SELECT c.id, c.name, c.status, c.linked_instrument_category_id,
                   (SELECT COUNT(*) FROM mutual_funds f WHERE f.amfi_category_id = c.id) AS fund_count
              FROM amfi_categories c
             WHERE {CATEGORY_FILTER_SQL}
             ORDER BY c.name
             LIMIT $2 OFFSET $3
            "#
        );
        let count_sql = format!(
            r#"
            SELECT COUNT(*) AS total
              FROM amfi_categories c
             WHERE {CATEGORY_FILTER_SQL}
            "#
        );

        let rows_fut = sqlx::query(&list_sql)
            .bind(pattern.as_deref())
            .bind(to_i64(query.limit))
            .bind(to_i64(query.offset()))
            .fetch_all(&self.pool);
        let count_fut = sqlx::query(&count_sql)
            .bind(pattern.as_deref())
            .fetch_one(&self.pool);
        let (rows, count_row) = tokio::try_join!(rows_fut, count_fut)?;

        let total: i64 = count_row.try_get("total")?;
        let mut data = Vec::with_capacity(rows.len());
        for row in &rows {
            let fund_count: i64 = row.try_get("fund_count")?;
            data.push(AmfiCategorySummary {
                category: category_from_row(row)?,
                fund_count: fund_count.max(0) as u64,
            });
        }
        Ok(Page {
            data,
            pagination: Pagination::new(query.page, query.limit, total.max(0) as u64),
        })
    }

    async fn get_category(&self, id: Uuid) -> Result<Option<AmfiCategory>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, status, linked_instrument_category_id
              FROM amfi_categories
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(category_from_row).transpose()
    }

    async fn update_category_status(
        &self,
        id: Uuid,
        status: CategoryStatus,
    ) -> Result<Option<AmfiCategory>, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE amfi_categories
               SET status = $2
             WHERE id = $1
            RETURNING id, name, status, linked_instrument_category_id
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(category_from_row).transpose()
    }

    async fn link_instrument_category(
        &self,
        id: Uuid,
        instrument_category: Uuid,
    ) -> Result<Option<AmfiCategory>, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE amfi_categories
               SET linked_instrument_category_id = $2,
                   status = 'set'
             WHERE id = $1
            RETURNING id, name, status, linked_instrument_category_id
            "#,
        )
        .bind(id)
        .bind(instrument_category)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(category_from_row).transpose()
    }
}
