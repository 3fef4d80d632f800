//! Axum JSON query API over the fund and AMFI category store.

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use navsync_core::{
    AmfiCategory, AmfiCategorySummary, CategoryStatus, Page, PageQuery, StoredFund,
};
use navsync_storage::{QueryStore, StoreError};
use navsync_sync::{HealthStatus, IngestionHealth};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "navsync-web";

pub const DEFAULT_FUND_LIMIT: u64 = 100;
pub const DEFAULT_CATEGORY_LIMIT: u64 = 10;
pub const MAX_LIMIT: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebConfig {
    pub port: u16,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("NAVSYNC_WEB_PORT")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(5000),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn QueryStore>,
    pub health: Arc<IngestionHealth>,
}

impl AppState {
    pub fn new(store: Arc<dyn QueryStore>, health: Arc<IngestionHealth>) -> Self {
        Self { store, health }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Store(StoreError),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, "bad_request", message),
            Self::NotFound(message) => (StatusCode::NOT_FOUND, "not_found", message),
            Self::Store(err) => {
                error!(error = %err, "store query failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "internal server error".to_string(),
                )
            }
        };
        (
            status,
            Json(ErrorBody {
                error: ErrorDetail { code, message },
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub page: Option<u64>,
    pub limit: Option<u64>,
    pub search: Option<String>,
}

impl ListParams {
    fn into_query(self, default_limit: u64) -> PageQuery {
        PageQuery::new(
            self.page.unwrap_or(1),
            self.limit.unwrap_or(default_limit).clamp(1, MAX_LIMIT),
            self.search,
        )
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FundStats {
    total_funds: u64,
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LinkBody {
    amfi_category_id: Uuid,
    instrument_category_id: Uuid,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/mutualfund/list-mf", get(list_funds_handler))
        .route("/api/mutualfund/stats", get(fund_stats_handler))
        .route("/api/category/list-amfi-categories", get(list_categories_handler))
        .route("/api/category/amfi-categories/{id}", get(get_category_handler))
        .route(
            "/api/category/update-amfi-category-status/{id}",
            put(update_category_status_handler),
        )
        .route(
            "/api/category/link-instrument-category-to-amfi-category",
            put(link_instrument_category_handler),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!(addr = %listener.local_addr()?, "query API listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

pub async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthStatus> {
    Json(state.health.status().await)
}

async fn list_funds_handler(
    State(state): State<AppState>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> ApiResult<Page<StoredFund>> {
    let Query(params) = params?;
    let page = state
        .store
        .list_funds(&params.into_query(DEFAULT_FUND_LIMIT))
        .await?;
    Ok(Json(page))
}

async fn fund_stats_handler(State(state): State<AppState>) -> ApiResult<FundStats> {
    let total_funds = state.store.count_funds().await?;
    Ok(Json(FundStats { total_funds }))
}

async fn list_categories_handler(
    State(state): State<AppState>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> ApiResult<Page<AmfiCategorySummary>> {
    let Query(params) = params?;
    let page = state
        .store
        .list_categories(&params.into_query(DEFAULT_CATEGORY_LIMIT))
        .await?;
    Ok(Json(page))
}

async fn get_category_handler(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<AmfiCategory> {
    let Path(id) = id?;
    state
        .store
        .get_category(id)
        .await?
        .map(Json)
        .ok_or_else(|| category_not_found(id))
}

async fn update_category_status_handler(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
    body: Result<Json<StatusBody>, JsonRejection>,
) -> ApiResult<AmfiCategory> {
    let Path(id) = id?;
    let Json(body) = body?;
    let status = body
        .status
        .parse::<CategoryStatus>()
        .map_err(|err| ApiError::BadRequest(err.to_string()))?;
    let updated = state
        .store
        .update_category_status(id, status)
        .await?
        .ok_or_else(|| category_not_found(id))?;
    info!(category = %updated.name, status = %status, "category status updated");
    Ok(Json(updated))
}

async fn link_instrument_category_handler(
    State(state): State<AppState>,
    body: Result<Json<LinkBody>, JsonRejection>,
) -> ApiResult<AmfiCategory> {
    let Json(body) = body?;
    let linked = state
        .store
        .link_instrument_category(body.amfi_category_id, body.instrument_category_id)
        .await?
        .ok_or_else(|| category_not_found(body.amfi_category_id))?;
    info!(
        category = %linked.name,
        instrument_category = %body.instrument_category_id,
        "instrument category linked"
    );
    Ok(Json(linked))
}

fn category_not_found(id: Uuid) -> ApiError {
    ApiError::NotFound(format!("AMFI category {id} not found"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use chrono::{NaiveDate, Utc};
    use http_body_util::BodyExt;
    use navsync_core::{FundUpsert, ResolvedFund, UpsertKind};
    use navsync_storage::{IngestStore, MemoryStore};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn seeded() -> (Router, AmfiCategory) {
        let store = Arc::new(MemoryStore::new());
        let liquid = AmfiCategory::discovered("Open Ended Schemes(Debt Scheme - Liquid Fund)");
        store.insert_category(&liquid).await.unwrap();
        store
            .insert_category(&AmfiCategory::discovered("Open Ended Schemes(Equity Scheme - ELSS)"))
            .await
            .unwrap();

        let ops = (0..150)
            .map(|i| FundUpsert {
                kind: UpsertKind::Insert,
                fund: ResolvedFund {
                    isin: format!("INF{i:09}"),
                    name: if i == 7 {
                        "Parag Parikh Liquid Fund".to_string()
                    } else {
                        format!("Scheme {i:03}")
                    },
                    nav: 10.0 + i as f64,
                    nav_date: NaiveDate::from_ymd_opt(2026, 10, 16).unwrap(),
                    category_id: (i < 3).then_some(liquid.id),
                },
                written_at: Utc::now(),
            })
            .collect::<Vec<_>>();
        store.bulk_write(&ops).await.unwrap();

        let state = AppState::new(store, Arc::new(IngestionHealth::new(3)));
        (app(state), liquid)
    }

    async fn send(app: Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn put_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("PUT")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn fund_list_defaults_to_first_hundred() {
        let (app, _) = seeded().await;
        let (status, body) = send(app, get("/api/mutualfund/list-mf")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"].as_array().unwrap().len(), 100);
        assert_eq!(body["pagination"]["total"], 150);
        assert_eq!(body["pagination"]["totalPages"], 2);
        assert_eq!(body["pagination"]["hasNext"], true);
        assert_eq!(body["pagination"]["hasPrev"], false);
    }

    #[tokio::test]
    async fn fund_search_is_case_insensitive_and_covers_category() {
        let (app, _) = seeded().await;
        let (_, by_name) = send(app.clone(), get("/api/mutualfund/list-mf?search=PARAG")).await;
        assert_eq!(by_name["data"].as_array().unwrap().len(), 1);
        assert_eq!(by_name["data"][0]["isin"], "INF000000007");

        let (_, by_category) =
            send(app, get("/api/mutualfund/list-mf?search=liquid&limit=50")).await;
        // Three funds sit in the liquid category, one more has "Liquid" in its name.
        assert_eq!(by_category["pagination"]["total"], 4);
    }

    #[tokio::test]
    async fn stats_reports_total_funds() {
        let (app, _) = seeded().await;
        let (status, body) = send(app, get("/api/mutualfund/stats")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "totalFunds": 150 }));
    }

    #[tokio::test]
    async fn page_past_u64_range_returns_an_empty_page() {
        let (app, _) = seeded().await;
        let (status, body) = send(
            app,
            get("/api/mutualfund/list-mf?page=18446744073709551615&limit=1000"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["data"].as_array().unwrap().is_empty());
        assert_eq!(body["pagination"]["total"], 150);
        assert_eq!(body["pagination"]["hasNext"], false);
        assert_eq!(body["pagination"]["hasPrev"], true);
    }

    #[tokio::test]
    async fn malformed_paging_is_a_json_bad_request() {
        let (app, _) = seeded().await;
        let (status, body) = send(app, get("/api/mutualfund/list-mf?page=abc")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "bad_request");
    }

    #[tokio::test]
    async fn category_list_carries_fund_counts() {
        let (app, liquid) = seeded().await;
        let (status, body) = send(app, get("/api/category/list-amfi-categories")).await;
        assert_eq!(status, StatusCode::OK);
        let rows = body["data"].as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["name"], liquid.name.as_str());
        assert_eq!(rows[0]["fundCount"], 3);
        assert_eq!(rows[0]["status"], "unset");
        assert_eq!(body["pagination"]["limit"], 10);
    }

    #[tokio::test]
    async fn unknown_category_is_not_found() {
        let (app, _) = seeded().await;
        let uri = format!("/api/category/amfi-categories/{}", Uuid::new_v4());
        let (status, body) = send(app.clone(), get(&uri)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "not_found");

        let (status, _) = send(app, get("/api/category/amfi-categories/not-a-uuid")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn status_update_accepts_only_set_or_unset() {
        let (app, liquid) = seeded().await;
        let uri = format!("/api/category/update-amfi-category-status/{}", liquid.id);

        let (status, body) = send(app.clone(), put_json(&uri, json!({ "status": "set" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "set");

        let (status, body) = send(app, put_json(&uri, json!({ "status": "archived" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "bad_request");
    }

    #[tokio::test]
    async fn linking_sets_status_and_instrument() {
        let (app, liquid) = seeded().await;
        let instrument = Uuid::new_v4();
        let (status, body) = send(
            app.clone(),
            put_json(
                "/api/category/link-instrument-category-to-amfi-category",
                json!({ "amfiCategoryId": liquid.id, "instrumentCategoryId": instrument }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "set");
        assert_eq!(body["linkedInstrumentCategory"], instrument.to_string());

        let (status, _) = send(
            app,
            put_json(
                "/api/category/link-instrument-category-to-amfi-category",
                json!({ "amfiCategoryId": liquid.id }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_reports_ingestion_state() {
        let (app, _) = seeded().await;
        let (status, body) = send(app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["consecutiveFailures"], 0);
        assert_eq!(body["maxConsecutiveFailures"], 3);
        assert_eq!(body["lastRun"], Value::Null);
    }
}
