//! JSON API over the local metadata mirror.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use dgi_adapters::CatalogSource;
use dgi_core::{Attribute, ResourceField};
use dgi_storage::{RecencyKind, SearchQuery, StoreError};
use dgi_sync::{maybe_build_scheduler, Mirror, SyncConfig};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "dgi-web";

const DEFAULT_DAYS: u32 = 7;
const DEFAULT_MAX_RESULTS: usize = 10;

#[derive(Clone)]
pub struct AppState {
    pub mirror: Arc<Mirror>,
}

impl AppState {
    pub fn new(mirror: Arc<Mirror>) -> Self {
        Self { mirror }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/attributes", get(all_attributes_handler))
        .route("/attributes/{name}", get(attribute_handler))
        .route("/resources/recent", get(recent_handler))
        .route("/resources/{index_name}", get(resource_handler))
        .route("/search", get(search_handler))
        .with_state(Arc::new(state))
}

/// Open the mirror, start the scheduler when enabled, and serve on `web_port`.
pub async fn serve(config: SyncConfig, source: Arc<dyn CatalogSource>) -> anyhow::Result<()> {
    let mirror = Arc::new(Mirror::open(&config, source).await?);
    let scheduler = maybe_build_scheduler(&config, Arc::clone(&mirror)).await?;
    if let Some(sched) = &scheduler {
        sched.start().await?;
        info!(cron = %config.sync_cron, "scheduler started");
    }

    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "serving metadata api");
    axum::serve(listener, app(AppState::new(mirror))).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let source = dgi_sync::api_source(&config)?;
    serve(config, source).await
}

struct ApiError(StoreError);

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self(err)
    }
}

impl From<dgi_core::ParseFieldError> for ApiError {
    fn from(err: dgi_core::ParseFieldError) -> Self {
        Self(StoreError::UnknownField(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            err if err.is_caller_input() => StatusCode::BAD_REQUEST,
            err => {
                error!(error = %err, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

fn parse_fields(fields: Option<&str>) -> Result<Vec<ResourceField>, ApiError> {
    Ok(fields
        .map(ResourceField::parse_list)
        .transpose()?
        .unwrap_or_default())
}

async fn all_attributes_handler(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let listing = state.mirror.list_all_attributes().await?;
    Ok(Json(listing).into_response())
}

async fn attribute_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let attribute: Attribute = name.parse()?;
    let values = state.mirror.list_attribute(attribute).await?;
    Ok(Json(values).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct RecentParams {
    kind: Option<RecencyKind>,
    days: Option<u32>,
    max_results: Option<usize>,
    fields: Option<String>,
}

async fn recent_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RecentParams>,
) -> Result<Response, ApiError> {
    let fields = parse_fields(params.fields.as_deref())?;
    let rows = state
        .mirror
        .list_recent(
            params.kind.unwrap_or(RecencyKind::Updated),
            params.days.unwrap_or(DEFAULT_DAYS),
            params.max_results.unwrap_or(DEFAULT_MAX_RESULTS),
            &fields,
        )
        .await?;
    Ok(Json(rows).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct SearchParams {
    title: Option<String>,
    #[serde(alias = "desc")]
    description: Option<String>,
    org: Option<String>,
    org_type: Option<String>,
    sector: Option<String>,
    source: Option<String>,
    max_results: Option<usize>,
    fields: Option<String>,
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> Result<Response, ApiError> {
    let fields = parse_fields(params.fields.as_deref())?;
    let query = SearchQuery {
        title: params.title,
        description: params.description,
        org: params.org,
        org_type: params.org_type,
        sector: params.sector,
        source: params.source,
    };
    let rows = state
        .mirror
        .search(
            &query,
            params.max_results.unwrap_or(DEFAULT_MAX_RESULTS),
            &fields,
        )
        .await?;
    Ok(Json(rows).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct FieldsParams {
    fields: Option<String>,
}

async fn resource_handler(
    State(state): State<Arc<AppState>>,
    Path(index_name): Path<String>,
    Query(params): Query<FieldsParams>,
) -> Result<Response, ApiError> {
    let fields = parse_fields(params.fields.as_deref())?;
    let resource = state.mirror.resource_info(&index_name, &fields).await?;
    Ok(Json(resource).into_response())
}
