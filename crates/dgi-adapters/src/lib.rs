//! Remote catalog sources: the data.gov.in HTTP API and an offline fixture catalog.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dgi_core::{normalize_records, ResourceMetadata, SortField, SortOrder, EXCLUDED_SOURCE};
use dgi_storage::{FetchError, HttpClientConfig, HttpFetcher};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dgi-adapters";

pub const DEFAULT_BASE_URL: &str = "https://api.data.gov.in";

/// Longest body excerpt attached to a parse-failure warning.
const LOGGED_BODY_LIMIT: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub offset: usize,
    pub limit: usize,
    pub sort: SortField,
    pub order: SortOrder,
}

impl PageRequest {
    pub fn new(offset: usize, limit: usize, sort: SortField, order: SortOrder) -> Self {
        Self {
            offset,
            limit,
            sort,
            order,
        }
    }

    pub fn recently_updated(offset: usize, limit: usize) -> Self {
        Self::new(offset, limit, SortField::Updated, SortOrder::Desc)
    }

    pub fn recently_created(offset: usize, limit: usize) -> Self {
        Self::new(offset, limit, SortField::Created, SortOrder::Desc)
    }
}

/// Normalized records of one listing page. `total` is `None` when the
/// response could not be read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchedPage {
    pub records: Vec<ResourceMetadata>,
    pub total: Option<usize>,
}

impl FetchedPage {
    pub fn empty() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchContext {
    pub run_id: Uuid,
}

impl FetchContext {
    pub fn new(run_id: Uuid) -> Self {
        Self { run_id }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed response from {url}: {message}")]
    Malformed { url: String, message: String },
    #[error("resource {index_name} has no valid metadata")]
    InvalidResource { index_name: String },
}

/// The paginated listing endpoint of the remote catalog.
///
/// Implementations never fail: transport and parse faults yield an empty page.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_page(&self, ctx: &FetchContext, request: PageRequest) -> FetchedPage;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListingPayload {
    pub total: Option<usize>,
    pub records: Vec<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct RawListing {
    #[serde(default)]
    total: Option<JsonValue>,
    records: Vec<JsonValue>,
}

/// Parse a listing response body. A body without a `records` array is malformed.
pub fn parse_listing(body: &[u8]) -> Result<ListingPayload, serde_json::Error> {
    let raw: RawListing = serde_json::from_slice(body)?;
    Ok(ListingPayload {
        total: raw.total.as_ref().and_then(json_count),
        records: raw.records,
    })
}

fn json_count(value: &JsonValue) -> Option<usize> {
    match value {
        JsonValue::Number(n) => n.as_u64().map(|n| n as usize),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn body_excerpt(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    match text.char_indices().nth(LOGGED_BODY_LIMIT) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.into_owned(),
    }
}

#[derive(Debug, Clone)]
pub struct DataGovApiConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub sample_api_key: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
}

impl Default for DataGovApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            sample_api_key: String::new(),
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 16,
        }
    }
}

/// Field-value filters and projection for the per-resource record endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceQuery {
    pub offset: Option<usize>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub filters: BTreeMap<String, String>,
    pub fields: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourcePayload {
    pub total: Option<usize>,
    pub field: Vec<JsonValue>,
    pub records: Vec<JsonValue>,
    pub raw: JsonValue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDescription {
    pub metadata: ResourceMetadata,
    pub total: Option<usize>,
}

#[derive(Debug)]
pub struct DataGovApi {
    http: HttpFetcher,
    base_url: String,
    api_key: String,
}

impl DataGovApi {
    pub fn new(config: DataGovApiConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            user_agent: config.user_agent.clone(),
            global_concurrency: config.global_concurrency,
            ..HttpClientConfig::with_timeout(config.timeout)
        })?;
        let api_key = match config.api_key {
            Some(key) => key,
            None => {
                warn!("using sample API key with limitations");
                config.sample_api_key
            }
        };
        Url::parse(&config.base_url)
            .with_context(|| format!("parsing base url {}", config.base_url))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, AdapterError> {
        let raw = format!("{}/{}", self.base_url, path);
        Url::parse(&raw).map_err(|err| AdapterError::Malformed {
            url: raw,
            message: err.to_string(),
        })
    }

    /// Listing URL with the fixed filters: active resources only, one noisy source excluded.
    pub fn listing_url(&self, request: &PageRequest) -> Result<Url, AdapterError> {
        let mut url = self.endpoint("lists")?;
        url.query_pairs_mut()
            .append_pair("format", "json")
            .append_pair("notfilters[source]", EXCLUDED_SOURCE)
            .append_pair("filters[active]", "1")
            .append_pair(
                &format!("sort[{}]", request.sort.as_str()),
                request.order.as_str(),
            )
            .append_pair("offset", &request.offset.to_string())
            .append_pair("limit", &request.limit.to_string());
        Ok(url)
    }

    pub fn resource_url(&self, index_name: &str, query: &ResourceQuery) -> Result<Url, AdapterError> {
        let mut url = self.endpoint(&format!("resource/{index_name}"))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("api-key", &self.api_key)
                .append_pair("format", "json");
            if let Some(offset) = query.offset {
                pairs.append_pair("offset", &offset.to_string());
            }
            if let Some(limit) = query.limit {
                pairs.append_pair("limit", &limit.to_string());
            }
            for (key, value) in &query.filters {
                pairs.append_pair(&format!("filters[{key}]"), value);
            }
            if let Some(fields) = &query.fields {
                pairs.append_pair("fields", &fields.join(","));
            }
        }
        Ok(url)
    }

    pub async fn fetch_resource(
        &self,
        ctx: &FetchContext,
        index_name: &str,
        query: &ResourceQuery,
    ) -> Result<ResourcePayload, AdapterError> {
        let url = self.resource_url(index_name, query)?;
        info!(index_name, "fetching resource records");
        let resp = self.http.fetch_bytes(ctx.run_id, url.as_str()).await?;
        let raw: JsonValue =
            serde_json::from_slice(&resp.body).map_err(|err| AdapterError::Malformed {
                url: resp.final_url.clone(),
                message: err.to_string(),
            })?;
        let array = |key: &str| {
            raw.get(key)
                .and_then(JsonValue::as_array)
                .cloned()
                .unwrap_or_default()
        };
        Ok(ResourcePayload {
            total: raw.get("total").and_then(json_count),
            field: array("field"),
            records: array("records"),
            raw: raw.clone(),
        })
    }

    /// Resource metadata and record count without downloading records.
    pub async fn describe_resource(
        &self,
        ctx: &FetchContext,
        index_name: &str,
    ) -> Result<ResourceDescription, AdapterError> {
        let query = ResourceQuery {
            limit: Some(0),
            fields: Some(Vec::new()),
            ..Default::default()
        };
        let payload = self.fetch_resource(ctx, index_name, &query).await?;
        let metadata =
            ResourceMetadata::from_raw(&payload.raw).ok_or_else(|| AdapterError::InvalidResource {
                index_name: index_name.to_string(),
            })?;
        Ok(ResourceDescription {
            metadata,
            total: payload.total,
        })
    }

    pub fn pager(
        &self,
        ctx: FetchContext,
        index_name: impl Into<String>,
        query: ResourceQuery,
        batch_size: usize,
    ) -> RecordPager<'_> {
        RecordPager {
            api: self,
            ctx,
            index_name: index_name.into(),
            offset: query.offset.unwrap_or(0),
            query,
            batch_size: batch_size.max(1),
            done: false,
        }
    }
}

#[async_trait]
impl CatalogSource for DataGovApi {
    fn name(&self) -> &str {
        "data.gov.in"
    }

    async fn fetch_page(&self, ctx: &FetchContext, request: PageRequest) -> FetchedPage {
        let url = match self.listing_url(&request) {
            Ok(url) => url,
            Err(err) => {
                warn!(error = %err, "cannot build listing url");
                return FetchedPage::empty();
            }
        };
        info!(%url, "fetching listing page");

        let resp = match self.http.fetch_bytes(ctx.run_id, url.as_str()).await {
            Ok(resp) => resp,
            Err(FetchError::HttpStatus { status, url, body }) => {
                warn!(status, %url, body = %body_excerpt(body.as_bytes()), "listing request rejected");
                return FetchedPage::empty();
            }
            Err(err) => {
                warn!(%url, error = %err, "listing request failed");
                return FetchedPage::empty();
            }
        };

        match parse_listing(&resp.body) {
            Ok(listing) => FetchedPage {
                records: normalize_records(&listing.records),
                total: listing.total,
            },
            Err(err) => {
                warn!(
                    url = %resp.final_url,
                    error = %err,
                    body = %body_excerpt(&resp.body),
                    "failed to parse listing response"
                );
                FetchedPage::empty()
            }
        }
    }
}

/// Pages through one resource's records until an empty page.
#[derive(Debug)]
pub struct RecordPager<'a> {
    api: &'a DataGovApi,
    ctx: FetchContext,
    index_name: String,
    query: ResourceQuery,
    offset: usize,
    batch_size: usize,
    done: bool,
}

impl RecordPager<'_> {
    pub async fn next_page(&mut self) -> Result<Option<Vec<JsonValue>>, AdapterError> {
        if self.done {
            return Ok(None);
        }
        let query = ResourceQuery {
            offset: Some(self.offset),
            limit: Some(self.batch_size),
            ..self.query.clone()
        };
        let payload = self
            .api
            .fetch_resource(&self.ctx, &self.index_name, &query)
            .await?;
        self.offset += self.batch_size;
        if payload.records.is_empty() {
            self.done = true;
            return Ok(None);
        }
        Ok(Some(payload.records))
    }
}

/// In-memory listing endpoint backed by raw records, sorted and sliced the
/// way the remote API does it.
#[derive(Debug, Default)]
pub struct FixtureCatalog {
    state: Mutex<FixtureState>,
}

#[derive(Debug, Default)]
struct FixtureState {
    records: Vec<FixtureRecord>,
    reported_total: Option<usize>,
    failing_offsets: HashSet<usize>,
    requests: Vec<PageRequest>,
}

/// A raw listing record with its normalized form, computed once on insert.
#[derive(Debug)]
struct FixtureRecord {
    raw: JsonValue,
    normalized: Option<ResourceMetadata>,
}

impl FixtureRecord {
    fn new(raw: JsonValue) -> Self {
        let normalized = ResourceMetadata::from_raw(&raw);
        Self { raw, normalized }
    }

    fn sort_key(&self, sort: SortField) -> Option<DateTime<Utc>> {
        let rec = self.normalized.as_ref()?;
        match sort {
            SortField::Created => rec.created_at,
            SortField::Updated => rec.updated_at,
        }
    }
}

impl FixtureCatalog {
    pub fn new(records: Vec<JsonValue>) -> Self {
        Self {
            state: Mutex::new(FixtureState {
                records: records.into_iter().map(FixtureRecord::new).collect(),
                ..Default::default()
            }),
        }
    }

    /// Load a file shaped like a listing response (`{"total": .., "records": [..]}`).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let listing = parse_listing(&bytes).with_context(|| format!("parsing {}", path.display()))?;
        let catalog = Self::new(listing.records);
        if let Some(total) = listing.total {
            catalog.report_total(total);
        }
        Ok(catalog)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FixtureState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the record with the same `index_name`, or append it.
    pub fn upsert(&self, raw: JsonValue) {
        let mut state = self.lock();
        let id = raw.get("index_name").cloned();
        let record = FixtureRecord::new(raw);
        match state
            .records
            .iter_mut()
            .find(|r| id.is_some() && r.raw.get("index_name") == id.as_ref())
        {
            Some(existing) => *existing = record,
            None => state.records.push(record),
        }
    }

    /// Override the `total` the listing reports.
    pub fn report_total(&self, total: usize) {
        self.lock().reported_total = Some(total);
    }

    /// Serve pages starting at `offset` as transport faults.
    pub fn fail_offset(&self, offset: usize) {
        self.lock().failing_offsets.insert(offset);
    }

    pub fn requests(&self) -> Vec<PageRequest> {
        self.lock().requests.clone()
    }

    pub fn clear_requests(&self) {
        self.lock().requests.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CatalogSource for FixtureCatalog {
    fn name(&self) -> &str {
        "fixture"
    }

    async fn fetch_page(&self, _ctx: &FetchContext, request: PageRequest) -> FetchedPage {
        let mut state = self.lock();
        state.requests.push(request);
        if state.failing_offsets.contains(&request.offset) {
            warn!(offset = request.offset, "simulated transport fault");
            return FetchedPage::empty();
        }

        let mut keyed = state
            .records
            .iter()
            .map(|rec| (rec.sort_key(request.sort), rec))
            .collect::<Vec<_>>();
        match request.order {
            SortOrder::Asc => keyed.sort_by(|a, b| a.0.cmp(&b.0)),
            SortOrder::Desc => keyed.sort_by(|a, b| b.0.cmp(&a.0)),
        }
        let records = keyed
            .into_iter()
            .skip(request.offset)
            .take(request.limit)
            .filter_map(|(_, rec)| rec.normalized.clone())
            .collect::<Vec<_>>();

        FetchedPage {
            records,
            total: Some(state.reported_total.unwrap_or(state.records.len())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::get;
    use serde_json::json;
    use std::path::PathBuf;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn id(n: u32) -> String {
        format!("00000000-0000-0000-0000-{n:012}")
    }

    fn raw(n: u32, created: i64, updated: i64) -> JsonValue {
        json!({
            "index_name": id(n),
            "title": format!("Resource {n}"),
            "created": created,
            "updated": updated,
        })
    }

    fn api(base_url: &str) -> DataGovApi {
        DataGovApi::new(DataGovApiConfig {
            base_url: base_url.to_string(),
            api_key: Some("test-key".to_string()),
            timeout: Duration::from_secs(1),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn listing_url_carries_sort_pagination_and_fixed_filters() {
        let url = api("https://api.data.gov.in/")
            .listing_url(&PageRequest::recently_created(20, 40))
            .unwrap();
        assert_eq!(url.path(), "/lists");
        let pairs = url.query_pairs().into_owned().collect::<BTreeMap<_, _>>();
        assert_eq!(pairs["format"], "json");
        assert_eq!(pairs["notfilters[source]"], "visualize.data.gov.in");
        assert_eq!(pairs["filters[active]"], "1");
        assert_eq!(pairs["sort[created]"], "desc");
        assert_eq!(pairs["offset"], "20");
        assert_eq!(pairs["limit"], "40");
    }

    #[test]
    fn resource_url_includes_filters_and_projection() {
        let mut filters = BTreeMap::new();
        filters.insert("state".to_string(), "Kerala".to_string());
        let query = ResourceQuery {
            offset: Some(0),
            limit: Some(10),
            filters,
            fields: Some(vec!["district".into(), "modal_price".into()]),
        };
        let url = api(DEFAULT_BASE_URL)
            .resource_url(&id(7), &query)
            .unwrap();
        assert_eq!(url.path(), format!("/resource/{}", id(7)));
        let pairs = url.query_pairs().into_owned().collect::<BTreeMap<_, _>>();
        assert_eq!(pairs["api-key"], "test-key");
        assert_eq!(pairs["filters[state]"], "Kerala");
        assert_eq!(pairs["fields"], "district,modal_price");
        assert_eq!(pairs["limit"], "10");
    }

    #[test]
    fn listing_parser_accepts_string_totals_and_rejects_missing_records() {
        let parsed = parse_listing(br#"{"total": "12", "records": [{"index_name": "x"}]}"#).unwrap();
        assert_eq!(parsed.total, Some(12));
        assert_eq!(parsed.records.len(), 1);

        assert!(parse_listing(br#"{"total": 3}"#).is_err());
        assert!(parse_listing(b"<html>502 Bad Gateway</html>").is_err());
    }

    #[tokio::test]
    async fn unreachable_endpoint_degrades_to_an_empty_page() {
        let api = api("http://127.0.0.1:9");
        let page = api
            .fetch_page(
                &FetchContext::new(Uuid::new_v4()),
                PageRequest::recently_updated(0, 10),
            )
            .await;
        assert_eq!(page, FetchedPage::empty());
    }

    async fn serve_listing(status: StatusCode, body: &'static str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = axum::Router::new().route("/lists", get(move || async move { (status, body) }));
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    async fn first_page(base_url: &str) -> FetchedPage {
        api(base_url)
            .fetch_page(
                &FetchContext::new(Uuid::new_v4()),
                PageRequest::recently_updated(0, 10),
            )
            .await
    }

    #[tokio::test]
    async fn malformed_listing_body_degrades_to_an_empty_page() {
        let base = serve_listing(StatusCode::OK, "<html>502</html>").await;
        assert_eq!(first_page(&base).await, FetchedPage::empty());

        let base = serve_listing(StatusCode::OK, r#"{"total": 3}"#).await;
        assert_eq!(first_page(&base).await, FetchedPage::empty());
    }

    #[tokio::test]
    async fn rejected_listing_request_degrades_to_an_empty_page() {
        let base = serve_listing(StatusCode::BAD_GATEWAY, "<html>502 Bad Gateway</html>").await;
        assert_eq!(first_page(&base).await, FetchedPage::empty());
    }

    #[tokio::test]
    async fn listing_response_is_normalized_with_its_total() {
        let base = serve_listing(
            StatusCode::OK,
            r#"{"total": "2", "records": [
                {"index_name": "00000000-0000-0000-0000-000000000001", "title": "  Crop   yield ", "source": "NIC"},
                {"index_name": "short", "title": "dropped"}
            ]}"#,
        )
        .await;
        let page = first_page(&base).await;
        assert_eq!(page.total, Some(2));
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0].title, "Crop yield");
        assert_eq!(page.records[0].source, "nic");
    }

    #[tokio::test]
    async fn fixture_catalog_sorts_slices_and_normalizes() {
        let catalog = FixtureCatalog::new(vec![
            raw(1, 100, 400),
            raw(2, 300, 200),
            raw(3, 200, 300),
            json!({"index_name": "bad", "updated": 999}),
        ]);
        let ctx = FetchContext::new(Uuid::new_v4());

        let page = catalog
            .fetch_page(&ctx, PageRequest::recently_updated(0, 2))
            .await;
        let ids = page.records.iter().map(|r| r.index_name.clone()).collect::<Vec<_>>();
        assert_eq!(ids, vec![id(1), id(3)]);
        assert_eq!(page.total, Some(4));

        let page = catalog
            .fetch_page(&ctx, PageRequest::recently_created(0, 10))
            .await;
        let ids = page.records.iter().map(|r| r.index_name.clone()).collect::<Vec<_>>();
        assert_eq!(ids, vec![id(2), id(3), id(1)]);

        catalog.fail_offset(2);
        let page = catalog
            .fetch_page(&ctx, PageRequest::recently_updated(2, 2))
            .await;
        assert!(page.records.is_empty());
        assert_eq!(page.total, None);
        assert_eq!(catalog.requests().len(), 3);
    }

    #[test]
    fn fixture_records_are_normalized_once_on_insert() {
        let catalog = FixtureCatalog::new(vec![raw(1, 100, 100), json!({"index_name": "bad"})]);
        catalog.upsert(raw(1, 100, 900));
        catalog.upsert(json!({"index_name": "also-bad"}));

        let state = catalog.lock();
        let normalized = state
            .records
            .iter()
            .map(|r| r.normalized.as_ref().map(|m| m.updated_at))
            .collect::<Vec<_>>();
        assert_eq!(normalized.len(), 3);
        assert_eq!(normalized[0], Some(DateTime::from_timestamp(900, 0)));
        assert_eq!(normalized[1..], [None, None]);
    }

    #[tokio::test]
    async fn fixture_upsert_replaces_by_identifier() {
        let catalog = FixtureCatalog::new(vec![raw(1, 100, 100)]);
        catalog.upsert(raw(1, 100, 500));
        catalog.upsert(raw(2, 600, 600));
        assert_eq!(catalog.len(), 2);

        let page = catalog
            .fetch_page(
                &FetchContext::new(Uuid::new_v4()),
                PageRequest::recently_updated(0, 1),
            )
            .await;
        assert_eq!(page.records[0].index_name, id(2));
    }

    #[tokio::test]
    async fn sample_fixture_loads_and_drops_malformed_identifiers() {
        let catalog =
            FixtureCatalog::load(workspace_root().join("fixtures/catalog/sample.json")).unwrap();
        assert_eq!(catalog.len(), 4);
        let page = catalog
            .fetch_page(
                &FetchContext::new(Uuid::new_v4()),
                PageRequest::recently_updated(0, 10),
            )
            .await;
        assert_eq!(page.total, Some(4));
        assert_eq!(page.records.len(), 3);
        assert!(page
            .records
            .iter()
            .all(|r| r.index_name.len() == dgi_core::INDEX_NAME_LEN));
    }
}
