//! Local metadata store (SQLite row store + FTS5 text index) and HTTP fetch utilities.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use dgi_core::{Attribute, ResourceField, ResourceMetadata, SortField};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dgi-storage";

/// File name of the metadata database inside the cache directory.
pub const DATABASE_FILE: &str = "metadata.db";

const RESOURCE_COLUMNS: &str =
    "index_name, title, description, org, org_type, source, sector, field, created, updated";
const SEARCH_COLUMNS: &str = "index_name, title, description, org, org_type, source, sector, field";

/// Identifiers bound per `IN (..)` lookup; SQLite caps bound variables at 32766.
const LOOKUP_CHUNK: usize = 500;

const CREATE_RESOURCES: &str = r#"
CREATE TABLE IF NOT EXISTS resources (
    index_name  TEXT PRIMARY KEY NOT NULL,
    title       TEXT NOT NULL DEFAULT '',
    description TEXT NOT NULL DEFAULT '',
    org         TEXT NOT NULL DEFAULT '[]',
    org_type    TEXT NOT NULL DEFAULT '',
    source      TEXT NOT NULL DEFAULT '',
    sector      TEXT NOT NULL DEFAULT '[]',
    field       TEXT NOT NULL DEFAULT '[]',
    created     INTEGER,
    updated     INTEGER
)
"#;

const CREATE_RESOURCE_INDEXES: [&str; 2] = [
    "CREATE INDEX IF NOT EXISTS resources_created_idx ON resources (created)",
    "CREATE INDEX IF NOT EXISTS resources_updated_idx ON resources (updated)",
];

const CREATE_SEARCH_INDEX: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS resources_fts USING fts5(
    index_name UNINDEXED,
    title,
    description,
    org,
    org_type,
    source,
    sector,
    field,
    tokenize = 'trigram'
)
"#;

const UPSERT_RESOURCE: &str = r#"
INSERT INTO resources (index_name, title, description, org, org_type, source, sector, field, created, updated)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT (index_name) DO UPDATE SET
    title       = excluded.title,
    description = excluded.description,
    org         = excluded.org,
    org_type    = excluded.org_type,
    source      = excluded.source,
    sector      = excluded.sector,
    field       = excluded.field,
    created     = excluded.created,
    updated     = excluded.updated
"#;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("resource {index_name} not found")]
    NotFound { index_name: String },
    #[error("search requires at least one of title, description, org, org_type, sector, source")]
    EmptySearch,
    #[error(transparent)]
    UnknownField(#[from] dgi_core::ParseFieldError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Faults caused by the caller's request rather than local state.
    pub fn is_caller_input(&self) -> bool {
        matches!(self, StoreError::EmptySearch | StoreError::UnknownField(_))
    }
}

/// Locally known identifiers with their stored `updated` value.
pub type KnownResources = HashMap<String, Option<DateTime<Utc>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Inserted,
    Updated,
}

#[derive(Debug, sqlx::FromRow)]
struct ResourceRow {
    index_name: String,
    title: String,
    description: String,
    org: String,
    org_type: String,
    source: String,
    sector: String,
    field: String,
    created: Option<i64>,
    updated: Option<i64>,
}

impl ResourceRow {
    fn into_metadata(self) -> Result<ResourceMetadata, StoreError> {
        Ok(ResourceMetadata {
            index_name: self.index_name,
            title: self.title,
            description: self.description,
            organizations: serde_json::from_str(&self.org)?,
            organization_type: self.org_type,
            source: self.source,
            sectors: serde_json::from_str(&self.sector)?,
            field_ids: serde_json::from_str(&self.field)?,
            created_at: self.created.and_then(DateTime::from_timestamp_millis),
            updated_at: self.updated.and_then(DateTime::from_timestamp_millis),
        })
    }
}

/// Row store and derived text index sharing one SQLite database.
///
/// The pool holds a single connection, so every run against one store sees a
/// single writer.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl MetadataStore {
    /// Open (creating the directory and file when missing) and ensure the schema.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool, path };
        store.create_schema().await?;
        Ok(store)
    }

    /// Open `metadata.db` inside a cache directory.
    pub async fn open_in_dir(cache_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open(cache_dir.as_ref().join(DATABASE_FILE)).await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn create_schema(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_RESOURCES).execute(&self.pool).await?;
        for stmt in CREATE_RESOURCE_INDEXES {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        sqlx::query(CREATE_SEARCH_INDEX).execute(&self.pool).await?;
        Ok(())
    }

    /// Drop and recreate both tables.
    pub async fn reset(&self) -> Result<(), StoreError> {
        sqlx::query("DROP TABLE IF EXISTS resources_fts")
            .execute(&self.pool)
            .await?;
        sqlx::query("DROP TABLE IF EXISTS resources")
            .execute(&self.pool)
            .await?;
        self.create_schema().await?;
        info!(path = %self.path.display(), "recreated metadata tables");
        Ok(())
    }

    pub async fn count(&self) -> Result<usize, StoreError> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM resources")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }

    pub async fn search_index_count(&self) -> Result<usize, StoreError> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM resources_fts")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }

    pub async fn index_names(&self) -> Result<BTreeSet<String>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT index_name FROM resources")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn search_index_names(&self) -> Result<BTreeSet<String>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT index_name FROM resources_fts")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Every text index row, ordered by identifier, as stringified columns.
    pub async fn search_index_rows(&self) -> Result<Vec<Vec<String>>, StoreError> {
        let rows: Vec<(String, String, String, String, String, String, String, String)> =
            sqlx::query_as(&format!(
                "SELECT {SEARCH_COLUMNS} FROM resources_fts ORDER BY index_name"
            ))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(a, b, c, d, e, f, g, h)| vec![a, b, c, d, e, f, g, h])
            .collect())
    }

    pub async fn known_resources(&self) -> Result<KnownResources, StoreError> {
        let rows: Vec<(String, Option<i64>)> =
            sqlx::query_as("SELECT index_name, updated FROM resources")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(id, updated)| (id, updated.and_then(DateTime::from_timestamp_millis)))
            .collect())
    }

    /// Write a batch of rows and their text index rows in one transaction.
    pub async fn insert_batch(&self, records: &[ResourceMetadata]) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            upsert_row(&mut tx, record).await?;
            reindex_row(&mut tx, &record.index_name).await?;
        }
        tx.commit().await?;
        Ok(records.len())
    }

    /// Rebuild the text index when it no longer covers the row store.
    pub async fn ensure_search_index(&self) -> Result<bool, StoreError> {
        let (rows, indexed) = (self.count().await?, self.search_index_count().await?);
        if rows == indexed {
            return Ok(false);
        }
        warn!(rows, indexed, "text index out of step with row store");
        self.rebuild_search_index().await?;
        Ok(true)
    }

    /// Replace the text index with a projection of every stored row.
    pub async fn rebuild_search_index(&self) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DROP TABLE IF EXISTS resources_fts")
            .execute(&mut *tx)
            .await?;
        sqlx::query(CREATE_SEARCH_INDEX).execute(&mut *tx).await?;
        let inserted = sqlx::query(&format!(
            "INSERT INTO resources_fts ({SEARCH_COLUMNS}) SELECT {SEARCH_COLUMNS} FROM resources"
        ))
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;
        info!(rows = inserted, "rebuilt full text search table");
        Ok(inserted as usize)
    }

    /// Write one record to the row store and its projection to the text index
    /// in a single transaction.
    pub async fn apply_record(
        &self,
        record: &ResourceMetadata,
        known: bool,
    ) -> Result<ApplyOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        upsert_row(&mut tx, record).await?;
        reindex_row(&mut tx, &record.index_name).await?;
        tx.commit().await?;
        Ok(if known {
            ApplyOutcome::Updated
        } else {
            ApplyOutcome::Inserted
        })
    }

    pub async fn get(&self, index_name: &str) -> Result<ResourceMetadata, StoreError> {
        let row: Option<ResourceRow> = sqlx::query_as(&format!(
            "SELECT {RESOURCE_COLUMNS} FROM resources WHERE index_name = ?"
        ))
        .bind(index_name)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => row.into_metadata(),
            None => Err(StoreError::NotFound {
                index_name: index_name.to_string(),
            }),
        }
    }

    /// Fetch rows for the given identifiers, preserving their order. Unknown
    /// identifiers are skipped.
    pub async fn get_many(&self, index_names: &[String]) -> Result<Vec<ResourceMetadata>, StoreError> {
        let mut by_id = HashMap::new();
        for chunk in index_names.chunks(LOOKUP_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT {RESOURCE_COLUMNS} FROM resources WHERE index_name IN ({placeholders})"
            );
            let mut query = sqlx::query_as::<_, ResourceRow>(&sql);
            for id in chunk {
                query = query.bind(id);
            }
            for row in query.fetch_all(&self.pool).await? {
                let rec = row.into_metadata()?;
                by_id.insert(rec.index_name.clone(), rec);
            }
        }
        Ok(index_names.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    /// Distinct values of one attribute, sorted.
    pub async fn distinct_values(&self, attribute: Attribute) -> Result<Vec<String>, StoreError> {
        let column = attribute.field().as_str();
        let rows: Vec<(String,)> = sqlx::query_as(&format!("SELECT DISTINCT {column} FROM resources"))
            .fetch_all(&self.pool)
            .await?;
        let mut values = BTreeSet::new();
        for (value,) in rows {
            if attribute.is_set_valued() {
                let set: BTreeSet<String> = serde_json::from_str(&value)?;
                values.extend(set);
            } else {
                values.insert(value);
            }
        }
        Ok(values.into_iter().collect())
    }

    /// Rows whose `field` timestamp lies in `[since, until]`, newest first.
    pub async fn list_between(
        &self,
        field: SortField,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        max_results: usize,
    ) -> Result<Vec<ResourceMetadata>, StoreError> {
        let column = field.as_str();
        let rows: Vec<ResourceRow> = sqlx::query_as(&format!(
            "SELECT {RESOURCE_COLUMNS} FROM resources WHERE {column} BETWEEN ? AND ? ORDER BY {column} DESC LIMIT ?"
        ))
        .bind(since.timestamp_millis())
        .bind(until.timestamp_millis())
        .bind(sql_limit(max_results))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ResourceRow::into_metadata).collect()
    }

    /// Identifiers matching every supplied predicate, in relevance order.
    pub async fn search_index_names_matching(
        &self,
        query: &SearchQuery,
        max_results: usize,
    ) -> Result<Vec<String>, StoreError> {
        let expression = query.match_expression().ok_or(StoreError::EmptySearch)?;
        debug!(%expression, "full text search");
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT index_name FROM resources_fts WHERE resources_fts MATCH ? ORDER BY rank LIMIT ?",
        )
        .bind(expression)
        .bind(sql_limit(max_results))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Rows matching every supplied predicate, in relevance order.
    pub async fn search(
        &self,
        query: &SearchQuery,
        max_results: usize,
    ) -> Result<Vec<ResourceMetadata>, StoreError> {
        let expression = query.match_expression().ok_or(StoreError::EmptySearch)?;
        debug!(%expression, "full text search");
        let rows: Vec<ResourceRow> = sqlx::query_as(
            r#"
SELECT r.index_name, r.title, r.description, r.org, r.org_type, r.source, r.sector, r.field, r.created, r.updated
FROM resources r
JOIN (
    SELECT index_name, rank AS score FROM resources_fts
    WHERE resources_fts MATCH ? ORDER BY rank LIMIT ?
) m ON m.index_name = r.index_name
ORDER BY m.score
"#,
        )
        .bind(expression)
        .bind(sql_limit(max_results))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ResourceRow::into_metadata).collect()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn sql_limit(max_results: usize) -> i64 {
    i64::try_from(max_results).unwrap_or(i64::MAX)
}

/// Replace the text index row of one identifier with its row store projection.
async fn reindex_row(tx: &mut Transaction<'_, Sqlite>, index_name: &str) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM resources_fts WHERE index_name = ?")
        .bind(index_name)
        .execute(&mut **tx)
        .await?;
    sqlx::query(&format!(
        "INSERT INTO resources_fts ({SEARCH_COLUMNS}) SELECT {SEARCH_COLUMNS} FROM resources WHERE index_name = ?"
    ))
    .bind(index_name)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn upsert_row(
    tx: &mut Transaction<'_, Sqlite>,
    record: &ResourceMetadata,
) -> Result<(), StoreError> {
    sqlx::query(UPSERT_RESOURCE)
        .bind(&record.index_name)
        .bind(&record.title)
        .bind(&record.description)
        .bind(serde_json::to_string(&record.organizations)?)
        .bind(&record.organization_type)
        .bind(&record.source)
        .bind(serde_json::to_string(&record.sectors)?)
        .bind(serde_json::to_string(&record.field_ids)?)
        .bind(record.created_at.map(|t| t.timestamp_millis()))
        .bind(record.updated_at.map(|t| t.timestamp_millis()))
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Per-field text predicates; supplied fields are ANDed together.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub title: Option<String>,
    #[serde(alias = "desc")]
    pub description: Option<String>,
    pub org: Option<String>,
    pub org_type: Option<String>,
    pub sector: Option<String>,
    pub source: Option<String>,
}

impl SearchQuery {
    pub fn predicates(&self) -> Vec<(ResourceField, &str)> {
        [
            (ResourceField::Title, &self.title),
            (ResourceField::Description, &self.description),
            (ResourceField::Organizations, &self.org),
            (ResourceField::OrganizationType, &self.org_type),
            (ResourceField::Sectors, &self.sector),
            (ResourceField::Source, &self.source),
        ]
        .into_iter()
        .filter_map(|(field, value)| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(|v| (field, v))
        })
        .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.predicates().is_empty()
    }

    /// FTS5 expression with one quoted column-filtered phrase per predicate.
    pub fn match_expression(&self) -> Option<String> {
        let parts = self
            .predicates()
            .into_iter()
            .map(|(field, value)| format!("{} : {}", field.as_str(), quote_phrase(value)))
            .collect::<Vec<_>>();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" AND "))
        }
    }
}

fn quote_phrase(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecencyKind {
    Updated,
    Created,
}

impl RecencyKind {
    fn sort_field(&self) -> SortField {
        match self {
            RecencyKind::Updated => SortField::Updated,
            RecencyKind::Created => SortField::Created,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeListing {
    pub sectors: Vec<String>,
    pub sources: Vec<String>,
    pub org_types: Vec<String>,
    pub orgs: Vec<String>,
}

pub type ProjectedResource = JsonMap<String, JsonValue>;

/// Read-side composition of the row store and the text index.
#[derive(Debug, Clone)]
pub struct QueryService {
    store: MetadataStore,
}

impl QueryService {
    pub fn new(store: MetadataStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    pub async fn list_attribute(&self, attribute: Attribute) -> Result<Vec<String>, StoreError> {
        self.store.distinct_values(attribute).await
    }

    pub async fn list_all_attributes(&self) -> Result<AttributeListing, StoreError> {
        Ok(AttributeListing {
            sectors: self.store.distinct_values(Attribute::Sectors).await?,
            sources: self.store.distinct_values(Attribute::Sources).await?,
            org_types: self.store.distinct_values(Attribute::OrganizationTypes).await?,
            orgs: self.store.distinct_values(Attribute::Organizations).await?,
        })
    }

    pub async fn list_recent(
        &self,
        kind: RecencyKind,
        days: u32,
        max_results: usize,
        fields: &[ResourceField],
    ) -> Result<Vec<ProjectedResource>, StoreError> {
        self.list_recent_at(kind, Utc::now(), days, max_results, fields)
            .await
    }

    pub async fn list_recent_at(
        &self,
        kind: RecencyKind,
        now: DateTime<Utc>,
        days: u32,
        max_results: usize,
        fields: &[ResourceField],
    ) -> Result<Vec<ProjectedResource>, StoreError> {
        let since = chrono::Duration::try_days(i64::from(days))
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let rows = self
            .store
            .list_between(kind.sort_field(), since, now, max_results)
            .await?;
        Ok(rows.iter().map(|r| r.project(fields)).collect())
    }

    pub async fn list_recently_updated(
        &self,
        days: u32,
        max_results: usize,
        fields: &[ResourceField],
    ) -> Result<Vec<ProjectedResource>, StoreError> {
        self.list_recent(RecencyKind::Updated, days, max_results, fields)
            .await
    }

    pub async fn list_recently_created(
        &self,
        days: u32,
        max_results: usize,
        fields: &[ResourceField],
    ) -> Result<Vec<ProjectedResource>, StoreError> {
        self.list_recent(RecencyKind::Created, days, max_results, fields)
            .await
    }

    pub async fn search(
        &self,
        query: &SearchQuery,
        max_results: usize,
        fields: &[ResourceField],
    ) -> Result<Vec<ProjectedResource>, StoreError> {
        let rows = self.store.search(query, max_results).await?;
        Ok(rows.iter().map(|r| r.project(fields)).collect())
    }

    pub async fn resource_info(
        &self,
        index_name: &str,
        fields: &[ResourceField],
    ) -> Result<ProjectedResource, StoreError> {
        Ok(self.store.get(index_name).await?.project(fields))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
}

impl HttpClientConfig {
    /// Connect timeout `t`, whole-request timeout `t + 15s`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            connect_timeout: timeout,
            request_timeout: timeout + Duration::from_secs(15),
            ..Default::default()
        }
    }
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(45),
            user_agent: None,
            global_concurrency: 16,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String, body: String },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
        })
    }

    /// One bounded GET. There is no retry; callers decide how to degrade.
    pub async fn fetch_bytes(&self, run_id: Uuid, url: &str) -> Result<FetchedResponse, FetchError> {
        // Never closed; a failed acquire proceeds unbounded.
        let _permit = self.global_limit.acquire().await.ok();

        let span = info_span!("http_fetch", %run_id, url);
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            let body = resp.bytes().await?.to_vec();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                    body: String::from_utf8_lossy(&body).into_owned(),
                });
            }

            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn id(n: u32) -> String {
        format!("00000000-0000-0000-0000-{n:012}")
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn mk_record(n: u32, title: &str, source: &str, updated: i64) -> ResourceMetadata {
        ResourceMetadata {
            index_name: id(n),
            title: title.to_string(),
            description: format!("{title} description"),
            organizations: ["Ministry of Agriculture".to_string()].into(),
            organization_type: "central".to_string(),
            source: source.to_string(),
            sectors: ["Agriculture".to_string(), format!("Sector {n}")].into(),
            field_ids: ["state".to_string(), "year".to_string()].into(),
            created_at: Some(ts(updated - 100)),
            updated_at: Some(ts(updated)),
        }
    }

    async fn open_store(dir: &tempfile::TempDir) -> MetadataStore {
        MetadataStore::open_in_dir(dir.path()).await.unwrap()
    }

    #[tokio::test]
    async fn batch_insert_then_lookup() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        let records = vec![
            mk_record(1, "Crop production", "data.gov.in", 1_000),
            mk_record(2, "Rainfall statistics", "data.gov.in", 2_000),
        ];
        assert_eq!(store.insert_batch(&records).await.unwrap(), 2);
        assert_eq!(store.count().await.unwrap(), 2);
        assert_eq!(store.get(&id(2)).await.unwrap(), records[1]);

        let err = store.get(&id(99)).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
        assert!(!err.is_caller_input());
    }

    #[tokio::test]
    async fn batch_insert_indexes_rows_in_the_same_transaction() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        let records = (1..=5)
            .map(|n| mk_record(n, &format!("Rainfall dataset {n}"), "data.gov.in", 1_000 + n as i64))
            .collect::<Vec<_>>();
        store.insert_batch(&records).await.unwrap();
        store.insert_batch(&records[..2]).await.unwrap();
        assert_eq!(
            store.search_index_names().await.unwrap(),
            store.index_names().await.unwrap()
        );
        assert_eq!(store.search_index_count().await.unwrap(), 5);

        let query = SearchQuery {
            title: Some("rainfall".into()),
            ..Default::default()
        };
        assert_eq!(store.search(&query, 10).await.unwrap().len(), 5);

        assert_eq!(store.rebuild_search_index().await.unwrap(), 5);
        assert_eq!(
            store.search_index_names().await.unwrap(),
            store.index_names().await.unwrap()
        );
    }

    #[tokio::test]
    async fn stale_text_index_is_rebuilt_on_demand() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        let records = (1..=3)
            .map(|n| mk_record(n, &format!("Dataset {n}"), "data.gov.in", 1_000))
            .collect::<Vec<_>>();
        store.insert_batch(&records).await.unwrap();
        assert!(!store.ensure_search_index().await.unwrap());

        sqlx::query("DELETE FROM resources_fts")
            .execute(&store.pool)
            .await
            .unwrap();
        assert!(store.ensure_search_index().await.unwrap());
        assert_eq!(
            store.search_index_names().await.unwrap(),
            store.index_names().await.unwrap()
        );
    }

    #[tokio::test]
    async fn lookups_beyond_the_bound_variable_limit_are_chunked() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        store
            .insert_batch(&[
                mk_record(1, "A", "s", 1_000),
                mk_record(2, "B", "s", 1_000),
            ])
            .await
            .unwrap();

        let mut ids = (100..33_100).map(id).collect::<Vec<_>>();
        ids.insert(0, id(2));
        ids.push(id(1));
        let rows = store.get_many(&ids).await.unwrap();
        let found = rows.iter().map(|r| r.index_name.clone()).collect::<Vec<_>>();
        assert_eq!(found, vec![id(2), id(1)]);
    }

    #[tokio::test]
    async fn oversized_limits_mean_no_limit() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        let records = (1..=3)
            .map(|n| mk_record(n, &format!("Rainfall {n}"), "s", 1_000))
            .collect::<Vec<_>>();
        store.insert_batch(&records).await.unwrap();
        let query = SearchQuery {
            title: Some("rainfall".into()),
            ..Default::default()
        };
        assert_eq!(store.search(&query, usize::MAX).await.unwrap().len(), 3);
        assert_eq!(
            store
                .search_index_names_matching(&query, usize::MAX)
                .await
                .unwrap()
                .len(),
            3
        );
        let all = store
            .list_between(SortField::Updated, ts(0), ts(2_000), usize::MAX)
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn applying_a_known_record_replaces_both_projections() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        let first = mk_record(1, "Groundwater levels", "data.gov.in", 1_000);
        assert_eq!(
            store.apply_record(&first, false).await.unwrap(),
            ApplyOutcome::Inserted
        );

        let second = mk_record(1, "Reservoir storage", "cgwb", 2_000);
        assert_eq!(
            store.apply_record(&second, true).await.unwrap(),
            ApplyOutcome::Updated
        );

        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.search_index_count().await.unwrap(), 1);
        assert_eq!(store.get(&id(1)).await.unwrap(), second);

        let old = SearchQuery {
            title: Some("groundwater".into()),
            ..Default::default()
        };
        assert!(store
            .search_index_names_matching(&old, 10)
            .await
            .unwrap()
            .is_empty());
        let new = SearchQuery {
            title: Some("reservoir".into()),
            ..Default::default()
        };
        assert_eq!(
            store.search_index_names_matching(&new, 10).await.unwrap(),
            vec![id(1)]
        );
    }

    #[tokio::test]
    async fn bulk_and_per_record_paths_produce_identical_text_rows() {
        let dir = tempdir().unwrap();
        let bulk = MetadataStore::open(dir.path().join("bulk.db")).await.unwrap();
        let incremental = MetadataStore::open(dir.path().join("incr.db")).await.unwrap();
        let records = (1..=4)
            .map(|n| mk_record(n, &format!("Census table {n}"), "census", 5_000 + n as i64))
            .collect::<Vec<_>>();

        bulk.insert_batch(&records).await.unwrap();
        let batched = bulk.search_index_rows().await.unwrap();
        bulk.rebuild_search_index().await.unwrap();
        for rec in &records {
            incremental.apply_record(rec, false).await.unwrap();
        }

        assert_eq!(
            bulk.search_index_rows().await.unwrap(),
            incremental.search_index_rows().await.unwrap()
        );
        assert_eq!(batched, incremental.search_index_rows().await.unwrap());
    }

    #[tokio::test]
    async fn distinct_values_flatten_set_attributes() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        store
            .insert_batch(&[
                mk_record(1, "A", "data.gov.in", 1_000),
                mk_record(2, "B", "data.gov.in", 1_000),
                mk_record(3, "C", "nic", 1_000),
            ])
            .await
            .unwrap();

        assert_eq!(
            store.distinct_values(Attribute::Sources).await.unwrap(),
            vec!["data.gov.in".to_string(), "nic".to_string()]
        );
        assert_eq!(
            store.distinct_values(Attribute::Sectors).await.unwrap(),
            vec!["Agriculture", "Sector 1", "Sector 2", "Sector 3"]
        );
        assert_eq!(
            store
                .distinct_values(Attribute::Organizations)
                .await
                .unwrap(),
            vec!["Ministry of Agriculture"]
        );
    }

    #[tokio::test]
    async fn recency_window_is_bounded_sorted_and_capped() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        let now = ts(100 * 86_400);
        let day = 86_400;
        store
            .insert_batch(&[
                mk_record(1, "old", "s", now.timestamp() - 10 * day),
                mk_record(2, "recent", "s", now.timestamp() - 2 * day),
                mk_record(3, "newest", "s", now.timestamp() - 60),
                mk_record(4, "yesterday", "s", now.timestamp() - day),
            ])
            .await
            .unwrap();

        let service = QueryService::new(store);
        let rows = service
            .list_recent_at(RecencyKind::Updated, now, 7, 2, &[ResourceField::Title])
            .await
            .unwrap();
        let titles = rows.iter().map(|r| r["title"].clone()).collect::<Vec<_>>();
        assert_eq!(titles, vec![JsonValue::from("newest"), JsonValue::from("yesterday")]);
        assert_eq!(rows[0].len(), 1);

        let all = service
            .list_recent_at(RecencyKind::Created, now, 7, 10, &[])
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].len(), ResourceField::ALL.len());

        let everything = service
            .list_recent_at(RecencyKind::Updated, now, u32::MAX, 10, &[])
            .await
            .unwrap();
        assert_eq!(everything.len(), 4);
        let everything = service
            .list_recent(RecencyKind::Updated, 200_000_000, 10, &[])
            .await
            .unwrap();
        assert_eq!(everything.len(), 4);
    }

    #[tokio::test]
    async fn search_ands_predicates_and_resolves_rows() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        store
            .insert_batch(&[
                mk_record(1, "District wise rainfall", "imd", 1_000),
                mk_record(2, "District wise crop yield", "data.gov.in", 1_000),
                mk_record(3, "State wise rainfall", "data.gov.in", 1_000),
            ])
            .await
            .unwrap();
        let service = QueryService::new(store.clone());

        let query = SearchQuery {
            title: Some("rainfall".into()),
            source: Some("data.gov.in".into()),
            ..Default::default()
        };
        let hits = service
            .search(&query, 10, &[ResourceField::IndexName])
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["index_name"], JsonValue::from(id(3)));

        let broad = SearchQuery {
            description: Some("wise".into()),
            ..Default::default()
        };
        for hit in service.search(&broad, 10, &[]).await.unwrap() {
            let id = hit["index_name"].as_str().unwrap();
            assert!(store.get(id).await.is_ok());
        }

        let none = SearchQuery {
            title: Some("no such \"title\"".into()),
            ..Default::default()
        };
        assert!(service.search(&none, 10, &[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn search_without_predicates_is_a_caller_fault() {
        let dir = tempdir().unwrap();
        let service = QueryService::new(open_store(&dir).await);
        let blank = SearchQuery {
            title: Some("   ".into()),
            ..Default::default()
        };
        for query in [SearchQuery::default(), blank] {
            let err = service.search(&query, 10, &[]).await.unwrap_err();
            assert!(matches!(err, StoreError::EmptySearch));
            assert!(err.is_caller_input());
        }
    }

    #[test]
    fn match_expression_quotes_each_predicate() {
        let query = SearchQuery {
            title: Some("say \"hi\"".into()),
            sector: Some("health".into()),
            ..Default::default()
        };
        assert_eq!(
            query.match_expression().as_deref(),
            Some(r#"title : "say ""hi""" AND sector : "health""#)
        );
    }

    #[tokio::test]
    async fn reset_clears_both_tables() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        store
            .apply_record(&mk_record(1, "A title", "s", 1_000), false)
            .await
            .unwrap();
        store.reset().await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
        assert_eq!(store.search_index_count().await.unwrap(), 0);
    }

    #[test]
    fn timeout_config_adds_read_grace() {
        let config = HttpClientConfig::with_timeout(Duration::from_secs(30));
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.request_timeout, Duration::from_secs(45));
    }
}
