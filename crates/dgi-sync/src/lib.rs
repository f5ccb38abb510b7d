//! Metadata synchronization: full rebuild, incremental merge, refresh policy.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dgi_adapters::{CatalogSource, DataGovApi, DataGovApiConfig, FetchContext, PageRequest};
use dgi_core::{Attribute, ResourceField, ResourceMetadata};
use dgi_storage::{
    ApplyOutcome, AttributeListing, KnownResources, MetadataStore, ProjectedResource, QueryService,
    RecencyKind, SearchQuery, StoreError,
};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dgi-sync";

pub const DEFAULT_BATCH_SIZE: usize = 5000;
pub const INITIAL_SCAN_LIMIT: usize = 10;
pub const MAX_SCAN_LIMIT: usize = 5000;

/// Public sample key of the remote API; rate limited.
pub const SAMPLE_API_KEY: &str = "579b464db66ec23bdd000001cdd3946e44ce4aad7209ff7b23ac571b";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub cache_dir: PathBuf,
    pub api_base_url: String,
    pub api_key: Option<String>,
    pub sample_api_key: String,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub batch_size: usize,
    pub fetch_workers: usize,
    pub auto_refresh: bool,
    pub refresh_interval: Duration,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub web_port: u16,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            cache_dir: std::env::var("DATAGOVINDIA_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_cache_dir()),
            api_base_url: std::env::var("DGI_API_BASE_URL")
                .unwrap_or_else(|_| dgi_adapters::DEFAULT_BASE_URL.to_string()),
            api_key: std::env::var("DATAGOVINDIA_API_KEY")
                .ok()
                .filter(|v| !v.is_empty()),
            sample_api_key: std::env::var("DATAGOVINDIA_SAMPLE_API_KEY")
                .unwrap_or_else(|_| SAMPLE_API_KEY.to_string()),
            http_timeout_secs: env_parse("DGI_HTTP_TIMEOUT_SECS").unwrap_or(30),
            user_agent: std::env::var("DGI_USER_AGENT")
                .unwrap_or_else(|_| "dgi-mirror/0.1".to_string()),
            batch_size: env_parse("DGI_BATCH_SIZE").unwrap_or(DEFAULT_BATCH_SIZE),
            fetch_workers: env_parse("DGI_FETCH_WORKERS").unwrap_or_else(host_parallelism),
            auto_refresh: env_flag("DGI_AUTO_REFRESH").unwrap_or(true),
            refresh_interval: Duration::from_secs(
                env_parse("DGI_REFRESH_INTERVAL_SECS").unwrap_or(3600),
            ),
            scheduler_enabled: env_flag("DGI_SCHEDULER_ENABLED").unwrap_or(false),
            sync_cron: std::env::var("DGI_SYNC_CRON").unwrap_or_else(|_| "0 0 * * * *".to_string()),
            web_port: env_parse("DGI_WEB_PORT").unwrap_or(8000),
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.cache_dir.join(dgi_storage::DATABASE_FILE)
    }

    pub fn api_config(&self) -> DataGovApiConfig {
        DataGovApiConfig {
            base_url: self.api_base_url.clone(),
            api_key: self.api_key.clone(),
            sample_api_key: self.sample_api_key.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            global_concurrency: self.fetch_workers.max(1),
        }
    }

    pub fn mirror_options(&self) -> MirrorOptions {
        MirrorOptions {
            auto_refresh: self.auto_refresh,
            refresh_interval: self.refresh_interval,
            batch_size: self.batch_size,
            fetch_workers: self.fetch_workers,
        }
    }
}

fn default_cache_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".cache")
        .join("datagovindia")
}

fn host_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
}

/// Split `[0, total)` into `(offset, limit)` windows; the last one holds the remainder.
pub fn partition_batches(total: usize, batch_size: usize) -> Vec<(usize, usize)> {
    let batch_size = batch_size.max(1);
    (0..total)
        .step_by(batch_size)
        .map(|offset| (offset, batch_size.min(total - offset)))
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct FullSyncReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub reported_total: usize,
    pub batches: usize,
    pub fetched: usize,
    pub stored: usize,
    pub indexed: usize,
}

/// Destructive rebuild of the row store and text index from the whole catalog.
pub struct FullSync {
    source: Arc<dyn CatalogSource>,
    store: MetadataStore,
    batch_size: usize,
    workers: usize,
}

impl FullSync {
    pub fn new(source: Arc<dyn CatalogSource>, store: MetadataStore) -> Self {
        Self {
            source,
            store,
            batch_size: DEFAULT_BATCH_SIZE,
            workers: host_parallelism(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub async fn run(&self) -> Result<FullSyncReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("full_sync", %run_id);
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<FullSyncReport> {
        let started_at = Utc::now();
        let ctx = FetchContext::new(run_id);

        let probe = self
            .source
            .fetch_page(&ctx, PageRequest::recently_updated(0, 1))
            .await;
        let total = probe
            .total
            .context("listing did not report a total; keeping the existing store")?;

        self.store.reset().await.context("recreating metadata tables")?;

        let batches = partition_batches(total, self.batch_size);
        info!(
            workers = self.workers,
            batches = batches.len(),
            total,
            "fetching catalog"
        );

        let permits = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();
        for (offset, limit) in batches.iter().copied() {
            let source = Arc::clone(&self.source);
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let page = source
                    .fetch_page(&ctx, PageRequest::recently_updated(offset, limit))
                    .await;
                (offset, page.records)
            });
        }

        let mut fetched = 0usize;
        while let Some(joined) = tasks.join_next().await {
            let (offset, records) = match joined {
                Ok(result) => result,
                Err(err) => {
                    warn!(error = %err, "fetch task aborted");
                    continue;
                }
            };
            fetched += self
                .store
                .insert_batch(&records)
                .await
                .with_context(|| format!("storing batch at offset {offset}"))?;
            debug!(offset, records = records.len(), "stored batch");
        }

        let stored = self.store.count().await?;
        if stored != total {
            warn!(total, fetched, stored, "catalog total differs from stored resources");
        }
        info!("valid resources: {stored}/{total}");

        let indexed = self
            .store
            .rebuild_search_index()
            .await
            .context("rebuilding full text search table")?;

        Ok(FullSyncReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            reported_total: total,
            batches: batches.len(),
            fetched,
            stored,
            indexed,
        })
    }
}

/// Offset/limit cursor of a descending scan: limit doubles per page up to a cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanCursor {
    pub offset: usize,
    pub limit: usize,
    pub done: bool,
}

impl Default for ScanCursor {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: INITIAL_SCAN_LIMIT,
            done: false,
        }
    }
}

impl ScanCursor {
    pub fn advance(&mut self) {
        self.offset += self.limit;
        self.limit = (self.limit * 2).min(MAX_SCAN_LIMIT);
    }

    pub fn finish(&mut self) {
        self.done = true;
    }

    /// Reopen a finished cursor at its current offset and limit.
    pub fn resume(&mut self) {
        self.done = false;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Updated,
    Created,
}

impl Stream {
    fn request(&self, cursor: &ScanCursor) -> PageRequest {
        match self {
            Stream::Updated => PageRequest::recently_updated(cursor.offset, cursor.limit),
            Stream::Created => PageRequest::recently_created(cursor.offset, cursor.limit),
        }
    }

    /// Whether `record` shows the stream has reached locally current data.
    pub fn is_cutover(&self, known: &KnownResources, record: &ResourceMetadata) -> bool {
        match self {
            Stream::Updated => known
                .get(&record.index_name)
                .is_some_and(|local| *local >= record.updated_at),
            Stream::Created => known.contains_key(&record.index_name),
        }
    }
}

/// Oldest first; records without a timestamp go last.
pub fn merge_order(
    mut updated: Vec<ResourceMetadata>,
    mut created: Vec<ResourceMetadata>,
) -> Vec<ResourceMetadata> {
    updated.sort_by_key(|r| missing_last(r.updated_at));
    created.sort_by_key(|r| missing_last(r.created_at));
    updated.extend(created);
    updated
}

fn missing_last(t: Option<DateTime<Utc>>) -> (bool, Option<DateTime<Utc>>) {
    (t.is_none(), t)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeCounts {
    pub inserted: usize,
    pub updated: usize,
}

/// Apply records in order, one committed transaction each, keeping `known`
/// current so later records see earlier ones.
pub async fn apply_delta(
    store: &MetadataStore,
    known: &mut KnownResources,
    records: impl IntoIterator<Item = ResourceMetadata>,
) -> Result<MergeCounts> {
    let mut counts = MergeCounts::default();
    for record in records {
        let is_known = known.contains_key(&record.index_name);
        let outcome = store
            .apply_record(&record, is_known)
            .await
            .with_context(|| format!("applying resource {}", record.index_name))?;
        match outcome {
            ApplyOutcome::Inserted => counts.inserted += 1,
            ApplyOutcome::Updated => counts.updated += 1,
        }
        known.insert(record.index_name, record.updated_at);
    }
    Ok(counts)
}

#[derive(Debug, Clone, Serialize)]
pub struct IncrementalSyncReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub known_before: usize,
    pub reindexed: bool,
    pub updated_found: usize,
    pub created_found: usize,
    pub inserted: usize,
    pub updated: usize,
}

/// Fetches the new tail of the updated and created streams and merges it.
pub struct IncrementalSync {
    source: Arc<dyn CatalogSource>,
    store: MetadataStore,
}

impl IncrementalSync {
    pub fn new(source: Arc<dyn CatalogSource>, store: MetadataStore) -> Self {
        Self { source, store }
    }

    pub async fn run(&self) -> Result<IncrementalSyncReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("incremental_sync", %run_id);
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<IncrementalSyncReport> {
        let started_at = Utc::now();
        let ctx = FetchContext::new(run_id);
        let reindexed = self.store.ensure_search_index().await?;
        let mut known = self.store.known_resources().await?;
        let known_before = known.len();
        info!(existing = known_before, "loaded existing resources");

        let mut cursor = ScanCursor::default();
        let updated = self
            .scan(&ctx, Stream::Updated, &mut cursor, &known)
            .await;
        info!(count = updated.len(), "found recently updated resources");

        cursor.resume();
        let created = self
            .scan(&ctx, Stream::Created, &mut cursor, &known)
            .await;
        info!(count = created.len(), "found recently created resources");

        let (updated_found, created_found) = (updated.len(), created.len());
        let counts = apply_delta(&self.store, &mut known, merge_order(updated, created)).await?;

        Ok(IncrementalSyncReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            known_before,
            reindexed,
            updated_found,
            created_found,
            inserted: counts.inserted,
            updated: counts.updated,
        })
    }

    /// Collect records ahead of the cutover; the cursor is left where the scan stopped.
    pub async fn scan(
        &self,
        ctx: &FetchContext,
        stream: Stream,
        cursor: &mut ScanCursor,
        known: &KnownResources,
    ) -> Vec<ResourceMetadata> {
        let mut delta = Vec::new();
        while !cursor.done {
            let page = self.source.fetch_page(ctx, stream.request(cursor)).await;
            if page.records.is_empty() {
                cursor.finish();
                break;
            }
            for record in page.records {
                if stream.is_cutover(known, &record) {
                    debug!(?stream, index_name = %record.index_name, "cutover");
                    cursor.finish();
                    break;
                }
                delta.push(record);
            }
            if !cursor.done {
                cursor.advance();
            }
        }
        delta
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SyncReport {
    Full(FullSyncReport),
    Incremental(IncrementalSyncReport),
}

#[derive(Debug, Clone)]
pub struct MirrorOptions {
    pub auto_refresh: bool,
    pub refresh_interval: Duration,
    pub batch_size: usize,
    pub fetch_workers: usize,
}

impl Default for MirrorOptions {
    fn default() -> Self {
        Self {
            auto_refresh: true,
            refresh_interval: Duration::from_secs(3600),
            batch_size: DEFAULT_BATCH_SIZE,
            fetch_workers: host_parallelism(),
        }
    }
}

/// Local mirror of the catalog: store, queries and refresh policy in one place.
pub struct Mirror {
    query: QueryService,
    source: Arc<dyn CatalogSource>,
    options: MirrorOptions,
    last_refreshed_at: Mutex<Option<DateTime<Utc>>>,
    sync_lock: tokio::sync::Mutex<()>,
}

impl Mirror {
    pub fn new(store: MetadataStore, source: Arc<dyn CatalogSource>, options: MirrorOptions) -> Self {
        Self {
            query: QueryService::new(store),
            source,
            options,
            last_refreshed_at: Mutex::new(None),
            sync_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Open the store under the configured cache directory and bootstrap it.
    pub async fn open(config: &SyncConfig, source: Arc<dyn CatalogSource>) -> Result<Self> {
        let store = MetadataStore::open(config.database_path())
            .await
            .with_context(|| format!("opening {}", config.database_path().display()))?;
        let mirror = Self::new(store, source, config.mirror_options());
        mirror.bootstrap().await?;
        Ok(mirror)
    }

    /// With auto refresh on: full sync into an empty store, incremental otherwise.
    pub async fn bootstrap(&self) -> Result<Option<SyncReport>> {
        if !self.options.auto_refresh {
            return Ok(None);
        }
        let full = self.store().count().await? == 0;
        self.refresh(full).await.map(Some)
    }

    pub fn store(&self) -> &MetadataStore {
        self.query.store()
    }

    pub fn query(&self) -> &QueryService {
        &self.query
    }

    pub fn last_refreshed_at(&self) -> Option<DateTime<Utc>> {
        *self
            .last_refreshed_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Run one sync. Concurrent calls queue behind each other.
    pub async fn refresh(&self, full: bool) -> Result<SyncReport> {
        let _guard = self.sync_lock.lock().await;
        self.refresh_locked(full).await
    }

    async fn refresh_locked(&self, full: bool) -> Result<SyncReport> {
        let store = self.store().clone();
        let report = if full {
            let report = FullSync::new(Arc::clone(&self.source), store)
                .with_batch_size(self.options.batch_size)
                .with_workers(self.options.fetch_workers)
                .run()
                .await?;
            SyncReport::Full(report)
        } else {
            SyncReport::Incremental(IncrementalSync::new(Arc::clone(&self.source), store).run().await?)
        };
        *self
            .last_refreshed_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
        Ok(report)
    }

    pub fn should_refresh(&self) -> bool {
        match self.last_refreshed_at() {
            None => true,
            Some(at) => Utc::now()
                .signed_duration_since(at)
                .to_std()
                .map_or(false, |elapsed| elapsed >= self.options.refresh_interval),
        }
    }

    /// Incremental refresh when due. Failures are logged; local state still answers queries.
    pub async fn refresh_if_due(&self) {
        if !self.should_refresh() {
            return;
        }
        let _guard = self.sync_lock.lock().await;
        // A concurrent caller may have refreshed while this one waited.
        if !self.should_refresh() {
            return;
        }
        if let Err(err) = self.refresh_locked(false).await {
            warn!(error = %err, "background refresh failed; serving local metadata");
        }
    }

    async fn before_query(&self) {
        if self.options.auto_refresh {
            self.refresh_if_due().await;
        }
    }

    pub async fn list_attribute(&self, attribute: Attribute) -> Result<Vec<String>, StoreError> {
        self.before_query().await;
        self.query.list_attribute(attribute).await
    }

    pub async fn list_org_types(&self) -> Result<Vec<String>, StoreError> {
        self.before_query().await;
        self.query.list_attribute(Attribute::OrganizationTypes).await
    }

    pub async fn list_orgs(&self) -> Result<Vec<String>, StoreError> {
        self.before_query().await;
        self.query.list_attribute(Attribute::Organizations).await
    }

    pub async fn list_sectors(&self) -> Result<Vec<String>, StoreError> {
        self.before_query().await;
        self.query.list_attribute(Attribute::Sectors).await
    }

    pub async fn list_sources(&self) -> Result<Vec<String>, StoreError> {
        self.before_query().await;
        self.query.list_attribute(Attribute::Sources).await
    }

    pub async fn list_all_attributes(&self) -> Result<AttributeListing, StoreError> {
        self.before_query().await;
        self.query.list_all_attributes().await
    }

    pub async fn list_recent(
        &self,
        kind: RecencyKind,
        days: u32,
        max_results: usize,
        fields: &[ResourceField],
    ) -> Result<Vec<ProjectedResource>, StoreError> {
        self.before_query().await;
        self.query.list_recent(kind, days, max_results, fields).await
    }

    pub async fn list_recently_updated(
        &self,
        days: u32,
        max_results: usize,
        fields: &[ResourceField],
    ) -> Result<Vec<ProjectedResource>, StoreError> {
        self.before_query().await;
        self.query
            .list_recently_updated(days, max_results, fields)
            .await
    }

    pub async fn list_recently_created(
        &self,
        days: u32,
        max_results: usize,
        fields: &[ResourceField],
    ) -> Result<Vec<ProjectedResource>, StoreError> {
        self.before_query().await;
        self.query
            .list_recently_created(days, max_results, fields)
            .await
    }

    pub async fn search(
        &self,
        query: &SearchQuery,
        max_results: usize,
        fields: &[ResourceField],
    ) -> Result<Vec<ProjectedResource>, StoreError> {
        if query.is_empty() {
            return Err(StoreError::EmptySearch);
        }
        self.before_query().await;
        self.query.search(query, max_results, fields).await
    }

    pub async fn resource_info(
        &self,
        index_name: &str,
        fields: &[ResourceField],
    ) -> Result<ProjectedResource, StoreError> {
        self.before_query().await;
        self.query.resource_info(index_name, fields).await
    }
}

/// Remote catalog source built from configuration.
pub fn api_source(config: &SyncConfig) -> Result<Arc<dyn CatalogSource>> {
    Ok(Arc::new(DataGovApi::new(config.api_config())?))
}

/// Scheduler running an incremental refresh on `cron`; not started.
pub async fn build_scheduler(mirror: Arc<Mirror>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let mirror = Arc::clone(&mirror);
        Box::pin(async move {
            match mirror.refresh(false).await {
                Ok(report) => info!(?report, "scheduled refresh complete"),
                Err(err) => warn!(error = %err, "scheduled refresh failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    mirror: Arc<Mirror>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }
    build_scheduler(mirror, &config.sync_cron).await.map(Some)
}

pub async fn run_sync_once_from_env(full: bool) -> Result<SyncReport> {
    let config = SyncConfig::from_env();
    let mirror = Mirror::new(
        MetadataStore::open(config.database_path()).await?,
        api_source(&config)?,
        config.mirror_options(),
    );
    let full = full || mirror.store().count().await? == 0;
    mirror.refresh(full).await
}
