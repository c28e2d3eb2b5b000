use crate::config::DedupConfig;
use crate::fingerprint::{normalize_url, title_hash, Fingerprinter};
use crate::types::{CandidateItem, DedupRecord, Fingerprint, PipelineError, Result, ScreenedItem};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Hot key-value cache: get / put-with-TTL, nothing more.
#[async_trait]
pub trait KvCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
}

/// In-process cache with per-key expiry. Doubles as the test cache, so it
/// counts lookups and can be told to fail them.
#[derive(Default)]
pub struct MemoryKvCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
    get_calls: AtomicUsize,
    fail_gets: AtomicBool,
}

impl MemoryKvCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn set_fail_gets(&self, fail: bool) {
        self.fail_gets.store(fail, Ordering::SeqCst);
    }

    pub fn contains(&self, key: &str) -> bool {
        let entries = self.entries.lock().unwrap();
        matches!(entries.get(key), Some((_, expiry)) if *expiry > Instant::now())
    }
}

#[async_trait]
impl KvCache for MemoryKvCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(PipelineError::Cache("cache unavailable".to_string()));
        }
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .get(key)
            .filter(|(_, expiry)| *expiry > Instant::now())
            .map(|(value, _)| value.clone()))
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }
}

/// Durable dedup-key store: one batched existence query, one batched
/// insert-or-ignore.
#[async_trait]
pub trait DedupBackend: Send + Sync {
    /// Which of `keys` exist with `recorded_at` newer than the cutoff.
    async fn find_existing(
        &self,
        keys: &[String],
        newer_than: DateTime<Utc>,
    ) -> Result<HashSet<String>>;

    async fn insert_records(&self, records: &[DedupRecord]) -> Result<()>;
}

/// Postgres-backed durable store.
pub struct PgDedupBackend {
    pool: PgPool,
}

impl PgDedupBackend {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        let backend = Self { pool };
        backend.ensure_schema().await?;
        Ok(backend)
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dedup_keys (
                key TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl DedupBackend for PgDedupBackend {
    async fn find_existing(
        &self,
        keys: &[String],
        newer_than: DateTime<Utc>,
    ) -> Result<HashSet<String>> {
        if keys.is_empty() {
            return Ok(HashSet::new());
        }

        let rows = sqlx::query(
            "SELECT key FROM dedup_keys WHERE key = ANY($1) AND recorded_at > $2",
        )
        .bind(keys)
        .bind(newer_than)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| row.try_get::<String, _>("key").ok())
            .collect())
    }

    async fn insert_records(&self, records: &[DedupRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let keys: Vec<String> = records.iter().map(|r| r.key.clone()).collect();
        let titles: Vec<String> = records.iter().map(|r| r.title.clone()).collect();
        let stamps: Vec<DateTime<Utc>> = records.iter().map(|r| r.recorded_at).collect();

        sqlx::query(
            r#"
            INSERT INTO dedup_keys (key, title, recorded_at)
            SELECT * FROM UNNEST($1::text[], $2::text[], $3::timestamptz[])
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(&keys)
        .bind(&titles)
        .bind(&stamps)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// In-memory durable store for tests, instrumented with call counters and a
/// failure switch.
#[derive(Default)]
pub struct MemoryDedupBackend {
    records: Mutex<HashMap<String, DedupRecord>>,
    query_calls: AtomicUsize,
    fail_queries: AtomicBool,
}

impl MemoryDedupBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query_calls(&self) -> usize {
        self.query_calls.load(Ordering::SeqCst)
    }

    pub fn set_fail_queries(&self, fail: bool) {
        self.fail_queries.store(fail, Ordering::SeqCst);
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.records.lock().unwrap().contains_key(key)
    }
}

#[async_trait]
impl DedupBackend for MemoryDedupBackend {
    async fn find_existing(
        &self,
        keys: &[String],
        newer_than: DateTime<Utc>,
    ) -> Result<HashSet<String>> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(PipelineError::General("durable store unavailable".to_string()));
        }
        let records = self.records.lock().unwrap();
        Ok(keys
            .iter()
            .filter(|key| {
                records
                    .get(key.as_str())
                    .map(|r| r.recorded_at > newer_than)
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn insert_records(&self, new_records: &[DedupRecord]) -> Result<()> {
        let mut records = self.records.lock().unwrap();
        for record in new_records {
            records.entry(record.key.clone()).or_insert_with(|| record.clone());
        }
        Ok(())
    }
}

/// Durable tier stand-in when no database is configured: everything is new,
/// nothing is remembered.
pub struct NullDedupBackend;

#[async_trait]
impl DedupBackend for NullDedupBackend {
    async fn find_existing(
        &self,
        _keys: &[String],
        _newer_than: DateTime<Utc>,
    ) -> Result<HashSet<String>> {
        Ok(HashSet::new())
    }

    async fn insert_records(&self, _records: &[DedupRecord]) -> Result<()> {
        Ok(())
    }
}

fn hot_cache_key(normalized_url: &str) -> String {
    format!("recent_url:{}", normalized_url)
}

/// Three cooperating dedup tiers, cheapest first: per-run set, hot cache,
/// durable store. A hit at any tier short-circuits the rest; a tier failure
/// is a non-hit. The tiering bounds outbound calls per run while still
/// covering the full historical corpus.
pub struct TieredDedupStore {
    cache: Arc<dyn KvCache>,
    backend: Arc<dyn DedupBackend>,
    fingerprinter: Arc<Fingerprinter>,
    config: DedupConfig,
}

impl TieredDedupStore {
    pub fn new(
        cache: Arc<dyn KvCache>,
        backend: Arc<dyn DedupBackend>,
        fingerprinter: Arc<Fingerprinter>,
        config: DedupConfig,
    ) -> Self {
        Self {
            cache,
            backend,
            fingerprinter,
            config,
        }
    }

    /// Filter one run's candidates down to items never published before.
    /// Items past a tier's batch cap pass that tier unchecked; the durable
    /// store remains the source of truth at publish time in future runs.
    pub async fn filter_new(&self, items: Vec<CandidateItem>) -> Vec<ScreenedItem> {
        let total = items.len();
        let batch_unique = self.filter_in_batch(items);
        info!("Dedup tier 0 (in-batch): {} -> {} items", total, batch_unique.len());

        let after_cache = self.filter_hot_cache(batch_unique).await;
        info!("Dedup tier 1 (hot cache): {} items remain", after_cache.len());

        let survivors = self.filter_durable(after_cache).await;
        info!("Dedup tier 2 (durable): {} items remain", survivors.len());
        survivors
    }

    fn filter_in_batch(&self, items: Vec<CandidateItem>) -> Vec<(CandidateItem, String)> {
        let mut seen_urls = HashSet::new();
        let mut seen_titles = HashSet::new();
        let mut unique = Vec::new();

        for item in items {
            let url = normalize_url(&item.link);
            let hash = title_hash(&item.title);
            if !seen_urls.insert(url.clone()) || !seen_titles.insert(hash) {
                debug!("In-batch duplicate: {}", item.title);
                continue;
            }
            unique.push((item, url));
        }

        unique
    }

    async fn filter_hot_cache(
        &self,
        items: Vec<(CandidateItem, String)>,
    ) -> Vec<(CandidateItem, String)> {
        if items.is_empty() {
            return items;
        }

        let checked = &items[..items.len().min(self.config.hot_cache_batch_limit)];
        let keys: Vec<String> = checked.iter().map(|(_, url)| hot_cache_key(url)).collect();
        let results = join_all(keys.iter().map(|key| self.cache.get(key))).await;

        let mut cached_urls = HashSet::new();
        for ((_, url), result) in checked.iter().zip(results) {
            match result {
                Ok(Some(_)) => {
                    cached_urls.insert(url.clone());
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Hot-cache lookup failed for {}: {}, treating as miss", url, e);
                }
            }
        }

        if !cached_urls.is_empty() {
            info!("Hot cache hits: {}", cached_urls.len());
        }

        items
            .into_iter()
            .filter(|(_, url)| !cached_urls.contains(url))
            .collect()
    }

    async fn filter_durable(&self, items: Vec<(CandidateItem, String)>) -> Vec<ScreenedItem> {
        if items.is_empty() {
            return Vec::new();
        }

        let check_count = items.len().min(self.config.durable_batch_limit);
        let cutoff = self.retention_cutoff();

        // The semantic fingerprint is only worth a judge call for items that
        // actually reach the durable query.
        let mut fingerprints = Vec::with_capacity(check_count);
        let mut all_keys = Vec::with_capacity(check_count * 3);
        for (item, _) in items.iter().take(check_count) {
            let fp = self.fingerprinter.fingerprint(item).await;
            all_keys.extend(fp.dedup_keys());
            fingerprints.push(fp);
        }

        let existing = match self.backend.find_existing(&all_keys, cutoff).await {
            Ok(existing) => existing,
            Err(e) => {
                warn!("Durable dedup query failed: {}, failing open", e);
                HashSet::new()
            }
        };

        let mut survivors = Vec::new();
        for (index, (item, _)) in items.into_iter().enumerate() {
            if index < check_count {
                let fp = fingerprints[index].clone();
                if fp.dedup_keys().iter().any(|key| existing.contains(key)) {
                    debug!("Durable-store duplicate: {}", item.title);
                    continue;
                }
                survivors.push(ScreenedItem {
                    item,
                    fingerprint: Some(fp),
                });
            } else {
                survivors.push(ScreenedItem {
                    item,
                    fingerprint: None,
                });
            }
        }

        survivors
    }

    /// Record dedup keys for a published item: all three namespaces into
    /// the durable store, plus a detached hot-cache marker. Best-effort;
    /// failures are logged, never rolled back. The worst case is one future
    /// re-publish.
    pub async fn record(&self, item: &CandidateItem, fingerprint: Option<Fingerprint>) {
        let fingerprint = match fingerprint {
            Some(fp) => fp,
            None => self.fingerprinter.fingerprint(item).await,
        };

        let now = Utc::now();
        let records: Vec<DedupRecord> = fingerprint
            .dedup_keys()
            .into_iter()
            .map(|key| DedupRecord {
                key,
                title: item.title.clone(),
                recorded_at: now,
            })
            .collect();

        if let Err(e) = self.backend.insert_records(&records).await {
            warn!("Durable dedup write failed for {}: {}", item.link, e);
        }

        // Hot-cache write-back is off the critical path.
        let cache = Arc::clone(&self.cache);
        let key = hot_cache_key(&fingerprint.normalized_url);
        let ttl = self.config.hot_cache_ttl;
        let stamp = now.timestamp_millis().to_string();
        tokio::spawn(async move {
            if let Err(e) = cache.put(&key, &stamp, ttl).await {
                warn!("Hot-cache write-back failed for {}: {}", key, e);
            }
        });
    }

    fn retention_cutoff(&self) -> DateTime<Utc> {
        Utc::now()
            - chrono::Duration::from_std(self.config.retention_ttl)
                .unwrap_or_else(|_| chrono::Duration::days(30))
    }
}
