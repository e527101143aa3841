//! Geocode cache persistence, rate-limited HTTP fetch and retry utilities.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;
use vinloc_core::{Coordinate, GeoSource, PlaceName};

pub const CRATE_NAME: &str = "vinloc-storage";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("geocode cache {}: {action} failed: {source}", .path.display())]
    Io {
        path: PathBuf,
        action: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("geocode cache {} is corrupt at line {line}: {reason}", .path.display())]
    Corrupt {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("geocode cache {}: encoding entry failed: {source}", .path.display())]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Result of a cache lookup. `Hit(None)` records that the source answered with
/// no result, which is different from never having asked.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CacheLookup {
    Hit(Option<Coordinate>),
    Miss,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CachePolicy {
    /// Cached "no result" entries older than this read back as `Miss`.
    /// `None` keeps them forever.
    pub null_ttl: Option<chrono::Duration>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub null_entries: usize,
    pub per_source: BTreeMap<GeoSource, usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JournalEntry {
    place: String,
    source: GeoSource,
    coord: Option<Coordinate>,
    cached_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct CachedValue {
    coord: Option<Coordinate>,
    cached_at: DateTime<Utc>,
}

/// Append-only JSON-lines journal keyed by `(place key, source)`.
///
/// Every `put` is appended and flushed before returning, so a crash loses at
/// most the entry being written. `close` rewrites the journal with one line per
/// key via temp file and atomic rename. Assumes a single writer process.
#[derive(Debug)]
pub struct GeocodeCache {
    path: PathBuf,
    policy: CachePolicy,
    entries: BTreeMap<(String, GeoSource), CachedValue>,
    journal_lines: usize,
    closed: bool,
}

impl GeocodeCache {
    pub async fn open(path: impl Into<PathBuf>, policy: CachePolicy) -> Result<Self, CacheError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(|source| CacheError::Io {
                path: path.clone(),
                action: "creating cache directory",
                source,
            })?;
        }

        let exists = fs::try_exists(&path).await.map_err(|source| CacheError::Io {
            path: path.clone(),
            action: "checking cache file",
            source,
        })?;

        let mut entries = BTreeMap::new();
        let mut journal_lines = 0usize;
        if exists {
            let text = fs::read_to_string(&path)
                .await
                .map_err(|source| CacheError::Io {
                    path: path.clone(),
                    action: "reading cache file",
                    source,
                })?;
            for (idx, line) in text.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let entry: JournalEntry =
                    serde_json::from_str(line).map_err(|err| CacheError::Corrupt {
                        path: path.clone(),
                        line: idx + 1,
                        reason: err.to_string(),
                    })?;
                journal_lines += 1;
                entries.insert(
                    (entry.place, entry.source),
                    CachedValue {
                        coord: entry.coord,
                        cached_at: entry.cached_at,
                    },
                );
            }
        }

        info!(
            cache = %path.display(),
            entries = entries.len(),
            journal_lines,
            "opened geocode cache"
        );

        Ok(Self {
            path,
            policy,
            entries,
            journal_lines,
            closed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, place: &PlaceName, source: GeoSource) -> CacheLookup {
        self.get_at(place, source, Utc::now())
    }

    pub fn get_at(&self, place: &PlaceName, source: GeoSource, now: DateTime<Utc>) -> CacheLookup {
        let Some(value) = self.entries.get(&(place.key().to_string(), source)) else {
            return CacheLookup::Miss;
        };
        if value.coord.is_none() {
            if let Some(ttl) = self.policy.null_ttl {
                if now - value.cached_at > ttl {
                    return CacheLookup::Miss;
                }
            }
        }
        CacheLookup::Hit(value.coord)
    }

    pub async fn put(
        &mut self,
        place: &PlaceName,
        source: GeoSource,
        coord: Option<Coordinate>,
    ) -> Result<(), CacheError> {
        self.put_at(place, source, coord, Utc::now()).await
    }

    pub async fn put_at(
        &mut self,
        place: &PlaceName,
        source: GeoSource,
        coord: Option<Coordinate>,
        cached_at: DateTime<Utc>,
    ) -> Result<(), CacheError> {
        let entry = JournalEntry {
            place: place.key().to_string(),
            source,
            coord,
            cached_at,
        };
        let mut line = serde_json::to_string(&entry).map_err(|source| CacheError::Encode {
            path: self.path.clone(),
            source,
        })?;
        line.push('\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|source| self.io_error("opening cache journal", source))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|source| self.io_error("appending cache entry", source))?;
        file.flush()
            .await
            .map_err(|source| self.io_error("flushing cache journal", source))?;

        self.journal_lines += 1;
        self.entries
            .insert((entry.place, source), CachedValue { coord, cached_at });
        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            entries: self.entries.len(),
            ..Default::default()
        };
        for ((_, source), value) in &self.entries {
            *stats.per_source.entry(*source).or_default() += 1;
            if value.coord.is_none() {
                stats.null_entries += 1;
            }
        }
        stats
    }

    /// Compact the journal and release the handle.
    pub async fn close(mut self) -> Result<CacheStats, CacheError> {
        let stats = self.stats();
        if self.journal_lines > self.entries.len() {
            self.compact().await?;
        }
        self.closed = true;
        debug!(cache = %self.path.display(), entries = stats.entries, "closed geocode cache");
        Ok(stats)
    }

    async fn compact(&mut self) -> Result<(), CacheError> {
        let mut body = String::new();
        for ((place, source), value) in &self.entries {
            let entry = JournalEntry {
                place: place.clone(),
                source: *source,
                coord: value.coord,
                cached_at: value.cached_at,
            };
            let line = serde_json::to_string(&entry).map_err(|source| CacheError::Encode {
                path: self.path.clone(),
                source,
            })?;
            body.push_str(&line);
            body.push('\n');
        }

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "geocode_cache".to_string());
        let temp_path = self
            .path
            .with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|source| self.io_error("creating compaction temp file", source))?;
        file.write_all(body.as_bytes())
            .await
            .map_err(|source| self.io_error("writing compaction temp file", source))?;
        file.flush()
            .await
            .map_err(|source| self.io_error("flushing compaction temp file", source))?;
        drop(file);

        if let Err(source) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(self.io_error("replacing cache journal", source));
        }
        self.journal_lines = self.entries.len();
        Ok(())
    }

    fn io_error(&self, action: &'static str, source: std::io::Error) -> CacheError {
        CacheError::Io {
            path: self.path.clone(),
            action,
            source,
        }
    }
}

impl Drop for GeocodeCache {
    fn drop(&mut self) {
        if !self.closed {
            warn!(
                cache = %self.path.display(),
                journal_lines = self.journal_lines,
                "geocode cache dropped without close; journal left uncompacted"
            );
        }
    }
}

/// Time source for backoff sleeps, swappable in tests.
#[async_trait]
pub trait Clock: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Clock that returns immediately and remembers every requested sleep.
#[derive(Debug, Default)]
pub struct RecordingClock {
    sleeps: StdMutex<Vec<Duration>>,
}

impl RecordingClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Clock for RecordingClock {
    async fn sleep(&self, duration: Duration) {
        if let Ok(mut sleeps) = self.sleeps.lock() {
            sleeps.push(duration);
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStep {
    /// Sleep `delay`, then make attempt number `attempt` (1-based).
    Retry { attempt: usize, delay: Duration },
    GiveUp { attempts: usize },
}

/// Bounded retry bookkeeping: counts failures and yields the next backoff.
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: BackoffPolicy,
    failures: usize,
}

impl RetryState {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    pub fn failures(&self) -> usize {
        self.failures
    }

    pub fn record_failure(&mut self) -> RetryStep {
        self.failures += 1;
        if self.failures >= self.policy.max_attempts.max(1) {
            return RetryStep::GiveUp {
                attempts: self.failures,
            };
        }
        RetryStep::Retry {
            attempt: self.failures + 1,
            delay: self.policy.delay_for_attempt(self.failures - 1),
        }
    }
}

#[derive(Debug)]
pub struct RetryExhausted<E> {
    pub attempts: usize,
    pub last_error: E,
}

/// Run `op` until it succeeds or the policy gives up. Only `Err` is retried.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: BackoffPolicy,
    clock: &dyn Clock,
    mut op: F,
) -> Result<T, RetryExhausted<E>>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut state = RetryState::new(policy);
    let mut attempt = 1usize;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => match state.record_failure() {
                RetryStep::Retry {
                    attempt: next,
                    delay,
                } => {
                    debug!(attempt, next, delay_ms = delay.as_millis() as u64, error = %err, "retrying after failure");
                    clock.sleep(delay).await;
                    attempt = next;
                }
                RetryStep::GiveUp { attempts } => {
                    return Err(RetryExhausted {
                        attempts,
                        last_error: err,
                    });
                }
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity.max(1),
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        if self.refill_every.is_zero() {
            return;
        }
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis().max(1)) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every.saturating_sub(elapsed);
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            concurrency: 1,
            token_bucket: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url} failed: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// One client per source, so each source is rate limited on its own.
/// Single attempt per call; callers own retry.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            token_bucket,
        })
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, FetchError> {
        let _permit = self.limit.acquire().await.expect("semaphore not closed");
        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let resp = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .query(query)
            .send()
            .await
            .map_err(|source| FetchError::Request {
                url: url.to_string(),
                source,
            })?;

        let status: StatusCode = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp.bytes().await.map_err(|source| FetchError::Request {
            url: final_url.clone(),
            source,
        })?;
        serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
            url: final_url,
            source,
        })
    }
}
