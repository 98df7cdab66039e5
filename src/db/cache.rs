use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::AppResult;

/// Opaque key/value backend behind every cache tier
///
/// Values are stored as serialized strings; the store never interprets them.
/// Concurrent writes to the same key are last-write-wins.
#[async_trait::async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> AppResult<Option<String>>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> AppResult<()>;

    /// Returns true when a key was removed
    async fn delete(&self, key: &str) -> AppResult<bool>;

    /// Adds `amount` to an integer counter, creating it with `ttl` when absent
    async fn increment(&self, key: &str, amount: i64, ttl: Duration) -> AppResult<i64>;

    /// Time left before the key expires, `None` when missing or persistent
    async fn remaining_ttl(&self, key: &str) -> AppResult<Option<Duration>>;

    fn backend(&self) -> &'static str;
}

/// Logical cache tiers, differing only in namespace and default TTL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheTier {
    Recommendations,
    AudioFeatures,
    ApiResponses,
    UserData,
}

impl CacheTier {
    pub fn namespace(&self) -> &'static str {
        match self {
            CacheTier::Recommendations => "recs:",
            CacheTier::AudioFeatures => "features:",
            CacheTier::ApiResponses => "api:",
            CacheTier::UserData => "user:",
        }
    }
}

/// Default TTL per tier
#[derive(Debug, Clone, Copy)]
pub struct CacheTtls {
    pub recommendations: Duration,
    pub audio_features: Duration,
    pub api_responses: Duration,
    pub user_data: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            recommendations: Duration::from_secs(86_400),
            audio_features: Duration::from_secs(604_800),
            api_responses: Duration::from_secs(21_600),
            user_data: Duration::from_secs(1_800),
        }
    }
}

impl CacheTtls {
    pub fn for_tier(&self, tier: CacheTier) -> Duration {
        match tier {
            CacheTier::Recommendations => self.recommendations,
            CacheTier::AudioFeatures => self.audio_features,
            CacheTier::ApiResponses => self.api_responses,
            CacheTier::UserData => self.user_data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// Ranked recommendations for a user
    Recommendations(String),
    /// Bumped by feedback; rankings computed under an older value are stale
    RecommendationVersion(String),
    /// Full track metadata by identity
    Track(String),
    /// Audio feature vector by track identity
    AudioFeatures(String),
    /// Genres attached to an upstream artist
    ArtistGenres(String),
    /// Generic upstream response, keyed by a request fingerprint
    ApiResponse(String),
    /// Daily upstream call counter
    QuotaUsage(String),
    /// Listening-history snapshot for a user
    ListeningHistory(String),
    /// Per-user request counter for one fixed window
    UserRateWindow { user_id: String, window: i64 },
}

impl CacheKey {
    pub fn tier(&self) -> CacheTier {
        match self {
            CacheKey::Recommendations(_) | CacheKey::RecommendationVersion(_) => {
                CacheTier::Recommendations
            }
            CacheKey::Track(_) | CacheKey::AudioFeatures(_) => CacheTier::AudioFeatures,
            CacheKey::ArtistGenres(_) | CacheKey::ApiResponse(_) | CacheKey::QuotaUsage(_) => {
                CacheTier::ApiResponses
            }
            CacheKey::ListeningHistory(_) | CacheKey::UserRateWindow { .. } => CacheTier::UserData,
        }
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ns = self.tier().namespace();
        match self {
            CacheKey::Recommendations(user_id) => write!(f, "{}{}", ns, user_id),
            CacheKey::RecommendationVersion(user_id) => write!(f, "{}version:{}", ns, user_id),
            CacheKey::Track(id) => write!(f, "{}track:{}", ns, id),
            CacheKey::AudioFeatures(id) => write!(f, "{}{}", ns, id),
            CacheKey::ArtistGenres(id) => write!(f, "{}artist:{}", ns, id),
            CacheKey::ApiResponse(fingerprint) => {
                write!(f, "{}{}", ns, fingerprint.to_lowercase())
            }
            CacheKey::QuotaUsage(date) => write!(f, "{}quota:daily:{}", ns, date),
            CacheKey::ListeningHistory(user_id) => write!(f, "{}history:{}", ns, user_id),
            CacheKey::UserRateWindow { user_id, window } => {
                write!(f, "{}ratelimit:{}:{}", ns, user_id, window)
            }
        }
    }
}

/// Hit/miss accounting shared by every clone of a [`Cache`]
#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    writes: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub backend: &'static str,
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub writes: u64,
    pub hit_rate: f64,
}

/// Message for asynchronous cache writes
struct CacheWriteMessage {
    key: String,
    value: String,
    ttl: Duration,
}

/// Tiered cache facade used by every component
///
/// Reads never fail: a backend error is logged, counted and reported as a
/// miss so callers fall through to the upstream.
#[derive(Clone)]
pub struct Cache {
    store: Arc<dyn CacheStore>,
    ttls: CacheTtls,
    counters: Arc<CacheCounters>,
    write_tx: mpsc::UnboundedSender<CacheWriteMessage>,
}

/// Handle for gracefully shutting down the cache writer
pub struct CacheWriterHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl CacheWriterHandle {
    /// Initiates a graceful shutdown of the cache writer
    ///
    /// Sends a shutdown signal to the writer task and waits for it to flush
    /// all pending writes.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        tracing::info!("Cache writer shutdown signal sent");
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Cache writer task failed during shutdown");
        }
    }
}

impl Cache {
    /// Creates a new Cache instance with an async write background task
    pub fn new(store: Arc<dyn CacheStore>, ttls: CacheTtls) -> (Self, CacheWriterHandle) {
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let writer_store = store.clone();
        let task = tokio::spawn(async move {
            Self::cache_writer_task(writer_store, write_rx, shutdown_rx).await;
        });

        let cache = Self {
            store,
            ttls,
            counters: Arc::new(CacheCounters::default()),
            write_tx,
        };

        (cache, CacheWriterHandle { shutdown_tx, task })
    }

    /// Background task that processes cache write messages
    ///
    /// On shutdown signal, flushes everything already queued before exiting.
    async fn cache_writer_task(
        store: Arc<dyn CacheStore>,
        mut write_rx: mpsc::UnboundedReceiver<CacheWriteMessage>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        tracing::info!(backend = store.backend(), "Cache writer task started");

        loop {
            tokio::select! {
                Some(msg) = write_rx.recv() => {
                    if let Err(e) = store.set(&msg.key, msg.value, msg.ttl).await {
                        tracing::error!(error = %e, key = %msg.key, "Failed to write to cache");
                    }
                }
                _ = shutdown_rx.recv() => {
                    write_rx.close();
                    let mut flushed = 0usize;
                    while let Some(msg) = write_rx.recv().await {
                        if let Err(e) = store.set(&msg.key, msg.value, msg.ttl).await {
                            tracing::error!(error = %e, "Failed to flush cache write during shutdown");
                        }
                        flushed += 1;
                    }

                    tracing::info!(flushed, "Cache writer task stopped");
                    break;
                }
            }
        }
    }

    pub fn default_ttl(&self, key: &CacheKey) -> Duration {
        self.ttls.for_tier(key.tier())
    }

    /// Retrieves a value from the cache by key
    ///
    /// Missing keys, expired entries, undecodable payloads and backend
    /// failures all come back as `None`.
    pub async fn get_from_cache<T: serde::de::DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let raw = match self.store.get(&key.to_string()).await {
            Ok(raw) => raw,
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, key = %key, "Cache read failed, treating as miss");
                return None;
            }
        };

        match raw {
            Some(json) => match serde_json::from_str(&json) {
                Ok(value) => {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    Some(value)
                }
                Err(e) => {
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %e, key = %key, "Cache deserialization error");
                    None
                }
            },
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Stores a value with the tier's default TTL and waits for the write
    pub async fn set<T: Serialize>(&self, key: &CacheKey, value: &T) -> AppResult<()> {
        self.set_with_ttl(key, value, self.default_ttl(key)).await
    }

    pub async fn set_with_ttl<T: Serialize>(
        &self,
        key: &CacheKey,
        value: &T,
        ttl: Duration,
    ) -> AppResult<()> {
        let json = serde_json::to_string(value)?;
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        self.store.set(&key.to_string(), json, ttl).await
    }

    /// Stores a value asynchronously without blocking, using the tier's default TTL
    pub fn set_in_background<T: Serialize>(&self, key: &CacheKey, value: &T) {
        self.set_in_background_with_ttl(key, value, self.default_ttl(key));
    }

    /// Stores a value asynchronously without blocking
    ///
    /// The value is serialized here and handed to the writer task, so this
    /// returns immediately without waiting for the backend.
    pub fn set_in_background_with_ttl<T: Serialize>(&self, key: &CacheKey, value: &T, ttl: Duration) {
        let json = match serde_json::to_string(value) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!(error = %e, "Cache serialization error");
                return;
            }
        };

        let msg = CacheWriteMessage {
            key: key.to_string(),
            value: json,
            ttl,
        };

        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.write_tx.send(msg) {
            tracing::error!(error = %e, "Failed to send cache write message");
        }
    }

    pub async fn delete(&self, key: &CacheKey) -> AppResult<bool> {
        self.store.delete(&key.to_string()).await
    }

    /// Increments a counter, giving it `ttl` when it is created
    pub async fn increment_counter(&self, key: &CacheKey, amount: i64, ttl: Duration) -> AppResult<i64> {
        self.store.increment(&key.to_string(), amount, ttl).await
    }

    /// Reads a counter written by [`Cache::increment_counter`], zero when absent
    pub async fn counter(&self, key: &CacheKey) -> AppResult<i64> {
        match self.store.get(&key.to_string()).await? {
            Some(raw) => Ok(raw.trim().parse().unwrap_or(0)),
            None => Ok(0),
        }
    }

    pub async fn remaining_ttl(&self, key: &CacheKey) -> AppResult<Option<Duration>> {
        self.store.remaining_ttl(&key.to_string()).await
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            backend: self.store.backend(),
            hits,
            misses,
            errors: self.counters.errors.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}
