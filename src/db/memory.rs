use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::db::cache::CacheStore;
use crate::error::{AppError, AppResult};

/// Writes between proactive sweeps of expired entries
const SWEEP_EVERY: u64 = 1024;

struct MemoryEntry {
    value: String,
    expires_at: Instant,
}

impl MemoryEntry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// In-process cache backend used when no Redis URL is configured
///
/// Expired entries are dropped lazily when read and proactively every
/// [`SWEEP_EVERY`] writes.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, MemoryEntry>>,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> AppResult<std::sync::MutexGuard<'_, HashMap<String, MemoryEntry>>> {
        self.entries
            .lock()
            .map_err(|_| AppError::Internal("memory cache lock poisoned".to_string()))
    }

    fn note_write(&self) {
        if self.writes.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            let removed = self.purge_expired();
            if removed > 0 {
                tracing::debug!(removed, "Swept expired in-memory cache entries");
            }
        }
    }

    /// Removes every expired entry, returning how many were dropped
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        match self.entries.lock() {
            Ok(mut entries) => {
                let before = entries.len();
                entries.retain(|_, entry| entry.is_live(now));
                before - entries.len()
            }
            Err(_) => 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let now = Instant::now();
        let mut entries = self.lock()?;
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> AppResult<()> {
        {
            let mut entries = self.lock()?;
            entries.insert(
                key.to_string(),
                MemoryEntry {
                    value,
                    expires_at: Instant::now() + ttl,
                },
            );
        }
        self.note_write();
        Ok(())
    }

    async fn delete(&self, key: &str) -> AppResult<bool> {
        let now = Instant::now();
        let mut entries = self.lock()?;
        Ok(entries.remove(key).is_some_and(|entry| entry.is_live(now)))
    }

    async fn increment(&self, key: &str, amount: i64, ttl: Duration) -> AppResult<i64> {
        let now = Instant::now();
        let value = {
            let mut entries = self.lock()?;
            let current = match entries.get(key) {
                Some(entry) if entry.is_live(now) => Some((
                    entry.value.trim().parse::<i64>().map_err(|_| {
                        AppError::InvalidInput(format!("cache key {} does not hold a counter", key))
                    })?,
                    entry.expires_at,
                )),
                _ => None,
            };

            let (value, expires_at) = match current {
                Some((count, expires_at)) => (count + amount, expires_at),
                None => (amount, now + ttl),
            };

            entries.insert(
                key.to_string(),
                MemoryEntry {
                    value: value.to_string(),
                    expires_at,
                },
            );
            value
        };
        self.note_write();
        Ok(value)
    }

    async fn remaining_ttl(&self, key: &str) -> AppResult<Option<Duration>> {
        let now = Instant::now();
        let entries = self.lock()?;
        Ok(entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.expires_at - now))
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
