use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use sqlx::{types::Json, PgPool, Row};

use crate::{
    db::{Cache, CacheKey},
    error::{AppError, AppResult},
    models::{ListeningHistoryEntry, Track},
    services::catalog::CatalogSource,
};

/// Most entries kept per user
pub const MAX_HISTORY_ENTRIES: usize = 50;

/// Snapshots younger than this are not refreshed from the catalog
const REFRESH_AFTER_HOURS: i64 = 6;

/// Persistent listening-history snapshots, ordered most-preferred first
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    async fn top_tracks(&self, user_id: &str, limit: usize) -> AppResult<Vec<ListeningHistoryEntry>>;

    /// When the snapshot was last replaced, `None` if never stored
    async fn last_updated(&self, user_id: &str) -> AppResult<Option<DateTime<Utc>>>;

    async fn replace(&self, user_id: &str, entries: &[ListeningHistoryEntry]) -> AppResult<()>;
}

#[derive(Clone)]
pub struct PgHistoryStore {
    pool: PgPool,
}

impl PgHistoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl HistoryStore for PgHistoryStore {
    async fn top_tracks(&self, user_id: &str, limit: usize) -> AppResult<Vec<ListeningHistoryEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT track_json, weight
            FROM listening_history
            WHERE user_id = $1
            ORDER BY position
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> AppResult<ListeningHistoryEntry> {
                let Json(track) = row.try_get::<Json<Track>, _>("track_json")?;
                Ok(ListeningHistoryEntry {
                    track,
                    weight: row.try_get("weight")?,
                })
            })
            .collect()
    }

    async fn last_updated(&self, user_id: &str) -> AppResult<Option<DateTime<Utc>>> {
        let updated = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            "SELECT MAX(updated_at) FROM listening_history WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(updated)
    }

    async fn replace(&self, user_id: &str, entries: &[ListeningHistoryEntry]) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM listening_history WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        let now = Utc::now();
        for (position, entry) in entries.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO listening_history (user_id, position, track_id, track_json, weight, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(user_id)
            .bind(position as i32)
            .bind(entry.track.id.as_str())
            .bind(Json(&entry.track))
            .bind(entry.weight)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

struct StoredHistory {
    entries: Vec<ListeningHistoryEntry>,
    updated_at: DateTime<Utc>,
}

/// In-process history store for tests and database-less runs
#[derive(Default)]
pub struct MemoryHistoryStore {
    users: RwLock<HashMap<String, StoredHistory>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a snapshot with an explicit timestamp
    pub fn insert_at(
        &self,
        user_id: &str,
        entries: Vec<ListeningHistoryEntry>,
        updated_at: DateTime<Utc>,
    ) -> AppResult<()> {
        let mut users = self
            .users
            .write()
            .map_err(|_| AppError::Internal("history store lock poisoned".to_string()))?;
        users.insert(
            user_id.to_string(),
            StoredHistory {
                entries,
                updated_at,
            },
        );
        Ok(())
    }
}

#[async_trait::async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn top_tracks(&self, user_id: &str, limit: usize) -> AppResult<Vec<ListeningHistoryEntry>> {
        let users = self
            .users
            .read()
            .map_err(|_| AppError::Internal("history store lock poisoned".to_string()))?;
        Ok(users
            .get(user_id)
            .map(|h| h.entries.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn last_updated(&self, user_id: &str) -> AppResult<Option<DateTime<Utc>>> {
        let users = self
            .users
            .read()
            .map_err(|_| AppError::Internal("history store lock poisoned".to_string()))?;
        Ok(users.get(user_id).map(|h| h.updated_at))
    }

    async fn replace(&self, user_id: &str, entries: &[ListeningHistoryEntry]) -> AppResult<()> {
        self.insert_at(user_id, entries.to_vec(), Utc::now())
    }
}

/// Rank-decayed weights, 1.0 for the first track down to 0.5 for the last
fn rank_weight(position: usize, total: usize) -> f64 {
    if total <= 1 {
        return 1.0;
    }
    1.0 - 0.5 * position as f64 / (total - 1) as f64
}

/// Read path and refresh cadence for listening history
#[derive(Clone)]
pub struct HistoryService {
    store: Arc<dyn HistoryStore>,
    catalog: Arc<dyn CatalogSource>,
    cache: Cache,
}

impl HistoryService {
    pub fn new(store: Arc<dyn HistoryStore>, catalog: Arc<dyn CatalogSource>, cache: Cache) -> Self {
        Self {
            store,
            catalog,
            cache,
        }
    }

    /// The user's history, empty when it cannot be read
    pub async fn history(&self, user_id: &str) -> Vec<ListeningHistoryEntry> {
        let key = CacheKey::ListeningHistory(user_id.to_string());
        if let Some(entries) = self.cache.get_from_cache::<Vec<ListeningHistoryEntry>>(&key).await {
            return entries;
        }

        match self.store.top_tracks(user_id, MAX_HISTORY_ENTRIES).await {
            Ok(entries) => {
                self.cache.set_in_background(&key, &entries);
                entries
            }
            Err(e) => {
                tracing::warn!(error = %e, user_id = %user_id, "Failed to load listening history");
                Vec::new()
            }
        }
    }

    /// Replaces the stored snapshot from the catalog when it is missing or
    /// older than six hours; returns whether a refresh happened
    pub async fn refresh_if_stale(&self, user_id: &str) -> AppResult<bool> {
        if let Some(updated) = self.store.last_updated(user_id).await? {
            if Utc::now() - updated < Duration::hours(REFRESH_AFTER_HOURS) {
                return Ok(false);
            }
        }

        let tracks = self
            .catalog
            .user_top_tracks(user_id, MAX_HISTORY_ENTRIES)
            .await?;
        let total = tracks.len();
        let entries: Vec<ListeningHistoryEntry> = tracks
            .into_iter()
            .enumerate()
            .map(|(position, track)| ListeningHistoryEntry {
                track,
                weight: rank_weight(position, total),
            })
            .collect();

        self.store.replace(user_id, &entries).await?;
        if let Err(e) = self
            .cache
            .delete(&CacheKey::ListeningHistory(user_id.to_string()))
            .await
        {
            tracing::warn!(error = %e, user_id = %user_id, "Failed to invalidate cached history");
        }

        tracing::info!(user_id = %user_id, count = entries.len(), "Refreshed listening history");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::{CacheTtls, MemoryStore},
        models::fixtures,
        services::catalog::MockCatalogSource,
    };

    fn cache() -> Cache {
        let (cache, _handle) = Cache::new(Arc::new(MemoryStore::new()), CacheTtls::default());
        cache
    }

    fn lofi(id: &str) -> Track {
        fixtures::track(id, "Lofi Girl", "lo-fi", fixtures::features(0.3, 0.5, 0.4, 0.7))
    }

    #[test]
    fn test_rank_weight_decays_linearly() {
        assert_eq!(rank_weight(0, 1), 1.0);
        assert_eq!(rank_weight(0, 3), 1.0);
        assert_eq!(rank_weight(1, 3), 0.75);
        assert_eq!(rank_weight(2, 3), 0.5);
    }

    #[tokio::test]
    async fn test_fresh_snapshot_is_not_refreshed() {
        let store = Arc::new(MemoryHistoryStore::new());
        store
            .insert_at("u1", fixtures::history(&[lofi("t1")]), Utc::now() - Duration::hours(1))
            .unwrap();

        let mut catalog = MockCatalogSource::new();
        catalog.expect_user_top_tracks().never();

        let service = HistoryService::new(store, Arc::new(catalog), cache());
        assert!(!service.refresh_if_stale("u1").await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_snapshot_is_replaced() {
        let store = Arc::new(MemoryHistoryStore::new());
        store
            .insert_at("u1", fixtures::history(&[lofi("old")]), Utc::now() - Duration::hours(7))
            .unwrap();

        let mut catalog = MockCatalogSource::new();
        catalog
            .expect_user_top_tracks()
            .times(1)
            .returning(|_, _| Ok(vec![lofi("t1"), lofi("t2")]));

        let service = HistoryService::new(store.clone(), Arc::new(catalog), cache());
        assert!(service.refresh_if_stale("u1").await.unwrap());

        let entries = store.top_tracks("u1", MAX_HISTORY_ENTRIES).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].track.id.as_str(), "t1");
        assert_eq!(entries[0].weight, 1.0);
        assert_eq!(entries[1].weight, 0.5);
    }

    #[tokio::test]
    async fn test_missing_user_token_propagates() {
        let mut catalog = MockCatalogSource::new();
        catalog
            .expect_user_top_tracks()
            .returning(|_, _| Err(AppError::NotFound("no user token".to_string())));

        let service = HistoryService::new(Arc::new(MemoryHistoryStore::new()), Arc::new(catalog), cache());
        assert!(matches!(
            service.refresh_if_stale("u1").await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_history_failure_reads_as_empty() {
        let mut store = MockHistoryStore::new();
        store
            .expect_top_tracks()
            .returning(|_, _| Err(AppError::Internal("down".to_string())));

        let service = HistoryService::new(Arc::new(store), Arc::new(MockCatalogSource::new()), cache());
        assert!(service.history("u1").await.is_empty());
    }

    #[tokio::test]
    async fn test_history_reads_from_store() {
        let store = Arc::new(MemoryHistoryStore::new());
        store
            .insert_at("u1", fixtures::history(&[lofi("t1")]), Utc::now())
            .unwrap();

        let service = HistoryService::new(store, Arc::new(MockCatalogSource::new()), cache());
        let entries = service.history("u1").await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].track.primary_genre(), "lo-fi");
    }
}
