use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};

use super::learner::GenrePerformance;
use crate::error::{AppError, AppResult};

/// Persisted learning state of one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnerSnapshot {
    pub user_id: String,
    /// Learned values keyed by `"{state}_{action}"`
    pub q_values: HashMap<String, f64>,
    pub genre_performance: HashMap<String, GenrePerformance>,
    pub episodes: u64,
    pub total_reward: f64,
    pub epsilon: f64,
    pub updated_at: DateTime<Utc>,
}

/// Durable home of learner snapshots
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load(&self, user_id: &str) -> AppResult<Option<LearnerSnapshot>>;

    async fn save(&self, snapshot: &LearnerSnapshot) -> AppResult<()>;
}

/// Snapshot store over the `rl_*` tables
#[derive(Clone)]
pub struct PgSnapshotStore {
    pool: PgPool,
}

impl PgSnapshotStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl SnapshotStore for PgSnapshotStore {
    async fn load(&self, user_id: &str) -> AppResult<Option<LearnerSnapshot>> {
        let Some(learner) = sqlx::query(
            r#"
            SELECT episodes, total_reward, epsilon, updated_at
            FROM rl_learners
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let q_rows = sqlx::query("SELECT state_key, value FROM rl_q_values WHERE user_id = $1")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;

        let mut q_values = HashMap::with_capacity(q_rows.len());
        for row in q_rows {
            q_values.insert(row.try_get::<String, _>("state_key")?, row.try_get::<f64, _>("value")?);
        }

        let genre_rows = sqlx::query(
            "SELECT genre, count, total_reward FROM rl_genre_performance WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut genre_performance = HashMap::with_capacity(genre_rows.len());
        for row in genre_rows {
            let count: i64 = row.try_get("count")?;
            genre_performance.insert(
                row.try_get::<String, _>("genre")?,
                GenrePerformance::new(count.max(0) as u64, row.try_get("total_reward")?),
            );
        }

        let episodes: i64 = learner.try_get("episodes")?;
        Ok(Some(LearnerSnapshot {
            user_id: user_id.to_string(),
            q_values,
            genre_performance,
            episodes: episodes.max(0) as u64,
            total_reward: learner.try_get("total_reward")?,
            epsilon: learner.try_get("epsilon")?,
            updated_at: learner.try_get("updated_at")?,
        }))
    }

    async fn save(&self, snapshot: &LearnerSnapshot) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO rl_learners (user_id, episodes, total_reward, epsilon, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id) DO UPDATE
            SET episodes = EXCLUDED.episodes,
                total_reward = EXCLUDED.total_reward,
                epsilon = EXCLUDED.epsilon,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&snapshot.user_id)
        .bind(snapshot.episodes as i64)
        .bind(snapshot.total_reward)
        .bind(snapshot.epsilon)
        .bind(snapshot.updated_at)
        .execute(&mut *tx)
        .await?;

        let (keys, values): (Vec<String>, Vec<f64>) = snapshot
            .q_values
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .unzip();
        sqlx::query(
            r#"
            INSERT INTO rl_q_values (user_id, state_key, value)
            SELECT $1, * FROM UNNEST($2::TEXT[], $3::DOUBLE PRECISION[])
            ON CONFLICT (user_id, state_key) DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(&snapshot.user_id)
        .bind(&keys)
        .bind(&values)
        .execute(&mut *tx)
        .await?;

        let mut genres = Vec::with_capacity(snapshot.genre_performance.len());
        let mut counts = Vec::with_capacity(snapshot.genre_performance.len());
        let mut totals = Vec::with_capacity(snapshot.genre_performance.len());
        for (genre, perf) in &snapshot.genre_performance {
            genres.push(genre.clone());
            counts.push(perf.count as i64);
            totals.push(perf.total_reward);
        }
        sqlx::query(
            r#"
            INSERT INTO rl_genre_performance (user_id, genre, count, total_reward)
            SELECT $1, * FROM UNNEST($2::TEXT[], $3::BIGINT[], $4::DOUBLE PRECISION[])
            ON CONFLICT (user_id, genre) DO UPDATE
            SET count = EXCLUDED.count, total_reward = EXCLUDED.total_reward
            "#,
        )
        .bind(&snapshot.user_id)
        .bind(&genres)
        .bind(&counts)
        .bind(&totals)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(
            user_id = %snapshot.user_id,
            q_values = keys.len(),
            "Saved learner snapshot"
        );
        Ok(())
    }
}

/// Process-local snapshot store for tests and database-less runs
#[derive(Default)]
pub struct MemorySnapshotStore {
    snapshots: Mutex<HashMap<String, LearnerSnapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load(&self, user_id: &str) -> AppResult<Option<LearnerSnapshot>> {
        let snapshots = self
            .snapshots
            .lock()
            .map_err(|_| AppError::Internal("snapshot store lock poisoned".to_string()))?;
        Ok(snapshots.get(user_id).cloned())
    }

    async fn save(&self, snapshot: &LearnerSnapshot) -> AppResult<()> {
        let mut snapshots = self
            .snapshots
            .lock()
            .map_err(|_| AppError::Internal("snapshot store lock poisoned".to_string()))?;
        snapshots.insert(snapshot.user_id.clone(), snapshot.clone());
        Ok(())
    }
}
