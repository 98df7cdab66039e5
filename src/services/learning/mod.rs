//! Online Q-learning over discretized (personality, track) states
//!
//! Each feedback event is one episode: the state is discretized, the reward
//! shaped from the feedback kind and context, and the value for
//! recommending in that state moved toward the reward. Every
//! `replay_every` episodes a random batch of past experiences is replayed
//! and the exploration rate decays.

use std::collections::BTreeMap;
use std::sync::{Arc, MutexGuard};

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::error::{AppError, AppResult};
use crate::models::{PersonalityProfile, Track};

pub mod learner;
pub mod reward;
pub mod snapshot;
pub mod state;
pub mod store;

pub use learner::{Experience, GenrePerformance, UserLearner};
pub use reward::{compute_reward, FeedbackContext, FeedbackKind};
pub use snapshot::{LearnerSnapshot, MemorySnapshotStore, PgSnapshotStore, SnapshotStore};
pub use store::{LearningStore, MemoryLearningStore, SharedLearner};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LearningConfig {
    pub learning_rate: f64,
    pub initial_epsilon: f64,
    pub epsilon_decay: f64,
    pub min_epsilon: f64,
    pub replay_capacity: usize,
    pub replay_every: u64,
    pub replay_min: usize,
    pub replay_batch: usize,
    /// Episodes between background snapshot saves
    pub persist_every: u64,
    /// Seed for per-user replay sampling; entropy when unset
    pub seed: Option<u64>,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            initial_epsilon: 0.1,
            epsilon_decay: 0.995,
            min_epsilon: 0.01,
            replay_capacity: 10_000,
            replay_every: 10,
            replay_min: 16,
            replay_batch: 32,
            persist_every: 10,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FeedbackOutcome {
    pub reward: f64,
    pub q_value: f64,
    pub episodes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenreInsight {
    pub genre: String,
    pub average_reward: f64,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LearningStats {
    pub user_id: String,
    pub episodes: u64,
    pub total_reward: f64,
    pub average_reward: f64,
    pub epsilon: f64,
    pub learning_rate: f64,
    pub q_table_size: usize,
    pub replay_size: usize,
    pub last_update: Option<DateTime<Utc>>,
    pub genre_performance: BTreeMap<String, GenrePerformance>,
    pub best_genres: Vec<GenreInsight>,
    pub worst_genres: Vec<GenreInsight>,
}

fn lock(learner: &SharedLearner) -> MutexGuard<'_, UserLearner> {
    match learner.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Learning engine shared by the feedback worker and the read path
#[derive(Clone)]
pub struct LearningEngine {
    config: LearningConfig,
    store: Arc<dyn LearningStore>,
    snapshots: Arc<dyn SnapshotStore>,
}

impl LearningEngine {
    pub fn new(
        config: LearningConfig,
        store: Arc<dyn LearningStore>,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> Self {
        Self {
            config,
            store,
            snapshots,
        }
    }

    pub fn config(&self) -> &LearningConfig {
        &self.config
    }

    fn rng_for(&self, user_id: &str) -> StdRng {
        match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed ^ store::stable_hash(user_id)),
            None => StdRng::from_entropy(),
        }
    }

    /// Returns the user's learner, loading its snapshot on first use
    ///
    /// An unreadable snapshot is logged and the user starts cold.
    pub async fn learner(&self, user_id: &str) -> SharedLearner {
        if let Some(learner) = self.store.get(user_id) {
            return learner;
        }

        let learner = match self.snapshots.load(user_id).await {
            Ok(Some(snapshot)) => {
                tracing::debug!(user_id = %user_id, episodes = snapshot.episodes, "Loaded learner snapshot");
                UserLearner::from_snapshot(snapshot, self.rng_for(user_id))
            }
            Ok(None) => UserLearner::new(&self.config, self.rng_for(user_id)),
            Err(e) => {
                tracing::warn!(error = %e, user_id = %user_id, "Unreadable learner snapshot, starting cold");
                UserLearner::new(&self.config, self.rng_for(user_id))
            }
        };

        self.store.insert_if_absent(user_id, learner)
    }

    /// Runs one learning episode for a feedback event
    pub async fn process_feedback(
        &self,
        user_id: &str,
        profile: &PersonalityProfile,
        track: &Track,
        kind: FeedbackKind,
        context: &FeedbackContext,
    ) -> FeedbackOutcome {
        let learner = self.learner(user_id).await;
        let reward = compute_reward(kind, context);
        let key = state::q_key(&state::discretize(profile, track), state::RECOMMEND_ACTION);

        let (q_value, episodes, snapshot) = {
            let mut guard = lock(&learner);
            let q_value = guard.observe(
                Experience {
                    q_key: key,
                    reward,
                    genre: track.primary_genre().to_string(),
                    kind,
                    timestamp: Utc::now(),
                },
                &self.config,
            );
            let episodes = guard.episodes();
            let due = self.config.persist_every > 0 && episodes % self.config.persist_every == 0;
            (q_value, episodes, due.then(|| guard.snapshot(user_id)))
        };

        if let Some(snapshot) = snapshot {
            let snapshots = self.snapshots.clone();
            tokio::spawn(async move {
                if let Err(e) = snapshots.save(&snapshot).await {
                    tracing::error!(error = %e, user_id = %snapshot.user_id, "Failed to save learner snapshot");
                }
            });
        }

        tracing::info!(
            user_id = %user_id,
            feedback = kind.as_str(),
            genre = %track.primary_genre(),
            reward,
            q_value,
            "Processed feedback"
        );

        FeedbackOutcome {
            reward,
            q_value,
            episodes,
        }
    }

    /// Learned value for recommending each track, aligned with `tracks`
    pub async fn recommendation_values<R: Rng + ?Sized>(
        &self,
        user_id: &str,
        profile: &PersonalityProfile,
        tracks: &[Track],
        rng: &mut R,
    ) -> Vec<f64> {
        let learner = self.learner(user_id).await;
        let guard = lock(&learner);
        tracks
            .iter()
            .map(|track| {
                let key = state::q_key(&state::discretize(profile, track), state::RECOMMEND_ACTION);
                guard.recommendation_value(&key, track.primary_genre(), rng)
            })
            .collect()
    }

    pub async fn genre_bonus(&self, user_id: &str, genre: &str) -> f64 {
        let learner = self.learner(user_id).await;
        let bonus = lock(&learner).genre_bonus(genre);
        bonus
    }

    pub async fn stats(&self, user_id: &str) -> LearningStats {
        let learner = self.learner(user_id).await;
        let guard = lock(&learner);

        let genre_performance: BTreeMap<String, GenrePerformance> = guard
            .genre_performance()
            .iter()
            .map(|(g, p)| (g.clone(), *p))
            .collect();

        let mut ranked: Vec<GenreInsight> = genre_performance
            .iter()
            .map(|(genre, p)| GenreInsight {
                genre: genre.clone(),
                average_reward: p.average_reward,
                count: p.count,
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.average_reward
                .total_cmp(&a.average_reward)
                .then_with(|| a.genre.cmp(&b.genre))
        });
        let best_genres = ranked.iter().take(5).cloned().collect();
        let worst_genres = ranked.iter().rev().take(3).cloned().collect();

        let episodes = guard.episodes();
        LearningStats {
            user_id: user_id.to_string(),
            episodes,
            total_reward: guard.total_reward(),
            average_reward: guard.total_reward() / episodes.max(1) as f64,
            epsilon: guard.epsilon(),
            learning_rate: self.config.learning_rate,
            q_table_size: guard.q_table_size(),
            replay_size: guard.replay_size(),
            last_update: guard.last_update(),
            genre_performance,
            best_genres,
            worst_genres,
        }
    }

    /// Saves the user's snapshot now
    pub async fn persist(&self, user_id: &str) -> AppResult<()> {
        let learner = self.store.get(user_id).ok_or_else(|| {
            AppError::NotFound(format!("no learning state for user {}", user_id))
        })?;
        let snapshot = lock(&learner).snapshot(user_id);
        self.snapshots.save(&snapshot).await
    }

    /// Saves every live learner; returns how many were saved
    pub async fn persist_all(&self) -> usize {
        let mut saved = 0;
        for user_id in self.store.user_ids() {
            match self.persist(&user_id).await {
                Ok(()) => saved += 1,
                Err(e) => {
                    tracing::error!(error = %e, user_id = %user_id, "Failed to persist learning state")
                }
            }
        }
        tracing::info!(saved, "Persisted learning state");
        saved
    }
}
