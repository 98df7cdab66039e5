use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::reward::FeedbackKind;
use super::snapshot::LearnerSnapshot;
use super::LearningConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct Experience {
    pub q_key: String,
    pub reward: f64,
    pub genre: String,
    pub kind: FeedbackKind,
    pub timestamp: DateTime<Utc>,
}

/// Running reward statistics for one genre
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GenrePerformance {
    pub count: u64,
    pub total_reward: f64,
    pub average_reward: f64,
}

impl GenrePerformance {
    pub fn new(count: u64, total_reward: f64) -> Self {
        Self {
            count,
            total_reward,
            average_reward: if count == 0 {
                0.0
            } else {
                total_reward / count as f64
            },
        }
    }

    fn record(&mut self, reward: f64) {
        *self = Self::new(self.count + 1, self.total_reward + reward);
    }
}

/// Learning state of a single user
///
/// Guarded by one mutex per user; nothing here awaits.
pub struct UserLearner {
    q_values: HashMap<String, f64>,
    genre_performance: HashMap<String, GenrePerformance>,
    replay: VecDeque<Experience>,
    episodes: u64,
    total_reward: f64,
    epsilon: f64,
    last_update: Option<DateTime<Utc>>,
    rng: StdRng,
}

impl UserLearner {
    pub fn new(config: &LearningConfig, rng: StdRng) -> Self {
        Self {
            q_values: HashMap::new(),
            genre_performance: HashMap::new(),
            replay: VecDeque::new(),
            episodes: 0,
            total_reward: 0.0,
            epsilon: config.initial_epsilon,
            last_update: None,
            rng,
        }
    }

    /// Restores persisted values; the replay buffer always starts empty
    pub fn from_snapshot(snapshot: LearnerSnapshot, rng: StdRng) -> Self {
        Self {
            q_values: snapshot.q_values,
            genre_performance: snapshot.genre_performance,
            replay: VecDeque::new(),
            episodes: snapshot.episodes,
            total_reward: snapshot.total_reward,
            epsilon: snapshot.epsilon,
            last_update: Some(snapshot.updated_at),
            rng,
        }
    }

    pub fn snapshot(&self, user_id: &str) -> LearnerSnapshot {
        LearnerSnapshot {
            user_id: user_id.to_string(),
            q_values: self.q_values.clone(),
            genre_performance: self.genre_performance.clone(),
            episodes: self.episodes,
            total_reward: self.total_reward,
            epsilon: self.epsilon,
            updated_at: self.last_update.unwrap_or_else(Utc::now),
        }
    }

    /// Learned value, 0.0 for unseen keys
    pub fn q_value(&self, q_key: &str) -> f64 {
        self.q_values.get(q_key).copied().unwrap_or(0.0)
    }

    fn apply(&mut self, q_key: &str, reward: f64, learning_rate: f64) -> f64 {
        let current = self.q_value(q_key);
        let updated = current + learning_rate * (reward - current);
        self.q_values.insert(q_key.to_string(), updated);
        updated
    }

    pub fn genre_bonus(&self, genre: &str) -> f64 {
        self.genre_performance
            .get(genre)
            .map(|p| (p.average_reward * 0.2).clamp(-0.2, 0.2))
            .unwrap_or(0.0)
    }

    /// Runs one learning episode and returns the updated value
    pub fn observe(&mut self, experience: Experience, config: &LearningConfig) -> f64 {
        let updated = self.apply(&experience.q_key, experience.reward, config.learning_rate);

        self.genre_performance
            .entry(experience.genre.clone())
            .or_default()
            .record(experience.reward);

        self.episodes += 1;
        self.total_reward += experience.reward;
        self.last_update = Some(experience.timestamp);

        self.replay.push_back(experience);
        while self.replay.len() > config.replay_capacity {
            self.replay.pop_front();
        }

        if config.replay_every > 0
            && self.episodes % config.replay_every == 0
            && self.replay.len() >= config.replay_min
        {
            self.replay_batch(config);
        }

        updated
    }

    /// Replays a random batch, sampled without replacement, then decays ε
    fn replay_batch(&mut self, config: &LearningConfig) {
        let batch = config.replay_batch.min(self.replay.len());
        let indices = rand::seq::index::sample(&mut self.rng, self.replay.len(), batch);

        let samples: Vec<(String, f64)> = indices
            .iter()
            .filter_map(|i| self.replay.get(i).map(|e| (e.q_key.clone(), e.reward)))
            .collect();
        for (q_key, reward) in samples {
            self.apply(&q_key, reward, config.learning_rate);
        }

        self.epsilon = (self.epsilon * config.epsilon_decay).max(config.min_epsilon);
        tracing::debug!(batch, epsilon = self.epsilon, "Replayed experience batch");
    }

    /// Value of recommending under `q_key` for `genre`, with ε-greedy jitter
    pub fn recommendation_value<R: Rng + ?Sized>(&self, q_key: &str, genre: &str, rng: &mut R) -> f64 {
        let value = self.q_value(q_key) + self.genre_bonus(genre);
        if rng.gen::<f64>() < self.epsilon {
            value + rng.gen_range(-0.1..0.1)
        } else {
            value
        }
    }

    pub fn episodes(&self) -> u64 {
        self.episodes
    }

    pub fn total_reward(&self) -> f64 {
        self.total_reward
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }

    pub fn q_table_size(&self) -> usize {
        self.q_values.len()
    }

    pub fn replay_size(&self) -> usize {
        self.replay.len()
    }

    pub fn genre_performance(&self) -> &HashMap<String, GenrePerformance> {
        &self.genre_performance
    }

    pub fn q_values(&self) -> &HashMap<String, f64> {
        &self.q_values
    }
}
