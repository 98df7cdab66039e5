use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, RwLock};

use super::learner::UserLearner;

const SHARDS: usize = 16;

pub type SharedLearner = Arc<Mutex<UserLearner>>;

/// Live per-user learning state
///
/// Injected into both the feedback path and the recommendation path so
/// neither owns the state.
pub trait LearningStore: Send + Sync {
    fn get(&self, user_id: &str) -> Option<SharedLearner>;

    /// Inserts `learner` unless another caller got there first; returns the
    /// learner now stored for the user
    fn insert_if_absent(&self, user_id: &str, learner: UserLearner) -> SharedLearner;

    fn user_ids(&self) -> Vec<String>;
}

pub(crate) fn stable_hash(value: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// In-memory store sharded by user so unrelated users rarely contend
pub struct MemoryLearningStore {
    shards: Vec<RwLock<HashMap<String, SharedLearner>>>,
}

impl Default for MemoryLearningStore {
    fn default() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }
}

impl MemoryLearningStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn shard(&self, user_id: &str) -> &RwLock<HashMap<String, SharedLearner>> {
        &self.shards[(stable_hash(user_id) % SHARDS as u64) as usize]
    }
}

impl LearningStore for MemoryLearningStore {
    fn get(&self, user_id: &str) -> Option<SharedLearner> {
        let shard = match self.shard(user_id).read() {
            Ok(shard) => shard,
            Err(poisoned) => poisoned.into_inner(),
        };
        shard.get(user_id).cloned()
    }

    fn insert_if_absent(&self, user_id: &str, learner: UserLearner) -> SharedLearner {
        let mut shard = match self.shard(user_id).write() {
            Ok(shard) => shard,
            Err(poisoned) => poisoned.into_inner(),
        };
        shard
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(learner)))
            .clone()
    }

    fn user_ids(&self) -> Vec<String> {
        self.shards
            .iter()
            .flat_map(|shard| {
                let shard = match shard.read() {
                    Ok(shard) => shard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                shard.keys().cloned().collect::<Vec<_>>()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::learning::LearningConfig;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn fresh() -> UserLearner {
        UserLearner::new(&LearningConfig::default(), StdRng::seed_from_u64(0))
    }

    #[test]
    fn test_first_insert_wins() {
        let store = MemoryLearningStore::new();
        assert!(store.get("u1").is_none());

        let first = store.insert_if_absent("u1", fresh());
        let second = store.insert_if_absent("u1", fresh());
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &store.get("u1").unwrap()));
    }

    #[test]
    fn test_user_ids_span_shards() {
        let store = MemoryLearningStore::new();
        for i in 0..40 {
            store.insert_if_absent(&format!("user-{}", i), fresh());
        }
        let mut ids = store.user_ids();
        ids.sort();
        assert_eq!(ids.len(), 40);
    }
}
