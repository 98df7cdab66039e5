use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use crate::{
    error::{AppError, AppResult},
    models::{PersonalityProfile, UserProfile},
};

/// Source of personality profiles and account ages
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait ProfileStore: Send + Sync {
    /// `None` when the user has no stored profile
    async fn profile(&self, user_id: &str) -> AppResult<Option<UserProfile>>;
}

#[derive(Clone)]
pub struct PgProfileStore {
    pool: PgPool,
}

impl PgProfileStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ProfileStore for PgProfileStore {
    async fn profile(&self, user_id: &str) -> AppResult<Option<UserProfile>> {
        let row = sqlx::query(
            r#"
            SELECT openness, conscientiousness, extraversion, agreeableness, neuroticism,
                   account_created_at
            FROM personality_profiles
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(UserProfile {
            personality: PersonalityProfile {
                openness: row.try_get("openness")?,
                conscientiousness: row.try_get("conscientiousness")?,
                extraversion: row.try_get("extraversion")?,
                agreeableness: row.try_get("agreeableness")?,
                neuroticism: row.try_get("neuroticism")?,
            },
            account_created_at: row.try_get::<Option<DateTime<Utc>>, _>("account_created_at")?,
        }))
    }
}

/// In-process profile store for tests and database-less runs
#[derive(Default)]
pub struct MemoryProfileStore {
    profiles: RwLock<HashMap<String, UserProfile>>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, user_id: &str, profile: UserProfile) -> AppResult<()> {
        let mut profiles = self
            .profiles
            .write()
            .map_err(|_| AppError::Internal("profile store lock poisoned".to_string()))?;
        profiles.insert(user_id.to_string(), profile);
        Ok(())
    }
}

#[async_trait::async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn profile(&self, user_id: &str) -> AppResult<Option<UserProfile>> {
        let profiles = self
            .profiles
            .read()
            .map_err(|_| AppError::Internal("profile store lock poisoned".to_string()))?;
        Ok(profiles.get(user_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_memory_profiles() {
        let store = MemoryProfileStore::new();
        assert!(store.profile("u1").await.unwrap().is_none());

        let profile = UserProfile {
            personality: PersonalityProfile {
                openness: 0.8,
                ..PersonalityProfile::default()
            },
            account_created_at: Some(Utc::now()),
        };
        assert_ok!(store.upsert("u1", profile.clone()));

        let stored = assert_ok!(store.profile("u1").await).unwrap();
        assert_eq!(stored.personality, profile.personality);
        assert_eq!(stored.account_created_at, profile.account_created_at);
    }
}
