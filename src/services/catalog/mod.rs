/// Upstream music catalog abstraction
///
/// Candidate sources, track lookups and listening-history snapshots all come
/// from the catalog. The HTTP implementation gates every upstream request
/// through the rate limiter; tests substitute a mock or an in-memory fake.
use std::collections::HashMap;

use crate::{
    error::{AppError, AppResult},
    models::{Track, TrackId},
};

pub mod http;

pub use http::{CatalogSettings, HttpCatalogClient};

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait CatalogSource: Send + Sync {
    /// Tracks similar to the given seeds (at most five are used)
    async fn similar_tracks(&self, seeds: &[TrackId], limit: usize) -> AppResult<Vec<Track>>;

    async fn tracks_by_genre(&self, genre: &str, limit: usize) -> AppResult<Vec<Track>>;

    /// Recent releases for discovery
    async fn new_releases(&self, limit: usize) -> AppResult<Vec<Track>>;

    /// Broadly popular tracks for users we know little about
    async fn popular_tracks(&self, limit: usize) -> AppResult<Vec<Track>>;

    /// A single track, `None` when the catalog does not know it
    async fn track(&self, id: &TrackId) -> AppResult<Option<Track>>;

    /// The user's most-played tracks, most preferred first
    async fn user_top_tracks(&self, user_id: &str, limit: usize) -> AppResult<Vec<Track>>;

    /// Source name for logging
    fn name(&self) -> &'static str;
}

/// Supplies catalog credentials; acquisition and refresh happen elsewhere
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait AccessTokenProvider: Send + Sync {
    /// Application-level token for public catalog data
    async fn app_token(&self) -> AppResult<String>;

    /// Token acting on behalf of a user, `None` when the user never connected
    async fn user_token(&self, user_id: &str) -> AppResult<Option<String>>;
}

/// Token provider backed by fixed configuration
#[derive(Debug, Clone, Default)]
pub struct StaticTokenProvider {
    app_token: String,
    user_tokens: HashMap<String, String>,
}

impl StaticTokenProvider {
    pub fn new(app_token: impl Into<String>) -> Self {
        Self {
            app_token: app_token.into(),
            user_tokens: HashMap::new(),
        }
    }

    pub fn with_user_token(mut self, user_id: impl Into<String>, token: impl Into<String>) -> Self {
        self.user_tokens.insert(user_id.into(), token.into());
        self
    }
}

#[async_trait::async_trait]
impl AccessTokenProvider for StaticTokenProvider {
    async fn app_token(&self) -> AppResult<String> {
        if self.app_token.is_empty() {
            return Err(AppError::ExternalApi(
                "No catalog access token configured".to_string(),
            ));
        }
        Ok(self.app_token.clone())
    }

    async fn user_token(&self, user_id: &str) -> AppResult<Option<String>> {
        Ok(self.user_tokens.get(user_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_err;

    #[tokio::test]
    async fn test_static_provider_tokens() {
        let provider = StaticTokenProvider::new("app").with_user_token("u1", "user-token");
        assert_eq!(provider.app_token().await.unwrap(), "app");
        assert_eq!(provider.user_token("u1").await.unwrap().as_deref(), Some("user-token"));
        assert_eq!(provider.user_token("u2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_app_token_is_an_error() {
        let provider = StaticTokenProvider::default();
        assert_err!(provider.app_token().await);
    }
}
