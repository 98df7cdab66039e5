/// HTTP client for a Spotify-compatible catalog API
///
/// Every request passes the rate limiter under its endpoint category and is
/// retried per the configured [`RetryPolicy`]. Responses are mapped to
/// errors the retry policy understands:
///
/// - 429 → [`AppError::QuotaExceeded`] (honoring `Retry-After`)
/// - 5xx and network failures → [`AppError::UpstreamUnavailable`]
/// - 404 → [`AppError::NotFound`]
/// - other non-success statuses → [`AppError::ExternalApi`]
///
/// Audio features and artist genres are cached per identity, search-style
/// responses per query in the API-response tier.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Utc};
use reqwest::{header::RETRY_AFTER, Client as HttpClient, StatusCode};
use serde::de::DeserializeOwned;

use crate::{
    cached,
    db::{Cache, CacheKey},
    error::{AppError, AppResult},
    models::{
        catalog::{
            ApiArtistsResponse, ApiAudioFeaturesResponse, ApiPlaylistPage,
            ApiRecommendationsResponse, ApiSearchResponse, ApiTrack, ApiTrackPage,
        },
        AudioFeatures, Track, TrackId,
    },
    services::{
        catalog::{AccessTokenProvider, CatalogSource},
        rate_limit::{EndpointCategory, RetryPolicy, UpstreamRateLimiter},
    },
};

const MAX_SEEDS: usize = 5;
const SEARCH_PAGE: usize = 50;
const FEATURES_BATCH: usize = 100;
const ARTISTS_BATCH: usize = 50;
const QUOTA_COUNTER_TTL: Duration = Duration::from_secs(172_800); // 2 days

/// Catalog endpoint and budget settings
#[derive(Debug, Clone)]
pub struct CatalogSettings {
    pub api_url: String,
    pub market: String,
    pub popular_playlist_id: String,
    pub retry: RetryPolicy,
    /// Upstream calls per day before usage warnings
    pub daily_budget: u64,
}

#[derive(Clone)]
pub struct HttpCatalogClient {
    http_client: HttpClient,
    settings: CatalogSettings,
    tokens: Arc<dyn AccessTokenProvider>,
    limiter: Arc<UpstreamRateLimiter>,
    cache: Cache,
}

impl HttpCatalogClient {
    pub fn new(
        settings: CatalogSettings,
        tokens: Arc<dyn AccessTokenProvider>,
        limiter: Arc<UpstreamRateLimiter>,
        cache: Cache,
    ) -> Self {
        Self {
            http_client: HttpClient::new(),
            settings,
            tokens,
            limiter,
            cache,
        }
    }

    /// Sends one GET and maps the response status to our error kinds
    async fn send<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
        token: &str,
    ) -> AppResult<T> {
        let response = self
            .http_client
            .get(url)
            .bearer_auth(token)
            .query(query)
            .send()
            .await
            .map_err(|e| AppError::UpstreamUnavailable(format!("catalog request failed: {}", e)))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(AppError::QuotaExceeded {
                message: format!("Catalog API returned status {}", status),
                retry_after,
            });
        }

        if status.is_server_error() {
            return Err(AppError::UpstreamUnavailable(format!(
                "Catalog API returned status {}",
                status
            )));
        }

        if status == StatusCode::NOT_FOUND {
            return Err(AppError::NotFound(format!("Catalog resource not found: {}", url)));
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::ExternalApi(format!(
                "Catalog API returned status {}: {}",
                status, body
            )));
        }

        Ok(response.json::<T>().await?)
    }

    /// Rate-limited GET against the catalog
    async fn get_json<T: DeserializeOwned>(
        &self,
        category: EndpointCategory,
        path: &str,
        query: &[(&str, String)],
        token: &str,
    ) -> AppResult<T> {
        let url = format!("{}{}", self.settings.api_url.trim_end_matches('/'), path);
        let value = self
            .limiter
            .rate_limited_call(category, &self.settings.retry, || self.send(&url, query, token))
            .await?;
        self.record_usage(category).await;
        Ok(value)
    }

    /// Counts a successful upstream call against today's budget
    async fn record_usage(&self, category: EndpointCategory) {
        let key = CacheKey::QuotaUsage(Utc::now().format("%Y-%m-%d").to_string());
        let used = match self.cache.increment_counter(&key, 1, QUOTA_COUNTER_TTL).await {
            Ok(used) => used.max(0) as u64,
            Err(e) => {
                tracing::debug!(error = %e, "Failed to record upstream usage");
                return;
            }
        };

        let budget = self.settings.daily_budget;
        let warn_at = (budget * 8).div_ceil(10);
        if budget > 0 && used == warn_at {
            tracing::warn!(used, budget, category = %category, "Upstream usage reached 80% of daily budget");
        } else if budget > 0 && used == budget {
            tracing::error!(used, budget, "Upstream daily budget exhausted");
        }
    }

    /// Audio features by track id; misses fall back to neutral features
    async fn audio_features(&self, ids: &[String], token: &str) -> HashMap<String, AudioFeatures> {
        let mut found = HashMap::with_capacity(ids.len());
        let mut missing = Vec::new();
        for id in ids {
            match self
                .cache
                .get_from_cache::<AudioFeatures>(&CacheKey::AudioFeatures(id.clone()))
                .await
            {
                Some(features) => {
                    found.insert(id.clone(), features);
                }
                None => missing.push(id.clone()),
            }
        }

        for chunk in missing.chunks(FEATURES_BATCH) {
            let response: AppResult<ApiAudioFeaturesResponse> = self
                .get_json(
                    EndpointCategory::AudioFeatures,
                    "/v1/audio-features",
                    &[("ids", chunk.join(","))],
                    token,
                )
                .await;

            match response {
                Ok(response) => {
                    for api in response.audio_features.into_iter().flatten() {
                        let features = AudioFeatures::from(&api);
                        self.cache
                            .set_in_background(&CacheKey::AudioFeatures(api.id.clone()), &features);
                        found.insert(api.id, features);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, count = chunk.len(), "Audio features unavailable, using neutral values");
                }
            }
        }

        found
    }

    /// Genres by artist id; unknown artists have no genres
    async fn artist_genres(&self, artist_ids: &[String], token: &str) -> HashMap<String, Vec<String>> {
        let mut found = HashMap::with_capacity(artist_ids.len());
        let mut missing = Vec::new();
        for id in artist_ids {
            match self
                .cache
                .get_from_cache::<Vec<String>>(&CacheKey::ArtistGenres(id.clone()))
                .await
            {
                Some(genres) => {
                    found.insert(id.clone(), genres);
                }
                None => missing.push(id.clone()),
            }
        }

        for chunk in missing.chunks(ARTISTS_BATCH) {
            let response: AppResult<ApiArtistsResponse> = self
                .get_json(
                    EndpointCategory::Artists,
                    "/v1/artists",
                    &[("ids", chunk.join(","))],
                    token,
                )
                .await;

            match response {
                Ok(response) => {
                    for artist in response.artists.into_iter().flatten() {
                        self.cache
                            .set_in_background(&CacheKey::ArtistGenres(artist.id.clone()), &artist.genres);
                        found.insert(artist.id, artist.genres);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, count = chunk.len(), "Artist genres unavailable");
                }
            }
        }

        found
    }

    /// Attaches genres and audio features to raw catalog tracks
    async fn hydrate(&self, tracks: Vec<ApiTrack>, token: &str) -> Vec<Track> {
        let ids: Vec<String> = tracks.iter().map(|t| t.id.clone()).collect();
        let mut artist_ids: Vec<String> = tracks
            .iter()
            .filter_map(|t| t.primary_artist_id().map(str::to_string))
            .collect();
        artist_ids.sort();
        artist_ids.dedup();

        let features = self.audio_features(&ids, token).await;
        let genres = self.artist_genres(&artist_ids, token).await;

        tracks
            .into_iter()
            .map(|t| {
                let track_genres = t
                    .primary_artist_id()
                    .and_then(|a| genres.get(a))
                    .cloned()
                    .unwrap_or_default();
                let track_features = features.get(&t.id).copied().unwrap_or_default();
                t.into_track(track_genres, track_features)
            })
            .collect()
    }

    /// Pages through track search results up to `limit`
    async fn search_tracks(&self, query: &str, limit: usize, token: &str) -> AppResult<Vec<ApiTrack>> {
        let mut tracks = Vec::with_capacity(limit);
        let mut offset = 0usize;

        while tracks.len() < limit {
            let page_size = (limit - tracks.len()).min(SEARCH_PAGE);
            let response: ApiSearchResponse = self
                .get_json(
                    EndpointCategory::Search,
                    "/v1/search",
                    &[
                        ("q", query.to_string()),
                        ("type", "track".to_string()),
                        ("market", self.settings.market.clone()),
                        ("limit", page_size.to_string()),
                        ("offset", offset.to_string()),
                    ],
                    token,
                )
                .await?;

            let ApiTrackPage { items } = response.tracks;
            let received = items.len();
            tracks.extend(items);
            if received < page_size {
                break;
            }
            offset += received;
        }

        Ok(tracks)
    }
}

#[async_trait::async_trait]
impl CatalogSource for HttpCatalogClient {
    async fn similar_tracks(&self, seeds: &[TrackId], limit: usize) -> AppResult<Vec<Track>> {
        let seeds: Vec<&str> = seeds.iter().take(MAX_SEEDS).map(|s| s.as_str()).collect();
        if seeds.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let seed_list = seeds.join(",");

        cached!(
            self.cache,
            CacheKey::ApiResponse(format!("recommendations:{}:{}", seed_list, limit)),
            async move {
                let token = self.tokens.app_token().await?;
                let response: ApiRecommendationsResponse = self
                    .get_json(
                        EndpointCategory::Recommendations,
                        "/v1/recommendations",
                        &[
                            ("seed_tracks", seed_list.clone()),
                            ("limit", limit.min(100).to_string()),
                            ("market", self.settings.market.clone()),
                        ],
                        &token,
                    )
                    .await?;

                tracing::debug!(seeds = %seed_list, count = response.tracks.len(), "Fetched similar tracks");
                Ok::<_, AppError>(self.hydrate(response.tracks, &token).await)
            }
        )
    }

    async fn tracks_by_genre(&self, genre: &str, limit: usize) -> AppResult<Vec<Track>> {
        if genre.trim().is_empty() {
            return Err(AppError::InvalidInput("Genre cannot be empty".to_string()));
        }

        cached!(
            self.cache,
            CacheKey::ApiResponse(format!("search:genre:{}:{}", genre, limit)),
            async move {
                let token = self.tokens.app_token().await?;
                let query = format!("genre:\"{}\"", genre);
                let found = self.search_tracks(&query, limit, &token).await?;
                Ok::<_, AppError>(self.hydrate(found, &token).await)
            }
        )
    }

    async fn new_releases(&self, limit: usize) -> AppResult<Vec<Track>> {
        let year = Utc::now().year();

        cached!(
            self.cache,
            CacheKey::ApiResponse(format!("search:year:{}:{}", year, limit)),
            async move {
                let token = self.tokens.app_token().await?;
                let found = self
                    .search_tracks(&format!("year:{}", year), limit, &token)
                    .await?;
                Ok::<_, AppError>(self.hydrate(found, &token).await)
            }
        )
    }

    async fn popular_tracks(&self, limit: usize) -> AppResult<Vec<Track>> {
        let playlist_id = self.settings.popular_playlist_id.clone();

        cached!(
            self.cache,
            CacheKey::ApiResponse(format!("playlist:{}:{}", playlist_id, limit)),
            async move {
                let token = self.tokens.app_token().await?;
                let page: ApiPlaylistPage = self
                    .get_json(
                        EndpointCategory::Playlists,
                        &format!("/v1/playlists/{}/tracks", playlist_id),
                        &[
                            ("limit", limit.min(100).to_string()),
                            ("market", self.settings.market.clone()),
                        ],
                        &token,
                    )
                    .await?;

                let found: Vec<ApiTrack> = page.items.into_iter().filter_map(|i| i.track).collect();
                Ok::<_, AppError>(self.hydrate(found, &token).await)
            }
        )
    }

    async fn track(&self, id: &TrackId) -> AppResult<Option<Track>> {
        let key = CacheKey::Track(id.to_string());
        if let Some(track) = self.cache.get_from_cache::<Track>(&key).await {
            return Ok(Some(track));
        }

        let token = self.tokens.app_token().await?;
        let api: ApiTrack = match self
            .get_json(
                EndpointCategory::Tracks,
                &format!("/v1/tracks/{}", id),
                &[("market", self.settings.market.clone())],
                &token,
            )
            .await
        {
            Ok(api) => api,
            Err(AppError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let track = self.hydrate(vec![api], &token).await.pop();
        if let Some(track) = &track {
            self.cache.set_in_background(&key, track);
        }
        Ok(track)
    }

    async fn user_top_tracks(&self, user_id: &str, limit: usize) -> AppResult<Vec<Track>> {
        let token = self.tokens.user_token(user_id).await?.ok_or_else(|| {
            AppError::NotFound(format!("No catalog credentials for user {}", user_id))
        })?;

        let page: ApiTrackPage = self
            .get_json(
                EndpointCategory::UserData,
                "/v1/me/top/tracks",
                &[
                    ("limit", limit.min(50).to_string()),
                    ("time_range", "medium_term".to_string()),
                ],
                &token,
            )
            .await?;

        tracing::info!(user_id = %user_id, count = page.items.len(), "Fetched user top tracks");
        Ok(self.hydrate(page.items, &token).await)
    }

    fn name(&self) -> &'static str {
        "catalog_http"
    }
}
