//! Candidate pool assembly
//!
//! Up to four catalog sources run concurrently under one request deadline
//! and are merged in a fixed order. A failed or timed-out source is logged
//! and contributes nothing; the pool is whatever the others produced.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{
    db::{Cache, CacheKey},
    error::{AppError, AppResult},
    models::{ListeningHistoryEntry, PersonalityProfile, Track, TrackId},
    services::{catalog::CatalogSource, cold_start::StagePolicy, scoring::trait_genres},
};

/// Pools smaller than this are logged as a quality signal
pub const MIN_POOL_SIZE: usize = 200;

const SIMILARITY_SEEDS: usize = 5;
const TOP_GENRES: usize = 3;
const DISCOVERY_LIMIT: usize = 50;
const POPULAR_MIN: usize = 50;
const POPULAR_MAX: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSourceKind {
    Similar,
    Genre,
    Discovery,
    Popular,
}

impl CandidateSourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateSourceKind::Similar => "similar",
            CandidateSourceKind::Genre => "genre",
            CandidateSourceKind::Discovery => "discovery",
            CandidateSourceKind::Popular => "popular",
        }
    }
}

/// What one source contributed before deduplication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceReport {
    pub source: CandidateSourceKind,
    pub fetched: usize,
    pub failed: bool,
}

/// Deduplicated candidates in merge order
#[derive(Debug, Clone, Default)]
pub struct CandidatePool {
    pub tracks: Vec<Track>,
    pub sources: Vec<SourceReport>,
}

impl CandidatePool {
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Appends tracks not already present; returns how many were new
    fn extend_unique(&mut self, seen: &mut HashSet<TrackId>, tracks: Vec<Track>) -> usize {
        let before = self.tracks.len();
        for track in tracks {
            if seen.insert(track.id.clone()) {
                self.tracks.push(track);
            }
        }
        self.tracks.len() - before
    }
}

/// Genres to target, strongest first
///
/// Uses weighted genre frequency over the history and falls back to the
/// genre affinities of the user's strongest traits.
pub fn top_genres(
    history: &[ListeningHistoryEntry],
    profile: &PersonalityProfile,
    count: usize,
) -> Vec<String> {
    let mut weights: HashMap<String, (f64, usize)> = HashMap::new();
    for entry in history {
        for genre in &entry.track.genres {
            let genre = genre.trim().to_lowercase();
            if genre.is_empty() {
                continue;
            }
            let next = weights.len();
            let slot = weights.entry(genre).or_insert((0.0, next));
            slot.0 += entry.weight.max(0.0);
        }
    }

    if !weights.is_empty() {
        let mut ranked: Vec<(String, f64, usize)> = weights
            .into_iter()
            .map(|(genre, (weight, first_seen))| (genre, weight, first_seen))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.2.cmp(&b.2)));
        return ranked.into_iter().take(count).map(|(g, _, _)| g).collect();
    }

    let mut genres: Vec<String> = Vec::with_capacity(count);
    for (personality_trait, _) in profile.ranked_traits() {
        for genre in trait_genres(personality_trait) {
            if genres.len() == count {
                return genres;
            }
            if !genres.iter().any(|g| g == genre) {
                genres.push(genre.to_string());
            }
        }
    }
    genres
}

#[derive(Clone)]
pub struct CandidateAggregator {
    catalog: Arc<dyn CatalogSource>,
    cache: Cache,
    deadline: Duration,
}

impl CandidateAggregator {
    pub fn new(
        catalog: Arc<dyn CatalogSource>,
        cache: Cache,
        deadline: Duration,
    ) -> Self {
        Self {
            catalog,
            cache,
            deadline,
        }
    }

    /// Deadline for a request starting now
    pub fn request_deadline(&self) -> Instant {
        Instant::now() + self.deadline
    }

    /// Builds the candidate pool for one request
    pub async fn generate_candidates(
        &self,
        user_id: &str,
        profile: &PersonalityProfile,
        history: &[ListeningHistoryEntry],
        policy: &StagePolicy,
        target_count: usize,
    ) -> CandidatePool {
        self.generate_candidates_until(
            self.request_deadline(),
            user_id,
            profile,
            history,
            policy,
            target_count,
        )
        .await
    }

    /// Builds the candidate pool, abandoning sources still running at `deadline`
    pub async fn generate_candidates_until(
        &self,
        deadline: Instant,
        user_id: &str,
        profile: &PersonalityProfile,
        history: &[ListeningHistoryEntry],
        policy: &StagePolicy,
        target_count: usize,
    ) -> CandidatePool {
        let genres = top_genres(history, profile, TOP_GENRES);

        let similar = async {
            if !policy.use_history_source || history.is_empty() {
                return None;
            }
            let seeds: Vec<TrackId> = history
                .iter()
                .take(SIMILARITY_SEEDS)
                .map(|e| e.track.id.clone())
                .collect();
            let limit = (target_count / 3).min(100);
            Some(
                bounded(deadline, user_id, CandidateSourceKind::Similar, async {
                    self.catalog.similar_tracks(&seeds, limit).await
                })
                .await,
            )
        };

        let by_genre = async {
            let limit = (target_count / 6).min(50);
            let mut tracks = Vec::new();
            for genre in &genres {
                tracks.extend(self.catalog.tracks_by_genre(genre, limit).await?);
            }
            Ok::<_, AppError>(tracks)
        };
        let by_genre = bounded(deadline, user_id, CandidateSourceKind::Genre, by_genre);

        let discovery = bounded(deadline, user_id, CandidateSourceKind::Discovery, async {
            self.catalog.new_releases(DISCOVERY_LIMIT).await
        });

        let (similar, by_genre, discovery) = tokio::join!(similar, by_genre, discovery);

        let mut pool = CandidatePool::default();
        let mut seen = HashSet::new();
        let mut gathered = 0;
        for outcome in [similar, Some(by_genre), Some(discovery)].into_iter().flatten() {
            gathered += outcome.tracks.len();
            pool.extend_unique(&mut seen, outcome.tracks);
            pool.sources.push(outcome.report);
        }

        if policy.force_popular_fallback || gathered < target_count / 2 {
            let limit = target_count
                .saturating_sub(gathered)
                .max(POPULAR_MIN)
                .min(POPULAR_MAX);
            let outcome = bounded(deadline, user_id, CandidateSourceKind::Popular, async {
                self.catalog.popular_tracks(limit).await
            })
            .await;
            pool.extend_unique(&mut seen, outcome.tracks);
            pool.sources.push(outcome.report);
        }

        for track in &pool.tracks {
            self.cache
                .set_in_background(&CacheKey::Track(track.id.to_string()), track);
        }

        if pool.len() < MIN_POOL_SIZE {
            tracing::warn!(
                user_id = %user_id,
                count = pool.len(),
                minimum = MIN_POOL_SIZE,
                "Candidate pool below preferred size"
            );
        } else {
            tracing::debug!(user_id = %user_id, count = pool.len(), "Generated candidate pool");
        }

        pool
    }
}

struct SourceOutcome {
    tracks: Vec<Track>,
    report: SourceReport,
}

/// Runs a source until the shared deadline, swallowing its failure
async fn bounded<F>(deadline: Instant, user_id: &str, source: CandidateSourceKind, fut: F) -> SourceOutcome
where
    F: Future<Output = AppResult<Vec<Track>>>,
{
    let (tracks, failed) = match tokio::time::timeout_at(deadline, fut).await {
        Ok(Ok(tracks)) => (tracks, false),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, user_id = %user_id, source = source.as_str(), "Candidate source failed");
            (Vec::new(), true)
        }
        Err(_) => {
            tracing::warn!(user_id = %user_id, source = source.as_str(), "Candidate source timed out");
            (Vec::new(), true)
        }
    };

    SourceOutcome {
        report: SourceReport {
            source,
            fetched: tracks.len(),
            failed,
        },
        tracks,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::{CacheTtls, MemoryStore},
        models::{fixtures, PersonalityTrait},
        services::{catalog::MockCatalogSource, cold_start::stage_for_age},
    };

    fn cache() -> Cache {
        let (cache, _handle) = Cache::new(Arc::new(MemoryStore::new()), CacheTtls::default());
        cache
    }

    fn tracks(prefix: &str, n: usize) -> Vec<Track> {
        (0..n)
            .map(|i| {
                fixtures::track(
                    &format!("{}{}", prefix, i),
                    &format!("{} artist {}", prefix, i % 7),
                    "pop",
                    fixtures::features(0.5, 0.5, 0.5, 0.5),
                )
            })
            .collect()
    }

    #[test]
    fn test_top_genres_weighted_by_history() {
        let history = vec![
            ListeningHistoryEntry {
                track: fixtures::track("a", "x", "jazz", fixtures::features(0.5, 0.5, 0.5, 0.5)),
                weight: 1.0,
            },
            ListeningHistoryEntry {
                track: fixtures::track("b", "y", "rock", fixtures::features(0.5, 0.5, 0.5, 0.5)),
                weight: 0.6,
            },
            ListeningHistoryEntry {
                track: fixtures::track("c", "z", "rock", fixtures::features(0.5, 0.5, 0.5, 0.5)),
                weight: 0.6,
            },
        ];

        let genres = top_genres(&history, &PersonalityProfile::default(), 3);
        assert_eq!(genres, vec!["rock".to_string(), "jazz".to_string()]);
    }

    #[test]
    fn test_top_genres_fall_back_to_traits() {
        let profile = PersonalityProfile {
            extraversion: 0.9,
            ..PersonalityProfile::default()
        };
        let genres = top_genres(&[], &profile, 3);
        let expected: Vec<String> = trait_genres(PersonalityTrait::Extraversion)
            .iter()
            .take(3)
            .map(|g| g.to_string())
            .collect();
        assert_eq!(genres, expected);
    }

    #[tokio::test]
    async fn test_merge_deduplicates_first_wins() {
        let mut catalog = MockCatalogSource::new();
        catalog
            .expect_similar_tracks()
            .returning(|_, _| Ok(tracks("s", 100)));
        // genre source overlaps with similar
        catalog
            .expect_tracks_by_genre()
            .returning(|_, _| Ok(tracks("s", 50)));
        catalog
            .expect_new_releases()
            .returning(|_| Ok(tracks("d", 50)));
        catalog.expect_popular_tracks().never();

        let aggregator = CandidateAggregator::new(Arc::new(catalog), cache(), Duration::from_secs(5));
        let history = fixtures::history(&tracks("h", 5));
        let policy = stage_for_age(Some(60));

        let pool = aggregator
            .generate_candidates("u1", &PersonalityProfile::default(), &history, &policy, 300)
            .await;

        assert_eq!(pool.len(), 150);
        let unique: HashSet<&TrackId> = pool.tracks.iter().map(|t| &t.id).collect();
        assert_eq!(unique.len(), pool.len());
        assert_eq!(pool.tracks[0].id.as_str(), "s0");
        assert_eq!(pool.tracks[100].id.as_str(), "d0");
    }

    #[tokio::test]
    async fn test_week_one_skips_history_and_adds_popular() {
        let mut catalog = MockCatalogSource::new();
        catalog.expect_similar_tracks().never();
        catalog
            .expect_tracks_by_genre()
            .returning(|_, _| Ok(Vec::new()));
        catalog
            .expect_new_releases()
            .returning(|_| Ok(tracks("d", 10)));
        catalog
            .expect_popular_tracks()
            .withf(|limit| *limit == 100)
            .times(1)
            .returning(|limit| Ok(tracks("p", limit)));

        let aggregator = CandidateAggregator::new(Arc::new(catalog), cache(), Duration::from_secs(5));
        let history = fixtures::history(&tracks("h", 5));
        let policy = stage_for_age(Some(2));

        let pool = aggregator
            .generate_candidates("u1", &PersonalityProfile::default(), &history, &policy, 300)
            .await;

        assert_eq!(pool.len(), 110);
        assert!(pool
            .sources
            .iter()
            .any(|s| s.source == CandidateSourceKind::Popular && s.fetched == 100));
    }

    #[tokio::test]
    async fn test_failed_source_contributes_nothing() {
        let mut catalog = MockCatalogSource::new();
        catalog
            .expect_tracks_by_genre()
            .returning(|_, _| Err(AppError::UpstreamUnavailable("down".to_string())));
        catalog
            .expect_new_releases()
            .returning(|_| Ok(tracks("d", 50)));
        catalog
            .expect_popular_tracks()
            .returning(|limit| Ok(tracks("p", limit)));

        let aggregator = CandidateAggregator::new(Arc::new(catalog), cache(), Duration::from_secs(5));
        let policy = stage_for_age(None);

        let pool = aggregator
            .generate_candidates("u1", &PersonalityProfile::default(), &[], &policy, 300)
            .await;

        let genre = pool
            .sources
            .iter()
            .find(|s| s.source == CandidateSourceKind::Genre)
            .unwrap();
        assert!(genre.failed);
        assert_eq!(pool.len(), 150);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_source_is_cut_at_deadline() {
        struct SlowDiscovery;

        #[async_trait::async_trait]
        impl CatalogSource for SlowDiscovery {
            async fn similar_tracks(&self, _: &[TrackId], _: usize) -> AppResult<Vec<Track>> {
                Ok(Vec::new())
            }
            async fn tracks_by_genre(&self, _: &str, _: usize) -> AppResult<Vec<Track>> {
                Ok(tracks("g", 10))
            }
            async fn new_releases(&self, _: usize) -> AppResult<Vec<Track>> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(tracks("d", 50))
            }
            async fn popular_tracks(&self, _: usize) -> AppResult<Vec<Track>> {
                Ok(Vec::new())
            }
            async fn track(&self, _: &TrackId) -> AppResult<Option<Track>> {
                Ok(None)
            }
            async fn user_top_tracks(&self, _: &str, _: usize) -> AppResult<Vec<Track>> {
                Ok(Vec::new())
            }
            fn name(&self) -> &'static str {
                "slow"
            }
        }

        let aggregator = CandidateAggregator::new(Arc::new(SlowDiscovery), cache(), Duration::from_secs(1));
        let pool = aggregator
            .generate_candidates("u1", &PersonalityProfile::default(), &[], &stage_for_age(None), 300)
            .await;

        let discovery = pool
            .sources
            .iter()
            .find(|s| s.source == CandidateSourceKind::Discovery)
            .unwrap();
        assert!(discovery.failed);
        assert!(pool.tracks.iter().all(|t| !t.id.as_str().starts_with('d')));
    }
}
