#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum_test::TestServer;
use chrono::{Duration, Utc};

use cadence_api::{
    app::{self, BackgroundTasks, Persistence},
    create_router,
    db::MemoryStore,
    error::{AppError, AppResult},
    models::{AudioFeatures, PersonalityProfile, Track, TrackId, UserProfile},
    services::{catalog::CatalogSource, history::MemoryHistoryStore, profiles::MemoryProfileStore},
    AppState, Config,
};

const GENRES: [&str; 6] = ["pop", "indie", "jazz", "electronic", "folk", "hip-hop"];

/// Deterministic track with features spread over the unit cube
pub fn track(id: &str, index: usize, genre: &str) -> Track {
    let f = |salt: usize| ((index * 37 + salt * 11) % 100) as f64 / 100.0;
    Track {
        id: TrackId::new(id),
        name: format!("Track {}", id),
        artist: format!("Artist {}", index % 23),
        genres: vec![genre.to_string()],
        popularity: Some(((index * 7) % 100) as u8),
        features: AudioFeatures {
            energy: f(1),
            valence: f(2),
            danceability: f(3),
            acousticness: f(4),
            instrumentalness: f(5),
            tempo: f(6),
            speechiness: f(7) / 4.0,
        },
    }
}

pub fn tracks(prefix: &str, count: usize) -> Vec<Track> {
    (0..count)
        .map(|i| track(&format!("{}-{}", prefix, i), i, GENRES[i % GENRES.len()]))
        .collect()
}

/// In-process catalog that records which sources were called
#[derive(Default)]
pub struct FakeCatalog {
    calls: Mutex<HashMap<&'static str, usize>>,
    known: Mutex<HashMap<TrackId, Track>>,
    top_tracks: Mutex<HashMap<String, Vec<Track>>>,
    failing: Mutex<Vec<&'static str>>,
}

impl FakeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self, source: &str) -> usize {
        self.calls.lock().unwrap().get(source).copied().unwrap_or(0)
    }

    pub fn add_track(&self, track: Track) {
        self.known.lock().unwrap().insert(track.id.clone(), track);
    }

    pub fn set_top_tracks(&self, user_id: &str, tracks: Vec<Track>) {
        self.top_tracks
            .lock()
            .unwrap()
            .insert(user_id.to_string(), tracks);
    }

    pub fn fail(&self, source: &'static str) {
        self.failing.lock().unwrap().push(source);
    }

    fn serve(&self, source: &'static str, tracks: Vec<Track>) -> AppResult<Vec<Track>> {
        *self.calls.lock().unwrap().entry(source).or_insert(0) += 1;
        if self.failing.lock().unwrap().contains(&source) {
            return Err(AppError::UpstreamUnavailable(format!("{} is down", source)));
        }
        let mut known = self.known.lock().unwrap();
        for track in &tracks {
            known.insert(track.id.clone(), track.clone());
        }
        Ok(tracks)
    }
}

#[async_trait::async_trait]
impl CatalogSource for FakeCatalog {
    async fn similar_tracks(&self, seeds: &[TrackId], limit: usize) -> AppResult<Vec<Track>> {
        let prefix = format!("similar-{}", seeds.first().map(|s| s.as_str()).unwrap_or("none"));
        self.serve("similar", tracks(&prefix, limit))
    }

    async fn tracks_by_genre(&self, genre: &str, limit: usize) -> AppResult<Vec<Track>> {
        let found = (0..limit)
            .map(|i| track(&format!("genre-{}-{}", genre, i), i + 3, genre))
            .collect();
        self.serve("genre", found)
    }

    async fn new_releases(&self, limit: usize) -> AppResult<Vec<Track>> {
        self.serve("discovery", tracks("new", limit))
    }

    async fn popular_tracks(&self, limit: usize) -> AppResult<Vec<Track>> {
        self.serve("popular", tracks("popular", limit))
    }

    async fn track(&self, id: &TrackId) -> AppResult<Option<Track>> {
        *self.calls.lock().unwrap().entry("track").or_insert(0) += 1;
        Ok(self.known.lock().unwrap().get(id).cloned())
    }

    async fn user_top_tracks(&self, user_id: &str, _limit: usize) -> AppResult<Vec<Track>> {
        *self.calls.lock().unwrap().entry("top_tracks").or_insert(0) += 1;
        self.top_tracks
            .lock()
            .unwrap()
            .get(user_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("no credentials for {}", user_id)))
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

/// Configuration from the given overrides on top of defaults
pub fn config(overrides: &[(&str, &str)]) -> Config {
    let mut vars: Vec<(String, String)> = vec![("RANDOM_SEED".to_string(), "7".to_string())];
    vars.extend(overrides.iter().map(|(k, v)| (k.to_string(), v.to_string())));
    envy::from_iter(vars).unwrap()
}

pub fn profile_created_days_ago(days: i64, personality: PersonalityProfile) -> UserProfile {
    UserProfile {
        personality,
        account_created_at: Some(Utc::now() - Duration::days(days)),
    }
}

pub struct TestApp {
    pub server: TestServer,
    pub state: AppState,
    pub catalog: Arc<FakeCatalog>,
    pub profiles: Arc<MemoryProfileStore>,
    pub history: Arc<MemoryHistoryStore>,
    pub background: BackgroundTasks,
}

pub fn spawn_app(config: Config) -> TestApp {
    let catalog = Arc::new(FakeCatalog::new());
    let profiles = Arc::new(MemoryProfileStore::new());
    let history = Arc::new(MemoryHistoryStore::new());

    let persistence = Persistence::with_stores(profiles.clone(), history.clone());
    let fake: Arc<dyn CatalogSource> = catalog.clone();
    let (state, background) = app::build(
        &config,
        Arc::new(MemoryStore::new()),
        persistence,
        move |_, _| fake,
    );

    let server = TestServer::new(create_router(state.clone())).unwrap();
    TestApp {
        server,
        state,
        catalog,
        profiles,
        history,
        background,
    }
}
