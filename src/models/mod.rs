use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;

pub mod catalog;

/// Neutral value used for any audio feature or trait we could not read
pub const NEUTRAL: f64 = 0.5;

/// Upstream identity of a track
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(pub String);

impl TrackId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Normalizes a tempo in BPM onto [0, 1] over the 40–200 BPM range
pub fn normalize_tempo(bpm: f64) -> f64 {
    ((bpm - 40.0) / 160.0).clamp(0.0, 1.0)
}

fn unit(value: Option<f64>) -> f64 {
    match value {
        Some(v) if v.is_finite() => v.clamp(0.0, 1.0),
        _ => NEUTRAL,
    }
}

/// Audio features, every component in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AudioFeatures {
    pub energy: f64,
    pub valence: f64,
    pub danceability: f64,
    pub acousticness: f64,
    pub instrumentalness: f64,
    /// Tempo already normalized with [`normalize_tempo`]
    pub tempo: f64,
    pub speechiness: f64,
}

impl Default for AudioFeatures {
    fn default() -> Self {
        Self {
            energy: NEUTRAL,
            valence: NEUTRAL,
            danceability: NEUTRAL,
            acousticness: NEUTRAL,
            instrumentalness: NEUTRAL,
            tempo: NEUTRAL,
            speechiness: NEUTRAL,
        }
    }
}

/// Feature values as reported upstream, any of which may be missing
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PartialFeatures {
    pub energy: Option<f64>,
    pub valence: Option<f64>,
    pub danceability: Option<f64>,
    pub acousticness: Option<f64>,
    pub instrumentalness: Option<f64>,
    /// Raw tempo in BPM
    pub tempo_bpm: Option<f64>,
    pub speechiness: Option<f64>,
}

impl From<PartialFeatures> for AudioFeatures {
    /// Missing or non-finite values fall back to the neutral midpoint
    fn from(raw: PartialFeatures) -> Self {
        Self {
            energy: unit(raw.energy),
            valence: unit(raw.valence),
            danceability: unit(raw.danceability),
            acousticness: unit(raw.acousticness),
            instrumentalness: unit(raw.instrumentalness),
            tempo: raw
                .tempo_bpm
                .filter(|bpm| bpm.is_finite() && *bpm > 0.0)
                .map(normalize_tempo)
                .unwrap_or(NEUTRAL),
            speechiness: unit(raw.speechiness),
        }
    }
}

impl AudioFeatures {
    pub fn as_vector(&self) -> [f64; 7] {
        [
            self.danceability,
            self.energy,
            self.valence,
            self.tempo,
            self.acousticness,
            self.instrumentalness,
            self.speechiness,
        ]
    }

    /// Tempo mapped back to BPM
    pub fn tempo_bpm(&self) -> f64 {
        40.0 + self.tempo * 160.0
    }

    /// Cosine similarity of the two feature vectors; zero vectors score 0
    pub fn cosine_similarity(&self, other: &AudioFeatures) -> f64 {
        let a = self.as_vector();
        let b = other.as_vector();
        let dot: f64 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        let norm_a = a.iter().map(|x| x * x).sum::<f64>().sqrt();
        let norm_b = b.iter().map(|x| x * x).sum::<f64>().sqrt();
        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }
        (dot / (norm_a * norm_b)).clamp(0.0, 1.0)
    }
}

/// Catalog track with its audio features; immutable once fetched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: TrackId,
    pub name: String,
    pub artist: String,
    #[serde(default)]
    pub genres: Vec<String>,
    /// Upstream popularity in 0–100
    #[serde(default)]
    pub popularity: Option<u8>,
    #[serde(default)]
    pub features: AudioFeatures,
}

impl Track {
    /// Genre tag used for learning state and genre performance
    pub fn primary_genre(&self) -> &str {
        self.genres
            .first()
            .map(|g| g.as_str())
            .filter(|g| !g.trim().is_empty())
            .unwrap_or("unknown")
    }

    /// Lowercased genres joined for substring matching
    pub fn genre_text(&self) -> String {
        self.genres.join(" ").to_lowercase()
    }

    pub fn same_artist(&self, other: &Track) -> bool {
        self.artist.eq_ignore_ascii_case(&other.artist)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersonalityTrait {
    Openness,
    Conscientiousness,
    Extraversion,
    Agreeableness,
    Neuroticism,
}

impl PersonalityTrait {
    pub const ALL: [PersonalityTrait; 5] = [
        PersonalityTrait::Openness,
        PersonalityTrait::Conscientiousness,
        PersonalityTrait::Extraversion,
        PersonalityTrait::Agreeableness,
        PersonalityTrait::Neuroticism,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PersonalityTrait::Openness => "openness",
            PersonalityTrait::Conscientiousness => "conscientiousness",
            PersonalityTrait::Extraversion => "extraversion",
            PersonalityTrait::Agreeableness => "agreeableness",
            PersonalityTrait::Neuroticism => "neuroticism",
        }
    }
}

/// Big Five scores in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PersonalityProfile {
    pub openness: f64,
    pub conscientiousness: f64,
    pub extraversion: f64,
    pub agreeableness: f64,
    pub neuroticism: f64,
}

impl Default for PersonalityProfile {
    fn default() -> Self {
        Self {
            openness: NEUTRAL,
            conscientiousness: NEUTRAL,
            extraversion: NEUTRAL,
            agreeableness: NEUTRAL,
            neuroticism: NEUTRAL,
        }
    }
}

impl PersonalityProfile {
    pub fn score(&self, personality_trait: PersonalityTrait) -> f64 {
        let raw = match personality_trait {
            PersonalityTrait::Openness => self.openness,
            PersonalityTrait::Conscientiousness => self.conscientiousness,
            PersonalityTrait::Extraversion => self.extraversion,
            PersonalityTrait::Agreeableness => self.agreeableness,
            PersonalityTrait::Neuroticism => self.neuroticism,
        };
        unit(Some(raw))
    }

    /// Traits ordered from strongest to weakest
    pub fn ranked_traits(&self) -> Vec<(PersonalityTrait, f64)> {
        let mut traits: Vec<_> = PersonalityTrait::ALL
            .iter()
            .map(|t| (*t, self.score(*t)))
            .collect();
        traits.sort_by(|a, b| b.1.total_cmp(&a.1));
        traits
    }
}

/// One of a user's most-preferred tracks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListeningHistoryEntry {
    pub track: Track,
    /// Recency/frequency weight, higher means more preferred
    #[serde(default = "default_history_weight")]
    pub weight: f64,
}

fn default_history_weight() -> f64 {
    1.0
}

/// Component scores behind a recommendation, all in [0, 1] except the
/// signed learned adjustment
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub final_score: f64,
    pub history_similarity: f64,
    pub personality_match: f64,
    pub diversity: f64,
    pub novelty: f64,
    pub popularity: f64,
    pub rl_adjustment: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredRecommendation {
    pub track: Track,
    pub scores: ScoreBreakdown,
}

/// Per-user data a recommendation request is computed from
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserProfile {
    pub personality: PersonalityProfile,
    pub account_created_at: Option<DateTime<Utc>>,
}

impl UserProfile {
    /// Whole days since account creation, `None` when unknown
    pub fn account_age_days(&self, now: DateTime<Utc>) -> Option<u32> {
        self.account_created_at
            .map(|created| (now - created).num_days().max(0) as u32)
    }
}
