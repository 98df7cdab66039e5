//! Wire types returned by the upstream music catalog
use serde::Deserialize;

use super::{AudioFeatures, PartialFeatures, Track, TrackId};

#[derive(Debug, Clone, Deserialize)]
pub struct ApiArtistRef {
    pub id: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiTrack {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub artists: Vec<ApiArtistRef>,
    #[serde(default)]
    pub popularity: Option<u8>,
}

impl ApiTrack {
    pub fn primary_artist_id(&self) -> Option<&str> {
        self.artists.first().and_then(|a| a.id.as_deref())
    }

    /// Builds a domain track once genres and features are known
    pub fn into_track(self, genres: Vec<String>, features: AudioFeatures) -> Track {
        let artist = self
            .artists
            .into_iter()
            .next()
            .map(|a| a.name)
            .unwrap_or_else(|| "Unknown Artist".to_string());

        Track {
            id: TrackId(self.id),
            name: self.name,
            artist,
            genres,
            popularity: self.popularity.map(|p| p.min(100)),
            features,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiTrackPage {
    #[serde(default)]
    pub items: Vec<ApiTrack>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiSearchResponse {
    pub tracks: ApiTrackPage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiPlaylistItem {
    /// `null` for episodes and removed tracks
    pub track: Option<ApiTrack>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiPlaylistPage {
    #[serde(default)]
    pub items: Vec<ApiPlaylistItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiRecommendationsResponse {
    #[serde(default)]
    pub tracks: Vec<ApiTrack>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiAudioFeatures {
    pub id: String,
    pub energy: Option<f64>,
    pub valence: Option<f64>,
    pub danceability: Option<f64>,
    pub acousticness: Option<f64>,
    pub instrumentalness: Option<f64>,
    pub tempo: Option<f64>,
    pub speechiness: Option<f64>,
}

impl From<&ApiAudioFeatures> for AudioFeatures {
    fn from(api: &ApiAudioFeatures) -> Self {
        AudioFeatures::from(PartialFeatures {
            energy: api.energy,
            valence: api.valence,
            danceability: api.danceability,
            acousticness: api.acousticness,
            instrumentalness: api.instrumentalness,
            tempo_bpm: api.tempo,
            speechiness: api.speechiness,
        })
    }
}

/// Batch feature lookup; unknown ids come back as `null`
#[derive(Debug, Clone, Deserialize)]
pub struct ApiAudioFeaturesResponse {
    #[serde(default)]
    pub audio_features: Vec<Option<ApiAudioFeatures>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiArtist {
    pub id: String,
    #[serde(default)]
    pub genres: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiArtistsResponse {
    #[serde(default)]
    pub artists: Vec<Option<ApiArtist>>,
}
