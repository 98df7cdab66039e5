//! Weighted composite scoring and diversity-aware selection
//!
//! Every component score lies in [0, 1]. The final score is the weighted
//! sum of components under [`ScoringWeights`] plus a bounded learned
//! adjustment, clamped back into [0, 1].

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::models::{
    AudioFeatures, ListeningHistoryEntry, PersonalityProfile, PersonalityTrait,
    ScoreBreakdown, ScoredRecommendation, Track, NEUTRAL,
};

const NEW_ARTIST_DIVERSITY_BONUS: f64 = 0.2;
const POPULARITY_PENALTY: f64 = 0.3;
const GENRE_MATCH_BONUS: f64 = 0.5;
const NEGATIVE_GENRE_PENALTY: f64 = 0.3;

/// Non-negative component weights; the stage presets sum to 1
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub history: f64,
    pub personality: f64,
    pub diversity: f64,
    pub novelty: f64,
    #[serde(default)]
    pub popularity: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            history: 0.4,
            personality: 0.4,
            diversity: 0.1,
            novelty: 0.1,
            popularity: 0.0,
        }
    }
}

impl ScoringWeights {
    pub fn total(&self) -> f64 {
        self.history + self.personality + self.diversity + self.novelty + self.popularity
    }
}

/// How strongly the learned value may move a final score
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RlBlend {
    pub scale: f64,
    pub band: f64,
}

impl Default for RlBlend {
    fn default() -> Self {
        Self {
            scale: 0.05,
            band: 0.05,
        }
    }
}

impl RlBlend {
    pub fn adjustment(&self, rl_value: f64) -> f64 {
        if !rl_value.is_finite() {
            return 0.0;
        }
        let band = self.band.abs();
        (rl_value * self.scale).clamp(-band, band)
    }
}

#[derive(Debug, Clone, Copy)]
enum Feature {
    Energy,
    Valence,
    Danceability,
    Acousticness,
    Tempo,
}

impl Feature {
    fn read(&self, features: &AudioFeatures) -> f64 {
        match self {
            Feature::Energy => features.energy,
            Feature::Valence => features.valence,
            Feature::Danceability => features.danceability,
            Feature::Acousticness => features.acousticness,
            Feature::Tempo => features.tempo,
        }
    }
}

struct TraitAffinity {
    personality_trait: PersonalityTrait,
    weight: f64,
    targets: &'static [(Feature, f64)],
    genres: &'static [&'static str],
    negative_genres: &'static [&'static str],
}

/// 100 BPM on the normalized tempo scale
const STEADY_TEMPO: f64 = 0.375;

const TRAIT_AFFINITIES: [TraitAffinity; 5] = [
    TraitAffinity {
        personality_trait: PersonalityTrait::Openness,
        weight: 0.25,
        targets: &[(Feature::Valence, 0.5), (Feature::Acousticness, 0.6)],
        genres: &["classical", "folk", "world", "jazz", "experimental"],
        negative_genres: &["mainstream pop"],
    },
    TraitAffinity {
        personality_trait: PersonalityTrait::Conscientiousness,
        weight: 0.15,
        targets: &[(Feature::Energy, 0.4), (Feature::Tempo, STEADY_TEMPO)],
        genres: &[],
        negative_genres: &["rock", "metal", "punk"],
    },
    TraitAffinity {
        personality_trait: PersonalityTrait::Extraversion,
        weight: 0.25,
        targets: &[
            (Feature::Energy, 0.75),
            (Feature::Danceability, 0.7),
            (Feature::Valence, 0.8),
        ],
        genres: &["pop", "dance", "hip-hop", "electronic"],
        negative_genres: &[],
    },
    TraitAffinity {
        personality_trait: PersonalityTrait::Agreeableness,
        weight: 0.15,
        targets: &[],
        genres: &["jazz", "country", "soul", "r&b"],
        negative_genres: &["death-metal", "hardcore"],
    },
    TraitAffinity {
        personality_trait: PersonalityTrait::Neuroticism,
        weight: 0.20,
        targets: &[(Feature::Valence, 0.7)],
        genres: &["soul", "pop", "indie"],
        negative_genres: &["metal", "hard rock"],
    },
];

/// Genres associated with a trait, used to seed genre searches
pub fn trait_genres(personality_trait: PersonalityTrait) -> &'static [&'static str] {
    TRAIT_AFFINITIES
        .iter()
        .find(|a| a.personality_trait == personality_trait)
        .map(|a| a.genres)
        .unwrap_or(&[])
}

/// Scores candidates and selects a diverse ranked list
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoringEngine {
    rl: RlBlend,
}

/// Components that do not depend on what was already selected
struct Precomputed {
    history_similarity: f64,
    personality_match: f64,
    novelty: f64,
    popularity: f64,
    rl_adjustment: f64,
}

impl ScoringEngine {
    pub fn new(rl: RlBlend) -> Self {
        Self { rl }
    }

    /// Weighted cosine similarity to the history, recent entries weighted
    /// 1.0 decaying linearly to 0.5; 0.5 when there is no history
    pub fn history_similarity(&self, candidate: &Track, history: &[ListeningHistoryEntry]) -> f64 {
        if history.is_empty() {
            return NEUTRAL;
        }

        let n = history.len();
        let mut weighted = 0.0;
        let mut total = 0.0;
        for (i, entry) in history.iter().enumerate() {
            let weight = if n == 1 {
                1.0
            } else {
                1.0 - 0.5 * i as f64 / (n - 1) as f64
            };
            weighted += weight * candidate.features.cosine_similarity(&entry.track.features);
            total += weight;
        }

        (weighted / total).clamp(0.0, 1.0)
    }

    pub fn personality_match(&self, candidate: &Track, profile: &PersonalityProfile) -> f64 {
        let genre_text = candidate.genre_text();
        let mut total_score = 0.0;
        let mut total_weight = 0.0;

        for affinity in TRAIT_AFFINITIES.iter() {
            let value = profile.score(affinity.personality_trait);
            let mut trait_score = 0.0;
            let mut components = 0usize;

            for (feature, target) in affinity.targets {
                let actual = feature.read(&candidate.features);
                trait_score += (1.0 - (actual - target).abs()) * value;
                components += 1;
            }

            if affinity.genres.iter().any(|g| genre_text.contains(g)) {
                trait_score += GENRE_MATCH_BONUS * value;
                components += 1;
            }

            if affinity.negative_genres.iter().any(|g| genre_text.contains(g)) {
                trait_score -= NEGATIVE_GENRE_PENALTY * value;
            }

            if components > 0 {
                trait_score /= components as f64;
            }

            total_score += trait_score * affinity.weight;
            total_weight += affinity.weight;
        }

        if total_weight > 0.0 {
            (total_score / total_weight).clamp(0.0, 1.0)
        } else {
            NEUTRAL
        }
    }

    pub fn diversity(&self, candidate: &Track, selected: &[&Track]) -> f64 {
        if selected.is_empty() {
            return 1.0;
        }

        let mean_similarity = selected
            .iter()
            .map(|s| candidate.features.cosine_similarity(&s.features))
            .sum::<f64>()
            / selected.len() as f64;
        let new_artist = !selected.iter().any(|s| s.same_artist(candidate));

        Self::diversity_from(mean_similarity, new_artist)
    }

    fn diversity_from(mean_similarity: f64, new_artist: bool) -> f64 {
        let bonus = if new_artist {
            NEW_ARTIST_DIVERSITY_BONUS
        } else {
            0.0
        };
        (1.0 - mean_similarity + bonus).clamp(0.0, 1.0)
    }

    pub fn novelty(&self, candidate: &Track, history: &[ListeningHistoryEntry]) -> f64 {
        let base = if history.iter().any(|e| e.track.id == candidate.id) {
            0.2
        } else if !history.iter().any(|e| e.track.same_artist(candidate)) {
            0.9
        } else {
            0.6
        };

        let popularity = candidate.popularity.unwrap_or(50).min(100) as f64;
        (base * (1.0 - popularity / 100.0 * POPULARITY_PENALTY)).clamp(0.0, 1.0)
    }

    pub fn popularity(&self, candidate: &Track) -> f64 {
        candidate
            .popularity
            .map(|p| p.min(100) as f64 / 100.0)
            .unwrap_or(NEUTRAL)
    }

    fn combine(&self, parts: &Precomputed, diversity: f64, weights: &ScoringWeights) -> f64 {
        let weighted = weights.history * parts.history_similarity
            + weights.personality * parts.personality_match
            + weights.diversity * diversity
            + weights.novelty * parts.novelty
            + weights.popularity * parts.popularity;
        (weighted + parts.rl_adjustment).clamp(0.0, 1.0)
    }

    fn precompute(
        &self,
        candidate: &Track,
        history: &[ListeningHistoryEntry],
        profile: &PersonalityProfile,
        rl_value: f64,
    ) -> Precomputed {
        Precomputed {
            history_similarity: self.history_similarity(candidate, history),
            personality_match: self.personality_match(candidate, profile),
            novelty: self.novelty(candidate, history),
            popularity: self.popularity(candidate),
            rl_adjustment: self.rl.adjustment(rl_value),
        }
    }

    /// Full score of one candidate against the tracks already selected
    pub fn score(
        &self,
        candidate: &Track,
        history: &[ListeningHistoryEntry],
        profile: &PersonalityProfile,
        already_selected: &[&Track],
        weights: &ScoringWeights,
        rl_value: f64,
    ) -> ScoreBreakdown {
        let parts = self.precompute(candidate, history, profile, rl_value);
        let diversity = self.diversity(candidate, already_selected);
        ScoreBreakdown {
            final_score: self.combine(&parts, diversity, weights),
            history_similarity: parts.history_similarity,
            personality_match: parts.personality_match,
            diversity,
            novelty: parts.novelty,
            popularity: parts.popularity,
            rl_adjustment: parts.rl_adjustment,
        }
    }

    /// Greedily selects up to `max_results` candidates
    ///
    /// Each round rescores diversity against the selections so far and
    /// takes the best candidate, the earliest in pool order on ties. The
    /// result is ordered by descending final score, ties by pool order.
    /// `rl_values` is aligned with `pool`; missing entries count as 0.
    pub fn rank(
        &self,
        pool: &[Track],
        history: &[ListeningHistoryEntry],
        profile: &PersonalityProfile,
        weights: &ScoringWeights,
        rl_values: &[f64],
        max_results: usize,
    ) -> Vec<ScoredRecommendation> {
        let parts: Vec<Precomputed> = pool
            .iter()
            .enumerate()
            .map(|(i, track)| {
                let rl_value = rl_values.get(i).copied().unwrap_or(0.0);
                self.precompute(track, history, profile, rl_value)
            })
            .collect();

        // Running similarity sums to the selections, updated per pick
        let mut similarity_sums = vec![0.0f64; pool.len()];
        let mut selected_artists: HashSet<String> = HashSet::new();
        let mut taken = vec![false; pool.len()];
        let mut picks: Vec<(usize, ScoreBreakdown)> = Vec::with_capacity(max_results.min(pool.len()));

        while picks.len() < max_results {
            let mut best: Option<(usize, f64, f64)> = None;

            for (i, track) in pool.iter().enumerate() {
                if taken[i] {
                    continue;
                }
                let diversity = if picks.is_empty() {
                    1.0
                } else {
                    let mean = similarity_sums[i] / picks.len() as f64;
                    let new_artist = !selected_artists.contains(&track.artist.to_lowercase());
                    Self::diversity_from(mean, new_artist)
                };
                let final_score = self.combine(&parts[i], diversity, weights);

                if best.map_or(true, |(_, score, _)| final_score > score) {
                    best = Some((i, final_score, diversity));
                }
            }

            let Some((index, final_score, diversity)) = best else {
                break;
            };

            taken[index] = true;
            let chosen = &pool[index];
            selected_artists.insert(chosen.artist.to_lowercase());
            for (i, track) in pool.iter().enumerate() {
                if !taken[i] {
                    similarity_sums[i] += track.features.cosine_similarity(&chosen.features);
                }
            }

            let p = &parts[index];
            picks.push((
                index,
                ScoreBreakdown {
                    final_score,
                    history_similarity: p.history_similarity,
                    personality_match: p.personality_match,
                    diversity,
                    novelty: p.novelty,
                    popularity: p.popularity,
                    rl_adjustment: p.rl_adjustment,
                },
            ));
        }

        picks.sort_by(|a, b| {
            b.1.final_score
                .total_cmp(&a.1.final_score)
                .then(a.0.cmp(&b.0))
        });

        picks
            .into_iter()
            .map(|(index, scores)| ScoredRecommendation {
                track: pool[index].clone(),
                scores,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::{features, history, track};
    use crate::models::normalize_tempo;

    fn engine() -> ScoringEngine {
        ScoringEngine::default()
    }

    #[test]
    fn test_steady_tempo_is_one_hundred_bpm() {
        assert_eq!(normalize_tempo(100.0), STEADY_TEMPO);
    }

    #[test]
    fn test_empty_history_similarity_is_neutral() {
        let candidate = track("c", "A", "pop", features(0.9, 0.9, 0.9, 0.1));
        assert_eq!(engine().history_similarity(&candidate, &[]), 0.5);
    }

    #[test]
    fn test_history_similarity_prefers_recent_matches() {
        let calm = features(0.1, 0.2, 0.1, 0.9);
        let loud = features(0.9, 0.9, 0.9, 0.05);
        let candidate = track("c", "A", "pop", calm);

        let recent_calm = history(&[track("h1", "B", "x", calm), track("h2", "C", "x", loud)]);
        let recent_loud = history(&[track("h2", "C", "x", loud), track("h1", "B", "x", calm)]);

        let a = engine().history_similarity(&candidate, &recent_calm);
        let b = engine().history_similarity(&candidate, &recent_loud);
        assert!(a > b);
        assert!((0.0..=1.0).contains(&a));
        assert!((0.0..=1.0).contains(&b));
    }

    #[test]
    fn test_personality_match_rewards_trait_genres() {
        let profile = PersonalityProfile {
            openness: 0.9,
            ..PersonalityProfile::default()
        };
        let f = features(0.5, 0.5, 0.5, 0.6);
        let jazz = track("j", "A", "jazz", f);
        let mainstream = track("m", "B", "mainstream pop", f);

        let engine = engine();
        assert!(engine.personality_match(&jazz, &profile) > engine.personality_match(&mainstream, &profile));
    }

    #[test]
    fn test_personality_match_in_unit_range() {
        let engine = engine();
        let extremes = [
            PersonalityProfile {
                openness: 1.0,
                conscientiousness: 1.0,
                extraversion: 1.0,
                agreeableness: 1.0,
                neuroticism: 1.0,
            },
            PersonalityProfile {
                openness: 0.0,
                conscientiousness: 0.0,
                extraversion: 0.0,
                agreeableness: 0.0,
                neuroticism: 0.0,
            },
        ];
        for profile in extremes {
            for genre in ["death-metal hardcore", "pop dance soul jazz", ""] {
                let candidate = track("c", "A", genre, features(1.0, 0.0, 1.0, 0.0));
                let score = engine.personality_match(&candidate, &profile);
                assert!((0.0..=1.0).contains(&score), "{} for {}", score, genre);
            }
        }
    }

    #[test]
    fn test_diversity_penalizes_similar_and_same_artist() {
        let engine = engine();
        let f = features(0.8, 0.8, 0.8, 0.1);
        let picked = track("p", "Same Artist", "pop", f);
        let twin = track("t", "same artist", "pop", f);
        let other = track("o", "Other", "folk", features(0.1, 0.2, 0.1, 0.9));

        assert_eq!(engine.diversity(&twin, &[]), 1.0);
        assert!(engine.diversity(&twin, &[&picked]) < 0.01);
        assert!(engine.diversity(&other, &[&picked]) > 0.2);
    }

    #[test]
    fn test_novelty_cases() {
        let engine = engine();
        let f = features(0.5, 0.5, 0.5, 0.5);
        let heard = track("h", "Known", "pop", f);
        let past = history(&[heard.clone()]);

        let mut unpopular = heard.clone();
        unpopular.popularity = Some(0);
        assert!((engine.novelty(&unpopular, &past) - 0.2).abs() < 1e-9);

        let mut same_artist = track("s", "Known", "pop", f);
        same_artist.popularity = Some(0);
        assert!((engine.novelty(&same_artist, &past) - 0.6).abs() < 1e-9);

        let mut fresh = track("f", "Stranger", "pop", f);
        fresh.popularity = Some(100);
        assert!((engine.novelty(&fresh, &past) - 0.63).abs() < 1e-9);

        fresh.popularity = None;
        assert!((engine.novelty(&fresh, &past) - 0.765).abs() < 1e-9);
    }

    #[test]
    fn test_rl_adjustment_is_bounded() {
        let blend = RlBlend::default();
        assert_eq!(blend.adjustment(0.0), 0.0);
        assert!((blend.adjustment(0.5) - 0.025).abs() < 1e-12);
        assert_eq!(blend.adjustment(50.0), 0.05);
        assert_eq!(blend.adjustment(-50.0), -0.05);
        assert_eq!(blend.adjustment(f64::NAN), 0.0);
    }

    #[test]
    fn test_final_score_stays_in_unit_range() {
        let engine = engine();
        let candidate = track("c", "A", "pop", features(1.0, 1.0, 1.0, 1.0));
        let profile = PersonalityProfile::default();
        for rl in [-100.0, 0.0, 100.0] {
            let s = engine.score(&candidate, &[], &profile, &[], &ScoringWeights::default(), rl);
            assert!((0.0..=1.0).contains(&s.final_score));
        }
    }

    #[test]
    fn test_rank_returns_requested_count_in_order() {
        let engine = engine();
        let pool: Vec<Track> = (0..30)
            .map(|i| {
                let x = i as f64 / 30.0;
                track(&format!("t{}", i), &format!("Artist {}", i % 7), "pop", features(x, 1.0 - x, 0.5, x))
            })
            .collect();

        let ranked = engine.rank(
            &pool,
            &[],
            &PersonalityProfile::default(),
            &ScoringWeights::default(),
            &[],
            10,
        );
        assert_eq!(ranked.len(), 10);
        for pair in ranked.windows(2) {
            assert!(pair[0].scores.final_score >= pair[1].scores.final_score);
        }
        let ids: HashSet<_> = ranked.iter().map(|r| r.track.id.clone()).collect();
        assert_eq!(ids.len(), 10);
    }

    #[test]
    fn test_rank_ties_keep_pool_order() {
        let engine = engine();
        let f = features(0.5, 0.5, 0.5, 0.5);
        let pool: Vec<Track> = (0..4).map(|i| track(&format!("t{}", i), &format!("A{}", i), "pop", f)).collect();
        let weights = ScoringWeights {
            history: 0.5,
            personality: 0.5,
            diversity: 0.0,
            novelty: 0.0,
            popularity: 0.0,
        };

        let ranked = engine.rank(&pool, &[], &PersonalityProfile::default(), &weights, &[], 4);
        let order: Vec<&str> = ranked.iter().map(|r| r.track.id.as_str()).collect();
        assert_eq!(order, vec!["t0", "t1", "t2", "t3"]);
    }

    #[test]
    fn test_rank_with_small_pool() {
        let engine = engine();
        let pool = vec![track("only", "A", "pop", features(0.3, 0.3, 0.3, 0.3))];
        let ranked = engine.rank(
            &pool,
            &[],
            &PersonalityProfile::default(),
            &ScoringWeights::default(),
            &[0.0],
            50,
        );
        assert_eq!(ranked.len(), 1);
    }

    #[test]
    fn test_rl_value_breaks_otherwise_equal_candidates() {
        let engine = engine();
        let f = features(0.5, 0.5, 0.5, 0.5);
        let pool = vec![track("a", "A", "pop", f), track("b", "B", "pop", f)];
        let ranked = engine.rank(
            &pool,
            &[],
            &PersonalityProfile::default(),
            &ScoringWeights::default(),
            &[0.0, 1.0],
            1,
        );
        assert_eq!(ranked[0].track.id.as_str(), "b");
        assert!(ranked[0].scores.rl_adjustment > 0.0);
    }
}
