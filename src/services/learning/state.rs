use crate::models::{PersonalityProfile, Track};

/// The only action the learner values: recommending a track
pub const RECOMMEND_ACTION: &str = "recommend";

fn level(value: f64) -> &'static str {
    if value < 0.33 {
        "low"
    } else if value < 0.67 {
        "med"
    } else {
        "high"
    }
}

fn tempo_class(bpm: f64) -> &'static str {
    if bpm < 90.0 {
        "slow"
    } else if bpm < 140.0 {
        "medium"
    } else {
        "fast"
    }
}

/// Genre tag as it appears in a state string
pub fn genre_tag(genre: &str) -> String {
    format!("genre_{}", genre.trim().to_lowercase().replace(' ', "_"))
}

/// Discretizes a (profile, track) pair into a composite state string
///
/// Parts are sorted before joining so the string does not depend on the
/// order features were listed in.
pub fn discretize(profile: &PersonalityProfile, track: &Track) -> String {
    let features = &track.features;
    let mut parts: Vec<String> = profile
        .ranked_traits()
        .into_iter()
        .map(|(personality_trait, score)| format!("{}_{}", personality_trait.as_str(), level(score)))
        .collect();

    parts.push(format!("energy_{}", level(features.energy)));
    parts.push(format!("valence_{}", level(features.valence)));
    parts.push(format!("dance_{}", level(features.danceability)));
    parts.push(format!("tempo_{}", tempo_class(features.tempo_bpm())));
    parts.push(genre_tag(track.primary_genre()));

    parts.sort();
    parts.join("|")
}

/// Key of a learned value in the table and in snapshots
pub fn q_key(state: &str, action: &str) -> String {
    format!("{}_{}", state, action)
}
