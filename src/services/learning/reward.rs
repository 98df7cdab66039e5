use serde::{Deserialize, Serialize};

/// Kinds of user feedback, each carrying its base reward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackKind {
    Like,
    Dislike,
    Play,
    Skip,
    Save,
    AddToPlaylist,
    Repeat,
    Share,
}

impl FeedbackKind {
    pub fn base_reward(&self) -> f64 {
        match self {
            FeedbackKind::Like => 1.0,
            FeedbackKind::Dislike => -1.0,
            FeedbackKind::Play => 0.8,
            FeedbackKind::Skip => -0.4,
            FeedbackKind::Save => 1.5,
            FeedbackKind::AddToPlaylist => 1.8,
            FeedbackKind::Repeat => 1.2,
            FeedbackKind::Share => 1.3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackKind::Like => "like",
            FeedbackKind::Dislike => "dislike",
            FeedbackKind::Play => "play",
            FeedbackKind::Skip => "skip",
            FeedbackKind::Save => "save",
            FeedbackKind::AddToPlaylist => "add_to_playlist",
            FeedbackKind::Repeat => "repeat",
            FeedbackKind::Share => "share",
        }
    }
}

/// Optional signals that shape the reward of a feedback event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackContext {
    pub listen_duration_secs: Option<f64>,
    pub track_duration_secs: Option<f64>,
    pub repeated: bool,
    /// Seconds between the track being shown and the user acting on it
    pub time_to_action_secs: Option<f64>,
    /// Activity the user was listening during, e.g. "workout"
    pub listening_context: Option<String>,
}

impl FeedbackContext {
    pub fn listen_ratio(&self) -> Option<f64> {
        match (self.listen_duration_secs, self.track_duration_secs) {
            (Some(listened), Some(total)) if total > 0.0 && listened.is_finite() => {
                Some(listened / total)
            }
            _ => None,
        }
    }
}

/// Base reward of `kind` adjusted by the context signals
pub fn compute_reward(kind: FeedbackKind, context: &FeedbackContext) -> f64 {
    let mut reward = kind.base_reward();

    if let Some(ratio) = context.listen_ratio() {
        if ratio > 0.9 {
            reward += 0.4;
        } else if ratio < 0.2 {
            reward -= 0.3;
        } else if ratio > 0.5 {
            reward += 0.2;
        }
    }

    if context.repeated {
        reward += 0.3;
    }

    if let Some(secs) = context.time_to_action_secs {
        if secs < 3.0 && matches!(kind, FeedbackKind::Like | FeedbackKind::Play) {
            reward += 0.15;
        }
    }

    if kind == FeedbackKind::Like {
        if let Some(activity) = context.listening_context.as_deref() {
            if matches!(activity, "workout" | "party") {
                reward += 0.1;
            }
        }
    }

    reward
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_base_rewards() {
        let ctx = FeedbackContext::default();
        assert!(close(compute_reward(FeedbackKind::Like, &ctx), 1.0));
        assert!(close(compute_reward(FeedbackKind::Dislike, &ctx), -1.0));
        assert!(close(compute_reward(FeedbackKind::Skip, &ctx), -0.4));
        assert!(close(compute_reward(FeedbackKind::AddToPlaylist, &ctx), 1.8));
    }

    #[test]
    fn test_listen_ratio_modifiers() {
        let ctx = |listened: f64| FeedbackContext {
            listen_duration_secs: Some(listened),
            track_duration_secs: Some(100.0),
            ..FeedbackContext::default()
        };
        assert!(close(compute_reward(FeedbackKind::Play, &ctx(95.0)), 1.2));
        assert!(close(compute_reward(FeedbackKind::Play, &ctx(60.0)), 1.0));
        assert!(close(compute_reward(FeedbackKind::Play, &ctx(30.0)), 0.8));
        assert!(close(compute_reward(FeedbackKind::Skip, &ctx(10.0)), -0.7));
    }

    #[test]
    fn test_quick_like_in_workout() {
        let ctx = FeedbackContext {
            repeated: true,
            time_to_action_secs: Some(1.5),
            listening_context: Some("workout".to_string()),
            ..FeedbackContext::default()
        };
        assert!(close(compute_reward(FeedbackKind::Like, &ctx), 1.55));
        // only likes and plays get the quick-action bonus, only likes the activity one
        assert!(close(compute_reward(FeedbackKind::Save, &ctx), 1.8));
    }

    #[test]
    fn test_zero_track_duration_is_ignored() {
        let ctx = FeedbackContext {
            listen_duration_secs: Some(10.0),
            track_duration_secs: Some(0.0),
            ..FeedbackContext::default()
        };
        assert_eq!(ctx.listen_ratio(), None);
    }

    #[test]
    fn test_kind_wire_names() {
        let kind: FeedbackKind = serde_json::from_str(r#""add_to_playlist""#).unwrap();
        assert_eq!(kind, FeedbackKind::AddToPlaylist);
        assert_eq!(kind.as_str(), "add_to_playlist");
        assert!(serde_json::from_str::<FeedbackKind>(r#""meh""#).is_err());
    }
}
