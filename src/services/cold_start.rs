use serde::{Deserialize, Serialize};

use crate::services::scoring::ScoringWeights;

const WEEK_ONE_MAX_DAYS: u32 = 7;
const FIRST_MONTH_MAX_DAYS: u32 = 28;

/// Lifecycle stage of an account, driving weights and candidate sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColdStartStage {
    #[serde(rename = "week_1")]
    WeekOne,
    #[serde(rename = "week_2_4")]
    WeeksTwoToFour,
    #[serde(rename = "month_2_plus")]
    MonthTwoPlus,
}

impl ColdStartStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColdStartStage::WeekOne => "week_1",
            ColdStartStage::WeeksTwoToFour => "week_2_4",
            ColdStartStage::MonthTwoPlus => "month_2_plus",
        }
    }
}

/// What a stage changes about a recommendation request
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StagePolicy {
    pub stage: ColdStartStage,
    pub weights: ScoringWeights,
    /// Whether history-seeded candidates are gathered
    pub use_history_source: bool,
    /// Whether popular tracks are always added to the pool
    pub force_popular_fallback: bool,
}

/// Picks the stage for an account age in whole days
///
/// Unknown ages are treated as established accounts.
pub fn stage_for_age(account_age_days: Option<u32>) -> StagePolicy {
    match account_age_days {
        Some(days) if days <= WEEK_ONE_MAX_DAYS => StagePolicy {
            stage: ColdStartStage::WeekOne,
            weights: ScoringWeights {
                history: 0.0,
                personality: 0.8,
                diversity: 0.0,
                novelty: 0.0,
                popularity: 0.2,
            },
            use_history_source: false,
            force_popular_fallback: true,
        },
        Some(days) if days <= FIRST_MONTH_MAX_DAYS => StagePolicy {
            stage: ColdStartStage::WeeksTwoToFour,
            weights: ScoringWeights {
                history: 0.4,
                personality: 0.6,
                diversity: 0.0,
                novelty: 0.0,
                popularity: 0.0,
            },
            use_history_source: true,
            force_popular_fallback: false,
        },
        _ => StagePolicy {
            stage: ColdStartStage::MonthTwoPlus,
            weights: ScoringWeights::default(),
            use_history_source: true,
            force_popular_fallback: false,
        },
    }
}
