use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};
use uuid::Uuid;

use crate::round::models::RoundModel;
use crate::user::models::clamp_tier;

/// Difficulty change, also the oracle's class label (down=0, same=1, up=2)
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Direction {
    Down,
    Same,
    Up,
}

impl Direction {
    pub fn label(self) -> usize {
        match self {
            Direction::Down => 0,
            Direction::Same => 1,
            Direction::Up => 2,
        }
    }

    pub fn from_label(label: usize) -> Option<Self> {
        Self::iter().nth(label)
    }

    /// Moves a tier one step, clamped to the valid range
    pub fn apply(self, tier: i16) -> i16 {
        let delta = match self {
            Direction::Down => -1,
            Direction::Same => 0,
            Direction::Up => 1,
        };
        clamp_tier(tier + delta)
    }

    /// Ground truth for a round, judged by how accuracy moved in the round after it
    pub fn from_accuracy_delta(previous: f64, next: f64, epsilon: f64) -> Self {
        let delta = next - previous;
        if delta > epsilon {
            Direction::Up
        } else if delta < -epsilon {
            Direction::Down
        } else {
            Direction::Same
        }
    }
}

/// Oracle input for one round
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Features {
    pub accuracy: f64,
    pub avg_time_secs: f64,
    pub hint_rate: f64,
}

impl Features {
    pub fn as_array(&self) -> [f64; 3] {
        [self.accuracy, self.avg_time_secs, self.hint_rate]
    }

    pub fn is_finite(&self) -> bool {
        self.as_array().iter().all(|v| v.is_finite())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Prediction {
    pub label: Direction,
    /// Indexed by `Direction::label`
    pub probabilities: [f64; 3],
}

impl Prediction {
    pub fn confidence(&self) -> f64 {
        self.probabilities[self.label.label()]
    }
}

/// One per finalized round. `true_label` is written at most once, when the
/// student's next round finalizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationModel {
    pub id: Uuid,
    pub round_id: Uuid,
    pub student_id: Uuid,
    pub direction: Direction,
    pub confidence: f64,
    pub prev_tier: i16,
    pub new_tier: i16,
    /// The student's round index when this was issued
    pub round_index: i32,
    pub true_label: Option<Direction>,
    pub labeled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl RecommendationModel {
    pub fn new(round: &RoundModel, prediction: &Prediction, prev_tier: i16) -> Self {
        Self {
            id: Uuid::new_v4(),
            round_id: round.id,
            student_id: round.student_id,
            direction: prediction.label,
            confidence: prediction.confidence(),
            prev_tier,
            new_tier: prediction.label.apply(prev_tier),
            round_index: round.round_index,
            true_label: None,
            labeled_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_labeled(&self) -> bool {
        self.true_label.is_some()
    }
}

/// A teacher's verdict on a student's newest recommendation. Recorded for
/// review only; the student's tier is left as the model set it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeacherActionModel {
    pub id: Uuid,
    pub teacher_id: Uuid,
    pub student_id: Uuid,
    pub recommendation_id: Uuid,
    pub action: Direction,
    pub created_at: DateTime<Utc>,
}

impl TeacherActionModel {
    pub fn new(teacher_id: Uuid, recommendation: &RecommendationModel, action: Direction) -> Self {
        Self {
            id: Uuid::new_v4(),
            teacher_id,
            student_id: recommendation.student_id,
            recommendation_id: recommendation.id,
            action,
            created_at: Utc::now(),
        }
    }
}

/// A recorded action next to what the model had recommended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeacherActionView {
    pub student_username: String,
    pub action: Direction,
    pub recommendation_id: Uuid,
    pub model_recommendation: Direction,
    pub model_confidence: f64,
    pub created_at: DateTime<Utc>,
}
