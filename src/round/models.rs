use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::question::models::{QuestionModel, QuestionPayload};
use crate::recommendation::models::Features;

/// A batch of questions answered by one student. Open until `end_ts` is set,
/// after which the aggregates are frozen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundModel {
    pub id: Uuid,
    pub student_id: Uuid,
    pub game_id: Option<Uuid>,
    pub topic_id: Uuid,
    pub round_index: i32,
    pub question_count: i32,
    pub start_ts: DateTime<Utc>,
    pub end_ts: Option<DateTime<Utc>>,
    pub accuracy: Option<f64>,
    pub avg_time_secs: Option<f64>,
    pub hint_rate: Option<f64>,
}

impl RoundModel {
    pub fn new(
        student_id: Uuid,
        game_id: Option<Uuid>,
        topic_id: Uuid,
        round_index: i32,
        question_count: i32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            student_id,
            game_id,
            topic_id,
            round_index,
            question_count,
            start_ts: Utc::now(),
            end_ts: None,
            accuracy: None,
            avg_time_secs: None,
            hint_rate: None,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.end_ts.is_some()
    }

    /// Stored aggregates, present only once finalized
    pub fn aggregates(&self) -> Option<RoundAggregates> {
        match (self.end_ts, self.accuracy, self.avg_time_secs, self.hint_rate) {
            (Some(_), Some(accuracy), Some(avg_time_secs), Some(hint_rate)) => {
                Some(RoundAggregates {
                    accuracy,
                    avg_time_secs,
                    hint_rate,
                    attempt_count: 0,
                })
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptModel {
    pub id: Uuid,
    pub round_id: Uuid,
    pub student_id: Uuid,
    pub question_id: Uuid,
    pub is_correct: bool,
    pub num_attempts: i32,
    pub time_spent_secs: f64,
    pub hints_used: i32,
    pub created_at: DateTime<Utc>,
}

/// Input for recording one answer
#[derive(Debug, Clone, PartialEq)]
pub struct NewAttempt {
    pub round_id: Uuid,
    pub student_id: Uuid,
    pub question_id: Uuid,
    pub is_correct: bool,
    pub num_attempts: i32,
    pub time_spent_secs: f64,
    pub hints_used: i32,
}

impl NewAttempt {
    pub fn into_model(self) -> AttemptModel {
        AttemptModel {
            id: Uuid::new_v4(),
            round_id: self.round_id,
            student_id: self.student_id,
            question_id: self.question_id,
            is_correct: self.is_correct,
            num_attempts: self.num_attempts,
            time_spent_secs: self.time_spent_secs,
            hints_used: self.hints_used,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoundAggregates {
    pub accuracy: f64,
    pub avg_time_secs: f64,
    /// Hints per attempt
    pub hint_rate: f64,
    #[serde(skip)]
    pub attempt_count: usize,
}

impl RoundAggregates {
    /// Every aggregate is 0 for a round without attempts
    pub fn from_attempts(attempts: &[AttemptModel]) -> Self {
        if attempts.is_empty() {
            return Self {
                accuracy: 0.0,
                avg_time_secs: 0.0,
                hint_rate: 0.0,
                attempt_count: 0,
            };
        }

        let n = attempts.len() as f64;
        let correct = attempts.iter().filter(|a| a.is_correct).count() as f64;
        let time: f64 = attempts.iter().map(|a| a.time_spent_secs).sum();
        let hints: i64 = attempts.iter().map(|a| i64::from(a.hints_used)).sum();

        Self {
            accuracy: correct / n,
            avg_time_secs: time / n,
            hint_rate: hints as f64 / n,
            attempt_count: attempts.len(),
        }
    }

    pub fn features(&self) -> Features {
        Features {
            accuracy: self.accuracy,
            avg_time_secs: self.avg_time_secs,
            hint_rate: self.hint_rate,
        }
    }
}

/// A freshly started round with the questions to deliver
#[derive(Debug, Clone)]
pub struct RoundBatch {
    pub round: RoundModel,
    pub questions: Vec<QuestionModel>,
}

impl RoundBatch {
    pub fn to_payload(&self) -> BatchPayload {
        BatchPayload {
            game_id: self.round.game_id,
            topic_id: self.round.topic_id,
            round_id: self.round.id,
            round_index: self.round.round_index,
            questions: self.questions.iter().map(QuestionModel::to_payload).collect(),
        }
    }
}

/// Wire shape of a delivered batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchPayload {
    pub game_id: Option<Uuid>,
    pub topic_id: Uuid,
    pub round_id: Uuid,
    pub round_index: i32,
    pub questions: Vec<QuestionPayload>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(correct: bool, time: f64, hints: i32) -> AttemptModel {
        NewAttempt {
            round_id: Uuid::new_v4(),
            student_id: Uuid::new_v4(),
            question_id: Uuid::new_v4(),
            is_correct: correct,
            num_attempts: 1,
            time_spent_secs: time,
            hints_used: hints,
        }
        .into_model()
    }

    #[test]
    fn test_aggregates_over_attempts() {
        let attempts = vec![
            attempt(true, 4.0, 0),
            attempt(true, 6.0, 1),
            attempt(false, 8.0, 3),
            attempt(true, 2.0, 0),
        ];

        let agg = RoundAggregates::from_attempts(&attempts);
        assert!((agg.accuracy - 0.75).abs() < 1e-12);
        assert!((agg.avg_time_secs - 5.0).abs() < 1e-12);
        assert!((agg.hint_rate - 1.0).abs() < 1e-12);
        assert_eq!(agg.attempt_count, 4);
    }

    #[test]
    fn test_empty_round_aggregates_to_zero() {
        let agg = RoundAggregates::from_attempts(&[]);
        assert_eq!(agg.accuracy, 0.0);
        assert_eq!(agg.avg_time_secs, 0.0);
        assert_eq!(agg.hint_rate, 0.0);
    }

    #[test]
    fn test_open_round_has_no_stored_aggregates() {
        let round = RoundModel::new(Uuid::new_v4(), None, Uuid::new_v4(), 0, 10);
        assert!(!round.is_finalized());
        assert!(round.aggregates().is_none());
    }
}
