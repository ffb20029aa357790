use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::models::{Direction, Features, RecommendationModel};
use super::oracle::SharedOracle;
use crate::round::models::{RoundAggregates, RoundModel};
use crate::round::repository::{CommitOutcome, DelayedLabel, FinalizationCommit, RoundRepository};
use crate::round::{FinalizationState, RoundEngine};
use crate::shared::{AppError, KeyedMutex};
use crate::user::models::StudentStats;
use crate::user::repository::UserRepository;

/// Aggregate-predict-commit passes before a busy round is reported as a conflict
const MAX_FINALIZE_PASSES: usize = 3;

/// How ground truth is derived and weighted
#[derive(Debug, Clone, Copy)]
pub struct LabelPolicy {
    /// Accuracy change inside which the label is "same"
    pub epsilon: f64,
    /// Weight of a real sample when the original prediction had full confidence
    pub real_sample_weight: f64,
}

/// Result of closing a round
#[derive(Debug, Clone)]
pub struct FinalizedRound {
    pub round: RoundModel,
    pub aggregates: RoundAggregates,
    pub recommendation: RecommendationModel,
    pub stats: StudentStats,
    /// Zero when the round had already been finalized
    pub xp_gained: i64,
    pub already_finalized: bool,
}

/// A training example produced by labeling the previous round
struct PendingLesson {
    label: DelayedLabel,
    features: Features,
    weight: f64,
}

pub struct RecommendationEngine {
    round_engine: Arc<RoundEngine>,
    rounds: Arc<dyn RoundRepository>,
    users: Arc<dyn UserRepository>,
    oracle: Arc<SharedOracle>,
    policy: LabelPolicy,
    student_locks: KeyedMutex,
}

impl RecommendationEngine {
    pub fn new(
        round_engine: Arc<RoundEngine>,
        rounds: Arc<dyn RoundRepository>,
        users: Arc<dyn UserRepository>,
        oracle: Arc<SharedOracle>,
        policy: LabelPolicy,
    ) -> Self {
        Self {
            round_engine,
            rounds,
            users,
            oracle,
            policy,
            student_locks: KeyedMutex::new(),
        }
    }

    /// Closes a round, recommends the next tier and labels the previous round.
    /// Calling it again for the same round returns the stored result.
    #[instrument(skip(self))]
    pub async fn finalize_round(&self, round_id: Uuid) -> Result<FinalizedRound, AppError> {
        let round = self.round_engine.get_round(round_id).await?;
        let _guard = self.student_locks.lock(round.student_id).await;

        for pass in 1..=MAX_FINALIZE_PASSES {
            if let Some(result) = self.finalize_pass(round_id).await? {
                return Ok(result);
            }
            warn!(%round_id, pass, "Answers arrived while finalizing, aggregating again");
        }
        Err(AppError::Conflict(
            "Round is still receiving answers, try again".to_string(),
        ))
    }

    /// Aggregates, predicts and commits once. `None` when the round gained
    /// attempts between aggregation and commit; nothing was written then.
    async fn finalize_pass(&self, round_id: Uuid) -> Result<Option<FinalizedRound>, AppError> {
        let (round, aggregates) = match self.round_engine.finalization_state(round_id).await? {
            FinalizationState::Closed { round } => return self.stored_result(round).await.map(Some),
            FinalizationState::Open { round, aggregates } => (round, aggregates),
        };

        let prediction = self.oracle.predict(&aggregates.features()).await?;

        let student = self
            .users
            .get_user(round.student_id)
            .await?
            .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;
        let recommendation = RecommendationModel::new(&round, &prediction, student.difficulty);

        let lesson = self.previous_round_lesson(&round, &aggregates).await?;

        let commit = FinalizationCommit {
            round_id: round.id,
            student_id: student.id,
            ended_at: Utc::now(),
            aggregates,
            round_attempts: i64::from(round.question_count),
            new_tier: recommendation.new_tier,
            recommendation: recommendation.clone(),
            delayed_label: lesson.as_ref().map(|l| l.label.clone()),
        };

        let (stats, xp_gained, labeled_previous) =
            match self.rounds.commit_finalization(&commit).await? {
                CommitOutcome::Committed {
                    stats,
                    xp_gained,
                    labeled_previous,
                } => (stats, xp_gained, labeled_previous),
                CommitOutcome::AlreadyFinalized => {
                    let round = self.round_engine.get_round(round_id).await?;
                    return self.stored_result(round).await.map(Some);
                }
                CommitOutcome::AttemptsChanged { recorded } => {
                    debug!(recorded, aggregated = aggregates.attempt_count, "Stale aggregates");
                    return Ok(None);
                }
            };

        if let (true, Some(lesson)) = (labeled_previous, lesson) {
            // The label is stored either way; a failed update drops this sample from training
            if let Err(e) = self
                .oracle
                .learn(&lesson.features, lesson.label.true_label, lesson.weight)
                .await
            {
                error!(error = %e, "Failed to feed delayed label to the model");
            }
        }

        info!(
            student_id = %student.id,
            direction = %recommendation.direction,
            confidence = recommendation.confidence,
            prev_tier = recommendation.prev_tier,
            new_tier = recommendation.new_tier,
            xp_gained,
            "Round finalized"
        );

        let round = self.round_engine.get_round(round_id).await?;
        Ok(Some(FinalizedRound {
            round,
            aggregates,
            recommendation,
            stats,
            xp_gained,
            already_finalized: false,
        }))
    }

    /// Ground truth for the student's previous round, if it still awaits a label
    async fn previous_round_lesson(
        &self,
        round: &RoundModel,
        aggregates: &RoundAggregates,
    ) -> Result<Option<PendingLesson>, AppError> {
        let Some(previous) = self.round_engine.previous_round(round).await? else {
            return Ok(None);
        };
        let Some(previous_aggregates) = previous.aggregates() else {
            // previous round was abandoned without finishing
            return Ok(None);
        };
        let Some(previous_rec) = self.rounds.get_recommendation_for_round(previous.id).await?
        else {
            return Ok(None);
        };
        if previous_rec.is_labeled() {
            return Ok(None);
        }

        let true_label = Direction::from_accuracy_delta(
            previous_aggregates.accuracy,
            aggregates.accuracy,
            self.policy.epsilon,
        );

        Ok(Some(PendingLesson {
            label: DelayedLabel {
                recommendation_id: previous_rec.id,
                true_label,
            },
            features: previous_aggregates.features(),
            weight: self.policy.real_sample_weight * previous_rec.confidence,
        }))
    }

    async fn stored_result(&self, round: RoundModel) -> Result<FinalizedRound, AppError> {
        let aggregates = round.aggregates().ok_or_else(|| {
            error!(round_id = %round.id, "Closed round is missing aggregates");
            AppError::Internal
        })?;
        let recommendation = self
            .rounds
            .get_recommendation_for_round(round.id)
            .await?
            .ok_or_else(|| {
                error!(round_id = %round.id, "Closed round is missing its recommendation");
                AppError::Internal
            })?;
        let stats = self
            .users
            .get_stats(round.student_id)
            .await?
            .unwrap_or_else(|| StudentStats::empty(round.student_id));

        warn!(round_id = %round.id, "Round already finalized, returning stored result");
        Ok(FinalizedRound {
            round,
            aggregates,
            recommendation,
            stats,
            xp_gained: 0,
            already_finalized: true,
        })
    }
}
