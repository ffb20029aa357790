use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::models::{NewAttempt, RoundAggregates, RoundBatch, RoundModel};
use super::repository::RoundRepository;
use crate::question::selector::QuestionSelector;
use crate::round::models::AttemptModel;
use crate::shared::{AppError, KeyedMutex};
use crate::user::repository::UserRepository;

/// Where a round stands when finalization is requested
#[derive(Debug, Clone)]
pub enum FinalizationState {
    /// Still open; aggregates computed from the attempts recorded so far
    Open {
        round: RoundModel,
        aggregates: RoundAggregates,
    },
    /// Already closed; stored aggregates are authoritative
    Closed { round: RoundModel },
}

/// Creates rounds, ingests attempts and computes round aggregates
pub struct RoundEngine {
    rounds: Arc<dyn RoundRepository>,
    users: Arc<dyn UserRepository>,
    selector: QuestionSelector,
    batch_limit: usize,
    // Guards round_index allocation per student
    student_locks: KeyedMutex,
}

impl RoundEngine {
    pub fn new(
        rounds: Arc<dyn RoundRepository>,
        users: Arc<dyn UserRepository>,
        selector: QuestionSelector,
        batch_limit: usize,
    ) -> Self {
        Self {
            rounds,
            users,
            selector,
            batch_limit,
            student_locks: KeyedMutex::new(),
        }
    }

    /// Selects a batch at the student's current tier and persists a new round for it
    #[instrument(skip(self))]
    pub async fn start_round(
        &self,
        student_id: Uuid,
        game_id: Option<Uuid>,
        topic_id: Uuid,
    ) -> Result<RoundBatch, AppError> {
        let student = self
            .users
            .get_user(student_id)
            .await?
            .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;

        let questions = self
            .selector
            .select(topic_id, student.difficulty, self.batch_limit)
            .await?;
        if questions.is_empty() {
            warn!(tier = student.difficulty, "No questions for round");
            return Err(AppError::NoQuestions);
        }

        let _guard = self.student_locks.lock(student_id).await;
        let round_index = self
            .rounds
            .max_round_index(student_id)
            .await?
            .map_or(0, |max| max + 1);

        let round = RoundModel::new(
            student_id,
            game_id,
            topic_id,
            round_index,
            questions.len() as i32,
        );
        let question_ids: Vec<Uuid> = questions.iter().map(|q| q.id).collect();
        self.rounds.create_round(&round, &question_ids).await?;

        info!(
            round_id = %round.id,
            round_index,
            tier = student.difficulty,
            questions = questions.len(),
            "Round started"
        );

        Ok(RoundBatch { round, questions })
    }

    #[instrument(skip(self, attempt), fields(round_id = %attempt.round_id, question_id = %attempt.question_id))]
    pub async fn record_attempt(&self, attempt: NewAttempt) -> Result<AttemptModel, AppError> {
        let round = self.get_round(attempt.round_id).await?;
        if round.student_id != attempt.student_id {
            return Err(AppError::Forbidden("Round belongs to another student".to_string()));
        }

        let attempt = attempt.into_model();
        self.rounds.append_attempt(&attempt).await?;

        debug!(correct = attempt.is_correct, "Attempt recorded");
        Ok(attempt)
    }

    pub async fn get_round(&self, round_id: Uuid) -> Result<RoundModel, AppError> {
        self.rounds
            .get_round(round_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Round not found".to_string()))
    }

    /// The round a student played immediately before this one, if any
    pub async fn previous_round(&self, round: &RoundModel) -> Result<Option<RoundModel>, AppError> {
        if round.round_index == 0 {
            return Ok(None);
        }
        self.rounds
            .find_round_by_index(round.student_id, round.round_index - 1)
            .await
    }

    /// Aggregates an open round's attempts, or reports it already closed
    #[instrument(skip(self))]
    pub async fn finalization_state(&self, round_id: Uuid) -> Result<FinalizationState, AppError> {
        let round = self.get_round(round_id).await?;
        if round.is_finalized() {
            return Ok(FinalizationState::Closed { round });
        }

        let attempts = self.rounds.list_attempts(round_id).await?;
        let aggregates = RoundAggregates::from_attempts(&attempts);
        debug!(
            attempts = attempts.len(),
            accuracy = aggregates.accuracy,
            "Round aggregated"
        );

        Ok(FinalizationState::Open { round, aggregates })
    }
}
