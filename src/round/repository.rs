use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::models::{AttemptModel, RoundAggregates, RoundModel};
use crate::recommendation::models::{Direction, RecommendationModel};
use crate::shared::AppError;
use crate::storage::InMemoryDatabase;
use crate::user::models::StudentStats;

/// Ground truth for an earlier recommendation
#[derive(Debug, Clone, PartialEq)]
pub struct DelayedLabel {
    pub recommendation_id: Uuid,
    pub true_label: Direction,
}

/// Everything a round finalization writes, applied as one unit
#[derive(Debug, Clone)]
pub struct FinalizationCommit {
    pub round_id: Uuid,
    pub student_id: Uuid,
    pub ended_at: DateTime<Utc>,
    pub aggregates: RoundAggregates,
    pub round_attempts: i64,
    pub recommendation: RecommendationModel,
    pub delayed_label: Option<DelayedLabel>,
    pub new_tier: i16,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    Committed {
        stats: StudentStats,
        xp_gained: i64,
        /// False when the delayed label was already written by someone else
        labeled_previous: bool,
    },
    /// The round had already been closed, nothing was written
    AlreadyFinalized,
    /// Answers arrived after the aggregates were taken, nothing was written
    AttemptsChanged { recorded: usize },
}

#[async_trait]
pub trait RoundRepository: Send + Sync {
    async fn create_round(&self, round: &RoundModel, question_ids: &[Uuid]) -> Result<(), AppError>;
    async fn get_round(&self, round_id: Uuid) -> Result<Option<RoundModel>, AppError>;
    async fn max_round_index(&self, student_id: Uuid) -> Result<Option<i32>, AppError>;
    async fn find_round_by_index(
        &self,
        student_id: Uuid,
        round_index: i32,
    ) -> Result<Option<RoundModel>, AppError>;
    async fn latest_round_in_game(
        &self,
        student_id: Uuid,
        game_id: Uuid,
    ) -> Result<Option<RoundModel>, AppError>;

    /// Appends to an open round. `NotFound` for an unknown round, `Conflict` once closed.
    async fn append_attempt(&self, attempt: &AttemptModel) -> Result<(), AppError>;
    async fn list_attempts(&self, round_id: Uuid) -> Result<Vec<AttemptModel>, AppError>;
    async fn get_recommendation_for_round(
        &self,
        round_id: Uuid,
    ) -> Result<Option<RecommendationModel>, AppError>;

    /// Closes the round, labels the previous recommendation if still unlabeled,
    /// stores the new recommendation, writes the tier and folds the round into stats.
    /// Either all of it happens or none of it. Nothing is written unless the round
    /// still holds exactly `aggregates.attempt_count` attempts; appends to the round
    /// are excluded while this runs.
    async fn commit_finalization(
        &self,
        commit: &FinalizationCommit,
    ) -> Result<CommitOutcome, AppError>;
}

pub struct InMemoryRoundRepository {
    db: Arc<InMemoryDatabase>,
}

impl InMemoryRoundRepository {
    pub fn new(db: Arc<InMemoryDatabase>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl RoundRepository for InMemoryRoundRepository {
    async fn create_round(&self, round: &RoundModel, question_ids: &[Uuid]) -> Result<(), AppError> {
        let mut tables = self.db.tables()?;
        if tables
            .rounds
            .values()
            .any(|r| r.student_id == round.student_id && r.round_index == round.round_index)
        {
            return Err(AppError::Conflict("Round index already taken".to_string()));
        }
        tables.rounds.insert(round.id, round.clone());
        tables.round_questions.insert(round.id, question_ids.to_vec());
        Ok(())
    }

    async fn get_round(&self, round_id: Uuid) -> Result<Option<RoundModel>, AppError> {
        Ok(self.db.tables()?.rounds.get(&round_id).cloned())
    }

    async fn max_round_index(&self, student_id: Uuid) -> Result<Option<i32>, AppError> {
        let tables = self.db.tables()?;
        Ok(tables
            .rounds
            .values()
            .filter(|r| r.student_id == student_id)
            .map(|r| r.round_index)
            .max())
    }

    async fn find_round_by_index(
        &self,
        student_id: Uuid,
        round_index: i32,
    ) -> Result<Option<RoundModel>, AppError> {
        let tables = self.db.tables()?;
        Ok(tables
            .rounds
            .values()
            .find(|r| r.student_id == student_id && r.round_index == round_index)
            .cloned())
    }

    async fn latest_round_in_game(
        &self,
        student_id: Uuid,
        game_id: Uuid,
    ) -> Result<Option<RoundModel>, AppError> {
        let tables = self.db.tables()?;
        Ok(tables
            .rounds
            .values()
            .filter(|r| r.student_id == student_id && r.game_id == Some(game_id))
            .max_by_key(|r| r.round_index)
            .cloned())
    }

    async fn append_attempt(&self, attempt: &AttemptModel) -> Result<(), AppError> {
        let mut tables = self.db.tables()?;
        match tables.rounds.get(&attempt.round_id) {
            None => return Err(AppError::NotFound("Round not found".to_string())),
            Some(round) if round.is_finalized() => {
                return Err(AppError::Conflict("Round already finished".to_string()))
            }
            Some(_) => {}
        }
        tables.attempts.push(attempt.clone());
        Ok(())
    }

    async fn list_attempts(&self, round_id: Uuid) -> Result<Vec<AttemptModel>, AppError> {
        let tables = self.db.tables()?;
        Ok(tables
            .attempts
            .iter()
            .filter(|a| a.round_id == round_id)
            .cloned()
            .collect())
    }

    async fn get_recommendation_for_round(
        &self,
        round_id: Uuid,
    ) -> Result<Option<RecommendationModel>, AppError> {
        let tables = self.db.tables()?;
        Ok(tables
            .recommendations
            .values()
            .find(|r| r.round_id == round_id)
            .cloned())
    }

    #[instrument(skip(self, commit), fields(round_id = %commit.round_id))]
    async fn commit_finalization(
        &self,
        commit: &FinalizationCommit,
    ) -> Result<CommitOutcome, AppError> {
        let mut tables = self.db.tables()?;

        // All checks first, so a failed commit leaves nothing behind
        match tables.rounds.get(&commit.round_id) {
            None => return Err(AppError::NotFound("Round not found".to_string())),
            Some(round) if round.is_finalized() => return Ok(CommitOutcome::AlreadyFinalized),
            Some(_) => {}
        }
        if !tables.users.contains_key(&commit.student_id) {
            return Err(AppError::NotFound("User not found".to_string()));
        }
        let recorded = tables
            .attempts
            .iter()
            .filter(|a| a.round_id == commit.round_id)
            .count();
        if recorded != commit.aggregates.attempt_count {
            debug!(
                recorded,
                aggregated = commit.aggregates.attempt_count,
                "Round gained attempts during finalization"
            );
            return Ok(CommitOutcome::AttemptsChanged { recorded });
        }
        let labeled_previous = commit
            .delayed_label
            .as_ref()
            .and_then(|label| tables.recommendations.get(&label.recommendation_id))
            .is_some_and(|rec| !rec.is_labeled());

        if let Some(round) = tables.rounds.get_mut(&commit.round_id) {
            round.end_ts = Some(commit.ended_at);
            round.accuracy = Some(commit.aggregates.accuracy);
            round.avg_time_secs = Some(commit.aggregates.avg_time_secs);
            round.hint_rate = Some(commit.aggregates.hint_rate);
        }

        if let (true, Some(label)) = (labeled_previous, commit.delayed_label.as_ref()) {
            if let Some(previous) = tables.recommendations.get_mut(&label.recommendation_id) {
                previous.true_label = Some(label.true_label);
                previous.labeled_at = Some(commit.ended_at);
            }
        }

        tables
            .recommendations
            .insert(commit.recommendation.id, commit.recommendation.clone());

        if let Some(user) = tables.users.get_mut(&commit.student_id) {
            user.difficulty = commit.new_tier;
        }

        let stats = tables
            .stats
            .entry(commit.student_id)
            .or_insert_with(|| StudentStats::empty(commit.student_id));
        let xp_gained = stats.incorporate(commit.round_attempts, commit.aggregates.accuracy);

        Ok(CommitOutcome::Committed {
            stats: stats.clone(),
            xp_gained,
            labeled_previous,
        })
    }
}

/// PostgreSQL implementation of the round repository
pub struct PostgresRoundRepository {
    pool: PgPool,
}

impl PostgresRoundRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const ROUND_COLUMNS: &str = "id, student_id, game_id, topic_id, round_index, question_count, \
                             start_ts, end_ts, accuracy, avg_time_secs, hint_rate";
pub(crate) const RECOMMENDATION_COLUMNS: &str = "id, round_id, student_id, direction, confidence, \
                                      prev_tier, new_tier, round_index, true_label, labeled_at, created_at";

fn round_from_row(row: &PgRow) -> RoundModel {
    RoundModel {
        id: row.get("id"),
        student_id: row.get("student_id"),
        game_id: row.get("game_id"),
        topic_id: row.get("topic_id"),
        round_index: row.get("round_index"),
        question_count: row.get("question_count"),
        start_ts: row.get("start_ts"),
        end_ts: row.get("end_ts"),
        accuracy: row.get("accuracy"),
        avg_time_secs: row.get("avg_time_secs"),
        hint_rate: row.get("hint_rate"),
    }
}

fn attempt_from_row(row: &PgRow) -> AttemptModel {
    AttemptModel {
        id: row.get("id"),
        round_id: row.get("round_id"),
        student_id: row.get("student_id"),
        question_id: row.get("question_id"),
        is_correct: row.get("is_correct"),
        num_attempts: row.get("num_attempts"),
        time_spent_secs: row.get("time_spent_secs"),
        hints_used: row.get("hints_used"),
        created_at: row.get("created_at"),
    }
}

fn direction_from_text(text: &str) -> Result<Direction, AppError> {
    Direction::from_str(text)
        .map_err(|_| AppError::DatabaseError(format!("unknown direction {}", text)))
}

pub(crate) fn recommendation_from_row(row: &PgRow) -> Result<RecommendationModel, AppError> {
    let direction: String = row.get("direction");
    let true_label: Option<String> = row.get("true_label");
    Ok(RecommendationModel {
        id: row.get("id"),
        round_id: row.get("round_id"),
        student_id: row.get("student_id"),
        direction: direction_from_text(&direction)?,
        confidence: row.get("confidence"),
        prev_tier: row.get("prev_tier"),
        new_tier: row.get("new_tier"),
        round_index: row.get("round_index"),
        true_label: true_label.as_deref().map(direction_from_text).transpose()?,
        labeled_at: row.get("labeled_at"),
        created_at: row.get("created_at"),
    })
}

#[async_trait]
impl RoundRepository for PostgresRoundRepository {
    #[instrument(skip(self, round, question_ids), fields(round_id = %round.id))]
    async fn create_round(&self, round: &RoundModel, question_ids: &[Uuid]) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO rounds (id, student_id, game_id, topic_id, round_index, question_count, start_ts) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(round.id)
        .bind(round.student_id)
        .bind(round.game_id)
        .bind(round.topic_id)
        .bind(round.round_index)
        .bind(round.question_count)
        .bind(round.start_ts)
        .execute(&mut *tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                AppError::Conflict("Round index already taken".to_string())
            }
            other => other.into(),
        })?;

        for (position, question_id) in question_ids.iter().enumerate() {
            sqlx::query(
                "INSERT INTO round_questions (round_id, question_id, position) VALUES ($1, $2, $3)",
            )
            .bind(round.id)
            .bind(question_id)
            .bind(position as i32)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(questions = question_ids.len(), "Round persisted");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_round(&self, round_id: Uuid) -> Result<Option<RoundModel>, AppError> {
        let row = sqlx::query(&format!("SELECT {} FROM rounds WHERE id = $1", ROUND_COLUMNS))
            .bind(round_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(round_from_row))
    }

    #[instrument(skip(self))]
    async fn max_round_index(&self, student_id: Uuid) -> Result<Option<i32>, AppError> {
        let row = sqlx::query("SELECT MAX(round_index) AS max_index FROM rounds WHERE student_id = $1")
            .bind(student_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.get("max_index"))
    }

    #[instrument(skip(self))]
    async fn find_round_by_index(
        &self,
        student_id: Uuid,
        round_index: i32,
    ) -> Result<Option<RoundModel>, AppError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM rounds WHERE student_id = $1 AND round_index = $2",
            ROUND_COLUMNS
        ))
        .bind(student_id)
        .bind(round_index)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(round_from_row))
    }

    #[instrument(skip(self))]
    async fn latest_round_in_game(
        &self,
        student_id: Uuid,
        game_id: Uuid,
    ) -> Result<Option<RoundModel>, AppError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM rounds WHERE student_id = $1 AND game_id = $2 \
             ORDER BY round_index DESC LIMIT 1",
            ROUND_COLUMNS
        ))
        .bind(student_id)
        .bind(game_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(round_from_row))
    }

    #[instrument(skip(self, attempt), fields(round_id = %attempt.round_id))]
    async fn append_attempt(&self, attempt: &AttemptModel) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        // Shares the row lock that finalization takes exclusively
        let round = sqlx::query("SELECT end_ts FROM rounds WHERE id = $1 FOR SHARE")
            .bind(attempt.round_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(round) = round else {
            tx.rollback().await?;
            return Err(AppError::NotFound("Round not found".to_string()));
        };
        let end_ts: Option<DateTime<Utc>> = round.get("end_ts");
        if end_ts.is_some() {
            tx.rollback().await?;
            return Err(AppError::Conflict("Round already finished".to_string()));
        }

        sqlx::query(
            "INSERT INTO attempts (id, round_id, student_id, question_id, is_correct, num_attempts, \
             time_spent_secs, hints_used, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(attempt.id)
        .bind(attempt.round_id)
        .bind(attempt.student_id)
        .bind(attempt.question_id)
        .bind(attempt.is_correct)
        .bind(attempt.num_attempts)
        .bind(attempt.time_spent_secs)
        .bind(attempt.hints_used)
        .bind(attempt.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_attempts(&self, round_id: Uuid) -> Result<Vec<AttemptModel>, AppError> {
        let rows = sqlx::query(
            "SELECT id, round_id, student_id, question_id, is_correct, num_attempts, \
             time_spent_secs, hints_used, created_at FROM attempts WHERE round_id = $1 ORDER BY created_at",
        )
        .bind(round_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(attempt_from_row).collect())
    }

    #[instrument(skip(self))]
    async fn get_recommendation_for_round(
        &self,
        round_id: Uuid,
    ) -> Result<Option<RecommendationModel>, AppError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM recommendations WHERE round_id = $1",
            RECOMMENDATION_COLUMNS
        ))
        .bind(round_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(recommendation_from_row).transpose()
    }

    #[instrument(skip(self, commit), fields(round_id = %commit.round_id))]
    async fn commit_finalization(
        &self,
        commit: &FinalizationCommit,
    ) -> Result<CommitOutcome, AppError> {
        let mut tx = self.pool.begin().await?;

        let closed = sqlx::query(
            "UPDATE rounds SET end_ts = $2, accuracy = $3, avg_time_secs = $4, hint_rate = $5 \
             WHERE id = $1 AND end_ts IS NULL",
        )
        .bind(commit.round_id)
        .bind(commit.ended_at)
        .bind(commit.aggregates.accuracy)
        .bind(commit.aggregates.avg_time_secs)
        .bind(commit.aggregates.hint_rate)
        .execute(&mut *tx)
        .await?;

        if closed.rows_affected() == 0 {
            tx.rollback().await?;
            return match self.get_round(commit.round_id).await? {
                Some(_) => Ok(CommitOutcome::AlreadyFinalized),
                None => Err(AppError::NotFound("Round not found".to_string())),
            };
        }

        // The update holds the row lock, so no append can slip in after this count
        let recorded: i64 = sqlx::query("SELECT COUNT(*) AS recorded FROM attempts WHERE round_id = $1")
            .bind(commit.round_id)
            .fetch_one(&mut *tx)
            .await?
            .get("recorded");
        let recorded = recorded as usize;
        if recorded != commit.aggregates.attempt_count {
            tx.rollback().await?;
            debug!(
                recorded,
                aggregated = commit.aggregates.attempt_count,
                "Round gained attempts during finalization"
            );
            return Ok(CommitOutcome::AttemptsChanged { recorded });
        }

        let labeled_previous = match &commit.delayed_label {
            Some(label) => {
                sqlx::query(
                    "UPDATE recommendations SET true_label = $2, labeled_at = $3 \
                     WHERE id = $1 AND true_label IS NULL",
                )
                .bind(label.recommendation_id)
                .bind(label.true_label.as_ref())
                .bind(commit.ended_at)
                .execute(&mut *tx)
                .await?
                .rows_affected()
                    == 1
            }
            None => false,
        };

        let rec = &commit.recommendation;
        sqlx::query(&format!(
            "INSERT INTO recommendations ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NULL, NULL, $9)",
            RECOMMENDATION_COLUMNS
        ))
        .bind(rec.id)
        .bind(rec.round_id)
        .bind(rec.student_id)
        .bind(rec.direction.as_ref())
        .bind(rec.confidence)
        .bind(rec.prev_tier)
        .bind(rec.new_tier)
        .bind(rec.round_index)
        .bind(rec.created_at)
        .execute(&mut *tx)
        .await?;

        let updated = sqlx::query("UPDATE users SET difficulty = $2 WHERE id = $1")
            .bind(commit.student_id)
            .bind(commit.new_tier)
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() == 0 {
            warn!(student_id = %commit.student_id, "Finalizing round for unknown user");
            tx.rollback().await?;
            return Err(AppError::NotFound("User not found".to_string()));
        }

        let existing = sqlx::query(
            "SELECT user_id, total_attempts, overall_accuracy, xp FROM student_stats \
             WHERE user_id = $1 FOR UPDATE",
        )
        .bind(commit.student_id)
        .fetch_optional(&mut *tx)
        .await?;
        let mut stats = existing
            .as_ref()
            .map(crate::user::repository::stats_from_row)
            .unwrap_or_else(|| StudentStats::empty(commit.student_id));
        let xp_gained = stats.incorporate(commit.round_attempts, commit.aggregates.accuracy);

        sqlx::query(
            "INSERT INTO student_stats (user_id, total_attempts, overall_accuracy, xp) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (user_id) DO UPDATE SET total_attempts = EXCLUDED.total_attempts, \
             overall_accuracy = EXCLUDED.overall_accuracy, xp = EXCLUDED.xp",
        )
        .bind(stats.user_id)
        .bind(stats.total_attempts)
        .bind(stats.overall_accuracy)
        .bind(stats.xp)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(xp_gained, labeled_previous, "Round finalization committed");

        Ok(CommitOutcome::Committed {
            stats,
            xp_gained,
            labeled_previous,
        })
    }
}
