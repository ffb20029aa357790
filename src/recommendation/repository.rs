use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::models::{Direction, RecommendationModel, TeacherActionModel, TeacherActionView};
use crate::round::repository::{recommendation_from_row, RECOMMENDATION_COLUMNS};
use crate::shared::AppError;
use crate::storage::InMemoryDatabase;

#[async_trait]
pub trait TeacherActionRepository: Send + Sync {
    /// The student's recommendation from their highest round index
    async fn latest_recommendation(
        &self,
        student_id: Uuid,
    ) -> Result<Option<RecommendationModel>, AppError>;
    async fn record_action(&self, action: &TeacherActionModel) -> Result<(), AppError>;
    /// Oldest first
    async fn list_actions(&self, teacher_id: Uuid) -> Result<Vec<TeacherActionView>, AppError>;
}

pub struct InMemoryTeacherActionRepository {
    db: Arc<InMemoryDatabase>,
}

impl InMemoryTeacherActionRepository {
    pub fn new(db: Arc<InMemoryDatabase>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl TeacherActionRepository for InMemoryTeacherActionRepository {
    async fn latest_recommendation(
        &self,
        student_id: Uuid,
    ) -> Result<Option<RecommendationModel>, AppError> {
        let tables = self.db.tables()?;
        Ok(tables
            .recommendations
            .values()
            .filter(|rec| rec.student_id == student_id)
            .max_by_key(|rec| (rec.round_index, rec.created_at))
            .cloned())
    }

    async fn record_action(&self, action: &TeacherActionModel) -> Result<(), AppError> {
        let mut tables = self.db.tables()?;
        if !tables.recommendations.contains_key(&action.recommendation_id) {
            return Err(AppError::NotFound("Recommendation not found".to_string()));
        }
        tables.teacher_actions.push(action.clone());
        Ok(())
    }

    async fn list_actions(&self, teacher_id: Uuid) -> Result<Vec<TeacherActionView>, AppError> {
        let tables = self.db.tables()?;
        let mut views: Vec<TeacherActionView> = tables
            .teacher_actions
            .iter()
            .filter(|action| action.teacher_id == teacher_id)
            .filter_map(|action| {
                let student = tables.users.get(&action.student_id)?;
                let rec = tables.recommendations.get(&action.recommendation_id)?;
                Some(TeacherActionView {
                    student_username: student.username.clone(),
                    action: action.action,
                    recommendation_id: rec.id,
                    model_recommendation: rec.direction,
                    model_confidence: rec.confidence,
                    created_at: action.created_at,
                })
            })
            .collect();
        views.sort_by_key(|view| view.created_at);
        Ok(views)
    }
}

/// PostgreSQL implementation of the teacher action repository
pub struct PostgresTeacherActionRepository {
    pool: PgPool,
}

impl PostgresTeacherActionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn direction_column(text: &str) -> Result<Direction, AppError> {
    Direction::from_str(text)
        .map_err(|_| AppError::DatabaseError(format!("unknown direction {}", text)))
}

#[async_trait]
impl TeacherActionRepository for PostgresTeacherActionRepository {
    #[instrument(skip(self))]
    async fn latest_recommendation(
        &self,
        student_id: Uuid,
    ) -> Result<Option<RecommendationModel>, AppError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM recommendations WHERE student_id = $1 \
             ORDER BY round_index DESC, created_at DESC LIMIT 1",
            RECOMMENDATION_COLUMNS
        ))
        .bind(student_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(recommendation_from_row).transpose()
    }

    #[instrument(skip(self, action), fields(teacher_id = %action.teacher_id))]
    async fn record_action(&self, action: &TeacherActionModel) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO teacher_actions (id, teacher_id, student_id, recommendation_id, action, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(action.id)
        .bind(action.teacher_id)
        .bind(action.student_id)
        .bind(action.recommendation_id)
        .bind(action.action.as_ref())
        .bind(action.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                AppError::NotFound("Recommendation not found".to_string())
            }
            other => other.into(),
        })?;

        debug!(action = %action.action, "Teacher action stored");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_actions(&self, teacher_id: Uuid) -> Result<Vec<TeacherActionView>, AppError> {
        let rows = sqlx::query(
            "SELECT u.username, a.action, a.recommendation_id, r.direction, r.confidence, a.created_at \
             FROM teacher_actions a \
             JOIN users u ON u.id = a.student_id \
             JOIN recommendations r ON r.id = a.recommendation_id \
             WHERE a.teacher_id = $1 ORDER BY a.created_at",
        )
        .bind(teacher_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let action: String = row.get("action");
                let direction: String = row.get("direction");
                Ok(TeacherActionView {
                    student_username: row.get("username"),
                    action: direction_column(&action)?,
                    recommendation_id: row.get("recommendation_id"),
                    model_recommendation: direction_column(&direction)?,
                    model_confidence: row.get("confidence"),
                    created_at: row.get("created_at"),
                })
            })
            .collect()
    }
}
