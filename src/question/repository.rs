use async_trait::async_trait;
use rand::seq::IndexedRandom;
use sqlx::{postgres::PgRow, PgPool, Row};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::models::{AnswerPayload, QuestionKind, QuestionModel, TopicModel};
use crate::shared::AppError;
use crate::storage::InMemoryDatabase;

#[async_trait]
pub trait QuestionRepository: Send + Sync {
    async fn list_topics(&self) -> Result<Vec<TopicModel>, AppError>;
    async fn get_topic(&self, topic_id: Uuid) -> Result<Option<TopicModel>, AppError>;
    /// Uniform sample without replacement of up to `count` questions of exactly
    /// `difficulty` within the topic
    async fn sample_questions(
        &self,
        topic_id: Uuid,
        difficulty: i16,
        count: usize,
    ) -> Result<Vec<QuestionModel>, AppError>;
}

pub struct InMemoryQuestionRepository {
    db: Arc<InMemoryDatabase>,
}

impl InMemoryQuestionRepository {
    pub fn new(db: Arc<InMemoryDatabase>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl QuestionRepository for InMemoryQuestionRepository {
    async fn list_topics(&self) -> Result<Vec<TopicModel>, AppError> {
        let mut topics: Vec<TopicModel> = self.db.tables()?.topics.values().cloned().collect();
        topics.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(topics)
    }

    async fn get_topic(&self, topic_id: Uuid) -> Result<Option<TopicModel>, AppError> {
        Ok(self.db.tables()?.topics.get(&topic_id).cloned())
    }

    async fn sample_questions(
        &self,
        topic_id: Uuid,
        difficulty: i16,
        count: usize,
    ) -> Result<Vec<QuestionModel>, AppError> {
        let tables = self.db.tables()?;
        let pool: Vec<&QuestionModel> = tables
            .questions
            .values()
            .filter(|q| q.topic_id == topic_id && q.difficulty == difficulty)
            .collect();

        let mut rng = rand::rng();
        Ok(pool
            .choose_multiple(&mut rng, count)
            .map(|q| (*q).clone())
            .collect())
    }
}

/// PostgreSQL implementation of the question repository
pub struct PostgresQuestionRepository {
    pool: PgPool,
}

impl PostgresQuestionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn question_from_row(row: &PgRow) -> Result<QuestionModel, AppError> {
    let kind: String = row.get("kind");
    let kind = QuestionKind::from_str(&kind)
        .map_err(|_| AppError::DatabaseError(format!("unknown question kind {}", kind)))?;
    let correct_answer: String = row.get("correct_answer");

    let answer = match kind {
        QuestionKind::Num => AnswerPayload::Numeric {
            correct_answer: correct_answer.trim().parse().map_err(|_| {
                AppError::DatabaseError(format!("non-numeric answer {}", correct_answer))
            })?,
        },
        QuestionKind::Mcq => AnswerPayload::MultipleChoice {
            option_a: row.get::<Option<String>, _>("option_a").unwrap_or_default(),
            option_b: row.get::<Option<String>, _>("option_b").unwrap_or_default(),
            option_c: row.get("option_c"),
            correct_answer,
        },
        QuestionKind::Wri => AnswerPayload::FreeText { correct_answer },
    };

    Ok(QuestionModel {
        id: row.get("id"),
        topic_id: row.get("topic_id"),
        text: row.get("text"),
        difficulty: row.get("difficulty"),
        answer,
    })
}

#[async_trait]
impl QuestionRepository for PostgresQuestionRepository {
    #[instrument(skip(self))]
    async fn list_topics(&self) -> Result<Vec<TopicModel>, AppError> {
        let rows = sqlx::query("SELECT id, name FROM topics ORDER BY name")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .map(|row| TopicModel {
                id: row.get("id"),
                name: row.get("name"),
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn get_topic(&self, topic_id: Uuid) -> Result<Option<TopicModel>, AppError> {
        let row = sqlx::query("SELECT id, name FROM topics WHERE id = $1")
            .bind(topic_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| TopicModel {
            id: row.get("id"),
            name: row.get("name"),
        }))
    }

    #[instrument(skip(self))]
    async fn sample_questions(
        &self,
        topic_id: Uuid,
        difficulty: i16,
        count: usize,
    ) -> Result<Vec<QuestionModel>, AppError> {
        let rows = sqlx::query(
            "SELECT id, topic_id, text, difficulty, kind, correct_answer, option_a, option_b, option_c \
             FROM questions WHERE topic_id = $1 AND difficulty = $2 ORDER BY random() LIMIT $3",
        )
        .bind(topic_id)
        .bind(difficulty)
        .bind(count as i64)
        .fetch_all(&self.pool)
        .await?;

        debug!(sampled = rows.len(), "Sampled questions");
        rows.iter().map(question_from_row).collect()
    }
}
