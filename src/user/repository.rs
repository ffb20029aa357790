use async_trait::async_trait;
use sqlx::{postgres::PgRow, PgPool, Row};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::models::{StudentStats, UserModel};
use crate::auth::Role;
use crate::shared::AppError;
use crate::storage::InMemoryDatabase;

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn get_user(&self, id: Uuid) -> Result<Option<UserModel>, AppError>;
    async fn get_user_by_username(&self, username: &str) -> Result<Option<UserModel>, AppError>;
    async fn get_users(&self, ids: &[Uuid]) -> Result<Vec<UserModel>, AppError>;
    async fn get_stats(&self, user_id: Uuid) -> Result<Option<StudentStats>, AppError>;
    async fn get_stats_for(&self, user_ids: &[Uuid]) -> Result<Vec<StudentStats>, AppError>;
}

pub struct InMemoryUserRepository {
    db: Arc<InMemoryDatabase>,
}

impl InMemoryUserRepository {
    pub fn new(db: Arc<InMemoryDatabase>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn get_user(&self, id: Uuid) -> Result<Option<UserModel>, AppError> {
        Ok(self.db.tables()?.users.get(&id).cloned())
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<UserModel>, AppError> {
        let tables = self.db.tables()?;
        Ok(tables
            .users
            .values()
            .find(|user| user.username == username)
            .cloned())
    }

    async fn get_users(&self, ids: &[Uuid]) -> Result<Vec<UserModel>, AppError> {
        let tables = self.db.tables()?;
        Ok(ids
            .iter()
            .filter_map(|id| tables.users.get(id).cloned())
            .collect())
    }

    async fn get_stats(&self, user_id: Uuid) -> Result<Option<StudentStats>, AppError> {
        Ok(self.db.tables()?.stats.get(&user_id).cloned())
    }

    async fn get_stats_for(&self, user_ids: &[Uuid]) -> Result<Vec<StudentStats>, AppError> {
        let tables = self.db.tables()?;
        Ok(user_ids
            .iter()
            .filter_map(|id| tables.stats.get(id).cloned())
            .collect())
    }
}

/// PostgreSQL implementation of the user repository
pub struct PostgresUserRepository {
    pool: PgPool,
}

impl PostgresUserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

pub(crate) fn user_from_row(row: &PgRow) -> Result<UserModel, AppError> {
    let role: String = row.get("role");
    Ok(UserModel {
        id: row.get("id"),
        username: row.get("username"),
        role: Role::from_str(&role)
            .map_err(|_| AppError::DatabaseError(format!("unknown role {}", role)))?,
        difficulty: row.get("difficulty"),
        created_at: row.get("created_at"),
    })
}

pub(crate) fn stats_from_row(row: &PgRow) -> StudentStats {
    StudentStats {
        user_id: row.get("user_id"),
        total_attempts: row.get("total_attempts"),
        overall_accuracy: row.get("overall_accuracy"),
        xp: row.get("xp"),
    }
}

#[async_trait]
impl UserRepository for PostgresUserRepository {
    #[instrument(skip(self))]
    async fn get_user(&self, id: Uuid) -> Result<Option<UserModel>, AppError> {
        let row = sqlx::query(
            "SELECT id, username, role, difficulty, created_at FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            warn!(error = %e, user_id = %id, "Failed to fetch user from database");
            AppError::from(e)
        })?;

        row.as_ref().map(user_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn get_user_by_username(&self, username: &str) -> Result<Option<UserModel>, AppError> {
        let row = sqlx::query(
            "SELECT id, username, role, difficulty, created_at FROM users WHERE username = $1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(user_from_row).transpose()
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn get_users(&self, ids: &[Uuid]) -> Result<Vec<UserModel>, AppError> {
        let rows = sqlx::query(
            "SELECT id, username, role, difficulty, created_at FROM users WHERE id = ANY($1)",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(user_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn get_stats(&self, user_id: Uuid) -> Result<Option<StudentStats>, AppError> {
        let row = sqlx::query(
            "SELECT user_id, total_attempts, overall_accuracy, xp FROM student_stats WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        debug!(found = row.is_some(), "Fetched student stats");
        Ok(row.as_ref().map(stats_from_row))
    }

    #[instrument(skip(self, user_ids), fields(count = user_ids.len()))]
    async fn get_stats_for(&self, user_ids: &[Uuid]) -> Result<Vec<StudentStats>, AppError> {
        let rows = sqlx::query(
            "SELECT user_id, total_attempts, overall_accuracy, xp FROM student_stats WHERE user_id = ANY($1)",
        )
        .bind(user_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(stats_from_row).collect())
    }
}
