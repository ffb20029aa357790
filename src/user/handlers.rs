use axum::{
    extract::{Path, State},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use super::models::StudentStats;
use crate::auth::{require_teacher, Principal};
use crate::shared::{AppError, AppState};

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct StatsResponse {
    pub student: String,
    pub user_id: Uuid,
    pub level: i16,
    pub total_attempts: i64,
    pub overall_accuracy: f64,
    pub xp: i64,
}

impl StatsResponse {
    fn new(student: String, user_id: Uuid, level: i16, stats: Option<StudentStats>) -> Self {
        let stats = stats.unwrap_or_else(|| StudentStats::empty(user_id));
        Self {
            student,
            user_id,
            level,
            total_attempts: stats.total_attempts,
            overall_accuracy: stats.overall_accuracy,
            xp: stats.xp,
        }
    }
}

/// GET /stats/me
#[instrument(name = "my_stats", skip(state, principal), fields(user_id = %principal.user_id))]
pub async fn my_stats(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<StatsResponse>, AppError> {
    let user = state
        .users
        .get_user(principal.user_id)
        .await?
        .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;
    let stats = state.users.get_stats(user.id).await?;

    Ok(Json(StatsResponse::new(
        user.username,
        user.id,
        user.difficulty,
        stats,
    )))
}

/// GET /stats/:username (teachers only)
#[instrument(name = "student_stats", skip(state, principal))]
pub async fn student_stats(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(username): Path<String>,
) -> Result<Json<StatsResponse>, AppError> {
    require_teacher(&principal)?;

    let user = state
        .users
        .get_user_by_username(&username)
        .await?
        .filter(|user| user.role == crate::auth::Role::Student)
        .ok_or_else(|| AppError::NotFound("Student not found".to_string()))?;
    let stats = state.users.get_stats(user.id).await?;

    info!(student = %user.username, "Teacher fetched student stats");

    Ok(Json(StatsResponse::new(
        user.username,
        user.id,
        user.difficulty,
        stats,
    )))
}
