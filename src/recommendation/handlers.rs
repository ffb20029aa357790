use axum::{extract::State, Extension, Json};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use super::models::{Direction, Features, TeacherActionModel, TeacherActionView};
use crate::auth::{require_teacher, Principal, Role};
use crate::shared::{AppError, AppState};

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct FeaturesRequest {
    pub accuracy: f64,
    pub avg_time: f64,
    pub hints: f64,
}

impl From<FeaturesRequest> for Features {
    fn from(request: FeaturesRequest) -> Self {
        Features {
            accuracy: request.accuracy,
            avg_time_secs: request.avg_time,
            hint_rate: request.hints,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct Probabilities {
    pub down: f64,
    pub same: f64,
    pub up: f64,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct PredictResponse {
    pub label: usize,
    pub direction: Direction,
    pub probabilities: Probabilities,
}

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    #[serde(flatten)]
    pub features: FeaturesRequest,
    pub true_label: usize,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct FeedbackResponse {
    pub status: String,
    pub updates: u64,
}

/// POST /difficulty/predict
#[instrument(name = "predict_difficulty", skip(state))]
pub async fn predict(
    State(state): State<AppState>,
    Json(request): Json<FeaturesRequest>,
) -> Result<Json<PredictResponse>, AppError> {
    let prediction = state.oracle.predict(&request.into()).await?;
    let [down, same, up] = prediction.probabilities;

    Ok(Json(PredictResponse {
        label: prediction.label.label(),
        direction: prediction.label,
        probabilities: Probabilities { down, same, up },
    }))
}

/// POST /difficulty/feedback (teachers only)
/// Teaches the model one labeled example at real-sample weight
#[instrument(name = "difficulty_feedback", skip(state, principal))]
pub async fn feedback(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(request): Json<FeedbackRequest>,
) -> Result<Json<FeedbackResponse>, AppError> {
    require_teacher(&principal)?;

    let label = Direction::from_label(request.true_label)
        .ok_or_else(|| AppError::BadRequest("true_label must be 0, 1 or 2".to_string()))?;

    state
        .oracle
        .learn(
            &request.features.into(),
            label,
            state.config.real_sample_weight,
        )
        .await?;

    let updates = state.oracle.updates().await;
    info!(label = %label, updates, "Manual feedback applied");

    Ok(Json(FeedbackResponse {
        status: "ok".to_string(),
        updates,
    }))
}

#[derive(Debug, Deserialize, Serialize)]
pub struct OverrideRequest {
    pub student_username: String,
    pub action: Direction,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct OverrideResponse {
    pub message: String,
    pub action: Direction,
    pub recommendation_id: Uuid,
}

/// POST /override (teachers only)
/// Records the teacher's verdict against the student's newest recommendation
#[instrument(name = "override_recommendation", skip(state, principal), fields(teacher_id = %principal.user_id))]
pub async fn override_recommendation(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(request): Json<OverrideRequest>,
) -> Result<Json<OverrideResponse>, AppError> {
    require_teacher(&principal)?;

    let student = state
        .users
        .get_user_by_username(&request.student_username)
        .await?
        .filter(|user| user.role == Role::Student)
        .ok_or_else(|| AppError::NotFound("Student not found".to_string()))?;
    let recommendation = state
        .teacher_actions
        .latest_recommendation(student.id)
        .await?
        .ok_or_else(|| AppError::NotFound("No recommendation for this student".to_string()))?;

    let action = TeacherActionModel::new(principal.user_id, &recommendation, request.action);
    state.teacher_actions.record_action(&action).await?;

    info!(
        student = %student.username,
        action = %action.action,
        model = %recommendation.direction,
        "Teacher overrode recommendation"
    );

    Ok(Json(OverrideResponse {
        message: "Action passed".to_string(),
        action: action.action,
        recommendation_id: recommendation.id,
    }))
}

/// GET /actions (teachers only)
/// NotFound when the teacher has recorded nothing yet
#[instrument(name = "list_actions", skip(state, principal), fields(teacher_id = %principal.user_id))]
pub async fn list_actions(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<Vec<TeacherActionView>>, AppError> {
    require_teacher(&principal)?;

    let actions = state.teacher_actions.list_actions(principal.user_id).await?;
    if actions.is_empty() {
        return Err(AppError::NotFound("No actions recorded".to_string()));
    }
    Ok(Json(actions))
}
