use axum::{extract::State, Json};
use tracing::{info, instrument};

use super::models::TopicModel;
use crate::shared::{AppError, AppState};

/// GET /topics
#[instrument(name = "list_topics", skip(state))]
pub async fn list_topics(State(state): State<AppState>) -> Result<Json<Vec<TopicModel>>, AppError> {
    let topics = state.questions.list_topics().await?;
    info!(topic_count = topics.len(), "Topics listed");
    Ok(Json(topics))
}
