use axum::{extract::State, Extension, Json};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use super::models::{GameModel, GameStatus};
use crate::auth::Principal;
use crate::shared::{AppError, AppState};

#[derive(Debug, Default, Deserialize)]
pub struct CreateGameRequest {
    #[serde(default)]
    pub topic_id: Option<Uuid>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct GameResponse {
    pub game_id: Uuid,
    pub game_code: String,
    pub status: GameStatus,
    pub topic_id: Option<Uuid>,
}

impl From<GameModel> for GameResponse {
    fn from(game: GameModel) -> Self {
        Self {
            game_id: game.id,
            game_code: game.game_code,
            status: game.status,
            topic_id: game.topic_id,
        }
    }
}

/// POST /games (teachers only)
/// Returns the new game with its join code
#[instrument(name = "create_game", skip(state, principal, request), fields(teacher_id = %principal.user_id))]
pub async fn create_game(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    request: Option<Json<CreateGameRequest>>,
) -> Result<Json<GameResponse>, AppError> {
    let request = request.map(|Json(r)| r).unwrap_or_default();

    let game = state
        .session_manager
        .create_game(&principal, request.topic_id)
        .await?;

    info!(game_id = %game.id, game_code = %game.game_code, "Game created");
    Ok(Json(game.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::test_utils::AppStateBuilder;
    use crate::storage::InMemoryDatabase;
    use crate::user::models::UserModel;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
        routing::post,
        Router,
    };
    use tower::ServiceExt; // for `oneshot`

    fn app(db: std::sync::Arc<InMemoryDatabase>, user: &UserModel) -> Router {
        let principal = Principal {
            user_id: user.id,
            role: user.role,
            username: user.username.clone(),
        };
        Router::new()
            .route("/games", post(create_game))
            .layer(Extension(principal))
            .with_state(AppStateBuilder::new().with_database(db).build())
    }

    #[tokio::test]
    async fn test_teacher_creates_lobby_game() {
        let db = InMemoryDatabase::new();
        let teacher = UserModel::teacher("frizzle");
        db.insert_user(teacher.clone()).unwrap();

        let response = app(db, &teacher)
            .oneshot(
                Request::post("/games")
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let game: GameResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(game.status, GameStatus::Lobby);
        assert_eq!(game.game_code.len(), 4);
    }

    #[tokio::test]
    async fn test_student_cannot_create_game() {
        let db = InMemoryDatabase::new();
        let student = UserModel::student("alice");
        db.insert_user(student.clone()).unwrap();

        let response = app(db, &student)
            .oneshot(Request::post("/games").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_unknown_topic_is_not_found() {
        let db = InMemoryDatabase::new();
        let teacher = UserModel::teacher("frizzle");
        db.insert_user(teacher.clone()).unwrap();

        let body = serde_json::json!({ "topic_id": Uuid::new_v4() }).to_string();
        let response = app(db, &teacher)
            .oneshot(
                Request::post("/games")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
