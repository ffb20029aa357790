use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::jwt_auth;
use crate::game::create_game;
use crate::question::list_topics;
use crate::recommendation::{feedback, list_actions, override_recommendation, predict};
use crate::shared::AppState;
use crate::user::{my_stats, student_stats};
use crate::websockets::websocket_handler;

/// All HTTP and WebSocket routes. Everything but `/`, `/health` and `/ws`
/// needs a bearer token; `/ws` authenticates during the upgrade.
pub fn router(app_state: AppState) -> Router {
    let protected = Router::new()
        .route("/games", post(create_game))
        .route("/topics", get(list_topics))
        .route("/stats/me", get(my_stats))
        .route("/stats/:username", get(student_stats))
        .route("/difficulty/predict", post(predict))
        .route("/difficulty/feedback", post(feedback))
        .route("/override", post(override_recommendation))
        .route("/actions", get(list_actions))
        .layer(middleware::from_fn_with_state(app_state.clone(), jwt_auth));

    Router::new()
        .route("/", get(|| async { "SmartMath game server" }))
        .route("/health", get(|| async { "ok" }))
        .route("/ws", get(websocket_handler))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}
