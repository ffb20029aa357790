use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

use crate::auth::{CredentialService, JwtCredentialService, TokenConfig};
use crate::config::AppConfig;
use crate::event::{EventBus, RoomSubscriptions};
use crate::game::repository::{GameRepository, PostgresGameRepository};
use crate::presence::PresenceTracker;
use crate::question::repository::{PostgresQuestionRepository, QuestionRepository};
use crate::question::selector::QuestionSelector;
use crate::recommendation::repository::{PostgresTeacherActionRepository, TeacherActionRepository};
use crate::recommendation::{LabelPolicy, RecommendationEngine, SharedOracle};
use crate::round::repository::{PostgresRoundRepository, RoundRepository};
use crate::round::RoundEngine;
use crate::session::SessionManager;
use crate::user::repository::{PostgresUserRepository, UserRepository};
use crate::websockets::{ConnectionManager, WebSocketRoomSubscriber};

/// Storage seams, one per aggregate
#[derive(Clone)]
pub struct Repositories {
    pub users: Arc<dyn UserRepository>,
    pub questions: Arc<dyn QuestionRepository>,
    pub games: Arc<dyn GameRepository>,
    pub rounds: Arc<dyn RoundRepository>,
    pub teacher_actions: Arc<dyn TeacherActionRepository>,
}

impl Repositories {
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            users: Arc::new(PostgresUserRepository::new(pool.clone())),
            questions: Arc::new(PostgresQuestionRepository::new(pool.clone())),
            games: Arc::new(PostgresGameRepository::new(pool.clone())),
            rounds: Arc::new(PostgresRoundRepository::new(pool.clone())),
            teacher_actions: Arc::new(PostgresTeacherActionRepository::new(pool)),
        }
    }
}

/// Shared application state containing all dependencies
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub credentials: Arc<dyn CredentialService>,
    pub users: Arc<dyn UserRepository>,
    pub questions: Arc<dyn QuestionRepository>,
    pub teacher_actions: Arc<dyn TeacherActionRepository>,
    pub oracle: Arc<SharedOracle>,
    pub presence: Arc<PresenceTracker>,
    pub session_manager: Arc<SessionManager>,
    pub connection_manager: Arc<dyn ConnectionManager>,
    pub event_bus: EventBus,
}

impl AppState {
    /// Wires every component on top of the given storage and oracle
    pub fn new(
        config: AppConfig,
        repositories: Repositories,
        oracle: Arc<SharedOracle>,
        connection_manager: Arc<dyn ConnectionManager>,
    ) -> Self {
        let config = Arc::new(config);
        let credentials: Arc<dyn CredentialService> = Arc::new(JwtCredentialService::new(
            TokenConfig::new(config.jwt_secret.clone()),
            repositories.users.clone(),
        ));

        let presence = Arc::new(PresenceTracker::new(credentials.clone()));
        let event_bus = EventBus::new(1000);
        let subscriber = Arc::new(WebSocketRoomSubscriber::new(
            presence.clone(),
            connection_manager.clone(),
        ));
        let rooms = Arc::new(RoomSubscriptions::new(event_bus.clone(), subscriber));

        let selector = QuestionSelector::new(repositories.questions.clone());
        let round_engine = Arc::new(RoundEngine::new(
            repositories.rounds.clone(),
            repositories.users.clone(),
            selector,
            config.batch_limit,
        ));
        let recommendations = Arc::new(RecommendationEngine::new(
            round_engine.clone(),
            repositories.rounds.clone(),
            repositories.users.clone(),
            oracle.clone(),
            LabelPolicy {
                epsilon: config.label_epsilon,
                real_sample_weight: config.real_sample_weight,
            },
        ));

        let teacher_actions = repositories.teacher_actions.clone();
        let session_manager = Arc::new(SessionManager::new(
            repositories.clone(),
            presence.clone(),
            round_engine,
            recommendations,
            event_bus.clone(),
            rooms,
            config.game_code_length,
        ));

        Self {
            config,
            credentials,
            users: repositories.users,
            questions: repositories.questions,
            teacher_actions,
            oracle,
            presence,
            session_manager,
            connection_manager,
            event_bus,
        }
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("JWT error: {0}")]
    JwtError(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("No questions available for this topic and tier")]
    NoQuestions,

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Difficulty model unavailable: {0}")]
    OracleUnavailable(String),

    #[error("Internal server error")]
    Internal,
}

impl From<sqlx::Error> for AppError {
    fn from(error: sqlx::Error) -> Self {
        AppError::DatabaseError(error.to_string())
    }
}

impl AppError {
    /// Message safe to show to a client
    pub fn client_message(&self) -> String {
        match self {
            AppError::JwtError(msg)
            | AppError::Unauthorized(msg)
            | AppError::Forbidden(msg)
            | AppError::NotFound(msg)
            | AppError::Conflict(msg)
            | AppError::BadRequest(msg) => msg.clone(),
            AppError::NoQuestions => self.to_string(),
            AppError::DatabaseError(_) => "Storage temporarily unavailable".to_string(),
            AppError::OracleUnavailable(_) => "Difficulty model unavailable".to_string(),
            AppError::Internal => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::JwtError(_) | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) | AppError::NoQuestions => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::DatabaseError(_) | AppError::OracleUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.client_message()
        }));

        (status, body).into_response()
    }
}

/// One async mutex per key, created on first use.
/// Holders of the same key are serialized, different keys proceed in parallel.
#[derive(Default)]
pub struct KeyedMutex {
    locks: RwLock<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

impl KeyedMutex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: Uuid) -> OwnedMutexGuard<()> {
        let existing = {
            let locks = self.locks.read().await;
            locks.get(&key).cloned()
        };

        let lock = match existing {
            Some(lock) => lock,
            None => {
                let mut locks = self.locks.write().await;
                locks
                    .entry(key)
                    .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                    .clone()
            }
        };

        lock.lock_owned().await
    }
}

#[cfg(test)]
pub mod test_utils {
    use super::*;
    use crate::recommendation::oracle::InMemorySnapshotStore;
    use crate::recommendation::softmax::SoftmaxRegression;
    use crate::storage::InMemoryDatabase;
    use crate::websockets::InMemoryConnectionManager;

    /// Builder for creating AppState with overrides for testing
    pub struct AppStateBuilder {
        database: Arc<InMemoryDatabase>,
        config: AppConfig,
        connection_manager: Option<Arc<dyn ConnectionManager>>,
    }

    impl AppStateBuilder {
        pub fn new() -> Self {
            Self {
                database: InMemoryDatabase::new(),
                config: AppConfig {
                    jwt_secret: "test-secret".to_string(),
                    ..AppConfig::default()
                },
                connection_manager: None,
            }
        }

        pub fn with_database(mut self, database: Arc<InMemoryDatabase>) -> Self {
            self.database = database;
            self
        }

        pub fn with_connection_manager(mut self, manager: Arc<dyn ConnectionManager>) -> Self {
            self.connection_manager = Some(manager);
            self
        }

        pub fn build(self) -> AppState {
            let oracle = Arc::new(SharedOracle::new(
                Box::new(SoftmaxRegression::bootstrap(50, 7)),
                Arc::new(InMemorySnapshotStore::new()),
                self.config.model_persist_every,
            ));

            AppState::new(
                self.config,
                self.database.repositories(),
                oracle,
                self.connection_manager
                    .unwrap_or_else(|| Arc::new(InMemoryConnectionManager::new())),
            )
        }
    }

    impl Default for AppStateBuilder {
        fn default() -> Self {
            Self::new()
        }
    }
}
