use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// Lifecycle of a game. Only ever moves forward.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum GameStatus {
    Lobby,
    Started,
    Finished,
}

impl GameStatus {
    pub fn is_live(self) -> bool {
        self != GameStatus::Finished
    }

    pub fn can_transition_to(self, next: GameStatus) -> bool {
        matches!(
            (self, next),
            (GameStatus::Lobby, GameStatus::Started)
                | (GameStatus::Lobby, GameStatus::Finished)
                | (GameStatus::Started, GameStatus::Finished)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameModel {
    pub id: Uuid,
    pub game_code: String,
    pub teacher_id: Uuid,
    pub topic_id: Option<Uuid>,
    pub status: GameStatus,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl GameModel {
    pub fn new(game_code: String, teacher_id: Uuid, topic_id: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            game_code,
            teacher_id,
            topic_id,
            status: GameStatus::Lobby,
            created_at: Utc::now(),
            ended_at: None,
        }
    }
}

/// Membership of a student in a game, tied to the connection that joined
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GamePlayerModel {
    pub id: Uuid,
    pub game_id: Uuid,
    pub user_id: Uuid,
    pub connection_id: Option<String>,
    pub is_active: bool,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
}

impl GamePlayerModel {
    pub fn new(game_id: Uuid, user_id: Uuid, connection_id: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            game_id,
            user_id,
            connection_id: Some(connection_id.to_string()),
            is_active: true,
            joined_at: Utc::now(),
            left_at: None,
        }
    }
}
