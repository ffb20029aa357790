use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::presence::ConnectionMode;
use crate::recommendation::models::Direction;
use crate::recommendation::FinalizedRound;
use crate::round::models::BatchPayload;
use crate::session::Roster;
use crate::shared::AppError;

/// Message types for WebSocket communication
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    // Client -> Server
    TeacherJoin,
    JoinGame,
    StartGame,
    SubmitAnswer,
    FetchNewBatch,
    FinishRound,
    EndGame,

    // Server -> Client
    JoinedGame,
    UpdatePlayers,
    ReceiveQuestions,
    GameStarted,
    GameClosed,
    AnswerSaved,
    AnswerError,
    RoundFinished,
    FinishRoundError,
    Error,
}

/// Metadata for WebSocket messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketMessageMeta {
    pub timestamp: DateTime<Utc>,
}

/// Base structure for WebSocket messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketMessage {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub meta: Option<WebSocketMessageMeta>,
}

/// Client-to-Server message payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeacherJoinPayload {
    pub game_id: Uuid,
    /// Defaults to the view matching the game's status
    #[serde(default)]
    pub mode: Option<ConnectionMode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinGamePayload {
    pub game_code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartGamePayload {
    pub game_id: Uuid,
    /// Falls back to the topic chosen when the game was created
    #[serde(default)]
    pub topic_id: Option<Uuid>,
}

fn one() -> i32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitAnswerPayload {
    pub round_id: Uuid,
    pub question_id: Uuid,
    pub is_correct: bool,
    #[serde(default = "one")]
    pub num_attempts: i32,
    pub time_spent_secs: f64,
    #[serde(default)]
    pub hints_used: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchNewBatchPayload {
    pub room_id: Uuid,
    #[serde(default)]
    pub topic_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishRoundPayload {
    pub round_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndGamePayload {
    pub game_id: Uuid,
}

/// Server-to-Client message payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinedGamePayload {
    pub game_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameStartedPayload {
    pub game_id: Uuid,
    pub topic_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameClosedPayload {
    pub game_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerSavedPayload {
    pub question_id: Uuid,
    pub attempt_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundFinishedPayload {
    pub round_id: Uuid,
    pub accuracy: f64,
    pub avg_time_secs: f64,
    pub hint_rate: f64,
    pub recommendation: Direction,
    pub confidence: f64,
    pub prev_tier: i16,
    pub new_tier: i16,
    pub xp_gained: i64,
}

impl From<&FinalizedRound> for RoundFinishedPayload {
    fn from(finalized: &FinalizedRound) -> Self {
        Self {
            round_id: finalized.round.id,
            accuracy: finalized.aggregates.accuracy,
            avg_time_secs: finalized.aggregates.avg_time_secs,
            hint_rate: finalized.aggregates.hint_rate,
            recommendation: finalized.recommendation.direction,
            confidence: finalized.recommendation.confidence,
            prev_tier: finalized.recommendation.prev_tier,
            new_tier: finalized.recommendation.new_tier,
            xp_gained: finalized.xp_gained,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// Helper functions for creating messages
impl WebSocketMessage {
    pub fn new(message_type: MessageType, payload: serde_json::Value) -> Self {
        Self {
            message_type,
            payload,
            meta: Some(WebSocketMessageMeta {
                timestamp: Utc::now(),
            }),
        }
    }

    fn with_payload<T: Serialize>(message_type: MessageType, payload: T) -> Self {
        let payload = serde_json::to_value(payload).unwrap_or_else(|e| {
            warn!(message_type = ?message_type, error = %e, "Failed to encode payload");
            serde_json::Value::Null
        });
        Self::new(message_type, payload)
    }

    /// Decodes the payload into the shape its type expects
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, AppError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            AppError::BadRequest(format!("Malformed {:?} payload: {}", self.message_type, e))
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Create a JOINED_GAME message
    pub fn joined_game(game_id: Uuid) -> Self {
        Self::with_payload(MessageType::JoinedGame, JoinedGamePayload { game_id })
    }

    /// Create an UPDATE_PLAYERS message
    pub fn update_players(roster: &Roster) -> Self {
        Self::with_payload(MessageType::UpdatePlayers, roster)
    }

    /// Create a RECEIVE_QUESTIONS message
    pub fn receive_questions(batch: &BatchPayload) -> Self {
        Self::with_payload(MessageType::ReceiveQuestions, batch)
    }

    /// Create a GAME_STARTED message
    pub fn game_started(game_id: Uuid, topic_id: Uuid) -> Self {
        Self::with_payload(
            MessageType::GameStarted,
            GameStartedPayload { game_id, topic_id },
        )
    }

    /// Create a GAME_CLOSED message
    pub fn game_closed(game_id: Uuid) -> Self {
        Self::with_payload(MessageType::GameClosed, GameClosedPayload { game_id })
    }

    /// Create an ANSWER_SAVED message
    pub fn answer_saved(question_id: Uuid, attempt_id: Uuid) -> Self {
        Self::with_payload(
            MessageType::AnswerSaved,
            AnswerSavedPayload {
                question_id,
                attempt_id,
            },
        )
    }

    /// Create a ROUND_FINISHED message
    pub fn round_finished(finalized: &FinalizedRound) -> Self {
        Self::with_payload(
            MessageType::RoundFinished,
            RoundFinishedPayload::from(finalized),
        )
    }

    /// Create an ERROR-family message of the given type
    pub fn failure(message_type: MessageType, message: String) -> Self {
        Self::with_payload(message_type, ErrorPayload { message })
    }

    /// Create an ERROR message
    pub fn error(message: String) -> Self {
        Self::failure(MessageType::Error, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_is_screaming_snake_case() {
        let message = WebSocketMessage::joined_game(Uuid::nil());
        let json: serde_json::Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();

        assert_eq!(json["type"], "JOINED_GAME");
        assert_eq!(json["payload"]["game_id"], Uuid::nil().to_string());
        assert!(json["meta"]["timestamp"].is_string());
    }

    #[test]
    fn test_inbound_message_without_meta_parses() {
        let raw = r#"{"type":"SUBMIT_ANSWER","payload":{
            "round_id":"00000000-0000-0000-0000-000000000001",
            "question_id":"00000000-0000-0000-0000-000000000002",
            "is_correct":true,
            "time_spent_secs":3.5
        }}"#;

        let message: WebSocketMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(message.message_type, MessageType::SubmitAnswer);

        let payload: SubmitAnswerPayload = message.parse_payload().unwrap();
        assert_eq!(payload.num_attempts, 1);
        assert_eq!(payload.hints_used, 0);
    }

    #[test]
    fn test_malformed_payload_is_bad_request() {
        let message = WebSocketMessage::new(
            MessageType::FinishRound,
            serde_json::json!({ "round_id": "not-a-uuid" }),
        );

        let result = message.parse_payload::<FinishRoundPayload>();
        assert!(matches!(result, Err(AppError::BadRequest(_))));
    }

    #[test]
    fn test_teacher_join_mode_is_optional() {
        let message = WebSocketMessage::new(
            MessageType::TeacherJoin,
            serde_json::json!({ "game_id": Uuid::nil(), "mode": "game" }),
        );
        let payload: TeacherJoinPayload = message.parse_payload().unwrap();
        assert_eq!(payload.mode, Some(ConnectionMode::Game));

        let message = WebSocketMessage::new(
            MessageType::TeacherJoin,
            serde_json::json!({ "game_id": Uuid::nil() }),
        );
        let payload: TeacherJoinPayload = message.parse_payload().unwrap();
        assert_eq!(payload.mode, None);
    }
}
