use serde_json::json;
use tokio::time::{sleep, Duration};
use uuid::Uuid;

use smartmath::websockets::{ConnectionManager, MessageHandler, MessageType, WebSocketMessage};

use super::setup::TestSetup;

// ============================================================================
// Action Helpers
// ============================================================================

/// Room events are fanned out by a background task
const SETTLE: Duration = Duration::from_millis(25);

impl TestSetup {
    /// Send a WebSocket message and wait for processing
    pub async fn send_message(&self, connection_id: &str, message: WebSocketMessage) {
        let message_json = serde_json::to_string(&message).unwrap();
        self.send_raw(connection_id, message_json).await;
    }

    pub async fn send_raw(&self, connection_id: &str, raw: String) {
        self.input_handler.handle_message(connection_id, raw).await;
        sleep(SETTLE).await;
    }

    /// Tear a connection down the way the socket task does when it ends
    pub async fn disconnect(&self, connection_id: &str) {
        self.state
            .session_manager
            .disconnect(connection_id)
            .await
            .unwrap();
        self.mock_conn_manager.remove_connection(connection_id).await;
        sleep(SETTLE).await;
    }

    pub async fn clear_messages(&self) {
        self.mock_conn_manager.clear_messages().await;
    }

    // ============================================================================
    // Convenience Action Methods
    // ============================================================================

    pub async fn send_teacher_join(&self, connection_id: &str, game_id: Uuid, mode: Option<&str>) {
        let mut payload = json!({ "game_id": game_id });
        if let Some(mode) = mode {
            payload["mode"] = json!(mode);
        }
        self.send_message(
            connection_id,
            WebSocketMessage::new(MessageType::TeacherJoin, payload),
        )
        .await;
    }

    pub async fn send_join(&self, connection_id: &str, game_code: &str) {
        self.send_message(
            connection_id,
            WebSocketMessage::new(MessageType::JoinGame, json!({ "game_code": game_code })),
        )
        .await;
    }

    pub async fn send_start(&self, connection_id: &str, game_id: Uuid) {
        self.send_message(
            connection_id,
            WebSocketMessage::new(MessageType::StartGame, json!({ "game_id": game_id })),
        )
        .await;
    }

    pub async fn send_answer(
        &self,
        connection_id: &str,
        round_id: Uuid,
        question_id: Uuid,
        is_correct: bool,
    ) {
        self.send_message(
            connection_id,
            WebSocketMessage::new(
                MessageType::SubmitAnswer,
                json!({
                    "round_id": round_id,
                    "question_id": question_id,
                    "is_correct": is_correct,
                    "time_spent_secs": 4.0,
                }),
            ),
        )
        .await;
    }

    pub async fn send_fetch_batch(&self, connection_id: &str, game_id: Uuid) {
        self.send_message(
            connection_id,
            WebSocketMessage::new(MessageType::FetchNewBatch, json!({ "room_id": game_id })),
        )
        .await;
    }

    pub async fn send_finish_round(&self, connection_id: &str, round_id: Uuid) {
        self.send_message(
            connection_id,
            WebSocketMessage::new(MessageType::FinishRound, json!({ "round_id": round_id })),
        )
        .await;
    }

    pub async fn send_end_game(&self, connection_id: &str, game_id: Uuid) {
        self.send_message(
            connection_id,
            WebSocketMessage::new(MessageType::EndGame, json!({ "game_id": game_id })),
        )
        .await;
    }

    /// Answers `questions` in order, the first `correct` of them right.
    /// Each ANSWER_SAVED acknowledgement is consumed.
    pub async fn answer_round(
        &self,
        connection_id: &str,
        round_id: Uuid,
        questions: &[Uuid],
        correct: usize,
    ) {
        for (i, question_id) in questions.iter().enumerate() {
            self.send_answer(connection_id, round_id, *question_id, i < correct)
                .await;
            let raw = self
                .mock_conn_manager
                .consume_first_matching(connection_id, |raw| raw.contains("\"ANSWER_SAVED\""))
                .await;
            assert!(raw.is_some(), "{} answer {} was not saved", connection_id, i);
        }
    }

    /// Lobby with the teacher's lobby view and every fixture student joined.
    /// The returned game is still in the lobby, all queues are cleared.
    pub async fn lobby_with_students(&self) -> smartmath::game::GameModel {
        let game = self.create_game().await;
        self.send_teacher_join(super::setup::TEACHER, game.id, None)
            .await;
        for student in self.students.clone() {
            self.send_join(&student.username, &game.game_code).await;
        }
        self.clear_messages().await;
        game
    }
}
