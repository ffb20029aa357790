use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    event::{RoomEvent, RoomEventError, RoomEventHandler},
    presence::PresenceTracker,
    websockets::connection_manager::{send_message, ConnectionManager},
    websockets::messages::WebSocketMessage,
};

/// Delivers room events to the WebSocket connections present in the room
pub struct WebSocketRoomSubscriber {
    presence: Arc<PresenceTracker>,
    connection_manager: Arc<dyn ConnectionManager>,
}

impl WebSocketRoomSubscriber {
    pub fn new(
        presence: Arc<PresenceTracker>,
        connection_manager: Arc<dyn ConnectionManager>,
    ) -> Self {
        Self {
            presence,
            connection_manager,
        }
    }

    async fn deliver(
        &self,
        connection_ids: &[String],
        message: &WebSocketMessage,
    ) -> Result<(), RoomEventError> {
        send_message(&self.connection_manager, connection_ids, message)
            .await
            .map_err(|e| RoomEventError::HandlerError(format!("Failed to serialize message: {}", e)))?;

        debug!(
            message_type = ?message.message_type,
            recipients = connection_ids.len(),
            "Room message delivered"
        );
        Ok(())
    }

    async fn to_room(&self, game_id: Uuid, message: &WebSocketMessage) -> Result<(), RoomEventError> {
        let connections = self.presence.connections_in_room(game_id).await;
        self.deliver(&connections, message).await
    }

    async fn to_student(
        &self,
        game_id: Uuid,
        student_id: Uuid,
        message: &WebSocketMessage,
    ) -> Result<(), RoomEventError> {
        let connections = self
            .presence
            .connections_for_user_in_room(game_id, student_id)
            .await;
        self.deliver(&connections, message).await
    }
}

#[async_trait]
impl RoomEventHandler for WebSocketRoomSubscriber {
    async fn handle_room_event(
        &self,
        room_id: &str,
        event: RoomEvent,
    ) -> Result<(), RoomEventError> {
        let game_id = Uuid::parse_str(room_id)
            .map_err(|_| RoomEventError::RoomNotFound(room_id.to_string()))?;

        match event {
            RoomEvent::PlayerJoined {
                connection_id,
                game_id,
            } => {
                self.deliver(&[connection_id], &WebSocketMessage::joined_game(game_id))
                    .await
            }
            RoomEvent::RosterUpdated { roster } => {
                self.to_room(game_id, &WebSocketMessage::update_players(&roster))
                    .await
            }
            RoomEvent::GameStarted { game_id, topic_id } => {
                self.to_room(game_id, &WebSocketMessage::game_started(game_id, topic_id))
                    .await
            }
            RoomEvent::QuestionsIssued { student_id, batch } => {
                self.to_student(
                    game_id,
                    student_id,
                    &WebSocketMessage::receive_questions(&batch),
                )
                .await
            }
            RoomEvent::StudentError {
                student_id,
                message,
            } => {
                self.to_student(game_id, student_id, &WebSocketMessage::error(message))
                    .await
            }
            RoomEvent::GameClosed { game_id } => {
                let connections = self.presence.connections_in_room(game_id).await;
                self.deliver(&connections, &WebSocketMessage::game_closed(game_id))
                    .await?;
                for connection_id in &connections {
                    self.presence.leave_room(connection_id).await;
                }
                info!(%game_id, connections = connections.len(), "Room emptied after game closed");
                Ok(())
            }
        }
    }

    fn handler_name(&self) -> &'static str {
        "WebSocketRoomSubscriber"
    }
}
