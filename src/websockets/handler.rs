use async_trait::async_trait;
use axum::{
    extract::{State, WebSocketUpgrade},
    http::{header, HeaderMap},
    response::Response,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::Principal;
use crate::session::{AnswerSubmission, SessionManager};
use crate::shared::{AppError, AppState};
use crate::websockets::connection_manager::ConnectionManager;
use crate::websockets::messages::{
    EndGamePayload, FetchNewBatchPayload, FinishRoundPayload, JoinGamePayload, MessageType,
    StartGamePayload, SubmitAnswerPayload, TeacherJoinPayload, WebSocketMessage,
};

use super::socket::{Connection, MessageHandler};

impl From<SubmitAnswerPayload> for AnswerSubmission {
    fn from(payload: SubmitAnswerPayload) -> Self {
        Self {
            round_id: payload.round_id,
            question_id: payload.question_id,
            is_correct: payload.is_correct,
            num_attempts: payload.num_attempts,
            time_spent_secs: payload.time_spent_secs,
            hints_used: payload.hints_used,
        }
    }
}

/// Routes client frames to the Session Manager and answers the sender
pub struct WebsocketReceiveHandler {
    session_manager: Arc<SessionManager>,
    connection_manager: Arc<dyn ConnectionManager>,
}

impl WebsocketReceiveHandler {
    pub fn new(
        session_manager: Arc<SessionManager>,
        connection_manager: Arc<dyn ConnectionManager>,
    ) -> Self {
        Self {
            session_manager,
            connection_manager,
        }
    }

    /// Performs the request; `Some` is a direct reply to the sender
    async fn dispatch(
        &self,
        connection_id: &str,
        message: &WebSocketMessage,
    ) -> Result<Option<WebSocketMessage>, AppError> {
        let sessions = &self.session_manager;

        match message.message_type {
            MessageType::TeacherJoin => {
                let payload: TeacherJoinPayload = message.parse_payload()?;
                sessions
                    .teacher_join(connection_id, payload.game_id, payload.mode)
                    .await?;
                Ok(None)
            }
            MessageType::JoinGame => {
                let payload: JoinGamePayload = message.parse_payload()?;
                sessions.join(connection_id, &payload.game_code).await?;
                Ok(None)
            }
            MessageType::StartGame => {
                let payload: StartGamePayload = message.parse_payload()?;
                sessions
                    .start(connection_id, payload.game_id, payload.topic_id)
                    .await?;
                Ok(None)
            }
            MessageType::SubmitAnswer => {
                let payload: SubmitAnswerPayload = message.parse_payload()?;
                let attempt = sessions
                    .submit_answer(connection_id, payload.into())
                    .await?;
                Ok(Some(WebSocketMessage::answer_saved(
                    attempt.question_id,
                    attempt.id,
                )))
            }
            MessageType::FetchNewBatch => {
                let payload: FetchNewBatchPayload = message.parse_payload()?;
                let batch = sessions
                    .next_batch(connection_id, payload.room_id, payload.topic_id)
                    .await?;
                Ok(Some(WebSocketMessage::receive_questions(&batch.to_payload())))
            }
            MessageType::FinishRound => {
                let payload: FinishRoundPayload = message.parse_payload()?;
                let finalized = sessions.finish_round(connection_id, payload.round_id).await?;
                Ok(Some(WebSocketMessage::round_finished(&finalized)))
            }
            MessageType::EndGame => {
                let payload: EndGamePayload = message.parse_payload()?;
                sessions.end_game(connection_id, payload.game_id).await?;
                Ok(None)
            }
            other => Err(AppError::BadRequest(format!(
                "{:?} is not accepted from clients",
                other
            ))),
        }
    }

    async fn reply(&self, connection_id: &str, message: &WebSocketMessage) {
        match message.to_json() {
            Ok(json) => {
                self.connection_manager
                    .send_to_connection(connection_id, &json)
                    .await
            }
            Err(e) => warn!(connection_id, error = %e, "Failed to serialize reply"),
        }
    }
}

/// Error frames are specific to the request that failed
fn failure_type(request: MessageType) -> MessageType {
    match request {
        MessageType::SubmitAnswer => MessageType::AnswerError,
        MessageType::FinishRound => MessageType::FinishRoundError,
        _ => MessageType::Error,
    }
}

#[async_trait]
impl MessageHandler for WebsocketReceiveHandler {
    async fn handle_message(&self, connection_id: &str, message: String) {
        debug!(connection_id, message = %message, "Received message");

        let ws_message = match serde_json::from_str::<WebSocketMessage>(&message) {
            Ok(ws_message) => ws_message,
            Err(e) => {
                warn!(connection_id, error = %e, "Failed to parse WebSocket message");
                self.reply(
                    connection_id,
                    &WebSocketMessage::error("Malformed message".to_string()),
                )
                .await;
                return;
            }
        };

        match self.dispatch(connection_id, &ws_message).await {
            Ok(Some(reply)) => self.reply(connection_id, &reply).await,
            Ok(None) => {}
            Err(e) => {
                info!(
                    connection_id,
                    message_type = ?ws_message.message_type,
                    error = %e,
                    "Request failed"
                );
                let failure = WebSocketMessage::failure(
                    failure_type(ws_message.message_type),
                    e.client_message(),
                );
                self.reply(connection_id, &failure).await;
            }
        }
    }
}

/// Where the client put its token: the subprotocol header (browsers cannot
/// set Authorization on a WebSocket), else a bearer Authorization header
fn extract_credential(headers: &HeaderMap) -> Option<(String, bool)> {
    let from_protocol = headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if let Some(token) = from_protocol {
        return Some((token.to_string(), true));
    }

    headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .map(|value| (value.to_string(), false))
}

/// WebSocket endpoint, GET /ws
/// The JWT comes in the Sec-WebSocket-Protocol header or as a bearer token
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(app_state): State<AppState>,
) -> Result<Response, AppError> {
    let (credential, via_protocol) = extract_credential(&headers).ok_or_else(|| {
        warn!("WebSocket request without credential");
        AppError::Unauthorized("Missing authentication token".to_string())
    })?;

    let principal = app_state.presence.authenticate(&credential).await?;
    info!(
        user_id = %principal.user_id,
        role = %principal.role,
        "WebSocket authentication successful"
    );

    // Echo the subprotocol so browsers accept the upgrade
    let ws = if via_protocol {
        ws.protocols([credential])
    } else {
        ws
    };

    Ok(ws.on_upgrade(move |socket| handle_websocket_connection(socket, principal, app_state)))
}

/// Handle the upgraded WebSocket connection
async fn handle_websocket_connection(
    socket: axum::extract::ws::WebSocket,
    principal: Principal,
    app_state: AppState,
) {
    let connection_id = Uuid::new_v4().to_string();
    info!(
        connection_id = %connection_id,
        username = %principal.username,
        "WebSocket connection established"
    );

    // Create the outbound channel (app -> client)
    let (outbound_sender, outbound_receiver) = mpsc::unbounded_channel::<String>();
    app_state
        .connection_manager
        .add_connection(connection_id.clone(), outbound_sender)
        .await;
    app_state
        .presence
        .attach_session(&connection_id, principal)
        .await;

    let message_handler = Arc::new(WebsocketReceiveHandler::new(
        app_state.session_manager.clone(),
        app_state.connection_manager.clone(),
    ));
    let connection = Connection::new(
        connection_id.clone(),
        Box::new(socket),
        outbound_receiver,
        message_handler,
    );

    match connection.run().await {
        Ok(()) => info!(connection_id = %connection_id, "WebSocket connection closed cleanly"),
        Err(e) => warn!(connection_id = %connection_id, error = %e, "WebSocket connection error"),
    }

    if let Err(e) = app_state.session_manager.disconnect(&connection_id).await {
        warn!(connection_id = %connection_id, error = %e, "Disconnect cleanup failed");
    }
    app_state
        .connection_manager
        .remove_connection(&connection_id)
        .await;
}
