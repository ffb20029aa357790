use async_trait::async_trait;
use thiserror::Error;

use super::events::RoomEvent;
use crate::shared::AppError;

/// Errors that can occur when handling room events
#[derive(Debug, Error)]
pub enum RoomEventError {
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Handler error: {0}")]
    HandlerError(String),
}

impl From<RoomEventError> for AppError {
    fn from(error: RoomEventError) -> Self {
        match error {
            RoomEventError::RoomNotFound(msg) => AppError::NotFound(msg),
            RoomEventError::ConnectionError(_) | RoomEventError::HandlerError(_) => {
                AppError::Internal
            }
        }
    }
}

/// Trait for components that react to room events
///
/// Keeps the room lifecycle independent of how events reach clients.
#[async_trait]
pub trait RoomEventHandler: Send + Sync {
    async fn handle_room_event(
        &self,
        room_id: &str,
        event: RoomEvent,
    ) -> Result<(), RoomEventError>;

    /// Get a human-readable name for this handler (for logging/debugging)
    fn handler_name(&self) -> &'static str;
}
