// Library crate for the SmartMath adaptive classroom game server
// This file exposes the public API for the binary and integration tests

pub mod auth;
pub mod config;
pub mod event;
pub mod game;
pub mod presence;
pub mod question;
pub mod recommendation;
pub mod round;
pub mod routes;
pub mod session;
pub mod shared;
pub mod storage;
pub mod user;
pub mod websockets;

// Re-export commonly used types for easier access in tests
pub use config::AppConfig;
pub use event::{EventBus, RoomEvent, RoomSubscription};
pub use presence::{ConnectionMode, PresenceTracker};
pub use session::SessionManager;
pub use shared::{AppError, AppState, Repositories};
pub use storage::InMemoryDatabase;
pub use websockets::{
    ConnectionManager, MessageHandler, MessageType, WebSocketMessage, WebSocketRoomSubscriber,
    WebsocketReceiveHandler,
};
