use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::round::models::BatchPayload;
use crate::session::Roster;

/// Facts about a game room, fanned out to every connection in it
///
/// Events describe things that already happened; the Session Manager
/// emits them after the corresponding state change is stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RoomEvent {
    /// A student's join was accepted; only that connection is told
    PlayerJoined {
        connection_id: String,
        game_id: Uuid,
    },

    /// Membership or standings changed
    RosterUpdated { roster: Roster },

    /// The game left the lobby
    GameStarted { game_id: Uuid, topic_id: Uuid },

    /// A personalized batch for one student
    QuestionsIssued {
        student_id: Uuid,
        batch: BatchPayload,
    },

    /// Something went wrong for one student during a room-wide action
    StudentError { student_id: Uuid, message: String },

    /// The game is over; nothing follows this event
    GameClosed { game_id: Uuid },
}

impl RoomEvent {
    /// Whether the room's subscription should stop after this event
    pub fn is_terminal(&self) -> bool {
        matches!(self, RoomEvent::GameClosed { .. })
    }
}

/// Rooms are keyed by the game id's string form
pub fn room_key(game_id: Uuid) -> String {
    game_id.to_string()
}
