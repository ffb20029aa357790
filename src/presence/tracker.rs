use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::auth::{CredentialService, Principal};
use crate::shared::AppError;

/// What a connection is being used for inside a room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    /// A student playing rounds
    Player,
    /// A teacher's lobby screen. Dropping it never ends the game.
    Lobby,
    /// A teacher's live game screen. Dropping it ends the game.
    Game,
}

/// Everything known about one live connection
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionContext {
    pub connection_id: String,
    pub principal: Principal,
    pub game_id: Option<Uuid>,
    pub mode: ConnectionMode,
}

impl ConnectionContext {
    fn new(connection_id: String, principal: Principal) -> Self {
        let mode = if principal.is_teacher() {
            ConnectionMode::Lobby
        } else {
            ConnectionMode::Player
        };
        Self {
            connection_id,
            principal,
            game_id: None,
            mode,
        }
    }
}

#[derive(Default)]
struct PresenceState {
    sessions: HashMap<String, ConnectionContext>,
    // game id -> connection ids
    rooms: HashMap<Uuid, HashSet<String>>,
}

impl PresenceState {
    fn remove_from_room(&mut self, connection_id: &str, game_id: Uuid) {
        if let Some(members) = self.rooms.get_mut(&game_id) {
            members.remove(connection_id);
            if members.is_empty() {
                self.rooms.remove(&game_id);
            }
        }
    }
}

/// Maps live connections to identities and rooms
pub struct PresenceTracker {
    credentials: Arc<dyn CredentialService>,
    state: RwLock<PresenceState>,
}

impl PresenceTracker {
    pub fn new(credentials: Arc<dyn CredentialService>) -> Self {
        Self {
            credentials,
            state: RwLock::new(PresenceState::default()),
        }
    }

    /// Resolves the credential presented when a connection opens
    pub async fn authenticate(&self, credential: &str) -> Result<Principal, AppError> {
        self.credentials.authenticate(credential).await
    }

    pub async fn attach_session(&self, connection_id: &str, principal: Principal) {
        let mut state = self.state.write().await;
        debug!(connection_id, user_id = %principal.user_id, "Session attached");
        state.sessions.insert(
            connection_id.to_string(),
            ConnectionContext::new(connection_id.to_string(), principal),
        );
    }

    /// Puts the connection in a room, moving it out of any room it was in
    #[instrument(skip(self))]
    pub async fn join_room(
        &self,
        connection_id: &str,
        game_id: Uuid,
        mode: ConnectionMode,
    ) -> Result<ConnectionContext, AppError> {
        let mut state = self.state.write().await;

        let previous = match state.sessions.get(connection_id) {
            Some(context) => context.game_id,
            None => return Err(AppError::Unauthorized("Connection is not authenticated".to_string())),
        };
        if let Some(previous) = previous.filter(|previous| *previous != game_id) {
            state.remove_from_room(connection_id, previous);
        }

        state
            .rooms
            .entry(game_id)
            .or_default()
            .insert(connection_id.to_string());

        let context = state
            .sessions
            .get_mut(connection_id)
            .ok_or(AppError::Internal)?;
        context.game_id = Some(game_id);
        context.mode = mode;

        info!(user_id = %context.principal.user_id, "Connection joined room");
        Ok(context.clone())
    }

    /// Takes the connection out of its room; the session stays attached
    pub async fn leave_room(&self, connection_id: &str) -> Option<ConnectionContext> {
        let mut state = self.state.write().await;
        let game_id = state.sessions.get(connection_id)?.game_id?;
        state.remove_from_room(connection_id, game_id);

        let context = state.sessions.get_mut(connection_id)?;
        let before = context.clone();
        context.game_id = None;
        Some(before)
    }

    /// Forgets the connection entirely and returns what it was doing
    pub async fn detach(&self, connection_id: &str) -> Option<ConnectionContext> {
        let mut state = self.state.write().await;
        let context = state.sessions.remove(connection_id)?;
        if let Some(game_id) = context.game_id {
            state.remove_from_room(connection_id, game_id);
        }
        debug!(connection_id, "Session detached");
        Some(context)
    }

    pub async fn lookup(&self, connection_id: &str) -> Option<ConnectionContext> {
        self.state.read().await.sessions.get(connection_id).cloned()
    }

    pub async fn connections_in_room(&self, game_id: Uuid) -> Vec<String> {
        let state = self.state.read().await;
        state
            .rooms
            .get(&game_id)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn connections_for_user_in_room(&self, game_id: Uuid, user_id: Uuid) -> Vec<String> {
        let state = self.state.read().await;
        let Some(members) = state.rooms.get(&game_id) else {
            return Vec::new();
        };
        members
            .iter()
            .filter(|id| {
                state
                    .sessions
                    .get(id.as_str())
                    .is_some_and(|context| context.principal.user_id == user_id)
            })
            .cloned()
            .collect()
    }
}
