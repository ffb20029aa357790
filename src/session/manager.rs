use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::roster::Roster;
use crate::auth::{require_student, require_teacher, Principal};
use crate::event::{room_key, EventBus, RoomEvent, RoomSubscriptions};
use crate::game::codes::{generate_code, normalize_code, MAX_CODE_ATTEMPTS};
use crate::game::repository::TransitionResult;
use crate::game::{GameModel, GameStatus};
use crate::presence::{ConnectionContext, ConnectionMode, PresenceTracker};
use crate::recommendation::{FinalizedRound, RecommendationEngine};
use crate::round::models::{AttemptModel, NewAttempt, RoundBatch};
use crate::round::{ActiveRound, ActiveRoundRegistry, RoundEngine};
use crate::shared::{AppError, KeyedMutex, Repositories};

/// One answer as reported by a student
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerSubmission {
    pub round_id: Uuid,
    pub question_id: Uuid,
    pub is_correct: bool,
    pub num_attempts: i32,
    pub time_spent_secs: f64,
    pub hints_used: i32,
}

/// Who is ending a game
#[derive(Debug, Clone)]
pub enum FinishedBy {
    Teacher(Principal),
    /// The teacher's live view went away
    System,
}

/// Runs the lobby -> started -> finished lifecycle of every game
pub struct SessionManager {
    repositories: Repositories,
    presence: Arc<PresenceTracker>,
    round_engine: Arc<RoundEngine>,
    recommendations: Arc<RecommendationEngine>,
    event_bus: EventBus,
    rooms: Arc<RoomSubscriptions>,
    active_rounds: ActiveRoundRegistry,
    // Serializes join/start/finish per game
    game_locks: KeyedMutex,
    code_length: usize,
}

impl SessionManager {
    pub fn new(
        repositories: Repositories,
        presence: Arc<PresenceTracker>,
        round_engine: Arc<RoundEngine>,
        recommendations: Arc<RecommendationEngine>,
        event_bus: EventBus,
        rooms: Arc<RoomSubscriptions>,
        code_length: usize,
    ) -> Self {
        let active_rounds = ActiveRoundRegistry::new(repositories.rounds.clone());
        Self {
            repositories,
            presence,
            round_engine,
            recommendations,
            event_bus,
            rooms,
            active_rounds,
            game_locks: KeyedMutex::new(),
            code_length,
        }
    }

    /// Opens a lobby under a fresh join code
    #[instrument(skip(self, teacher), fields(teacher_id = %teacher.user_id))]
    pub async fn create_game(
        &self,
        teacher: &Principal,
        topic_id: Option<Uuid>,
    ) -> Result<GameModel, AppError> {
        require_teacher(teacher)?;
        if let Some(topic_id) = topic_id {
            self.repositories
                .questions
                .get_topic(topic_id)
                .await?
                .ok_or_else(|| AppError::NotFound("Topic not found".to_string()))?;
        }

        for attempt in 1..=MAX_CODE_ATTEMPTS {
            let code = generate_code(self.code_length);
            if self
                .repositories
                .games
                .get_live_game_by_code(&code)
                .await?
                .is_some()
            {
                debug!(attempt, "Join code taken, retrying");
                continue;
            }

            let game = GameModel::new(code, teacher.user_id, topic_id);
            match self.repositories.games.create_game(&game).await {
                Ok(()) => {
                    self.rooms.ensure(&room_key(game.id)).await;
                    return Ok(game);
                }
                // Lost a race for the code
                Err(AppError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        warn!("No free join code");
        Err(AppError::Conflict(
            "Could not allocate a join code, try again later".to_string(),
        ))
    }

    /// Attaches a teacher connection to their game's room
    #[instrument(skip(self))]
    pub async fn teacher_join(
        &self,
        connection_id: &str,
        game_id: Uuid,
        mode: Option<ConnectionMode>,
    ) -> Result<GameModel, AppError> {
        let context = self.context(connection_id).await?;
        require_teacher(&context.principal)?;

        let game = self.owned_game(&context.principal, game_id).await?;
        let mode = match (game.status, mode) {
            (GameStatus::Finished, _) => {
                return Err(AppError::Conflict("Game has finished".to_string()))
            }
            (_, Some(ConnectionMode::Player)) => {
                return Err(AppError::BadRequest("Teachers cannot join as players".to_string()))
            }
            (_, Some(mode)) => mode,
            (GameStatus::Lobby, None) => ConnectionMode::Lobby,
            (GameStatus::Started, None) => ConnectionMode::Game,
        };

        self.rooms.ensure(&room_key(game_id)).await;
        self.presence.join_room(connection_id, game_id, mode).await?;
        info!(?mode, "Teacher joined room");

        self.broadcast_roster(game_id).await?;
        Ok(game)
    }

    /// A student joins a lobby by its code
    #[instrument(skip(self))]
    pub async fn join(&self, connection_id: &str, game_code: &str) -> Result<GameModel, AppError> {
        let context = self.context(connection_id).await?;
        require_student(&context.principal)?;
        let student_id = context.principal.user_id;

        let game = self
            .repositories
            .games
            .get_live_game_by_code(&normalize_code(game_code))
            .await?
            .ok_or_else(|| AppError::NotFound("Game not found".to_string()))?;

        let _guard = self.game_locks.lock(game.id).await;
        let game = self.game(game.id).await?;
        if game.status != GameStatus::Lobby {
            info!(game_id = %game.id, status = %game.status, "Join rejected");
            return Err(AppError::Conflict("Game has already started".to_string()));
        }

        if let Some(previous) = context.game_id.filter(|previous| *previous != game.id) {
            self.repositories
                .games
                .deactivate_player_by_connection(connection_id)
                .await?;
            self.broadcast_roster(previous).await?;
        }

        self.repositories
            .games
            .upsert_active_player(game.id, student_id, connection_id)
            .await?;
        self.rooms.ensure(&room_key(game.id)).await;
        self.presence
            .join_room(connection_id, game.id, ConnectionMode::Player)
            .await?;

        info!(game_id = %game.id, %student_id, "Student joined game");
        self.event_bus
            .emit_to_room(
                &room_key(game.id),
                RoomEvent::PlayerJoined {
                    connection_id: connection_id.to_string(),
                    game_id: game.id,
                },
            )
            .await;
        self.broadcast_roster(game.id).await?;

        Ok(game)
    }

    /// Leaves the lobby and deals every active student a first batch
    #[instrument(skip(self))]
    pub async fn start(
        &self,
        connection_id: &str,
        game_id: Uuid,
        topic_id: Option<Uuid>,
    ) -> Result<GameModel, AppError> {
        let context = self.context(connection_id).await?;
        require_teacher(&context.principal)?;

        let _guard = self.game_locks.lock(game_id).await;
        let game = self.owned_game(&context.principal, game_id).await?;

        let topic_id = topic_id
            .or(game.topic_id)
            .ok_or_else(|| AppError::BadRequest("A topic is required to start".to_string()))?;
        self.repositories
            .questions
            .get_topic(topic_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Topic not found".to_string()))?;

        let game = match self
            .repositories
            .games
            .transition_status(game_id, &[GameStatus::Lobby], GameStatus::Started)
            .await?
        {
            TransitionResult::Success(game) => game,
            TransitionResult::InvalidState(game) => {
                info!(status = %game.status, "Start rejected");
                return Err(AppError::Conflict(format!("Game is {}", game.status)));
            }
            TransitionResult::GameNotFound => {
                return Err(AppError::NotFound("Game not found".to_string()))
            }
        };

        let room = room_key(game_id);
        self.rooms.ensure(&room).await;
        self.event_bus
            .emit_to_room(&room, RoomEvent::GameStarted { game_id, topic_id })
            .await;

        let players = self.repositories.games.list_active_players(game_id).await?;
        let mut dealt = 0;
        for player in &players {
            match self.deal_batch(game_id, player.user_id, topic_id).await {
                Ok(batch) => {
                    dealt += 1;
                    self.event_bus
                        .emit_to_room(
                            &room,
                            RoomEvent::QuestionsIssued {
                                student_id: player.user_id,
                                batch: batch.to_payload(),
                            },
                        )
                        .await;
                }
                Err(e) => {
                    warn!(student_id = %player.user_id, error = %e, "Could not start round");
                    self.event_bus
                        .emit_to_room(
                            &room,
                            RoomEvent::StudentError {
                                student_id: player.user_id,
                                message: e.client_message(),
                            },
                        )
                        .await;
                }
            }
        }

        info!(%topic_id, players = players.len(), dealt, "Game started");
        Ok(game)
    }

    /// Stores one answer of the caller's round
    #[instrument(skip(self, submission), fields(round_id = %submission.round_id))]
    pub async fn submit_answer(
        &self,
        connection_id: &str,
        submission: AnswerSubmission,
    ) -> Result<AttemptModel, AppError> {
        let context = self.context(connection_id).await?;
        require_student(&context.principal)?;

        let round = self.round_engine.get_round(submission.round_id).await?;
        if let Some(game_id) = round.game_id {
            self.require_started(game_id).await?;
        }

        self.round_engine
            .record_attempt(NewAttempt {
                round_id: submission.round_id,
                student_id: context.principal.user_id,
                question_id: submission.question_id,
                is_correct: submission.is_correct,
                num_attempts: submission.num_attempts,
                time_spent_secs: submission.time_spent_secs,
                hints_used: submission.hints_used,
            })
            .await
    }

    /// Starts the caller's next round in a running game
    #[instrument(skip(self))]
    pub async fn next_batch(
        &self,
        connection_id: &str,
        game_id: Uuid,
        topic_id: Option<Uuid>,
    ) -> Result<RoundBatch, AppError> {
        let context = self.context(connection_id).await?;
        require_student(&context.principal)?;
        let student_id = context.principal.user_id;

        let game = self.require_started(game_id).await?;
        let topic_id = match topic_id {
            Some(topic_id) => topic_id,
            None => self
                .active_rounds
                .active_round(game_id, student_id)
                .await?
                .map(|active| active.topic_id)
                .or(game.topic_id)
                .ok_or_else(|| AppError::BadRequest("A topic is required".to_string()))?,
        };

        self.deal_batch(game_id, student_id, topic_id).await
    }

    /// Closes one of the caller's rounds and reports the new tier
    #[instrument(skip(self))]
    pub async fn finish_round(
        &self,
        connection_id: &str,
        round_id: Uuid,
    ) -> Result<FinalizedRound, AppError> {
        let context = self.context(connection_id).await?;
        require_student(&context.principal)?;

        let round = self.round_engine.get_round(round_id).await?;
        if round.student_id != context.principal.user_id {
            return Err(AppError::Forbidden("Round belongs to another student".to_string()));
        }

        let finalized = self.recommendations.finalize_round(round_id).await?;

        if let Some(game_id) = round.game_id.filter(|_| !finalized.already_finalized) {
            if self.game(game_id).await?.status.is_live() {
                self.broadcast_roster(game_id).await?;
            }
        }
        Ok(finalized)
    }

    /// END_GAME from the owning teacher
    pub async fn end_game(&self, connection_id: &str, game_id: Uuid) -> Result<GameModel, AppError> {
        let context = self.context(connection_id).await?;
        self.finish(game_id, FinishedBy::Teacher(context.principal))
            .await
    }

    /// Ends the game. Finishing a finished game changes nothing.
    #[instrument(skip(self, by))]
    pub async fn finish(&self, game_id: Uuid, by: FinishedBy) -> Result<GameModel, AppError> {
        if let FinishedBy::Teacher(principal) = &by {
            require_teacher(principal)?;
            self.owned_game(principal, game_id).await?;
        }

        let _guard = self.game_locks.lock(game_id).await;
        let game = match self
            .repositories
            .games
            .transition_status(
                game_id,
                &[GameStatus::Lobby, GameStatus::Started],
                GameStatus::Finished,
            )
            .await?
        {
            TransitionResult::Success(game) => game,
            TransitionResult::InvalidState(game) => {
                debug!("Game already finished");
                return Ok(game);
            }
            TransitionResult::GameNotFound => {
                return Err(AppError::NotFound("Game not found".to_string()))
            }
        };

        let deactivated = self
            .repositories
            .games
            .deactivate_all_players(game_id)
            .await?;
        self.active_rounds.forget_game(game_id).await;
        self.event_bus
            .emit_to_room(&room_key(game_id), RoomEvent::GameClosed { game_id })
            .await;

        info!(by = ?by, deactivated, "Game finished");
        Ok(game)
    }

    /// Cleans up after a closed socket
    #[instrument(skip(self))]
    pub async fn disconnect(&self, connection_id: &str) -> Result<(), AppError> {
        let Some(context) = self.presence.detach(connection_id).await else {
            return Ok(());
        };
        let Some(game_id) = context.game_id else {
            return Ok(());
        };

        match context.mode {
            ConnectionMode::Player => {
                let left = self
                    .repositories
                    .games
                    .deactivate_player_by_connection(connection_id)
                    .await?;
                if left.is_some() {
                    info!(%game_id, user_id = %context.principal.user_id, "Student left game");
                    self.broadcast_roster(game_id).await?;
                }
            }
            ConnectionMode::Lobby => {
                debug!(%game_id, "Teacher lobby view closed");
            }
            ConnectionMode::Game => {
                info!(%game_id, "Teacher game view closed, finishing game");
                self.finish(game_id, FinishedBy::System).await?;
            }
        }
        Ok(())
    }

    /// Sends the current standings to everyone in the room
    pub async fn broadcast_roster(&self, game_id: Uuid) -> Result<(), AppError> {
        let roster = self.roster(game_id).await?;
        self.event_bus
            .emit_to_room(&room_key(game_id), RoomEvent::RosterUpdated { roster })
            .await;
        Ok(())
    }

    pub async fn roster(&self, game_id: Uuid) -> Result<Roster, AppError> {
        let mut student_ids: Vec<Uuid> = self
            .repositories
            .games
            .list_active_players(game_id)
            .await?
            .into_iter()
            .map(|player| player.user_id)
            .collect();
        student_ids.sort();
        student_ids.dedup();

        let students = self.repositories.users.get_users(&student_ids).await?;
        let stats = self.repositories.users.get_stats_for(&student_ids).await?;
        Ok(Roster::build(game_id, students, &stats))
    }

    async fn deal_batch(
        &self,
        game_id: Uuid,
        student_id: Uuid,
        topic_id: Uuid,
    ) -> Result<RoundBatch, AppError> {
        let batch = self
            .round_engine
            .start_round(student_id, Some(game_id), topic_id)
            .await?;
        self.active_rounds
            .record(
                game_id,
                student_id,
                ActiveRound {
                    round_id: batch.round.id,
                    topic_id,
                },
            )
            .await;
        Ok(batch)
    }

    async fn context(&self, connection_id: &str) -> Result<ConnectionContext, AppError> {
        self.presence
            .lookup(connection_id)
            .await
            .ok_or_else(|| AppError::Unauthorized("Connection is not authenticated".to_string()))
    }

    async fn game(&self, game_id: Uuid) -> Result<GameModel, AppError> {
        self.repositories
            .games
            .get_game(game_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Game not found".to_string()))
    }

    async fn owned_game(&self, teacher: &Principal, game_id: Uuid) -> Result<GameModel, AppError> {
        let game = self.game(game_id).await?;
        if game.teacher_id != teacher.user_id {
            warn!(%game_id, teacher_id = %teacher.user_id, "Teacher does not own game");
            return Err(AppError::Forbidden("Not the owner of this game".to_string()));
        }
        Ok(game)
    }

    async fn require_started(&self, game_id: Uuid) -> Result<GameModel, AppError> {
        let game = self.game(game_id).await?;
        if game.status != GameStatus::Started {
            return Err(AppError::Conflict(format!("Game is {}", game.status)));
        }
        Ok(game)
    }
}
