use async_trait::async_trait;
use chrono::Utc;
use sqlx::{postgres::PgRow, PgPool, Row};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::models::{GameModel, GamePlayerModel, GameStatus};
use crate::shared::AppError;
use crate::storage::InMemoryDatabase;

/// Result of a conditional status change
#[derive(Debug, Clone)]
pub enum TransitionResult {
    /// Status changed, returns the updated game
    Success(GameModel),
    /// Game exists but its status was not one of the allowed sources
    InvalidState(GameModel),
    /// Game does not exist
    GameNotFound,
}

#[async_trait]
pub trait GameRepository: Send + Sync {
    /// Fails with `Conflict` when a live game already holds the code
    async fn create_game(&self, game: &GameModel) -> Result<(), AppError>;
    async fn get_game(&self, game_id: Uuid) -> Result<Option<GameModel>, AppError>;
    async fn get_live_game_by_code(&self, game_code: &str) -> Result<Option<GameModel>, AppError>;

    /// Atomically moves the game to `to` if its current status is in `allowed_from`
    async fn transition_status(
        &self,
        game_id: Uuid,
        allowed_from: &[GameStatus],
        to: GameStatus,
    ) -> Result<TransitionResult, AppError>;

    /// Re-points an existing active membership at the connection, or inserts a new one
    async fn upsert_active_player(
        &self,
        game_id: Uuid,
        user_id: Uuid,
        connection_id: &str,
    ) -> Result<GamePlayerModel, AppError>;
    async fn deactivate_player_by_connection(
        &self,
        connection_id: &str,
    ) -> Result<Option<GamePlayerModel>, AppError>;
    async fn deactivate_all_players(&self, game_id: Uuid) -> Result<u64, AppError>;
    async fn list_active_players(&self, game_id: Uuid) -> Result<Vec<GamePlayerModel>, AppError>;
}

pub struct InMemoryGameRepository {
    db: Arc<InMemoryDatabase>,
}

impl InMemoryGameRepository {
    pub fn new(db: Arc<InMemoryDatabase>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl GameRepository for InMemoryGameRepository {
    #[instrument(skip(self, game), fields(game_id = %game.id, game_code = %game.game_code))]
    async fn create_game(&self, game: &GameModel) -> Result<(), AppError> {
        let mut tables = self.db.tables()?;
        if tables
            .games
            .values()
            .any(|g| g.status.is_live() && g.game_code == game.game_code)
        {
            debug!("Game code already held by a live game");
            return Err(AppError::Conflict("Game code in use".to_string()));
        }
        tables.games.insert(game.id, game.clone());
        Ok(())
    }

    async fn get_game(&self, game_id: Uuid) -> Result<Option<GameModel>, AppError> {
        Ok(self.db.tables()?.games.get(&game_id).cloned())
    }

    async fn get_live_game_by_code(&self, game_code: &str) -> Result<Option<GameModel>, AppError> {
        let tables = self.db.tables()?;
        Ok(tables
            .games
            .values()
            .find(|g| g.status.is_live() && g.game_code == game_code)
            .cloned())
    }

    #[instrument(skip(self))]
    async fn transition_status(
        &self,
        game_id: Uuid,
        allowed_from: &[GameStatus],
        to: GameStatus,
    ) -> Result<TransitionResult, AppError> {
        let mut tables = self.db.tables()?;
        let Some(game) = tables.games.get_mut(&game_id) else {
            return Ok(TransitionResult::GameNotFound);
        };

        if !allowed_from.contains(&game.status) || !game.status.can_transition_to(to) {
            return Ok(TransitionResult::InvalidState(game.clone()));
        }

        game.status = to;
        if to == GameStatus::Finished {
            game.ended_at = Some(Utc::now());
        }
        Ok(TransitionResult::Success(game.clone()))
    }

    async fn upsert_active_player(
        &self,
        game_id: Uuid,
        user_id: Uuid,
        connection_id: &str,
    ) -> Result<GamePlayerModel, AppError> {
        let mut tables = self.db.tables()?;
        if let Some(existing) = tables
            .game_players
            .iter_mut()
            .find(|p| p.game_id == game_id && p.user_id == user_id && p.is_active)
        {
            existing.connection_id = Some(connection_id.to_string());
            return Ok(existing.clone());
        }

        let player = GamePlayerModel::new(game_id, user_id, connection_id);
        tables.game_players.push(player.clone());
        Ok(player)
    }

    async fn deactivate_player_by_connection(
        &self,
        connection_id: &str,
    ) -> Result<Option<GamePlayerModel>, AppError> {
        let mut tables = self.db.tables()?;
        let player = tables
            .game_players
            .iter_mut()
            .find(|p| p.is_active && p.connection_id.as_deref() == Some(connection_id));

        Ok(player.map(|p| {
            p.is_active = false;
            p.left_at = Some(Utc::now());
            p.clone()
        }))
    }

    async fn deactivate_all_players(&self, game_id: Uuid) -> Result<u64, AppError> {
        let mut tables = self.db.tables()?;
        let now = Utc::now();
        let mut count = 0;
        for player in tables
            .game_players
            .iter_mut()
            .filter(|p| p.game_id == game_id && p.is_active)
        {
            player.is_active = false;
            player.left_at = Some(now);
            count += 1;
        }
        Ok(count)
    }

    async fn list_active_players(&self, game_id: Uuid) -> Result<Vec<GamePlayerModel>, AppError> {
        let tables = self.db.tables()?;
        let mut players: Vec<GamePlayerModel> = tables
            .game_players
            .iter()
            .filter(|p| p.game_id == game_id && p.is_active)
            .cloned()
            .collect();
        players.sort_by_key(|p| p.joined_at);
        Ok(players)
    }
}

/// PostgreSQL implementation of the game repository
pub struct PostgresGameRepository {
    pool: PgPool,
}

impl PostgresGameRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const GAME_COLUMNS: &str = "id, game_code, teacher_id, topic_id, status, created_at, ended_at";
const PLAYER_COLUMNS: &str = "id, game_id, user_id, connection_id, is_active, joined_at, left_at";

fn game_from_row(row: &PgRow) -> Result<GameModel, AppError> {
    let status: String = row.get("status");
    Ok(GameModel {
        id: row.get("id"),
        game_code: row.get("game_code"),
        teacher_id: row.get("teacher_id"),
        topic_id: row.get("topic_id"),
        status: GameStatus::from_str(&status)
            .map_err(|_| AppError::DatabaseError(format!("unknown game status {}", status)))?,
        created_at: row.get("created_at"),
        ended_at: row.get("ended_at"),
    })
}

fn player_from_row(row: &PgRow) -> GamePlayerModel {
    GamePlayerModel {
        id: row.get("id"),
        game_id: row.get("game_id"),
        user_id: row.get("user_id"),
        connection_id: row.get("connection_id"),
        is_active: row.get("is_active"),
        joined_at: row.get("joined_at"),
        left_at: row.get("left_at"),
    }
}

#[async_trait]
impl GameRepository for PostgresGameRepository {
    #[instrument(skip(self, game), fields(game_id = %game.id, game_code = %game.game_code))]
    async fn create_game(&self, game: &GameModel) -> Result<(), AppError> {
        let result = sqlx::query(
            "INSERT INTO games (id, game_code, teacher_id, topic_id, status, created_at, ended_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(game.id)
        .bind(&game.game_code)
        .bind(game.teacher_id)
        .bind(game.topic_id)
        .bind(game.status.as_ref())
        .bind(game.created_at)
        .bind(game.ended_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                info!("Game row created");
                Ok(())
            }
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                debug!("Game code already held by a live game");
                Err(AppError::Conflict("Game code in use".to_string()))
            }
            Err(e) => {
                warn!(error = %e, "Failed to create game in database");
                Err(e.into())
            }
        }
    }

    #[instrument(skip(self))]
    async fn get_game(&self, game_id: Uuid) -> Result<Option<GameModel>, AppError> {
        let row = sqlx::query(&format!("SELECT {} FROM games WHERE id = $1", GAME_COLUMNS))
            .bind(game_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(game_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn get_live_game_by_code(&self, game_code: &str) -> Result<Option<GameModel>, AppError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM games WHERE game_code = $1 AND status <> 'finished'",
            GAME_COLUMNS
        ))
        .bind(game_code)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(game_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn transition_status(
        &self,
        game_id: Uuid,
        allowed_from: &[GameStatus],
        to: GameStatus,
    ) -> Result<TransitionResult, AppError> {
        let allowed: Vec<String> = allowed_from
            .iter()
            .filter(|from| from.can_transition_to(to))
            .map(|from| from.to_string())
            .collect();

        let updated = sqlx::query(&format!(
            "UPDATE games SET status = $2, \
             ended_at = CASE WHEN $2 = 'finished' THEN now() ELSE ended_at END \
             WHERE id = $1 AND status = ANY($3) RETURNING {}",
            GAME_COLUMNS
        ))
        .bind(game_id)
        .bind(to.as_ref())
        .bind(&allowed)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = updated {
            return Ok(TransitionResult::Success(game_from_row(&row)?));
        }

        match self.get_game(game_id).await? {
            Some(game) => Ok(TransitionResult::InvalidState(game)),
            None => Ok(TransitionResult::GameNotFound),
        }
    }

    #[instrument(skip(self))]
    async fn upsert_active_player(
        &self,
        game_id: Uuid,
        user_id: Uuid,
        connection_id: &str,
    ) -> Result<GamePlayerModel, AppError> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(&format!(
            "UPDATE game_players SET connection_id = $3 \
             WHERE game_id = $1 AND user_id = $2 AND is_active RETURNING {}",
            PLAYER_COLUMNS
        ))
        .bind(game_id)
        .bind(user_id)
        .bind(connection_id)
        .fetch_optional(&mut *tx)
        .await?;

        let player = match existing {
            Some(row) => player_from_row(&row),
            None => {
                let player = GamePlayerModel::new(game_id, user_id, connection_id);
                sqlx::query(
                    "INSERT INTO game_players (id, game_id, user_id, connection_id, is_active, joined_at, left_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7)",
                )
                .bind(player.id)
                .bind(player.game_id)
                .bind(player.user_id)
                .bind(&player.connection_id)
                .bind(player.is_active)
                .bind(player.joined_at)
                .bind(player.left_at)
                .execute(&mut *tx)
                .await?;
                player
            }
        };

        tx.commit().await?;
        Ok(player)
    }

    #[instrument(skip(self))]
    async fn deactivate_player_by_connection(
        &self,
        connection_id: &str,
    ) -> Result<Option<GamePlayerModel>, AppError> {
        let row = sqlx::query(&format!(
            "UPDATE game_players SET is_active = FALSE, left_at = now() \
             WHERE connection_id = $1 AND is_active RETURNING {}",
            PLAYER_COLUMNS
        ))
        .bind(connection_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(player_from_row))
    }

    #[instrument(skip(self))]
    async fn deactivate_all_players(&self, game_id: Uuid) -> Result<u64, AppError> {
        let result = sqlx::query(
            "UPDATE game_players SET is_active = FALSE, left_at = now() WHERE game_id = $1 AND is_active",
        )
        .bind(game_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn list_active_players(&self, game_id: Uuid) -> Result<Vec<GamePlayerModel>, AppError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM game_players WHERE game_id = $1 AND is_active ORDER BY joined_at",
            PLAYER_COLUMNS
        ))
        .bind(game_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(player_from_row).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> InMemoryGameRepository {
        InMemoryGameRepository::new(InMemoryDatabase::new())
    }

    #[tokio::test]
    async fn test_live_code_collision_is_conflict() {
        let repo = repo();
        let teacher = Uuid::new_v4();
        let first = GameModel::new("ABCD".to_string(), teacher, None);
        repo.create_game(&first).await.unwrap();

        let clash = GameModel::new("ABCD".to_string(), teacher, None);
        assert!(matches!(
            repo.create_game(&clash).await,
            Err(AppError::Conflict(_))
        ));

        // Once finished the code may be reused
        repo.transition_status(first.id, &[GameStatus::Lobby], GameStatus::Finished)
            .await
            .unwrap();
        assert!(repo.create_game(&clash).await.is_ok());
        assert_eq!(
            repo.get_live_game_by_code("ABCD").await.unwrap().map(|g| g.id),
            Some(clash.id)
        );
    }

    #[tokio::test]
    async fn test_transition_is_conditional() {
        let repo = repo();
        let game = GameModel::new("DCBA".to_string(), Uuid::new_v4(), None);
        repo.create_game(&game).await.unwrap();

        let started = repo
            .transition_status(game.id, &[GameStatus::Lobby], GameStatus::Started)
            .await
            .unwrap();
        assert!(matches!(started, TransitionResult::Success(g) if g.status == GameStatus::Started));

        let again = repo
            .transition_status(game.id, &[GameStatus::Lobby], GameStatus::Started)
            .await
            .unwrap();
        assert!(matches!(again, TransitionResult::InvalidState(_)));

        let finished = repo
            .transition_status(
                game.id,
                &[GameStatus::Lobby, GameStatus::Started],
                GameStatus::Finished,
            )
            .await
            .unwrap();
        match finished {
            TransitionResult::Success(g) => assert!(g.ended_at.is_some()),
            other => panic!("unexpected {:?}", other),
        }

        let backwards = repo
            .transition_status(game.id, &[GameStatus::Finished], GameStatus::Lobby)
            .await
            .unwrap();
        assert!(matches!(backwards, TransitionResult::InvalidState(_)));

        assert!(matches!(
            repo.transition_status(Uuid::new_v4(), &[GameStatus::Lobby], GameStatus::Started)
                .await
                .unwrap(),
            TransitionResult::GameNotFound
        ));
    }

    #[tokio::test]
    async fn test_rejoin_reuses_active_membership() {
        let repo = repo();
        let game_id = Uuid::new_v4();
        let student = Uuid::new_v4();

        let first = repo
            .upsert_active_player(game_id, student, "conn-1")
            .await
            .unwrap();
        let second = repo
            .upsert_active_player(game_id, student, "conn-2")
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.connection_id.as_deref(), Some("conn-2"));
        assert_eq!(repo.list_active_players(game_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_deactivation_keeps_history() {
        let repo = repo();
        let game_id = Uuid::new_v4();
        let student = Uuid::new_v4();

        repo.upsert_active_player(game_id, student, "conn-1")
            .await
            .unwrap();
        let left = repo
            .deactivate_player_by_connection("conn-1")
            .await
            .unwrap()
            .unwrap();
        assert!(!left.is_active);
        assert!(left.left_at.is_some());
        assert!(repo
            .deactivate_player_by_connection("conn-1")
            .await
            .unwrap()
            .is_none());

        let rejoined = repo
            .upsert_active_player(game_id, student, "conn-3")
            .await
            .unwrap();
        assert_ne!(rejoined.id, left.id);
        assert_eq!(repo.deactivate_all_players(game_id).await.unwrap(), 1);
        assert!(repo.list_active_players(game_id).await.unwrap().is_empty());
    }
}
