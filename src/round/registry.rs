use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::repository::RoundRepository;
use crate::shared::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveRound {
    pub round_id: Uuid,
    pub topic_id: Uuid,
}

/// Per game, the round each student is currently playing.
/// A cache over durable rounds: misses are refilled from storage.
pub struct ActiveRoundRegistry {
    games: RwLock<HashMap<Uuid, HashMap<Uuid, ActiveRound>>>,
    rounds: Arc<dyn RoundRepository>,
}

impl ActiveRoundRegistry {
    pub fn new(rounds: Arc<dyn RoundRepository>) -> Self {
        Self {
            games: RwLock::new(HashMap::new()),
            rounds,
        }
    }

    pub async fn record(&self, game_id: Uuid, student_id: Uuid, active: ActiveRound) {
        let mut games = self.games.write().await;
        games.entry(game_id).or_default().insert(student_id, active);
    }

    pub async fn active_round(
        &self,
        game_id: Uuid,
        student_id: Uuid,
    ) -> Result<Option<ActiveRound>, AppError> {
        {
            let games = self.games.read().await;
            if let Some(active) = games.get(&game_id).and_then(|g| g.get(&student_id)) {
                return Ok(Some(*active));
            }
        }

        let Some(round) = self.rounds.latest_round_in_game(student_id, game_id).await? else {
            return Ok(None);
        };

        debug!(%game_id, %student_id, round_id = %round.id, "Active round rehydrated from storage");
        let active = ActiveRound {
            round_id: round.id,
            topic_id: round.topic_id,
        };
        self.record(game_id, student_id, active).await;
        Ok(Some(active))
    }

    pub async fn forget_game(&self, game_id: Uuid) {
        self.games.write().await.remove(&game_id);
    }
}
