use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::user::models::{StudentStats, UserModel};

/// One active player's standing in the game
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerStanding {
    pub user_id: Uuid,
    pub username: String,
    pub level: i16,
    pub xp: i64,
    /// Competition rank by xp; ties share a rank
    pub rank: usize,
}

/// Who is in the game, ordered by standing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Roster {
    pub game_id: Uuid,
    pub players: Vec<String>,
    pub players_detailed: Vec<PlayerStanding>,
}

impl Roster {
    /// Ranks the given players by xp. Players without stats count as zero xp.
    pub fn build(game_id: Uuid, players: Vec<UserModel>, stats: &[StudentStats]) -> Self {
        let xp_by_user: HashMap<Uuid, i64> = stats.iter().map(|s| (s.user_id, s.xp)).collect();

        let mut standings: Vec<PlayerStanding> = players
            .into_iter()
            .map(|user| PlayerStanding {
                xp: xp_by_user.get(&user.id).copied().unwrap_or(0),
                user_id: user.id,
                username: user.username,
                level: user.difficulty,
                rank: 0,
            })
            .collect();

        standings.sort_by(|a, b| b.xp.cmp(&a.xp).then_with(|| a.username.cmp(&b.username)));

        let xps: Vec<i64> = standings.iter().map(|s| s.xp).collect();
        for standing in &mut standings {
            standing.rank = 1 + xps.iter().filter(|xp| **xp > standing.xp).count();
        }

        Self {
            game_id,
            players: standings.iter().map(|s| s.username.clone()).collect(),
            players_detailed: standings,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }
}
