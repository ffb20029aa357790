use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::Role;

pub const MIN_TIER: i16 = 1;
pub const MAX_TIER: i16 = 5;
pub const DEFAULT_TIER: i16 = 1;

/// Account row. `difficulty` is the student's current tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserModel {
    pub id: Uuid,
    pub username: String,
    pub role: Role,
    pub difficulty: i16,
    pub created_at: DateTime<Utc>,
}

impl UserModel {
    pub fn new(username: impl Into<String>, role: Role) -> Self {
        Self {
            id: Uuid::new_v4(),
            username: username.into(),
            role,
            difficulty: DEFAULT_TIER,
            created_at: Utc::now(),
        }
    }

    pub fn student(username: impl Into<String>) -> Self {
        Self::new(username, Role::Student)
    }

    pub fn teacher(username: impl Into<String>) -> Self {
        Self::new(username, Role::Teacher)
    }

    pub fn with_tier(mut self, tier: i16) -> Self {
        self.difficulty = clamp_tier(tier);
        self
    }
}

pub fn clamp_tier(tier: i16) -> i16 {
    tier.clamp(MIN_TIER, MAX_TIER)
}

/// Running per-student totals, updated once per finalized round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentStats {
    pub user_id: Uuid,
    pub total_attempts: i64,
    pub overall_accuracy: f64,
    pub xp: i64,
}

impl StudentStats {
    pub fn empty(user_id: Uuid) -> Self {
        Self {
            user_id,
            total_attempts: 0,
            overall_accuracy: 0.0,
            xp: 0,
        }
    }

    /// Folds one round in and returns the xp it earned
    pub fn incorporate(&mut self, round_attempts: i64, round_accuracy: f64) -> i64 {
        let round_attempts = round_attempts.max(0);
        let total = self.total_attempts + round_attempts;
        if total > 0 {
            self.overall_accuracy = (self.overall_accuracy * self.total_attempts as f64
                + round_accuracy * round_attempts as f64)
                / total as f64;
        }
        self.total_attempts = total;

        let xp_gained = xp_for_accuracy(round_accuracy);
        self.xp += xp_gained;
        xp_gained
    }
}

pub fn xp_for_accuracy(accuracy: f64) -> i64 {
    (accuracy.clamp(0.0, 1.0) * 100.0).round() as i64
}
