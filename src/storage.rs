use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;
use uuid::Uuid;

use crate::game::models::{GameModel, GamePlayerModel};
use crate::game::repository::InMemoryGameRepository;
use crate::question::models::{QuestionModel, TopicModel};
use crate::question::repository::InMemoryQuestionRepository;
use crate::recommendation::models::{RecommendationModel, TeacherActionModel};
use crate::recommendation::repository::InMemoryTeacherActionRepository;
use crate::round::models::{AttemptModel, RoundModel};
use crate::round::repository::InMemoryRoundRepository;
use crate::shared::{AppError, Repositories};
use crate::user::models::{StudentStats, UserModel};
use crate::user::repository::InMemoryUserRepository;

/// Every table of the in-memory store. One lock guards all of them, so a
/// multi-table write performed under a single guard is atomic.
#[derive(Debug, Default)]
pub struct Tables {
    pub users: HashMap<Uuid, UserModel>,
    pub stats: HashMap<Uuid, StudentStats>,
    pub topics: HashMap<Uuid, TopicModel>,
    pub questions: HashMap<Uuid, QuestionModel>,
    pub games: HashMap<Uuid, GameModel>,
    pub game_players: Vec<GamePlayerModel>,
    pub rounds: HashMap<Uuid, RoundModel>,
    pub round_questions: HashMap<Uuid, Vec<Uuid>>,
    pub attempts: Vec<AttemptModel>,
    pub recommendations: HashMap<Uuid, RecommendationModel>,
    pub teacher_actions: Vec<TeacherActionModel>,
}

/// In-memory backing store for development and testing.
///
/// Data is lost when the process exits. The repositories built by
/// [`InMemoryDatabase::repositories`] share this one instance.
#[derive(Debug, Default)]
pub struct InMemoryDatabase {
    tables: Mutex<Tables>,
    outage: AtomicBool,
}

impl InMemoryDatabase {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn repositories(self: &Arc<Self>) -> Repositories {
        Repositories {
            users: Arc::new(InMemoryUserRepository::new(self.clone())),
            questions: Arc::new(InMemoryQuestionRepository::new(self.clone())),
            games: Arc::new(InMemoryGameRepository::new(self.clone())),
            rounds: Arc::new(InMemoryRoundRepository::new(self.clone())),
            teacher_actions: Arc::new(InMemoryTeacherActionRepository::new(self.clone())),
        }
    }

    /// Locks all tables, failing while an outage is simulated
    pub fn tables(&self) -> Result<MutexGuard<'_, Tables>, AppError> {
        if self.outage.load(Ordering::SeqCst) {
            warn!("In-memory store is simulating an outage");
            return Err(AppError::DatabaseError("store unavailable".to_string()));
        }
        self.tables.lock().map_err(|_| {
            warn!("In-memory store lock poisoned");
            AppError::Internal
        })
    }

    /// Makes every subsequent store access fail until switched back
    pub fn simulate_outage(&self, down: bool) {
        self.outage.store(down, Ordering::SeqCst);
    }

    pub fn insert_user(&self, user: UserModel) -> Result<(), AppError> {
        let mut tables = self.tables()?;
        if tables.users.values().any(|u| u.username == user.username) {
            return Err(AppError::Conflict(format!(
                "Username {} already exists",
                user.username
            )));
        }
        tables.users.insert(user.id, user);
        Ok(())
    }

    pub fn insert_topic(&self, topic: TopicModel) -> Result<(), AppError> {
        self.tables()?.topics.insert(topic.id, topic);
        Ok(())
    }

    pub fn insert_question(&self, question: QuestionModel) -> Result<(), AppError> {
        let mut tables = self.tables()?;
        if !tables.topics.contains_key(&question.topic_id) {
            return Err(AppError::NotFound("Topic not found".to_string()));
        }
        tables.questions.insert(question.id, question);
        Ok(())
    }
}
