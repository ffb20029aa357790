use std::sync::Arc;
use uuid::Uuid;

use smartmath::auth::{Principal, TokenConfig};
use smartmath::config::AppConfig;
use smartmath::game::GameModel;
use smartmath::question::models::{AnswerPayload, QuestionModel, TopicModel};
use smartmath::recommendation::models::Direction;
use smartmath::recommendation::oracle::InMemorySnapshotStore;
use smartmath::recommendation::SharedOracle;
use smartmath::storage::InMemoryDatabase;
use smartmath::user::models::UserModel;
use smartmath::websockets::{ConnectionManager, WebsocketReceiveHandler};
use smartmath::AppState;

use super::mocks::{MockConnectionManager, OracleControl, ScriptedOracle};

// ============================================================================
// Test Setup Infrastructure
// ============================================================================

pub const TEACHER: &str = "teacher";
const JWT_SECRET: &str = "integration-secret";
const QUESTIONS_PER_TIER: i16 = 12;

pub struct TestSetup {
    pub db: Arc<InMemoryDatabase>,
    pub state: AppState,
    pub mock_conn_manager: Arc<MockConnectionManager>,
    pub input_handler: WebsocketReceiveHandler,
    pub oracle: OracleControl,
    pub teacher: UserModel,
    pub topic: TopicModel,
    pub students: Vec<UserModel>,
}

pub struct TestSetupBuilder {
    students: Vec<String>,
    direction: Direction,
}

impl TestSetupBuilder {
    pub fn new() -> Self {
        Self {
            students: vec![],
            direction: Direction::Same,
        }
    }

    pub fn with_students(mut self, students: Vec<&str>) -> Self {
        self.students = students.into_iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_two_students(self) -> Self {
        self.with_students(vec!["alice", "bob"])
    }

    /// What the model recommends until told otherwise
    pub fn recommending(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub async fn build(self) -> TestSetup {
        let db = InMemoryDatabase::new();

        let teacher = UserModel::teacher(TEACHER);
        db.insert_user(teacher.clone()).unwrap();

        let topic = TopicModel::new("fractions");
        db.insert_topic(topic.clone()).unwrap();
        for difficulty in 1..=5 {
            for n in 0..QUESTIONS_PER_TIER {
                db.insert_question(QuestionModel::new(
                    topic.id,
                    format!("{} + {} = ?", difficulty, n),
                    difficulty,
                    AnswerPayload::Numeric {
                        correct_answer: f64::from(difficulty + n),
                    },
                ))
                .unwrap();
            }
        }

        let students: Vec<UserModel> = self
            .students
            .iter()
            .map(|name| {
                let student = UserModel::student(name.as_str());
                db.insert_user(student.clone()).unwrap();
                student
            })
            .collect();

        let config = AppConfig {
            jwt_secret: JWT_SECRET.to_string(),
            ..AppConfig::default()
        };
        let (model, oracle) = ScriptedOracle::new(self.direction);
        let shared_oracle = Arc::new(SharedOracle::new(
            Box::new(model),
            Arc::new(InMemorySnapshotStore::new()),
            config.model_persist_every,
        ));

        let mock_conn_manager = Arc::new(MockConnectionManager::new());
        let state = AppState::new(
            config,
            db.repositories(),
            shared_oracle,
            mock_conn_manager.clone(),
        );
        let input_handler = WebsocketReceiveHandler::new(
            state.session_manager.clone(),
            mock_conn_manager.clone(),
        );

        let setup = TestSetup {
            db,
            state,
            mock_conn_manager,
            input_handler,
            oracle,
            teacher: teacher.clone(),
            topic,
            students: students.clone(),
        };

        // Connection id == username, like one browser tab per person
        setup.connect(TEACHER, &teacher).await;
        for student in &students {
            setup.connect(&student.username, student).await;
        }
        setup
    }
}

impl TestSetup {
    /// Opens a connection the way the /ws endpoint does, with a real token
    pub async fn connect(&self, connection_id: &str, user: &UserModel) {
        let token = TokenConfig::new(JWT_SECRET)
            .create_token(user.id, user.role, &user.username)
            .unwrap();
        let principal = self
            .state
            .presence
            .authenticate(&format!("Bearer {}", token))
            .await
            .unwrap();

        let (sender, _receiver) = tokio::sync::mpsc::unbounded_channel();
        self.mock_conn_manager
            .add_connection(connection_id.to_string(), sender)
            .await;
        self.state
            .presence
            .attach_session(connection_id, principal)
            .await;
    }

    pub fn teacher_principal(&self) -> Principal {
        Principal {
            user_id: self.teacher.id,
            role: self.teacher.role,
            username: self.teacher.username.clone(),
        }
    }

    pub fn student(&self, name: &str) -> &UserModel {
        self.students
            .iter()
            .find(|s| s.username == name)
            .unwrap_or_else(|| panic!("no student named {}", name))
    }

    /// Creates a game on the fixture topic, owned by the fixture teacher
    pub async fn create_game(&self) -> GameModel {
        self.state
            .session_manager
            .create_game(&self.teacher_principal(), Some(self.topic.id))
            .await
            .unwrap()
    }

    pub fn game_row(&self, game_id: Uuid) -> GameModel {
        self.db.tables().unwrap().games[&game_id].clone()
    }

    pub fn student_row(&self, name: &str) -> UserModel {
        let id = self.student(name).id;
        self.db.tables().unwrap().users[&id].clone()
    }
}
