use std::path::PathBuf;

/// Runtime configuration, read once from the environment at startup
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    /// Unset means the in-memory store is used
    pub database_url: Option<String>,
    pub jwt_secret: String,
    pub model_path: PathBuf,
    /// Persist oracle parameters every N `learn` calls
    pub model_persist_every: u64,
    /// Accuracy delta below which a delayed label is "same"
    pub label_epsilon: f64,
    /// Sample weight of a real (non-synthetic) training example at full confidence
    pub real_sample_weight: f64,
    pub batch_limit: usize,
    pub game_code_length: usize,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            bind_addr: std::env::var("BIND_ADDR").unwrap_or(defaults.bind_addr),
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),
            jwt_secret: std::env::var("JWT_SECRET").unwrap_or(defaults.jwt_secret),
            model_path: std::env::var("MODEL_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.model_path),
            model_persist_every: env_parse("MODEL_PERSIST_EVERY")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.model_persist_every),
            label_epsilon: env_parse("LABEL_EPSILON").unwrap_or(defaults.label_epsilon),
            real_sample_weight: env_parse("REAL_SAMPLE_WEIGHT")
                .unwrap_or(defaults.real_sample_weight),
            batch_limit: env_parse("BATCH_LIMIT")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.batch_limit),
            game_code_length: env_parse("GAME_CODE_LENGTH")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.game_code_length),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".to_string(),
            database_url: None,
            jwt_secret: "your-secret-key-change-in-production".to_string(),
            model_path: PathBuf::from("model/model.json"),
            model_persist_every: 10,
            label_epsilon: 0.1,
            real_sample_weight: 5.0,
            batch_limit: 10,
            game_code_length: 4,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|raw| raw.trim().parse().ok())
}
