pub use handlers::{feedback, list_actions, override_recommendation, predict};
pub use oracle::{FileSnapshotStore, ModelOracle, OracleError, OracleSnapshotStore, SharedOracle};
pub use service::{FinalizedRound, LabelPolicy, RecommendationEngine};

mod handlers;
pub mod models;
pub mod oracle;
pub mod repository;
mod service;
pub mod softmax;
