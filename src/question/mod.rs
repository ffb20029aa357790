pub use handlers::list_topics;
pub use selector::{DistributionTable, QuestionSelector};

mod handlers;
pub mod models;
pub mod repository;
pub mod selector;
