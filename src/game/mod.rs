pub use handlers::create_game;
pub use models::{GameModel, GamePlayerModel, GameStatus};

pub mod codes;
mod handlers;
pub mod models;
pub mod repository;
