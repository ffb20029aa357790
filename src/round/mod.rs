pub use registry::{ActiveRound, ActiveRoundRegistry};
pub use service::{FinalizationState, RoundEngine};

pub mod models;
mod registry;
pub mod repository;
mod service;
