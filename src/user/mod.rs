pub use handlers::{my_stats, student_stats};

mod handlers;
pub mod models;
pub mod repository;
