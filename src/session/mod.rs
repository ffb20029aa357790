pub use manager::{AnswerSubmission, FinishedBy, SessionManager};
pub use roster::{PlayerStanding, Roster};

mod manager;
mod roster;
