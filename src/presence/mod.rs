pub use tracker::{ConnectionContext, ConnectionMode, PresenceTracker};

mod tracker;
