// Room-scoped event plumbing
//
// The Session Manager emits room events after state changes; one
// subscription per room hands them to whatever delivers them to clients.

pub use bus::EventBus;
pub use events::{room_key, RoomEvent};
pub use room_handler::{RoomEventError, RoomEventHandler};
pub use room_subscription::{RoomSubscription, RoomSubscriptions};

mod bus;
mod events;
mod room_handler;
mod room_subscription;
