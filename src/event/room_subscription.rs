use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast::error::RecvError, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{bus::EventBus, room_handler::RoomEventHandler};

/// Routes one room's events to a handler until the room closes
pub struct RoomSubscription {
    room_id: String,
    handler: Arc<dyn RoomEventHandler>,
    event_bus: EventBus,
}

impl RoomSubscription {
    pub fn new(room_id: String, handler: Arc<dyn RoomEventHandler>, event_bus: EventBus) -> Self {
        Self {
            room_id,
            handler,
            event_bus,
        }
    }

    /// Subscribes, then spawns the task that feeds events to the handler.
    /// Events emitted after this returns are guaranteed to be seen.
    pub async fn start(self) -> JoinHandle<()> {
        let room_id = self.room_id.clone();
        let handler_name = self.handler.handler_name();

        info!(
            room_id = %room_id,
            handler = handler_name,
            "Starting room subscription"
        );

        let mut receiver = self.event_bus.subscribe_to_room(&room_id).await;

        tokio::spawn(async move {
            loop {
                let event = match receiver.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(room_id = %room_id, skipped, "Room subscription lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };

                let terminal = event.is_terminal();
                if let Err(e) = self.handler.handle_room_event(&room_id, event).await {
                    warn!(
                        room_id = %room_id,
                        handler = handler_name,
                        error = %e,
                        "Room event handler failed"
                    );
                }

                if terminal {
                    self.event_bus.close_room(&room_id).await;
                    break;
                }
            }

            info!(
                room_id = %room_id,
                handler = handler_name,
                "Room subscription ended"
            );
        })
    }
}

/// Starts at most one live subscription per room
pub struct RoomSubscriptions {
    event_bus: EventBus,
    handler: Arc<dyn RoomEventHandler>,
    running: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl RoomSubscriptions {
    pub fn new(event_bus: EventBus, handler: Arc<dyn RoomEventHandler>) -> Self {
        Self {
            event_bus,
            handler,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Makes sure the room has a running subscription
    pub async fn ensure(&self, room_id: &str) {
        let mut running = self.running.lock().await;
        running.retain(|_, task| !task.is_finished());

        if running.contains_key(room_id) {
            return;
        }

        let task = RoomSubscription::new(
            room_id.to_string(),
            Arc::clone(&self.handler),
            self.event_bus.clone(),
        )
        .start()
        .await;
        running.insert(room_id.to_string(), task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{RoomEvent, RoomEventError};
    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    struct Forwarding {
        seen: mpsc::UnboundedSender<RoomEvent>,
    }

    #[async_trait]
    impl RoomEventHandler for Forwarding {
        async fn handle_room_event(
            &self,
            _room_id: &str,
            event: RoomEvent,
        ) -> Result<(), RoomEventError> {
            let _ = self.seen.send(event);
            Ok(())
        }

        fn handler_name(&self) -> &'static str {
            "Forwarding"
        }
    }

    #[tokio::test]
    async fn test_subscription_ends_after_terminal_event() {
        let bus = EventBus::new(16);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = RoomSubscription::new("room".to_string(), Arc::new(Forwarding { seen: tx }), bus.clone())
            .start()
            .await;

        let game_id = Uuid::new_v4();
        bus.emit_to_room(
            "room",
            RoomEvent::GameStarted {
                game_id,
                topic_id: Uuid::new_v4(),
            },
        )
        .await;
        bus.emit_to_room("room", RoomEvent::GameClosed { game_id }).await;

        task.await.unwrap();
        assert!(matches!(rx.recv().await, Some(RoomEvent::GameStarted { .. })));
        assert!(matches!(rx.recv().await, Some(RoomEvent::GameClosed { .. })));
        assert!(!bus.has_room("room").await);
    }

    #[tokio::test]
    async fn test_ensure_starts_one_subscription_per_room() {
        let bus = EventBus::new(16);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscriptions = RoomSubscriptions::new(bus.clone(), Arc::new(Forwarding { seen: tx }));

        subscriptions.ensure("room").await;
        subscriptions.ensure("room").await;
        bus.emit_to_room("room", RoomEvent::GameClosed { game_id: Uuid::new_v4() }).await;

        assert!(matches!(rx.recv().await, Some(RoomEvent::GameClosed { .. })));
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }
}
