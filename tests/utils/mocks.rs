use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, RwLock};

use smartmath::recommendation::models::{Direction, Features, Prediction};
use smartmath::recommendation::{ModelOracle, OracleError};
use smartmath::websockets::ConnectionManager;

// ============================================================================
// Mock Infrastructure
// ============================================================================

/// Records every outbound frame per connection id
#[derive(Clone)]
pub struct MockConnectionManager {
    sent_messages: Arc<RwLock<HashMap<String, Vec<String>>>>,
    connected: Arc<RwLock<Vec<String>>>,
}

impl MockConnectionManager {
    pub fn new() -> Self {
        Self {
            sent_messages: Arc::new(RwLock::new(HashMap::new())),
            connected: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub async fn get_messages_for(&self, connection_id: &str) -> Vec<String> {
        self.sent_messages
            .read()
            .await
            .get(connection_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Removes and returns the oldest frame sent to the connection
    pub async fn consume_message_for(&self, connection_id: &str) -> Option<String> {
        let mut sent = self.sent_messages.write().await;
        let queue = sent.get_mut(connection_id)?;
        if queue.is_empty() {
            None
        } else {
            Some(queue.remove(0))
        }
    }

    /// Removes and returns the oldest frame matching `predicate`
    pub async fn consume_first_matching(
        &self,
        connection_id: &str,
        predicate: impl Fn(&str) -> bool,
    ) -> Option<String> {
        let mut sent = self.sent_messages.write().await;
        let queue = sent.get_mut(connection_id)?;
        let position = queue.iter().position(|raw| predicate(raw.as_str()))?;
        Some(queue.remove(position))
    }

    pub async fn clear_messages(&self) {
        self.sent_messages.write().await.clear();
    }

    pub async fn is_connected(&self, connection_id: &str) -> bool {
        self.connected
            .read()
            .await
            .iter()
            .any(|id| id == connection_id)
    }
}

#[async_trait]
impl ConnectionManager for MockConnectionManager {
    async fn add_connection(&self, connection_id: String, _sender: mpsc::UnboundedSender<String>) {
        self.connected.write().await.push(connection_id);
    }

    async fn remove_connection(&self, connection_id: &str) {
        self.connected.write().await.retain(|id| id != connection_id);
    }

    async fn send_to_connection(&self, connection_id: &str, message: &str) {
        self.sent_messages
            .write()
            .await
            .entry(connection_id.to_string())
            .or_default()
            .push(message.to_string());
    }

    async fn send_to_connections(&self, connection_ids: &[String], message: &str) {
        for connection_id in connection_ids {
            self.send_to_connection(connection_id, message).await;
        }
    }
}

/// Handle the tests keep to steer a [`ScriptedOracle`] after it is boxed
#[derive(Clone)]
pub struct OracleControl {
    direction: Arc<Mutex<Direction>>,
    available: Arc<AtomicBool>,
    lessons: Arc<Mutex<Vec<(Features, Direction, f64)>>>,
}

impl OracleControl {
    pub fn recommend(&self, direction: Direction) {
        *self.direction.lock().unwrap() = direction;
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Every (features, label, weight) the model has been taught
    pub fn lessons(&self) -> Vec<(Features, Direction, f64)> {
        self.lessons.lock().unwrap().clone()
    }
}

/// Predicts whatever it is told to, with fixed confidence
pub struct ScriptedOracle {
    control: OracleControl,
}

impl ScriptedOracle {
    pub fn new(direction: Direction) -> (Self, OracleControl) {
        let control = OracleControl {
            direction: Arc::new(Mutex::new(direction)),
            available: Arc::new(AtomicBool::new(true)),
            lessons: Arc::new(Mutex::new(Vec::new())),
        };
        (
            Self {
                control: control.clone(),
            },
            control,
        )
    }
}

impl ModelOracle for ScriptedOracle {
    fn predict(&self, _features: &Features) -> Result<Prediction, OracleError> {
        if !self.control.available.load(Ordering::SeqCst) {
            return Err(OracleError::Unavailable("scripted outage".to_string()));
        }
        let label = *self.control.direction.lock().unwrap();
        let mut probabilities = [0.1, 0.1, 0.1];
        probabilities[label.label()] = 0.8;
        Ok(Prediction {
            label,
            probabilities,
        })
    }

    fn learn(
        &mut self,
        features: &Features,
        label: Direction,
        weight: f64,
    ) -> Result<(), OracleError> {
        self.control
            .lessons
            .lock()
            .unwrap()
            .push((*features, label, weight));
        Ok(())
    }

    fn export(&self) -> Result<Vec<u8>, OracleError> {
        Ok(b"{}".to_vec())
    }
}
