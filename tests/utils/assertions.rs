use serde_json::Value;

use smartmath::websockets::{MessageType, WebSocketMessage};

use super::setup::TestSetup;

// ============================================================================
// Message Assertions
// ============================================================================

pub struct MessageAssertion<'a> {
    setup: &'a TestSetup,
    connections: Vec<String>,
}

impl<'a> MessageAssertion<'a> {
    pub fn for_connection(setup: &'a TestSetup, connection_id: &str) -> Self {
        Self::for_connections(setup, vec![connection_id])
    }

    pub fn for_connections(setup: &'a TestSetup, connections: Vec<&str>) -> Self {
        Self {
            setup,
            connections: connections.into_iter().map(|s| s.to_string()).collect(),
        }
    }

    /// The next frame each connection received is of this type.
    /// Returns the first connection's payload.
    pub async fn received_message_type(&self, expected_type: MessageType) -> MessageContent {
        let mut first = None;
        for connection in &self.connections {
            let raw = self
                .setup
                .mock_conn_manager
                .consume_message_for(connection)
                .await
                .unwrap_or_else(|| {
                    panic!("{} has no message, expected {:?}", connection, expected_type)
                });
            let msg = parse(&raw);
            assert_eq!(
                msg.message_type, expected_type,
                "{} received the wrong message: {}",
                connection, raw
            );
            first.get_or_insert(MessageContent {
                payload: msg.payload,
            });
        }
        first.expect("assertion needs at least one connection")
    }

    /// Some queued frame of this type exists; frames before it are kept
    pub async fn received_eventually(&self, expected_type: MessageType) -> MessageContent {
        let mut first = None;
        for connection in &self.connections {
            let raw = self
                .setup
                .mock_conn_manager
                .consume_first_matching(connection, |raw| parse(raw).message_type == expected_type)
                .await
                .unwrap_or_else(|| {
                    panic!("{} never received {:?}", connection, expected_type)
                });
            first.get_or_insert(MessageContent {
                payload: parse(&raw).payload,
            });
        }
        first.expect("assertion needs at least one connection")
    }

    pub async fn received_no_messages(&self) {
        for connection in &self.connections {
            let messages = self.setup.mock_conn_manager.get_messages_for(connection).await;
            assert!(
                messages.is_empty(),
                "{} should have no messages, got {:?}",
                connection,
                messages
            );
        }
    }

    pub async fn count_message_type(&self, message_type: MessageType) -> usize {
        let mut count = 0;
        for connection in &self.connections {
            count += self
                .setup
                .mock_conn_manager
                .get_messages_for(connection)
                .await
                .iter()
                .filter(|raw| parse(raw).message_type == message_type)
                .count();
        }
        count
    }
}

fn parse(raw: &str) -> WebSocketMessage {
    serde_json::from_str(raw).unwrap_or_else(|e| panic!("unparseable frame {}: {}", raw, e))
}

// ============================================================================
// Message Content Assertions
// ============================================================================

pub struct MessageContent {
    pub payload: Value,
}

impl MessageContent {
    pub fn with_players(self, expected: Vec<&str>) -> Self {
        let players: Vec<String> = serde_json::from_value(self.payload["players"].clone()).unwrap();
        assert_eq!(players, expected);
        self
    }

    pub fn with_error_containing(self, fragment: &str) -> Self {
        let message = self.payload["message"].as_str().unwrap_or_default();
        assert!(
            message.contains(fragment),
            "error {:?} does not mention {:?}",
            message,
            fragment
        );
        self
    }

    pub fn with_question_count(self, expected: usize) -> Self {
        let questions = self.payload["questions"].as_array().unwrap();
        assert_eq!(questions.len(), expected);
        self
    }

    pub fn round_id(&self) -> uuid::Uuid {
        serde_json::from_value(self.payload["round_id"].clone()).unwrap()
    }

    pub fn question_ids(&self) -> Vec<uuid::Uuid> {
        self.payload["questions"]
            .as_array()
            .unwrap()
            .iter()
            .map(|q| serde_json::from_value(q["question_id"].clone()).unwrap())
            .collect()
    }

    pub fn difficulties(&self) -> Vec<i64> {
        self.payload["questions"]
            .as_array()
            .unwrap()
            .iter()
            .map(|q| q["difficulty"].as_i64().unwrap())
            .collect()
    }

    pub fn field_f64(&self, field: &str) -> f64 {
        self.payload[field].as_f64().unwrap()
    }

    pub fn field_i64(&self, field: &str) -> i64 {
        self.payload[field].as_i64().unwrap()
    }

    pub fn field_str(&self, field: &str) -> String {
        self.payload[field].as_str().unwrap().to_string()
    }
}
