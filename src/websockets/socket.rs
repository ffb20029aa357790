use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::StreamExt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Simple WebSocket abstraction - all we care about is send/receive
#[async_trait]
pub trait SocketWrapper: Send {
    /// Send a text message to the client
    async fn send_message(&mut self, message: String) -> Result<(), SocketError>;

    /// Receive the next message from the client (None if connection closed)
    async fn receive_message(&mut self) -> Result<Option<String>, SocketError>;

    async fn close(&mut self) -> Result<(), SocketError>;
}

/// Handler for incoming WebSocket messages
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, connection_id: &str, message: String);
}

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),
}

/// Direct implementation on axum's WebSocket
#[async_trait]
impl SocketWrapper for WebSocket {
    async fn send_message(&mut self, message: String) -> Result<(), SocketError> {
        self.send(Message::Text(message))
            .await
            .map_err(|e| SocketError::SendFailed(e.to_string()))
    }

    async fn receive_message(&mut self) -> Result<Option<String>, SocketError> {
        loop {
            match self.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                // Ping/pong is answered by axum; binary frames are not part of the protocol
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(SocketError::ReceiveFailed(e.to_string())),
            }
        }
    }

    async fn close(&mut self) -> Result<(), SocketError> {
        self.send(Message::Close(None))
            .await
            .map_err(|e| SocketError::SendFailed(e.to_string()))
    }
}

/// A managed WebSocket connection
///
/// Pumps messages queued on the outbound channel (by the ConnectionManager)
/// to the client, and hands client frames to the message handler.
pub struct Connection {
    pub connection_id: String,
    socket: Box<dyn SocketWrapper>,
    outbound_receiver: mpsc::UnboundedReceiver<String>,
    message_handler: Arc<dyn MessageHandler>,
}

impl Connection {
    pub fn new(
        connection_id: String,
        socket: Box<dyn SocketWrapper>,
        outbound_receiver: mpsc::UnboundedReceiver<String>,
        message_handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            connection_id,
            socket,
            outbound_receiver,
            message_handler,
        }
    }

    /// Run the connection - handles both sending and receiving until disconnect
    pub async fn run(mut self) -> Result<(), SocketError> {
        loop {
            tokio::select! {
                msg = self.outbound_receiver.recv() => {
                    match msg {
                        Some(message) => self.socket.send_message(message).await?,
                        None => break,
                    }
                }

                msg = self.socket.receive_message() => {
                    match msg? {
                        Some(message) => {
                            self.message_handler
                                .handle_message(&self.connection_id, message)
                                .await;
                        }
                        None => break,
                    }
                }
            }
        }

        let _ = self.socket.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tokio::sync::Mutex;

    /// Replays scripted client frames, then reports the client gone
    struct ScriptedSocket {
        inbound: VecDeque<String>,
        sent: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl SocketWrapper for ScriptedSocket {
        async fn send_message(&mut self, message: String) -> Result<(), SocketError> {
            self.sent.lock().await.push(message);
            Ok(())
        }

        async fn receive_message(&mut self) -> Result<Option<String>, SocketError> {
            match self.inbound.pop_front() {
                Some(message) => Ok(Some(message)),
                None => {
                    // Give queued outbound messages a chance to flush first
                    tokio::task::yield_now().await;
                    Ok(None)
                }
            }
        }

        async fn close(&mut self) -> Result<(), SocketError> {
            Ok(())
        }
    }

    struct Recorder {
        seen: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle_message(&self, connection_id: &str, message: String) {
            self.seen
                .lock()
                .await
                .push((connection_id.to_string(), message));
        }
    }

    #[tokio::test]
    async fn test_inbound_frames_reach_handler() {
        let handler = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let socket = ScriptedSocket {
            inbound: VecDeque::from(vec!["one".to_string(), "two".to_string()]),
            sent: Arc::new(Mutex::new(Vec::new())),
        };
        let (_tx, rx) = mpsc::unbounded_channel();

        Connection::new("conn".to_string(), Box::new(socket), rx, handler.clone())
            .run()
            .await
            .unwrap();

        let seen = handler.seen.lock().await;
        assert_eq!(
            *seen,
            vec![
                ("conn".to_string(), "one".to_string()),
                ("conn".to_string(), "two".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_closed_outbound_channel_ends_connection() {
        let handler = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });

        /// Never produces a frame
        struct Silent;

        #[async_trait]
        impl SocketWrapper for Silent {
            async fn send_message(&mut self, _message: String) -> Result<(), SocketError> {
                Ok(())
            }
            async fn receive_message(&mut self) -> Result<Option<String>, SocketError> {
                std::future::pending().await
            }
            async fn close(&mut self) -> Result<(), SocketError> {
                Ok(())
            }
        }

        let (tx, rx) = mpsc::unbounded_channel::<String>();
        drop(tx);

        Connection::new("conn".to_string(), Box::new(Silent), rx, handler.clone())
            .run()
            .await
            .unwrap();
        assert!(handler.seen.lock().await.is_empty());
    }
}
