//! Transport layer implementations
//!
//! Relay transports that carry [`SignalingMessage`]s between endpoints:
//! an in-process [`MemoryRelay`] hub and, with the `websocket` feature, a
//! [`WebSocketTransport`] client for the `duet relay` server.

use crate::directory::Presence;
use crate::identity::PeerIdentity;
use crate::signaling::{SignalingMessage, SignalingTransport};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Maximum encoded relay frame size (64KB) to prevent DoS attacks
pub const MAX_SIGNALING_MESSAGE_SIZE: usize = 64 * 1024;

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection error
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Send error
    #[error("Send error: {0}")]
    SendError(String),

    /// Receive error
    #[error("Receive error: {0}")]
    ReceiveError(String),

    /// Relay is not accepting messages
    #[error("Relay unavailable: {0}")]
    Unavailable(String),

    /// Inbound stream has ended
    #[error("Transport closed")]
    Closed,
}

/// Relay wire frame
///
/// Clients register once, then exchange `signal` frames; the relay forwards
/// each signal to the connection registered under its `to` identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "kebab-case", bound = "I: PeerIdentity")]
pub enum RelayFrame<I: PeerIdentity> {
    /// Bind this connection to an identity
    Register {
        /// Identity to route to this connection
        user: I,
    },

    /// Addressed signaling message
    Signal(SignalingMessage<I>),

    /// Relay-side diagnostic
    Error {
        /// Human-readable reason
        message: String,
    },
}

impl<I: PeerIdentity> RelayFrame<I> {
    /// Encode as a JSON text frame
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails or the frame is oversized
    pub fn encode(&self) -> Result<String, TransportError> {
        let text = serde_json::to_string(self)
            .map_err(|e| TransportError::SendError(format!("Failed to serialize frame: {}", e)))?;
        if text.len() > MAX_SIGNALING_MESSAGE_SIZE {
            return Err(TransportError::SendError(format!(
                "Frame size {} exceeds maximum of {} bytes",
                text.len(),
                MAX_SIGNALING_MESSAGE_SIZE
            )));
        }
        Ok(text)
    }

    /// Decode a JSON text frame
    ///
    /// # Errors
    ///
    /// Returns error if the frame is oversized or malformed
    pub fn decode(text: &str) -> Result<Self, TransportError> {
        if text.len() > MAX_SIGNALING_MESSAGE_SIZE {
            return Err(TransportError::ReceiveError(format!(
                "Frame size {} exceeds maximum of {} bytes",
                text.len(),
                MAX_SIGNALING_MESSAGE_SIZE
            )));
        }
        serde_json::from_str(text)
            .map_err(|e| TransportError::ReceiveError(format!("Failed to deserialize frame: {}", e)))
    }
}

type Route<I> = mpsc::UnboundedSender<SignalingMessage<I>>;

struct RelayInner<I: PeerIdentity> {
    routes: RwLock<HashMap<String, Route<I>>>,
    available: AtomicBool,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// In-process signaling relay
///
/// Routes messages between [`MemoryTransport`]s by recipient identity. Used
/// by tests and the `duet simulate` command.
#[derive(Clone)]
pub struct MemoryRelay<I: PeerIdentity> {
    inner: Arc<RelayInner<I>>,
}

impl<I: PeerIdentity> Default for MemoryRelay<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: PeerIdentity> MemoryRelay<I> {
    /// Create an empty relay
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RelayInner {
                routes: RwLock::new(HashMap::new()),
                available: AtomicBool::new(true),
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Connect an identity, replacing any previous connection for it
    #[must_use]
    pub fn connect(&self, identity: I) -> MemoryTransport<I> {
        let (tx, rx) = mpsc::unbounded_channel();
        let replaced = self.inner.routes.write().insert(identity.unique_id(), tx);
        if replaced.is_some() {
            tracing::debug!(user = %identity, "Replaced existing relay connection");
        }
        tracing::debug!(user = %identity, "Connected to memory relay");
        MemoryTransport {
            identity,
            relay: Arc::clone(&self.inner),
            inbox: tokio::sync::Mutex::new(rx),
        }
    }

    /// Drop an identity's route; its transport then reports `Closed`
    pub fn disconnect(&self, identity: &I) {
        if self.inner.routes.write().remove(&identity.unique_id()).is_some() {
            tracing::debug!(user = %identity, "Disconnected from memory relay");
        }
    }

    /// Whether an identity currently has a route
    #[must_use]
    pub fn is_connected(&self, identity: &I) -> bool {
        self.inner.routes.read().contains_key(&identity.unique_id())
    }

    /// Simulate a relay outage; sends fail while unavailable
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Push a message straight into `recipient`'s inbox, ignoring `to`
    ///
    /// Returns `false` if the recipient is not connected.
    pub fn inject(&self, recipient: &I, message: SignalingMessage<I>) -> bool {
        let routes = self.inner.routes.read();
        match routes.get(&recipient.unique_id()) {
            Some(route) => route.send(message).is_ok(),
            None => false,
        }
    }

    /// Messages handed to a connected recipient
    #[must_use]
    pub fn delivered_count(&self) -> u64 {
        self.inner.delivered.load(Ordering::Relaxed)
    }

    /// Messages dropped because the recipient was not connected
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl<I: PeerIdentity> Presence for MemoryRelay<I> {
    async fn is_online(&self, user_id: &str) -> bool {
        self.inner.routes.read().contains_key(user_id)
    }
}

/// One endpoint's connection to a [`MemoryRelay`]
pub struct MemoryTransport<I: PeerIdentity> {
    identity: I,
    relay: Arc<RelayInner<I>>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<SignalingMessage<I>>>,
}

impl<I: PeerIdentity> MemoryTransport<I> {
    /// Identity this connection is registered under
    #[must_use]
    pub fn identity(&self) -> &I {
        &self.identity
    }
}

#[async_trait]
impl<I: PeerIdentity> SignalingTransport<I> for MemoryTransport<I> {
    async fn send_message(
        &self,
        to: &I,
        message: SignalingMessage<I>,
    ) -> Result<(), TransportError> {
        if !self.relay.available.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("relay offline".to_string()));
        }

        let routes = self.relay.routes.read();
        match routes.get(&to.unique_id()) {
            Some(route) => {
                if route.send(message).is_err() {
                    self.relay.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(peer = %to, "Recipient inbox closed, message dropped");
                } else {
                    self.relay.delivered.fetch_add(1, Ordering::Relaxed);
                }
            }
            None => {
                self.relay.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(peer = %to, "Recipient not connected, message dropped");
            }
        }
        Ok(())
    }

    async fn receive_message(&self) -> Result<SignalingMessage<I>, TransportError> {
        self.inbox.lock().await.recv().await.ok_or(TransportError::Closed)
    }
}

#[cfg(feature = "websocket")]
pub use self::websocket::WebSocketTransport;

#[cfg(feature = "websocket")]
mod websocket {
    use super::{RelayFrame, TransportError};
    use crate::identity::PeerIdentity;
    use crate::signaling::{SignalingMessage, SignalingTransport};
    use async_trait::async_trait;
    use futures::{SinkExt, StreamExt};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

    /// WebSocket client for the `duet relay` server
    pub struct WebSocketTransport<I: PeerIdentity> {
        identity: I,
        sender: mpsc::UnboundedSender<String>,
        inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<SignalingMessage<I>>>,
        connected: Arc<AtomicBool>,
    }

    impl<I: PeerIdentity> WebSocketTransport<I> {
        /// Connect to `url` and register as `identity`
        ///
        /// # Errors
        ///
        /// Returns error if the URL is invalid or the handshake fails
        #[tracing::instrument(skip(identity), fields(user = %identity))]
        pub async fn connect(url: &str, identity: I) -> Result<Self, TransportError> {
            let parsed = url::Url::parse(url)
                .map_err(|e| TransportError::ConnectionError(format!("Invalid relay URL: {}", e)))?;
            if !matches!(parsed.scheme(), "ws" | "wss") {
                return Err(TransportError::ConnectionError(format!(
                    "Unsupported relay scheme: {}",
                    parsed.scheme()
                )));
            }

            let (ws_stream, _) = connect_async(parsed.as_str())
                .await
                .map_err(|e| TransportError::ConnectionError(format!("WebSocket connect: {}", e)))?;
            let (mut write, mut read) = ws_stream.split();

            let register = RelayFrame::Register {
                user: identity.clone(),
            }
            .encode()?;
            write
                .send(WsMessage::Text(register))
                .await
                .map_err(|e| TransportError::SendError(format!("Failed to register: {}", e)))?;

            let (tx, mut rx) = mpsc::unbounded_channel::<String>();
            let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
            let connected = Arc::new(AtomicBool::new(true));

            // Receive task
            let connected_rx = Arc::clone(&connected);
            tokio::spawn(async move {
                while let Some(msg) = read.next().await {
                    match msg {
                        Ok(WsMessage::Text(text)) => match RelayFrame::<I>::decode(&text) {
                            Ok(RelayFrame::Signal(message)) => {
                                if inbox_tx.send(message).is_err() {
                                    break;
                                }
                            }
                            Ok(RelayFrame::Error { message }) => {
                                tracing::warn!(reason = %message, "Relay reported an error");
                            }
                            Ok(RelayFrame::Register { .. }) => {
                                tracing::debug!("Ignoring register frame from relay");
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "Dropping malformed relay frame");
                            }
                        },
                        Ok(WsMessage::Close(_)) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
                connected_rx.store(false, Ordering::SeqCst);
                tracing::info!("Relay connection closed");
            });

            // Send task
            let connected_tx = Arc::clone(&connected);
            tokio::spawn(async move {
                while let Some(text) = rx.recv().await {
                    if write.send(WsMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
                connected_tx.store(false, Ordering::SeqCst);
            });

            tracing::info!(relay = %parsed, "Connected to signaling relay");
            Ok(Self {
                identity,
                sender: tx,
                inbox: tokio::sync::Mutex::new(inbox_rx),
                connected,
            })
        }

        /// Identity this connection registered as
        #[must_use]
        pub fn identity(&self) -> &I {
            &self.identity
        }

        /// Whether both socket halves are still running
        #[must_use]
        pub fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl<I: PeerIdentity> SignalingTransport<I> for WebSocketTransport<I> {
        async fn send_message(
            &self,
            _to: &I,
            message: SignalingMessage<I>,
        ) -> Result<(), TransportError> {
            if !self.is_connected() {
                return Err(TransportError::Unavailable(
                    "relay connection closed".to_string(),
                ));
            }
            let text = RelayFrame::Signal(message).encode()?;
            self.sender
                .send(text)
                .map_err(|_| TransportError::Unavailable("relay connection closed".to_string()))
        }

        async fn receive_message(&self) -> Result<SignalingMessage<I>, TransportError> {
            self.inbox.lock().await.recv().await.ok_or(TransportError::Closed)
        }
    }
}
