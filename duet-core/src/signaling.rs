//! Call signaling protocol
//!
//! Typed signaling messages and the channel adapter that relays them between
//! the local call manager and a transport. The adapter does not interpret
//! message semantics; it only addresses, validates, and dispatches.

use crate::identity::PeerIdentity;
use crate::transport::TransportError;
use crate::types::{CallId, EndReason, IceCandidate, MediaType, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};

/// Maximum SDP string length accepted from the wire
pub const MAX_SDP_LENGTH: usize = 32 * 1024;

/// Maximum ICE candidate string length accepted from the wire
pub const MAX_CANDIDATE_LENGTH: usize = 1024;

/// Maximum identity length accepted from the wire
pub const MAX_IDENTITY_LENGTH: usize = 256;

/// Minimum time between received messages (10ms for 100 msg/sec rate limit)
const MIN_MESSAGE_INTERVAL: Duration = Duration::from_millis(10);

/// Signaling errors
#[derive(Error, Debug)]
pub enum SignalingError {
    /// Relay could not take the message
    #[error("Signaling unavailable: {0}")]
    Unavailable(String),

    /// A handler is already registered on this channel
    #[error("A signaling handler is already registered")]
    HandlerAlreadyRegistered,

    /// Message failed validation
    #[error("Invalid signaling message: {0}")]
    InvalidMessage(String),
}

impl From<TransportError> for SignalingError {
    fn from(err: TransportError) -> Self {
        SignalingError::Unavailable(err.to_string())
    }
}

/// Type-specific signaling payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalPayload {
    /// Call offer
    Offer {
        /// Call attempt
        call_id: CallId,
        /// Offered media type
        media_type: MediaType,
        /// SDP offer
        sdp: String,
    },

    /// Call answer
    Answer {
        /// Call attempt
        call_id: CallId,
        /// SDP answer
        sdp: String,
    },

    /// Trickled ICE candidate
    IceCandidate {
        /// Call attempt
        call_id: CallId,
        /// Candidate string
        candidate: String,
        /// SDP mid
        sdp_mid: Option<String>,
        /// SDP mline index
        sdp_mline_index: Option<u16>,
    },

    /// End, reject, cancel or busy
    End {
        /// Call attempt
        call_id: CallId,
        /// Why the call ended
        reason: Option<EndReason>,
    },

    /// Sender switched to audio plus video
    SwitchToVideo {
        /// Call attempt
        call_id: CallId,
    },

    /// Sender switched to audio only
    SwitchToAudio {
        /// Call attempt
        call_id: CallId,
    },

    /// Sender's camera track enabled flag changed
    VideoToggle {
        /// Call attempt
        call_id: CallId,
        /// Camera enabled
        enabled: bool,
    },
}

impl SignalPayload {
    /// Build an offer payload
    #[must_use]
    pub fn offer(call_id: CallId, media_type: MediaType, offer: &SessionDescription) -> Self {
        Self::Offer {
            call_id,
            media_type,
            sdp: offer.sdp.clone(),
        }
    }

    /// Build an answer payload
    #[must_use]
    pub fn answer(call_id: CallId, answer: &SessionDescription) -> Self {
        Self::Answer {
            call_id,
            sdp: answer.sdp.clone(),
        }
    }

    /// Build an ICE candidate payload
    #[must_use]
    pub fn ice_candidate(call_id: CallId, candidate: IceCandidate) -> Self {
        Self::IceCandidate {
            call_id,
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
        }
    }

    /// Build an end payload
    #[must_use]
    pub fn end(call_id: CallId, reason: EndReason) -> Self {
        Self::End {
            call_id,
            reason: Some(reason),
        }
    }

    /// Get the call ID
    #[must_use]
    pub fn call_id(&self) -> CallId {
        match self {
            Self::Offer { call_id, .. }
            | Self::Answer { call_id, .. }
            | Self::IceCandidate { call_id, .. }
            | Self::End { call_id, .. }
            | Self::SwitchToVideo { call_id }
            | Self::SwitchToAudio { call_id }
            | Self::VideoToggle { call_id, .. } => *call_id,
        }
    }

    /// Wire name of the payload type
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::End { .. } => "end",
            Self::SwitchToVideo { .. } => "switch-to-video",
            Self::SwitchToAudio { .. } => "switch-to-audio",
            Self::VideoToggle { .. } => "video-toggle",
        }
    }

    /// Check size limits of variable-length fields
    ///
    /// # Errors
    ///
    /// Returns error naming the first oversized field
    pub fn validate(&self) -> Result<(), SignalingError> {
        match self {
            Self::Offer { sdp, .. } | Self::Answer { sdp, .. } => {
                if sdp.len() > MAX_SDP_LENGTH {
                    return Err(SignalingError::InvalidMessage(format!(
                        "SDP too large: {} bytes",
                        sdp.len()
                    )));
                }
            }
            Self::IceCandidate { candidate, .. } => {
                if candidate.len() > MAX_CANDIDATE_LENGTH {
                    return Err(SignalingError::InvalidMessage(format!(
                        "ICE candidate too large: {} bytes",
                        candidate.len()
                    )));
                }
            }
            Self::End { .. }
            | Self::SwitchToVideo { .. }
            | Self::SwitchToAudio { .. }
            | Self::VideoToggle { .. } => {}
        }
        Ok(())
    }
}

/// Addressed signaling envelope
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(bound = "I: PeerIdentity")]
pub struct SignalingMessage<I: PeerIdentity> {
    /// Sender
    pub from: I,
    /// Recipient
    pub to: I,
    /// Payload
    #[serde(flatten)]
    pub payload: SignalPayload,
}

impl<I: PeerIdentity> SignalingMessage<I> {
    /// Create a new envelope
    pub fn new(from: I, to: I, payload: SignalPayload) -> Self {
        Self { from, to, payload }
    }

    /// Check envelope and payload limits
    ///
    /// # Errors
    ///
    /// Returns error if an identity or payload field is oversized
    pub fn validate(&self) -> Result<(), SignalingError> {
        for id in [&self.from, &self.to] {
            if id.to_string_repr().len() > MAX_IDENTITY_LENGTH {
                return Err(SignalingError::InvalidMessage(
                    "identity too long".to_string(),
                ));
            }
        }
        self.payload.validate()
    }
}

/// Signaling transport trait
///
/// Implement this for your relay (in-process hub, WebSocket, ...).
#[async_trait]
pub trait SignalingTransport<I: PeerIdentity>: Send + Sync {
    /// Send a signaling message to `to`
    async fn send_message(&self, to: &I, message: SignalingMessage<I>)
        -> Result<(), TransportError>;

    /// Receive the next inbound message; `TransportError::Closed` ends the stream
    async fn receive_message(&self) -> Result<SignalingMessage<I>, TransportError>;
}

/// Sole subscriber of a [`SignalingChannel`]
#[async_trait]
pub trait SignalingHandler<I: PeerIdentity>: Send + Sync {
    /// Handle one inbound message addressed to the local identity
    async fn on_signal(&self, message: SignalingMessage<I>);
}

/// Signaling channel adapter with rate limiting
pub struct SignalingChannel<I: PeerIdentity> {
    local: I,
    transport: Arc<dyn SignalingTransport<I>>,
    handler: Mutex<Option<Arc<dyn SignalingHandler<I>>>>,
    last_receive_time: tokio::sync::Mutex<Instant>,
    error_count: tokio::sync::Mutex<u32>,
}

impl<I: PeerIdentity> SignalingChannel<I> {
    /// Create new signaling channel for `local`
    #[must_use]
    pub fn new(local: I, transport: Arc<dyn SignalingTransport<I>>) -> Self {
        Self {
            local,
            transport,
            handler: Mutex::new(None),
            last_receive_time: tokio::sync::Mutex::new(Instant::now()),
            error_count: tokio::sync::Mutex::new(0),
        }
    }

    /// Identity messages are sent from
    #[must_use]
    pub fn local_identity(&self) -> &I {
        &self.local
    }

    /// Register the handler for all inbound messages
    ///
    /// # Errors
    ///
    /// Returns error if a handler is already registered
    pub fn on_message(&self, handler: Arc<dyn SignalingHandler<I>>) -> Result<(), SignalingError> {
        let mut slot = self.handler.lock();
        if slot.is_some() {
            return Err(SignalingError::HandlerAlreadyRegistered);
        }
        *slot = Some(handler);
        Ok(())
    }

    /// Whether a handler is registered
    #[must_use]
    pub fn has_handler(&self) -> bool {
        self.handler.lock().is_some()
    }

    /// Send a payload to a peer
    ///
    /// # Errors
    ///
    /// Returns `SignalingError::Unavailable` if the transport rejects the send
    #[tracing::instrument(skip(self, payload), fields(peer = %to, message_type = payload.kind(), call_id = %payload.call_id()))]
    pub async fn send(&self, to: &I, payload: SignalPayload) -> Result<(), SignalingError> {
        tracing::debug!("Sending signaling message");
        let message = SignalingMessage::new(self.local.clone(), to.clone(), payload);
        self.transport
            .send_message(to, message)
            .await
            .map_err(SignalingError::from)
    }

    /// Receive a signaling message with rate limiting and backoff
    ///
    /// # Errors
    ///
    /// Returns error if receiving fails
    #[tracing::instrument(skip(self), fields(local = %self.local))]
    pub async fn receive_message(&self) -> Result<SignalingMessage<I>, TransportError> {
        let mut last_time = self.last_receive_time.lock().await;
        let elapsed = Instant::now().duration_since(*last_time);

        if elapsed < MIN_MESSAGE_INTERVAL {
            let sleep_duration = MIN_MESSAGE_INTERVAL - elapsed;
            tracing::trace!(
                sleep_ms = sleep_duration.as_millis(),
                "Rate limiting applied"
            );
            drop(last_time);
            sleep(sleep_duration).await;
            last_time = self.last_receive_time.lock().await;
        }

        *last_time = Instant::now();
        drop(last_time);

        match self.transport.receive_message().await {
            Ok(message) => {
                *self.error_count.lock().await = 0;
                tracing::debug!(
                    peer = %message.from,
                    message_type = message.payload.kind(),
                    "Received signaling message"
                );
                Ok(message)
            }
            Err(TransportError::Closed) => Err(TransportError::Closed),
            Err(e) => {
                let mut error_count = self.error_count.lock().await;
                *error_count += 1;
                let count = *error_count;
                drop(error_count);

                let backoff_duration = Duration::from_millis(100 * u64::from(count.min(10)));
                tracing::warn!(
                    error_count = count,
                    backoff_ms = backoff_duration.as_millis(),
                    error = %e,
                    "Error receiving message, applying backoff"
                );
                sleep(backoff_duration).await;

                Err(e)
            }
        }
    }

    /// Filter and hand one inbound message to the registered handler
    ///
    /// Returns `true` if the message reached the handler.
    pub async fn dispatch(&self, message: SignalingMessage<I>) -> bool {
        if message.to != self.local {
            tracing::debug!(
                to = %message.to,
                local = %self.local,
                "Dropping signaling message addressed to another user"
            );
            return false;
        }

        if let Err(e) = message.validate() {
            tracing::warn!(peer = %message.from, error = %e, "Dropping invalid signaling message");
            return false;
        }

        let handler = self.handler.lock().clone();
        match handler {
            Some(handler) => {
                handler.on_signal(message).await;
                true
            }
            None => {
                tracing::warn!(
                    message_type = message.payload.kind(),
                    "No signaling handler registered, dropping message"
                );
                false
            }
        }
    }

    /// Pump inbound messages until the transport closes
    pub async fn run(&self) {
        tracing::info!(local = %self.local, "Signaling receive loop started");
        loop {
            match self.receive_message().await {
                Ok(message) => {
                    self.dispatch(message).await;
                }
                Err(TransportError::Closed) => break,
                Err(_) => continue,
            }
        }
        tracing::info!(local = %self.local, "Signaling receive loop stopped");
    }

    /// Spawn [`Self::run`] on the current runtime
    #[must_use]
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let channel = Arc::clone(self);
        tokio::spawn(async move { channel.run().await })
    }
}
