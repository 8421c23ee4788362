//! Duet - two-party call signaling and negotiation
//!
//! This library drives one endpoint of a one-to-one audio/video call. It
//! provides:
//!
//! - **Signaling**: typed offer/answer/candidate/end envelopes over any relay
//! - **Call state machine**: idle, calling, incoming and in-call with
//!   ring timeouts, busy handling and cancellation
//! - **Media sessions**: a capability trait with a WebRTC backend and a
//!   deterministic simulator
//! - **Call history**: exactly one record per call and participant
//!
//! # Examples
//!
//! ```rust,no_run
//! use duet_core::prelude::*;
//! use duet_core::media::{SimulatedMediaConfig, SimulatedMediaManager};
//! use duet_core::transport::MemoryRelay;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let relay = MemoryRelay::new();
//! let alice = UserId::new("alice");
//! let transport = Arc::new(relay.connect(alice.clone()));
//! let media = Arc::new(SimulatedMediaManager::new(SimulatedMediaConfig::default()));
//!
//! let service = CallService::builder(alice, transport, media)
//!     .with_presence(Arc::new(relay.clone()))
//!     .build()?;
//! service.start()?;
//!
//! let call_id = service
//!     .calls()
//!     .initiate(UserId::new("bob"), MediaType::Video)
//!     .await?;
//! # let _ = call_id;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

/// Core call types and data structures
pub mod types;

/// Peer identity abstraction
pub mod identity;

/// Signaling protocol and channel
pub mod signaling;

/// Relay transports
pub mod transport;

/// Media capture and peer sessions
pub mod media;

/// WebRTC peer session backend
#[cfg(feature = "webrtc-backend")]
pub mod rtc;

/// User profiles and presence
pub mod directory;

/// Call history persistence
pub mod history;

/// Ringtone and ringback playback
pub mod tone;

/// Call state machine
pub mod call;

/// Endpoint orchestration
pub mod service;

// Re-export main types at crate root
pub use call::{CallError, CallManager, CallManagerBuilder, CallManagerConfig};
pub use directory::{Presence, ProfileDirectory, StaticDirectory, UserProfile};
pub use history::{
    compute_stats, CallHistoryRecord, CallStats, HistoryDirection, HistoryRecorder, HistoryStore,
    JsonlHistoryStore, MemoryHistoryStore,
};
pub use identity::{PeerIdentity, UserId};
pub use media::{MediaError, MediaSessionManager, SimulatedMediaManager};
#[cfg(feature = "webrtc-backend")]
pub use rtc::{RtcMediaConfig, RtcMediaManager};
pub use service::{CallService, CallServiceBuilder, ServiceError};
pub use signaling::{
    SignalPayload, SignalingChannel, SignalingError, SignalingHandler, SignalingMessage,
    SignalingTransport,
};
pub use tone::{LoopingTone, ToneConfig, ToneRole, ToneSink};
pub use transport::{MemoryRelay, MemoryTransport, RelayFrame, TransportError};
#[cfg(feature = "websocket")]
pub use transport::WebSocketTransport;
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::call::{CallError, CallManager, CallManagerConfig};
    pub use crate::history::{HistoryRecorder, HistoryStore};
    pub use crate::identity::{PeerIdentity, UserId};
    pub use crate::media::MediaSessionManager;
    pub use crate::service::{CallService, ServiceError};
    pub use crate::signaling::{SignalPayload, SignalingChannel, SignalingMessage, SignalingTransport};
    pub use crate::types::{
        CallEvent, CallId, CallOutcome, CallSession, CallState, EndReason, MediaType,
    };
}
