//! Call state machine
//!
//! [`CallManager`] owns the authoritative call state of one endpoint and is
//! the sole subscriber of its [`SignalingChannel`]. Every trigger (user
//! operation, inbound signal, timer, peer event) serializes on one async
//! lock around the [`Phase`] enum.
//!
//! ```text
//!            initiate                 receive(answer)
//!    Idle ──────────────▶ Calling ─────────────────────▶ InCall
//!     │                     │  receive(end) / timeout       │
//!     │                     ▼                               │
//!     │                   Idle ◀────── end() / receive(end) ┘
//!     │  receive(offer)               accept()
//!     └───────────────▶ Incoming ─────────────────────▶ InCall
//!                           │ reject() / receive(end) / timeout
//!                           ▼
//!                         Idle
//! ```
//!
//! The lock is released only while waiting on media acquisition and
//! offer/answer creation; afterwards the machine re-checks that the same call
//! is still in the expected state and otherwise releases what it obtained and
//! reports [`CallError::Cancelled`].

use crate::directory::Presence;
use crate::history::{CallAttempt, HistoryDirection, HistoryError, HistoryRecorder, MemoryHistoryStore};
use crate::identity::PeerIdentity;
use crate::media::{
    LocalTrack, MediaDevices, MediaError, MediaHandle, MediaSessionManager, PeerEvent,
    PeerSessionHandle, TrackKind, TrackSource,
};
use crate::signaling::{SignalPayload, SignalingChannel, SignalingError, SignalingHandler, SignalingMessage};
use crate::tone::{LoopingTone, SilentToneSink, ToneConfig, ToneRole, ToneSink};
use crate::types::{
    CallDirection, CallEvent, CallId, CallNotice, CallOutcome, CallSession, CallState, EndReason,
    IceCandidate, MediaType, SessionDescription,
};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Call management errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Camera or microphone permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Camera or microphone missing
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Peer session could not be established
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    /// Signaling relay send failed
    #[error("Signaling unavailable: {0}")]
    SignalingUnavailable(String),

    /// Call history could not be written
    #[error("History write failed: {0}")]
    HistoryWriteFailed(String),

    /// Another call is active on this endpoint
    #[error("Already in a call")]
    AlreadyInCall,

    /// Operation not valid in the current state
    #[error("Invalid call state")]
    InvalidState,

    /// Call ended while the operation was waiting on media
    #[error("Call was cancelled")]
    Cancelled,

    /// Remote identity not usable
    #[error("Invalid peer: {0}")]
    InvalidPeer(String),

    /// Wiring error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl From<MediaError> for CallError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::PermissionDenied(msg) => CallError::PermissionDenied(msg),
            MediaError::DeviceUnavailable(msg) => CallError::DeviceUnavailable(msg),
            other => CallError::NegotiationFailed(other.to_string()),
        }
    }
}

impl From<SignalingError> for CallError {
    fn from(err: SignalingError) -> Self {
        match err {
            SignalingError::HandlerAlreadyRegistered => CallError::ConfigError(err.to_string()),
            other => CallError::SignalingUnavailable(other.to_string()),
        }
    }
}

impl From<HistoryError> for CallError {
    fn from(err: HistoryError) -> Self {
        CallError::HistoryWriteFailed(err.to_string())
    }
}

impl CallError {
    fn notice(&self) -> Option<CallNotice> {
        match self {
            Self::PermissionDenied(msg) => Some(CallNotice::PermissionDenied(msg.clone())),
            Self::DeviceUnavailable(msg) => Some(CallNotice::DeviceUnavailable(msg.clone())),
            Self::NegotiationFailed(msg) => Some(CallNotice::ConnectionFailed(msg.clone())),
            Self::SignalingUnavailable(msg) => Some(CallNotice::SignalingUnavailable(msg.clone())),
            _ => None,
        }
    }
}

/// Call manager configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallManagerConfig {
    /// How long an unanswered call rings
    #[serde(with = "humantime_serde")]
    pub ring_timeout: Duration,
    /// Interval of `DurationTick` events while in a call
    #[serde(with = "humantime_serde")]
    pub duration_tick: Duration,
    /// Caller also logs a `rejected` record when the callee declines
    pub record_rejected_outgoing: bool,
    /// On ring timeout, write the callee's `missed` record if presence
    /// reports them offline
    pub proxy_missed_for_offline: bool,
    /// Event channel capacity
    pub event_capacity: usize,
    /// Ringtone and ringback timing
    pub tones: ToneConfig,
}

impl Default for CallManagerConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(30),
            duration_tick: Duration::from_secs(1),
            record_rejected_outgoing: true,
            proxy_missed_for_offline: true,
            event_capacity: 100,
            tones: ToneConfig::default(),
        }
    }
}

/// Per-call resources held by the state machine
struct ActiveCall<I: PeerIdentity> {
    session: CallSession<I>,
    local_media: Option<MediaHandle>,
    parked_camera: Option<LocalTrack>,
    peer: Option<PeerSessionHandle>,
    pending_candidates: Vec<IceCandidate>,
    ring_timer: Option<JoinHandle<()>>,
    duration_timer: Option<JoinHandle<()>>,
    forwarder: Option<JoinHandle<()>>,
    offer_sent: bool,
    accepting: bool,
    connected_at: Option<Instant>,
    media_connected: bool,
}

impl<I: PeerIdentity> ActiveCall<I> {
    fn new(session: CallSession<I>) -> Self {
        Self {
            session,
            local_media: None,
            parked_camera: None,
            peer: None,
            pending_candidates: Vec::new(),
            ring_timer: None,
            duration_timer: None,
            forwarder: None,
            offer_sent: false,
            accepting: false,
            connected_at: None,
            media_connected: false,
        }
    }

    fn call_id(&self) -> CallId {
        self.session.call_id
    }

    fn is_from(&self, call_id: CallId, peer: &I) -> bool {
        self.session.call_id == call_id && &self.session.remote_user == peer
    }

    fn elapsed_secs(&self) -> u64 {
        self.connected_at.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Whether a camera or screen track is on our video slot
    fn sends_video(&self) -> bool {
        self.local_media
            .as_ref()
            .is_some_and(|m| m.track(TrackKind::Video).is_some())
    }

    fn refresh_media_type(&mut self) {
        self.session.media_type =
            if self.sends_video() || self.session.remote_media_type == MediaType::Video {
                MediaType::Video
            } else {
                MediaType::Audio
            };
    }
}

/// Local call state
enum Phase<I: PeerIdentity> {
    Idle,
    Calling(ActiveCall<I>),
    Incoming(ActiveCall<I>),
    InCall(ActiveCall<I>),
}

impl<I: PeerIdentity> Phase<I> {
    fn state(&self) -> CallState {
        match self {
            Self::Idle => CallState::Idle,
            Self::Calling(_) => CallState::Calling,
            Self::Incoming(_) => CallState::Incoming,
            Self::InCall(_) => CallState::InCall,
        }
    }

    fn call(&self) -> Option<&ActiveCall<I>> {
        match self {
            Self::Idle => None,
            Self::Calling(call) | Self::Incoming(call) | Self::InCall(call) => Some(call),
        }
    }

    fn call_mut(&mut self) -> Option<&mut ActiveCall<I>> {
        match self {
            Self::Idle => None,
            Self::Calling(call) | Self::Incoming(call) | Self::InCall(call) => Some(call),
        }
    }

    /// Active call if it is `call_id` and in `state`
    fn current_mut(&mut self, call_id: CallId, state: CallState) -> Option<&mut ActiveCall<I>> {
        if self.state() != state {
            return None;
        }
        self.call_mut().filter(|c| c.call_id() == call_id)
    }

    fn is(&self, call_id: CallId, state: CallState) -> bool {
        self.state() == state && self.call().map(ActiveCall::call_id) == Some(call_id)
    }
}

/// How a call leaves the active phase
#[derive(Debug, Clone, Copy)]
struct Termination {
    outcome: CallOutcome,
    record: bool,
    proxy_missed: bool,
    requires_media: bool,
}

impl Termination {
    fn record(outcome: CallOutcome) -> Self {
        Self {
            outcome,
            record: true,
            proxy_missed: false,
            requires_media: false,
        }
    }

    fn silent(outcome: CallOutcome) -> Self {
        Self {
            record: false,
            ..Self::record(outcome)
        }
    }

    fn proxy_missed(mut self) -> Self {
        self.proxy_missed = true;
        self
    }

    fn requires_media(mut self) -> Self {
        self.requires_media = true;
        self
    }
}

struct Inner<I: PeerIdentity> {
    local: I,
    config: CallManagerConfig,
    signaling: Arc<SignalingChannel<I>>,
    media: Arc<dyn MediaSessionManager>,
    history: HistoryRecorder,
    presence: Option<Arc<dyn Presence>>,
    tone: LoopingTone,
    phase: Mutex<Phase<I>>,
    events: broadcast::Sender<CallEvent<I>>,
}

/// Routes inbound signals to a manager without keeping it alive
struct SignalRouter<I: PeerIdentity>(Weak<Inner<I>>);

#[async_trait]
impl<I: PeerIdentity> SignalingHandler<I> for SignalRouter<I> {
    async fn on_signal(&self, message: SignalingMessage<I>) {
        if let Some(inner) = self.0.upgrade() {
            inner.handle_signal(message).await;
        }
    }
}

/// Builder for [`CallManager`]
pub struct CallManagerBuilder<I: PeerIdentity> {
    signaling: Arc<SignalingChannel<I>>,
    media: Arc<dyn MediaSessionManager>,
    config: CallManagerConfig,
    history: Option<HistoryRecorder>,
    presence: Option<Arc<dyn Presence>>,
    tone_sink: Option<Arc<dyn ToneSink>>,
}

impl<I: PeerIdentity> CallManagerBuilder<I> {
    /// Set the configuration
    #[must_use]
    pub fn config(mut self, config: CallManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the history recorder (defaults to an in-memory store)
    #[must_use]
    pub fn history(mut self, history: HistoryRecorder) -> Self {
        self.history = Some(history);
        self
    }

    /// Set the presence source used for missed-call proxying
    #[must_use]
    pub fn presence(mut self, presence: Arc<dyn Presence>) -> Self {
        self.presence = Some(presence);
        self
    }

    /// Set the ringtone/ringback output (defaults to silence)
    #[must_use]
    pub fn tone_sink(mut self, sink: Arc<dyn ToneSink>) -> Self {
        self.tone_sink = Some(sink);
        self
    }

    /// Build the manager and register it on the signaling channel
    ///
    /// # Errors
    ///
    /// Returns error if the channel already has a handler
    pub fn build(self) -> Result<CallManager<I>, CallError> {
        let (events, _) = broadcast::channel(self.config.event_capacity.max(1));
        let history = self
            .history
            .unwrap_or_else(|| HistoryRecorder::new(Arc::new(MemoryHistoryStore::new())));
        let sink = self.tone_sink.unwrap_or_else(|| Arc::new(SilentToneSink));
        let tone = LoopingTone::new(sink, self.config.tones.clone());

        let inner = Arc::new(Inner {
            local: self.signaling.local_identity().clone(),
            config: self.config,
            signaling: self.signaling,
            media: self.media,
            history,
            presence: self.presence,
            tone,
            phase: Mutex::new(Phase::Idle),
            events,
        });

        inner
            .signaling
            .on_message(Arc::new(SignalRouter(Arc::downgrade(&inner))))?;

        tracing::info!(local = %inner.local, "Call manager ready");
        Ok(CallManager { inner })
    }
}

/// Call manager
///
/// Cheap to clone; all clones drive the same endpoint.
pub struct CallManager<I: PeerIdentity> {
    inner: Arc<Inner<I>>,
}

impl<I: PeerIdentity> Clone for CallManager<I> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<I: PeerIdentity> CallManager<I> {
    /// Start building a manager for the channel's local identity
    pub fn builder(
        signaling: Arc<SignalingChannel<I>>,
        media: Arc<dyn MediaSessionManager>,
    ) -> CallManagerBuilder<I> {
        CallManagerBuilder {
            signaling,
            media,
            config: CallManagerConfig::default(),
            history: None,
            presence: None,
            tone_sink: None,
        }
    }

    /// Local identity
    #[must_use]
    pub fn local_identity(&self) -> &I {
        &self.inner.local
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &CallManagerConfig {
        &self.inner.config
    }

    /// Subscribe to call events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent<I>> {
        self.inner.events.subscribe()
    }

    /// History recorder
    #[must_use]
    pub fn history(&self) -> &HistoryRecorder {
        &self.inner.history
    }

    /// Capture devices the media backend exposes
    #[must_use]
    pub fn devices(&self) -> MediaDevices {
        self.inner.media.devices()
    }

    /// Current state
    pub async fn state(&self) -> CallState {
        self.inner.phase.lock().await.state()
    }

    /// Snapshot of the active call, if any
    pub async fn current_call(&self) -> Option<CallSession<I>> {
        self.inner.phase.lock().await.call().map(|c| c.session.clone())
    }

    /// Place a call
    ///
    /// # Errors
    ///
    /// Returns `AlreadyInCall` unless idle, a media error if capture fails,
    /// `SignalingUnavailable` if the offer cannot be sent, or `Cancelled` if
    /// the call was ended while waiting on media
    #[tracing::instrument(skip(self), fields(local = %self.inner.local, peer = %remote))]
    pub async fn initiate(&self, remote: I, media_type: MediaType) -> Result<CallId, CallError> {
        self.inner.initiate(remote, media_type).await
    }

    /// Answer the incoming call
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless a call is ringing, a media error if
    /// capture fails, or `Cancelled` if the caller hung up meanwhile
    #[tracing::instrument(skip(self), fields(local = %self.inner.local))]
    pub async fn accept(&self) -> Result<(), CallError> {
        self.inner.accept().await
    }

    /// Decline the incoming call
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless a call is ringing
    #[tracing::instrument(skip(self), fields(local = %self.inner.local))]
    pub async fn reject(&self) -> Result<(), CallError> {
        self.inner.reject().await
    }

    /// Cancel an outgoing call or hang up a connected one; no-op when idle
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` while a call is ringing (use [`Self::reject`])
    #[tracing::instrument(skip(self), fields(local = %self.inner.local))]
    pub async fn end(&self) -> Result<(), CallError> {
        self.inner.end().await
    }

    /// Switch between audio-only and audio plus video
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` outside a call or while screen sharing, or a
    /// media error if the camera cannot be captured
    #[tracing::instrument(skip(self), fields(local = %self.inner.local))]
    pub async fn switch_media(&self, media_type: MediaType) -> Result<(), CallError> {
        self.inner.switch_media(media_type).await
    }

    /// Turn the camera track on or off and tell the peer
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` outside a call or without a video track
    #[tracing::instrument(skip(self), fields(local = %self.inner.local))]
    pub async fn set_video_enabled(&self, enabled: bool) -> Result<(), CallError> {
        self.inner.set_video_enabled(enabled).await
    }

    /// Mute or unmute the microphone locally
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if no microphone track is live
    #[tracing::instrument(skip(self), fields(local = %self.inner.local))]
    pub async fn set_microphone_enabled(&self, enabled: bool) -> Result<(), CallError> {
        self.inner.set_microphone_enabled(enabled).await
    }

    /// Replace the camera with a screen capture
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` outside a video call or when already sharing
    #[tracing::instrument(skip(self), fields(local = %self.inner.local))]
    pub async fn start_screen_share(&self) -> Result<(), CallError> {
        self.inner.start_screen_share().await
    }

    /// Restore the camera after a screen share
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if not sharing
    #[tracing::instrument(skip(self), fields(local = %self.inner.local))]
    pub async fn stop_screen_share(&self) -> Result<(), CallError> {
        self.inner.stop_screen_share().await
    }

    /// Move the live microphone or camera to another device
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` outside a call or for screen sources, or a
    /// media error if the device cannot be captured
    #[tracing::instrument(skip(self), fields(local = %self.inner.local))]
    pub async fn change_device(&self, source: TrackSource, device_id: &str) -> Result<(), CallError> {
        self.inner.change_device(source, device_id).await
    }

    /// Feed one inbound signaling message through the state machine
    pub async fn handle_signal(&self, message: SignalingMessage<I>) {
        self.inner.handle_signal(message).await;
    }
}

impl<I: PeerIdentity> Inner<I> {
    fn emit(&self, event: CallEvent<I>) {
        let _ = self.events.send(event);
    }

    fn emit_transition(&self, call_id: CallId, old_state: CallState, new_state: CallState) {
        tracing::debug!(
            call_id = %call_id,
            old_state = ?old_state,
            new_state = ?new_state,
            "Call state transition"
        );
        self.emit(CallEvent::StateChanged {
            call_id,
            old_state,
            new_state,
        });
    }

    fn notify(&self, call_id: Option<CallId>, notice: CallNotice) {
        tracing::info!(notice = ?notice, "Call notice");
        self.emit(CallEvent::Notice { call_id, notice });
    }

    async fn send_best_effort(&self, to: &I, payload: SignalPayload) {
        let kind = payload.kind();
        if let Err(e) = self.signaling.send(to, payload).await {
            tracing::warn!(peer = %to, message_type = kind, error = %e, "Failed to send signal");
        }
    }

    fn spawn_ring_timer(self: &Arc<Self>, call_id: CallId) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let timeout = self.config.ring_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.on_ring_timeout(call_id).await;
            }
        })
    }

    fn spawn_duration_timer(self: &Arc<Self>, call_id: CallId, connected_at: Instant) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let tick = self.config.duration_tick.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(connected_at + tick, tick);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.emit(CallEvent::DurationTick {
                    call_id,
                    elapsed_secs: connected_at.elapsed().as_secs(),
                });
            }
        })
    }

    fn spawn_forwarder(
        self: &Arc<Self>,
        call_id: CallId,
        mut events: mpsc::UnboundedReceiver<PeerEvent>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                match event {
                    PeerEvent::LocalCandidate(candidate) => {
                        inner.forward_candidate(call_id, candidate).await;
                    }
                    PeerEvent::Connected => inner.on_media_connected(call_id).await,
                    PeerEvent::Failed(reason) => {
                        inner.on_peer_failed(call_id, reason).await;
                        break;
                    }
                }
            }
        })
    }

    /// Stop timers and tones, close the peer session, release devices
    async fn release(&self, call: &mut ActiveCall<I>) {
        for task in [
            call.ring_timer.take(),
            call.duration_timer.take(),
            call.forwarder.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
        self.tone.stop();
        if let Some(peer) = call.peer.take() {
            self.media.teardown(&peer).await;
        }
        if let Some(media) = call.local_media.take() {
            self.media.release_media(&media).await;
        }
        if let Some(track) = call.parked_camera.take() {
            self.media.release_track(&track).await;
        }
    }

    /// Leave the active phase, then write history outside the lock
    async fn finish(&self, mut phase: MutexGuard<'_, Phase<I>>, termination: Termination) {
        let previous = std::mem::replace(&mut *phase, Phase::Idle);
        let old_state = previous.state();
        let mut call = match previous {
            Phase::Idle => return,
            Phase::Calling(call) | Phase::Incoming(call) | Phase::InCall(call) => call,
        };

        let duration_secs = if old_state == CallState::InCall
            && (!termination.requires_media || call.media_connected)
        {
            call.elapsed_secs()
        } else {
            0
        };

        self.release(&mut call).await;
        call.session.state = CallState::Idle;
        let call_id = call.call_id();
        self.emit_transition(call_id, old_state, CallState::Idle);
        drop(phase);

        let session = call.session;
        let started_at = session.started_at.unwrap_or(session.created_at);
        let ended_at = match session.started_at {
            Some(started) => {
                started
                    + chrono::Duration::from_std(Duration::from_secs(duration_secs))
                        .unwrap_or_else(|_| chrono::Duration::zero())
            }
            None => Utc::now(),
        };

        if termination.record {
            let direction = match (termination.outcome, session.direction) {
                (CallOutcome::Missed, _) => HistoryDirection::Missed,
                (_, CallDirection::Outgoing) => HistoryDirection::Outgoing,
                (_, CallDirection::Incoming) => HistoryDirection::Incoming,
            };
            self.history
                .record(CallAttempt {
                    call_id,
                    owner: session.local_user.unique_id(),
                    participant: session.remote_user.unique_id(),
                    media_type: session.media_type,
                    direction,
                    outcome: termination.outcome,
                    started_at,
                    ended_at: Some(ended_at),
                    duration_seconds: duration_secs,
                })
                .await;
        }

        if termination.proxy_missed && self.config.proxy_missed_for_offline {
            let remote_id = session.remote_user.unique_id();
            let offline = match &self.presence {
                Some(presence) => !presence.is_online(&remote_id).await,
                None => false,
            };
            if offline {
                tracing::info!(call_id = %call_id, peer = %remote_id, "Callee offline, recording missed call on their behalf");
                self.history
                    .record(CallAttempt {
                        call_id,
                        owner: remote_id,
                        participant: session.local_user.unique_id(),
                        media_type: session.media_type,
                        direction: HistoryDirection::Missed,
                        outcome: CallOutcome::Missed,
                        started_at,
                        ended_at: Some(ended_at),
                        duration_seconds: 0,
                    })
                    .await;
            }
        }

        tracing::info!(
            call_id = %call_id,
            outcome = %termination.outcome,
            duration_secs,
            "Call ended"
        );
        self.emit(CallEvent::CallEnded {
            call_id,
            outcome: termination.outcome,
            duration_secs,
        });
    }

    /// Abandon a call that failed before reaching the peer
    async fn abort_setup(
        &self,
        call_id: CallId,
        expected: CallState,
        error: CallError,
        orphan_media: Option<MediaHandle>,
        orphan_peer: Option<PeerSessionHandle>,
        termination: Termination,
    ) -> CallError {
        let phase = self.phase.lock().await;
        if let Some(peer) = orphan_peer {
            self.media.teardown(&peer).await;
        }
        if let Some(media) = orphan_media {
            self.media.release_media(&media).await;
        }
        if !phase.is(call_id, expected) {
            tracing::debug!(call_id = %call_id, "Call ended while waiting on media");
            return CallError::Cancelled;
        }
        tracing::warn!(call_id = %call_id, error = %error, "Call setup failed");
        if let Some(notice) = error.notice() {
            self.notify(Some(call_id), notice);
        }
        self.finish(phase, termination).await;
        error
    }

    async fn initiate(self: &Arc<Self>, remote: I, media_type: MediaType) -> Result<CallId, CallError> {
        if remote == self.local {
            return Err(CallError::InvalidPeer(remote.to_string_repr()));
        }

        let call_id = {
            let mut phase = self.phase.lock().await;
            if !matches!(*phase, Phase::Idle) {
                tracing::warn!(state = %phase.state(), "Already in a call");
                return Err(CallError::AlreadyInCall);
            }
            let session = CallSession::new(
                CallId::new(),
                self.local.clone(),
                remote.clone(),
                CallDirection::Outgoing,
                media_type,
                CallState::Calling,
            );
            let call_id = session.call_id;
            *phase = Phase::Calling(ActiveCall::new(session));
            self.emit_transition(call_id, CallState::Idle, CallState::Calling);
            self.tone.start(ToneRole::Ringback);
            call_id
        };
        tracing::info!(call_id = %call_id, media_type = %media_type, "Placing call");

        let local = match self.media.acquire_local_media(media_type).await {
            Ok(local) => local,
            Err(e) => {
                return Err(self
                    .abort_setup(
                        call_id,
                        CallState::Calling,
                        e.into(),
                        None,
                        None,
                        Termination::silent(CallOutcome::NoAnswer),
                    )
                    .await)
            }
        };

        if !self.phase.lock().await.is(call_id, CallState::Calling) {
            self.media.release_media(&local).await;
            return Err(CallError::Cancelled);
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (offer, peer) = match self.media.create_offer(call_id, &local, events_tx).await {
            Ok(created) => created,
            Err(e) => {
                return Err(self
                    .abort_setup(
                        call_id,
                        CallState::Calling,
                        e.into(),
                        Some(local),
                        None,
                        Termination::silent(CallOutcome::NoAnswer),
                    )
                    .await)
            }
        };

        let mut phase = self.phase.lock().await;
        let Some(call) = phase.current_mut(call_id, CallState::Calling) else {
            drop(phase);
            self.media.teardown(&peer).await;
            self.media.release_media(&local).await;
            return Err(CallError::Cancelled);
        };
        call.local_media = Some(local);
        call.peer = Some(peer);
        call.session.pending_offer = Some(offer.clone());

        let payload = SignalPayload::offer(call_id, media_type, &offer);
        if let Err(e) = self.signaling.send(&remote, payload).await {
            let error = CallError::from(e);
            if let Some(notice) = error.notice() {
                self.notify(Some(call_id), notice);
            }
            self.finish(phase, Termination::silent(CallOutcome::NoAnswer)).await;
            return Err(error);
        }

        call.offer_sent = true;
        call.ring_timer = Some(self.spawn_ring_timer(call_id));
        call.forwarder = Some(self.spawn_forwarder(call_id, events_rx));
        tracing::info!(call_id = %call_id, "Offer sent, ringing");
        Ok(call_id)
    }

    async fn accept(self: &Arc<Self>) -> Result<(), CallError> {
        let (call_id, media_type, offer) = {
            let mut phase = self.phase.lock().await;
            let state = phase.state();
            let Phase::Incoming(call) = &mut *phase else {
                tracing::warn!(state = %state, "Cannot accept: no incoming call");
                return Err(CallError::InvalidState);
            };
            if call.accepting {
                return Err(CallError::InvalidState);
            }
            let Some(offer) = call.session.pending_offer.clone() else {
                return Err(CallError::InvalidState);
            };
            call.accepting = true;
            if let Some(timer) = call.ring_timer.take() {
                timer.abort();
            }
            self.tone.stop();
            (call.call_id(), call.session.media_type, offer)
        };
        tracing::info!(call_id = %call_id, "Accepting call");

        let local = match self.media.acquire_local_media(media_type).await {
            Ok(local) => local,
            Err(e) => {
                return Err(self
                    .abort_setup(
                        call_id,
                        CallState::Incoming,
                        e.into(),
                        None,
                        None,
                        Termination::record(CallOutcome::Missed),
                    )
                    .await)
            }
        };

        if !self.phase.lock().await.is(call_id, CallState::Incoming) {
            self.media.release_media(&local).await;
            return Err(CallError::Cancelled);
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (answer, peer) = match self
            .media
            .create_answer(call_id, &offer, &local, events_tx)
            .await
        {
            Ok(created) => created,
            Err(e) => {
                let phase = self.phase.lock().await;
                if let Some(call) = phase.call().filter(|c| c.call_id() == call_id) {
                    let remote = call.session.remote_user.clone();
                    self.send_best_effort(&remote, SignalPayload::end(call_id, EndReason::Failed))
                        .await;
                }
                drop(phase);
                return Err(self
                    .abort_setup(
                        call_id,
                        CallState::Incoming,
                        e.into(),
                        Some(local),
                        None,
                        Termination::record(CallOutcome::NoAnswer),
                    )
                    .await);
            }
        };

        let mut phase = self.phase.lock().await;
        let Some(call) = phase.current_mut(call_id, CallState::Incoming) else {
            drop(phase);
            self.media.teardown(&peer).await;
            self.media.release_media(&local).await;
            return Err(CallError::Cancelled);
        };
        call.local_media = Some(local);
        call.peer = Some(peer.clone());
        call.session.pending_answer = Some(answer.clone());
        let remote = call.session.remote_user.clone();

        if let Err(e) = self
            .signaling
            .send(&remote, SignalPayload::answer(call_id, &answer))
            .await
        {
            let error = CallError::from(e);
            if let Some(notice) = error.notice() {
                self.notify(Some(call_id), notice);
            }
            self.finish(phase, Termination::record(CallOutcome::Missed)).await;
            return Err(error);
        }

        for candidate in std::mem::take(&mut call.pending_candidates) {
            if let Err(e) = self.media.apply_remote_candidate(&peer, &candidate).await {
                tracing::warn!(call_id = %call_id, error = %e, "Failed to apply buffered candidate");
            }
        }
        call.forwarder = Some(self.spawn_forwarder(call_id, events_rx));
        self.enter_in_call(&mut phase);
        Ok(())
    }

    async fn reject(&self) -> Result<(), CallError> {
        let phase = self.phase.lock().await;
        let Phase::Incoming(call) = &*phase else {
            tracing::warn!(state = %phase.state(), "Cannot reject: no incoming call");
            return Err(CallError::InvalidState);
        };
        let call_id = call.call_id();
        let remote = call.session.remote_user.clone();
        tracing::info!(call_id = %call_id, "Rejecting call");
        self.send_best_effort(&remote, SignalPayload::end(call_id, EndReason::Rejected))
            .await;
        self.finish(phase, Termination::record(CallOutcome::Rejected)).await;
        Ok(())
    }

    async fn end(&self) -> Result<(), CallError> {
        let phase = self.phase.lock().await;
        match &*phase {
            Phase::Idle => {
                tracing::debug!("End requested while idle, nothing to do");
                Ok(())
            }
            Phase::Incoming(_) => Err(CallError::InvalidState),
            Phase::Calling(call) => {
                let call_id = call.call_id();
                let remote = call.session.remote_user.clone();
                let offer_sent = call.offer_sent;
                tracing::info!(call_id = %call_id, "Cancelling outgoing call");
                if offer_sent {
                    self.send_best_effort(&remote, SignalPayload::end(call_id, EndReason::Cancelled))
                        .await;
                    self.finish(phase, Termination::record(CallOutcome::NoAnswer)).await;
                } else {
                    self.finish(phase, Termination::silent(CallOutcome::NoAnswer)).await;
                }
                Ok(())
            }
            Phase::InCall(call) => {
                let call_id = call.call_id();
                let remote = call.session.remote_user.clone();
                tracing::info!(call_id = %call_id, "Hanging up");
                self.send_best_effort(&remote, SignalPayload::end(call_id, EndReason::Hangup))
                    .await;
                self.finish(phase, Termination::record(CallOutcome::Completed)).await;
                Ok(())
            }
        }
    }

    /// Move a ringing call to `InCall` and start the duration ticker
    fn enter_in_call(self: &Arc<Self>, phase: &mut Phase<I>) {
        let previous = std::mem::replace(phase, Phase::Idle);
        let old_state = previous.state();
        let mut call = match previous {
            Phase::Calling(call) | Phase::Incoming(call) => call,
            other => {
                *phase = other;
                return;
            }
        };

        if let Some(timer) = call.ring_timer.take() {
            timer.abort();
        }
        self.tone.stop();

        let now = Instant::now();
        call.connected_at = Some(now);
        call.accepting = false;
        call.session.state = CallState::InCall;
        call.session.started_at = Some(Utc::now());
        call.session.pending_offer = None;
        call.session.pending_answer = None;
        let call_id = call.call_id();
        call.duration_timer = Some(self.spawn_duration_timer(call_id, now));
        *phase = Phase::InCall(call);

        self.emit_transition(call_id, old_state, CallState::InCall);
        tracing::info!(call_id = %call_id, "Call connected");
    }

    async fn on_ring_timeout(&self, call_id: CallId) {
        let mut phase = self.phase.lock().await;
        let state = phase.state();
        let Some(call) = phase.call_mut().filter(|c| c.call_id() == call_id) else {
            tracing::debug!(call_id = %call_id, "Stale ring timer");
            return;
        };
        // Detach rather than abort: this code runs on the timer task itself
        call.ring_timer = None;
        let remote = call.session.remote_user.clone();

        match state {
            CallState::Calling => {
                tracing::info!(call_id = %call_id, "No answer before ring timeout");
                self.send_best_effort(&remote, SignalPayload::end(call_id, EndReason::Timeout))
                    .await;
                self.finish(
                    phase,
                    Termination::record(CallOutcome::NoAnswer).proxy_missed(),
                )
                .await;
            }
            CallState::Incoming if !call.accepting => {
                tracing::info!(call_id = %call_id, "Incoming call not answered");
                self.send_best_effort(&remote, SignalPayload::end(call_id, EndReason::Timeout))
                    .await;
                self.finish(phase, Termination::record(CallOutcome::Missed)).await;
            }
            _ => tracing::debug!(call_id = %call_id, state = %state, "Ring timer fired outside ringing"),
        }
    }

    async fn forward_candidate(&self, call_id: CallId, candidate: IceCandidate) {
        let phase = self.phase.lock().await;
        let Some(call) = phase.call().filter(|c| c.call_id() == call_id) else {
            return;
        };
        let remote = call.session.remote_user.clone();
        self.send_best_effort(&remote, SignalPayload::ice_candidate(call_id, candidate))
            .await;
    }

    async fn on_media_connected(&self, call_id: CallId) {
        let mut phase = self.phase.lock().await;
        if let Some(call) = phase.current_mut(call_id, CallState::InCall) {
            if !call.media_connected {
                call.media_connected = true;
                tracing::info!(call_id = %call_id, "Media connected");
            }
        }
    }

    async fn on_peer_failed(&self, call_id: CallId, reason: String) {
        let mut phase = self.phase.lock().await;
        let Some(call) = phase.call_mut().filter(|c| c.call_id() == call_id) else {
            return;
        };
        // Detach rather than abort: this code runs on the forwarder task
        call.forwarder = None;
        self.fail_negotiation(phase, reason).await;
    }

    /// Treat a negotiation or connection failure like a remote hangup
    async fn fail_negotiation(&self, phase: MutexGuard<'_, Phase<I>>, reason: String) {
        let state = phase.state();
        let Some(call) = phase.call() else {
            return;
        };
        let call_id = call.call_id();
        let remote = call.session.remote_user.clone();
        let offer_sent = call.offer_sent;
        tracing::warn!(call_id = %call_id, reason = %reason, "Peer session failed");
        self.notify(Some(call_id), CallNotice::ConnectionFailed(reason));

        match state {
            CallState::Calling if !offer_sent => {
                self.finish(phase, Termination::silent(CallOutcome::NoAnswer)).await;
            }
            CallState::Calling | CallState::Incoming => {
                self.send_best_effort(&remote, SignalPayload::end(call_id, EndReason::Failed))
                    .await;
                self.finish(phase, Termination::record(CallOutcome::NoAnswer)).await;
            }
            CallState::InCall => {
                self.send_best_effort(&remote, SignalPayload::end(call_id, EndReason::Failed))
                    .await;
                self.finish(
                    phase,
                    Termination::record(CallOutcome::Completed).requires_media(),
                )
                .await;
            }
            CallState::Idle => {}
        }
    }

    async fn handle_signal(self: &Arc<Self>, message: SignalingMessage<I>) {
        let SignalingMessage { from, to, payload } = message;
        if to != self.local || from == self.local {
            tracing::debug!(from = %from, to = %to, "Ignoring misrouted signal");
            return;
        }

        match payload {
            SignalPayload::Offer {
                call_id,
                media_type,
                sdp,
            } => self.on_offer(from, call_id, media_type, sdp).await,
            SignalPayload::Answer { call_id, sdp } => self.on_answer(from, call_id, sdp).await,
            SignalPayload::IceCandidate {
                call_id,
                candidate,
                sdp_mid,
                sdp_mline_index,
            } => {
                let candidate = IceCandidate {
                    candidate,
                    sdp_mid,
                    sdp_mline_index,
                };
                self.on_candidate(from, call_id, candidate).await;
            }
            SignalPayload::End { call_id, reason } => self.on_end(from, call_id, reason).await,
            SignalPayload::SwitchToVideo { call_id } => {
                self.on_remote_switch(from, call_id, MediaType::Video).await;
            }
            SignalPayload::SwitchToAudio { call_id } => {
                self.on_remote_switch(from, call_id, MediaType::Audio).await;
            }
            SignalPayload::VideoToggle { call_id, enabled } => {
                self.on_video_toggle(from, call_id, enabled).await;
            }
        }
    }

    async fn on_offer(self: &Arc<Self>, from: I, call_id: CallId, media_type: MediaType, sdp: String) {
        let mut phase = self.phase.lock().await;
        if let Some(current) = phase.call() {
            if current.call_id() == call_id {
                tracing::debug!(call_id = %call_id, "Duplicate offer ignored");
                return;
            }
            tracing::warn!(
                call_id = %call_id,
                peer = %from,
                active_call = %current.call_id(),
                "Busy, rejecting incoming offer"
            );
            self.send_best_effort(&from, SignalPayload::end(call_id, EndReason::Busy))
                .await;
            return;
        }

        let mut session = CallSession::new(
            call_id,
            self.local.clone(),
            from.clone(),
            CallDirection::Incoming,
            media_type,
            CallState::Incoming,
        );
        session.pending_offer = Some(SessionDescription::offer(sdp));
        let mut call = ActiveCall::new(session);
        call.ring_timer = Some(self.spawn_ring_timer(call_id));
        *phase = Phase::Incoming(call);

        self.emit_transition(call_id, CallState::Idle, CallState::Incoming);
        self.emit(CallEvent::IncomingCall {
            call_id,
            caller: from,
            media_type,
        });
        self.tone.start(ToneRole::Ringtone);
        tracing::info!(call_id = %call_id, media_type = %media_type, "Incoming call");
    }

    async fn on_answer(self: &Arc<Self>, from: I, call_id: CallId, sdp: String) {
        let mut phase = self.phase.lock().await;
        let Phase::Calling(call) = &mut *phase else {
            tracing::debug!(call_id = %call_id, "Answer outside calling state ignored");
            return;
        };
        if !call.is_from(call_id, &from) || !call.offer_sent {
            tracing::debug!(call_id = %call_id, "Stale answer ignored");
            return;
        }
        let Some(peer) = call.peer.clone() else {
            return;
        };

        let answer = SessionDescription::answer(sdp);
        if let Err(e) = self.media.apply_remote_description(&peer, &answer).await {
            self.fail_negotiation(phase, e.to_string()).await;
            return;
        }
        for candidate in std::mem::take(&mut call.pending_candidates) {
            if let Err(e) = self.media.apply_remote_candidate(&peer, &candidate).await {
                tracing::warn!(call_id = %call_id, error = %e, "Failed to apply buffered candidate");
            }
        }
        call.session.pending_answer = Some(answer);
        self.enter_in_call(&mut phase);
    }

    async fn on_candidate(&self, from: I, call_id: CallId, candidate: IceCandidate) {
        let mut phase = self.phase.lock().await;
        let in_call = phase.state() == CallState::InCall;
        let Some(call) = phase.call_mut().filter(|c| c.is_from(call_id, &from)) else {
            tracing::debug!(call_id = %call_id, "Candidate for unknown call ignored");
            return;
        };
        match (&call.peer, in_call) {
            (Some(peer), true) => {
                if let Err(e) = self.media.apply_remote_candidate(peer, &candidate).await {
                    tracing::warn!(call_id = %call_id, error = %e, "Failed to apply remote candidate");
                }
            }
            _ => call.pending_candidates.push(candidate),
        }
    }

    async fn on_end(&self, from: I, call_id: CallId, reason: Option<EndReason>) {
        let phase = self.phase.lock().await;
        let state = phase.state();
        if !phase.call().is_some_and(|c| c.is_from(call_id, &from)) {
            tracing::debug!(call_id = %call_id, state = %state, "End for inactive call ignored");
            return;
        }
        tracing::info!(call_id = %call_id, reason = ?reason, "Remote ended call");

        match state {
            CallState::Calling => {
                let outcome = match reason {
                    Some(EndReason::Rejected) => CallOutcome::Rejected,
                    Some(EndReason::Busy) => CallOutcome::Busy,
                    _ => CallOutcome::NoAnswer,
                };
                if outcome == CallOutcome::Busy {
                    self.notify(Some(call_id), CallNotice::RemoteBusy);
                }
                let termination = if outcome == CallOutcome::Rejected
                    && !self.config.record_rejected_outgoing
                {
                    Termination::silent(outcome)
                } else {
                    Termination::record(outcome)
                };
                self.finish(phase, termination).await;
            }
            CallState::Incoming => {
                let outcome = match reason {
                    Some(EndReason::Timeout | EndReason::Cancelled | EndReason::Failed) => {
                        CallOutcome::Missed
                    }
                    _ => CallOutcome::Rejected,
                };
                self.finish(phase, Termination::record(outcome)).await;
            }
            CallState::InCall => {
                let termination = if reason == Some(EndReason::Failed) {
                    self.notify(
                        Some(call_id),
                        CallNotice::ConnectionFailed("remote connection failed".to_string()),
                    );
                    Termination::record(CallOutcome::Completed).requires_media()
                } else {
                    Termination::record(CallOutcome::Completed)
                };
                self.finish(phase, termination).await;
            }
            CallState::Idle => {}
        }
    }

    async fn on_remote_switch(&self, from: I, call_id: CallId, media_type: MediaType) {
        let mut phase = self.phase.lock().await;
        let Some(call) = phase
            .current_mut(call_id, CallState::InCall)
            .filter(|c| c.session.remote_user == from)
        else {
            tracing::debug!(call_id = %call_id, "Media switch outside call ignored");
            return;
        };
        call.session.remote_media_type = media_type;
        call.session.remote_video_enabled = media_type == MediaType::Video;
        call.refresh_media_type();
        tracing::info!(call_id = %call_id, media_type = %media_type, "Remote switched media");
        self.emit(CallEvent::MediaTypeChanged {
            call_id,
            media_type,
            remote: true,
        });
    }

    async fn on_video_toggle(&self, from: I, call_id: CallId, enabled: bool) {
        let mut phase = self.phase.lock().await;
        let Some(call) = phase
            .current_mut(call_id, CallState::InCall)
            .filter(|c| c.session.remote_user == from)
        else {
            return;
        };
        call.session.remote_video_enabled = enabled;
        self.emit(CallEvent::RemoteVideoToggled { call_id, enabled });
    }

    /// Snapshot of the connected call for operations that await media
    async fn in_call_id(&self) -> Result<CallId, CallError> {
        let phase = self.phase.lock().await;
        match &*phase {
            Phase::InCall(call) => Ok(call.call_id()),
            other => {
                tracing::warn!(state = %other.state(), "Operation requires an active call");
                Err(CallError::InvalidState)
            }
        }
    }

    /// Capture a track mid-call; failures raise a notice but keep the call
    async fn capture_mid_call(
        &self,
        call_id: CallId,
        source: TrackSource,
        device_id: Option<&str>,
    ) -> Result<LocalTrack, CallError> {
        self.media
            .acquire_track(source, device_id)
            .await
            .map_err(|e| {
                let error = CallError::from(e);
                if let Some(notice) = error.notice() {
                    self.notify(Some(call_id), notice);
                }
                error
            })
    }

    async fn send_mid_call(&self, call_id: CallId, to: &I, payload: SignalPayload) -> Result<(), CallError> {
        self.signaling.send(to, payload).await.map_err(|e| {
            let error = CallError::from(e);
            if let Some(notice) = error.notice() {
                self.notify(Some(call_id), notice);
            }
            error
        })
    }

    async fn switch_media(&self, media_type: MediaType) -> Result<(), CallError> {
        let call_id = {
            let phase = self.phase.lock().await;
            let Phase::InCall(call) = &*phase else {
                return Err(CallError::InvalidState);
            };
            if call.session.screen_sharing {
                return Err(CallError::InvalidState);
            }
            if call.sends_video() == (media_type == MediaType::Video) {
                return Ok(());
            }
            call.call_id()
        };

        let camera = match media_type {
            MediaType::Video => Some(self.capture_mid_call(call_id, TrackSource::Camera, None).await?),
            MediaType::Audio => None,
        };

        let mut phase = self.phase.lock().await;
        let Some(call) = phase.current_mut(call_id, CallState::InCall) else {
            drop(phase);
            if let Some(camera) = camera {
                self.media.release_track(&camera).await;
            }
            return Err(CallError::Cancelled);
        };
        if call.sends_video() == (media_type == MediaType::Video) || call.session.screen_sharing {
            drop(phase);
            if let Some(camera) = camera {
                self.media.release_track(&camera).await;
            }
            return Ok(());
        }

        if let Some(peer) = call.peer.clone() {
            if let Err(e) = self
                .media
                .replace_track(&peer, TrackKind::Video, camera.as_ref())
                .await
            {
                if let Some(camera) = camera {
                    self.media.release_track(&camera).await;
                }
                let error = CallError::from(e);
                if let Some(notice) = error.notice() {
                    self.notify(Some(call_id), notice);
                }
                return Err(error);
            }
        }

        if let Some(local) = call.local_media.as_mut() {
            local.media_type = media_type;
            let displaced = match camera {
                Some(camera) => local.set_track(camera),
                None => local.take_track(TrackKind::Video),
            };
            if let Some(old) = displaced {
                self.media.release_track(&old).await;
            }
        }
        call.session.local_video_enabled = media_type == MediaType::Video;
        call.refresh_media_type();
        let remote = call.session.remote_user.clone();
        self.emit(CallEvent::MediaTypeChanged {
            call_id,
            media_type,
            remote: false,
        });
        tracing::info!(call_id = %call_id, media_type = %media_type, "Switched media");

        let payload = match media_type {
            MediaType::Video => SignalPayload::SwitchToVideo { call_id },
            MediaType::Audio => SignalPayload::SwitchToAudio { call_id },
        };
        self.send_mid_call(call_id, &remote, payload).await
    }

    async fn set_video_enabled(&self, enabled: bool) -> Result<(), CallError> {
        let mut phase = self.phase.lock().await;
        let Phase::InCall(call) = &mut *phase else {
            return Err(CallError::InvalidState);
        };
        let call_id = call.call_id();
        let Some(track) = call
            .local_media
            .as_mut()
            .and_then(|m| m.track_mut(TrackKind::Video))
        else {
            return Err(CallError::InvalidState);
        };
        self.media.set_track_enabled(track, enabled).await?;
        track.enabled = enabled;
        call.session.local_video_enabled = enabled;
        let remote = call.session.remote_user.clone();
        self.send_mid_call(call_id, &remote, SignalPayload::VideoToggle { call_id, enabled })
            .await
    }

    async fn set_microphone_enabled(&self, enabled: bool) -> Result<(), CallError> {
        let mut phase = self.phase.lock().await;
        let Some(call) = phase.call_mut() else {
            return Err(CallError::InvalidState);
        };
        let Some(track) = call
            .local_media
            .as_mut()
            .and_then(|m| m.track_mut(TrackKind::Audio))
        else {
            return Err(CallError::InvalidState);
        };
        self.media.set_track_enabled(track, enabled).await?;
        track.enabled = enabled;
        call.session.microphone_enabled = enabled;
        tracing::debug!(call_id = %call.call_id(), enabled, "Microphone toggled");
        Ok(())
    }

    async fn start_screen_share(&self) -> Result<(), CallError> {
        let call_id = {
            let phase = self.phase.lock().await;
            let Phase::InCall(call) = &*phase else {
                return Err(CallError::InvalidState);
            };
            if call.session.screen_sharing || !call.sends_video() {
                return Err(CallError::InvalidState);
            }
            call.call_id()
        };

        let screen = self.capture_mid_call(call_id, TrackSource::Screen, None).await?;

        let mut phase = self.phase.lock().await;
        let Some(call) = phase
            .current_mut(call_id, CallState::InCall)
            .filter(|c| !c.session.screen_sharing && c.sends_video())
        else {
            drop(phase);
            self.media.release_track(&screen).await;
            return Err(CallError::Cancelled);
        };

        if let Some(peer) = call.peer.clone() {
            if let Err(e) = self
                .media
                .replace_track(&peer, TrackKind::Video, Some(&screen))
                .await
            {
                self.media.release_track(&screen).await;
                return Err(e.into());
            }
        }
        if let Some(local) = call.local_media.as_mut() {
            call.parked_camera = local.set_track(screen);
        }
        call.session.screen_sharing = true;
        self.emit(CallEvent::ScreenShareChanged {
            call_id,
            active: true,
        });
        tracing::info!(call_id = %call_id, "Screen share started");
        Ok(())
    }

    async fn stop_screen_share(&self) -> Result<(), CallError> {
        let mut phase = self.phase.lock().await;
        let Phase::InCall(call) = &mut *phase else {
            return Err(CallError::InvalidState);
        };
        if !call.session.screen_sharing {
            return Err(CallError::InvalidState);
        }
        let call_id = call.call_id();

        if let Some(peer) = call.peer.clone() {
            self.media
                .replace_track(&peer, TrackKind::Video, call.parked_camera.as_ref())
                .await?;
        }
        if let Some(local) = call.local_media.as_mut() {
            let screen = match call.parked_camera.take() {
                Some(camera) => local.set_track(camera),
                None => local.take_track(TrackKind::Video),
            };
            if let Some(screen) = screen {
                self.media.release_track(&screen).await;
            }
        }
        call.session.screen_sharing = false;
        self.emit(CallEvent::ScreenShareChanged {
            call_id,
            active: false,
        });
        tracing::info!(call_id = %call_id, "Screen share stopped");
        Ok(())
    }

    async fn change_device(&self, source: TrackSource, device_id: &str) -> Result<(), CallError> {
        if source == TrackSource::Screen {
            return Err(CallError::InvalidState);
        }
        let call_id = self.in_call_id().await?;
        let mut track = self.capture_mid_call(call_id, source, Some(device_id)).await?;

        let mut phase = self.phase.lock().await;
        let Some(call) = phase.current_mut(call_id, CallState::InCall) else {
            drop(phase);
            self.media.release_track(&track).await;
            return Err(CallError::Cancelled);
        };

        let kind = source.kind();
        let parked = source == TrackSource::Camera && call.session.screen_sharing;
        let previous_enabled = if parked {
            call.parked_camera.as_ref().map(|t| t.enabled)
        } else {
            call.local_media
                .as_ref()
                .and_then(|m| m.track(kind))
                .map(|t| t.enabled)
        };
        let Some(enabled) = previous_enabled else {
            drop(phase);
            self.media.release_track(&track).await;
            return Err(CallError::InvalidState);
        };
        if !enabled {
            self.media.set_track_enabled(&track, false).await?;
            track.enabled = false;
        }

        let displaced = if parked {
            call.parked_camera.replace(track)
        } else {
            if let Some(peer) = call.peer.clone() {
                if let Err(e) = self.media.replace_track(&peer, kind, Some(&track)).await {
                    self.media.release_track(&track).await;
                    return Err(e.into());
                }
            }
            call.local_media.as_mut().and_then(|m| m.set_track(track))
        };
        if let Some(old) = displaced {
            self.media.release_track(&old).await;
        }
        tracing::info!(call_id = %call_id, source = %source, device_id, "Switched capture device");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = CallManagerConfig::default();
        assert_eq!(config.ring_timeout, Duration::from_secs(30));
        assert_eq!(config.duration_tick, Duration::from_secs(1));
        assert!(config.record_rejected_outgoing);
        assert!(config.proxy_missed_for_offline);
        assert_eq!(config.event_capacity, 100);
    }

    #[test]
    fn test_config_from_json_with_humantime() {
        let config: CallManagerConfig =
            serde_json::from_str(r#"{"ring_timeout":"45s","record_rejected_outgoing":false}"#)
                .unwrap();
        assert_eq!(config.ring_timeout, Duration::from_secs(45));
        assert!(!config.record_rejected_outgoing);
        assert_eq!(config.duration_tick, Duration::from_secs(1));
    }

    #[test]
    fn test_media_errors_map_to_call_errors() {
        assert!(matches!(
            CallError::from(MediaError::PermissionDenied("camera".into())),
            CallError::PermissionDenied(_)
        ));
        assert!(matches!(
            CallError::from(MediaError::DeviceUnavailable("mic".into())),
            CallError::DeviceUnavailable(_)
        ));
        assert!(matches!(
            CallError::from(MediaError::Negotiation("ice".into())),
            CallError::NegotiationFailed(_)
        ));
    }

    #[test]
    fn test_signaling_errors_map_to_call_errors() {
        assert!(matches!(
            CallError::from(SignalingError::Unavailable("down".into())),
            CallError::SignalingUnavailable(_)
        ));
        assert!(matches!(
            CallError::from(SignalingError::HandlerAlreadyRegistered),
            CallError::ConfigError(_)
        ));
    }

    #[test]
    fn test_only_media_and_relay_errors_raise_notices() {
        assert_eq!(
            CallError::PermissionDenied("camera".into()).notice(),
            Some(CallNotice::PermissionDenied("camera".into()))
        );
        assert!(CallError::AlreadyInCall.notice().is_none());
        assert!(CallError::InvalidState.notice().is_none());
    }
}
