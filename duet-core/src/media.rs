//! Media and peer session management
//!
//! [`MediaSessionManager`] is the capability boundary between the call state
//! machine and the platform: it captures local tracks, owns one peer session
//! per call, and streams locally gathered ICE candidates back as
//! [`PeerEvent`]s. [`SimulatedMediaManager`] is a device-free backend used by
//! tests and the `duet simulate` command; the webrtc-rs backend lives in
//! [`crate::rtc`].

use crate::types::{CallId, IceCandidate, MediaType, SdpType, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Media errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// Platform denied access to a capture device
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Capture device missing or unknown
    #[error("Device not found: {0}")]
    DeviceUnavailable(String),

    /// Offer/answer or description application failed
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// Peer session handle is unknown or already closed
    #[error("Unknown peer session: {0}")]
    UnknownSession(String),

    /// Track operation failed
    #[error("Stream error: {0}")]
    StreamError(String),
}

/// Kind of an outgoing track slot on a peer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Audio slot
    Audio,
    /// Video slot (camera or screen)
    Video,
}

/// Capture source of a local track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackSource {
    /// Microphone
    Microphone,
    /// Camera
    Camera,
    /// Screen capture
    Screen,
}

impl TrackSource {
    /// Slot this source feeds
    #[must_use]
    pub fn kind(&self) -> TrackKind {
        match self {
            Self::Microphone => TrackKind::Audio,
            Self::Camera | Self::Screen => TrackKind::Video,
        }
    }
}

impl std::fmt::Display for TrackSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Microphone => "microphone",
            Self::Camera => "camera",
            Self::Screen => "screen",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for TrackSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "microphone" | "mic" => Ok(Self::Microphone),
            "camera" | "cam" => Ok(Self::Camera),
            "screen" => Ok(Self::Screen),
            other => anyhow::bail!("unknown track source: {}", other),
        }
    }
}

/// Locally captured track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    /// Track identifier
    pub id: String,
    /// Capture source
    pub source: TrackSource,
    /// Device the track was captured from
    pub device_id: String,
    /// Enabled flag (muted/camera-off when false)
    pub enabled: bool,
}

impl LocalTrack {
    /// Slot this track feeds
    #[must_use]
    pub fn kind(&self) -> TrackKind {
        self.source.kind()
    }
}

/// Local media captured for one call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaHandle {
    /// Handle identifier
    pub id: String,
    /// Media type the handle was acquired for
    pub media_type: MediaType,
    /// Captured tracks
    pub tracks: Vec<LocalTrack>,
}

impl MediaHandle {
    /// Current track feeding `kind`
    #[must_use]
    pub fn track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    /// Mutable access to the track feeding `kind`
    pub fn track_mut(&mut self, kind: TrackKind) -> Option<&mut LocalTrack> {
        self.tracks.iter_mut().find(|t| t.kind() == kind)
    }

    /// Put `track` into its slot, returning the track it displaced
    pub fn set_track(&mut self, track: LocalTrack) -> Option<LocalTrack> {
        let kind = track.kind();
        let previous = self.take_track(kind);
        self.tracks.push(track);
        previous
    }

    /// Remove and return the track feeding `kind`
    pub fn take_track(&mut self, kind: TrackKind) -> Option<LocalTrack> {
        let index = self.tracks.iter().position(|t| t.kind() == kind)?;
        Some(self.tracks.remove(index))
    }
}

/// Handle to a peer session (one per call)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerSessionHandle {
    /// Session identifier
    pub id: String,
    /// Call this session belongs to
    pub call_id: CallId,
}

/// Asynchronous events from a peer session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// Locally gathered ICE candidate, to be trickled to the peer
    LocalCandidate(IceCandidate),
    /// Media path established
    Connected,
    /// Connection failed or dropped
    Failed(String),
}

/// Sink a peer session reports its events into
pub type PeerEventSink = mpsc::UnboundedSender<PeerEvent>;

/// Audio device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioDevice {
    /// Device identifier
    pub id: String,
    /// Device name
    pub name: String,
}

/// Video device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoDevice {
    /// Device identifier
    pub id: String,
    /// Device name
    pub name: String,
}

/// Capture devices known to a backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaDevices {
    /// Microphones
    pub audio: Vec<AudioDevice>,
    /// Cameras
    pub video: Vec<VideoDevice>,
}

impl Default for MediaDevices {
    fn default() -> Self {
        Self {
            audio: vec![AudioDevice {
                id: "default-audio".to_string(),
                name: "Default Audio Device".to_string(),
            }],
            video: vec![VideoDevice {
                id: "default-video".to_string(),
                name: "Default Video Device".to_string(),
            }],
        }
    }
}

impl MediaDevices {
    /// Resolve the device for `source`, defaulting to the first one
    ///
    /// # Errors
    ///
    /// Returns `DeviceUnavailable` if no matching device exists
    pub fn resolve(&self, source: TrackSource, device_id: Option<&str>) -> Result<String, MediaError> {
        let ids: Vec<&str> = match source {
            TrackSource::Microphone => self.audio.iter().map(|d| d.id.as_str()).collect(),
            TrackSource::Camera => self.video.iter().map(|d| d.id.as_str()).collect(),
            TrackSource::Screen => return Ok(device_id.unwrap_or("screen").to_string()),
        };
        match device_id {
            Some(wanted) => ids
                .into_iter()
                .find(|id| *id == wanted)
                .map(str::to_string)
                .ok_or_else(|| MediaError::DeviceUnavailable(format!("{} {}", source, wanted))),
            None => ids
                .first()
                .map(|id| (*id).to_string())
                .ok_or_else(|| MediaError::DeviceUnavailable(format!("no {} found", source))),
        }
    }
}

/// Media/peer session capability used by the call state machine
#[async_trait]
pub trait MediaSessionManager: Send + Sync {
    /// Capture microphone, plus camera when `media_type` is video
    async fn acquire_local_media(&self, media_type: MediaType) -> Result<MediaHandle, MediaError>;

    /// Capture a single track, optionally from a specific device
    async fn acquire_track(
        &self,
        source: TrackSource,
        device_id: Option<&str>,
    ) -> Result<LocalTrack, MediaError>;

    /// Create a peer session with `local` attached and return its offer
    async fn create_offer(
        &self,
        call_id: CallId,
        local: &MediaHandle,
        events: PeerEventSink,
    ) -> Result<(SessionDescription, PeerSessionHandle), MediaError>;

    /// Create a peer session from a remote offer and return its answer
    async fn create_answer(
        &self,
        call_id: CallId,
        offer: &SessionDescription,
        local: &MediaHandle,
        events: PeerEventSink,
    ) -> Result<(SessionDescription, PeerSessionHandle), MediaError>;

    /// Apply the remote description
    async fn apply_remote_description(
        &self,
        handle: &PeerSessionHandle,
        description: &SessionDescription,
    ) -> Result<(), MediaError>;

    /// Add a remote ICE candidate; late candidates are added, not rejected
    async fn apply_remote_candidate(
        &self,
        handle: &PeerSessionHandle,
        candidate: &IceCandidate,
    ) -> Result<(), MediaError>;

    /// Swap the outgoing track of `kind` without renegotiating
    async fn replace_track(
        &self,
        handle: &PeerSessionHandle,
        kind: TrackKind,
        track: Option<&LocalTrack>,
    ) -> Result<(), MediaError>;

    /// Toggle a local track's enabled flag
    async fn set_track_enabled(&self, track: &LocalTrack, enabled: bool) -> Result<(), MediaError>;

    /// Stop a single local track and release its device
    async fn release_track(&self, track: &LocalTrack);

    /// Stop every track of a handle
    async fn release_media(&self, media: &MediaHandle) {
        for track in &media.tracks {
            self.release_track(track).await;
        }
    }

    /// Close the peer session; no-op if already closed
    async fn teardown(&self, handle: &PeerSessionHandle);

    /// Capture devices the backend knows about
    fn devices(&self) -> MediaDevices;
}

/// Outcome of a device permission prompt in the simulated backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceAccess {
    /// Prompt accepted
    Granted,
    /// Prompt denied
    Denied,
    /// No such device
    Missing,
}

impl DeviceAccess {
    fn check(self, source: TrackSource) -> Result<(), MediaError> {
        match self {
            Self::Granted => Ok(()),
            Self::Denied => Err(MediaError::PermissionDenied(format!("{} access denied", source))),
            Self::Missing => Err(MediaError::DeviceUnavailable(format!("no {} found", source))),
        }
    }
}

/// Simulated backend configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedMediaConfig {
    /// Microphone prompt result
    pub microphone: DeviceAccess,
    /// Camera prompt result
    pub camera: DeviceAccess,
    /// Screen capture prompt result
    pub screen: DeviceAccess,
    /// Host candidates gathered per session
    pub candidates_per_session: usize,
    /// Fail every offer/answer creation
    pub fail_negotiation: bool,
    /// Report `Connected` once both descriptions are in place
    pub auto_connect: bool,
    /// Time a permission prompt stays open
    #[serde(with = "humantime_serde")]
    pub acquire_delay: Option<Duration>,
    /// Devices to expose
    pub devices: MediaDevices,
}

impl Default for SimulatedMediaConfig {
    fn default() -> Self {
        Self {
            microphone: DeviceAccess::Granted,
            camera: DeviceAccess::Granted,
            screen: DeviceAccess::Granted,
            candidates_per_session: 2,
            fail_negotiation: false,
            auto_connect: true,
            acquire_delay: None,
            devices: MediaDevices::default(),
        }
    }
}

#[derive(Debug)]
struct SimSession {
    call_id: CallId,
    role: SdpType,
    events: PeerEventSink,
    remote_applied: bool,
    closed: bool,
    outgoing: HashMap<TrackKind, Option<String>>,
}

#[derive(Debug, Default)]
struct SimState {
    next_id: u64,
    live_tracks: HashMap<String, LocalTrack>,
    sessions: HashMap<String, SimSession>,
    tracks_acquired: u64,
    releases: u64,
    double_releases: u64,
    teardowns: u64,
    double_teardowns: u64,
    applied_candidates: u64,
    track_replacements: u64,
}

impl SimState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }

    fn open_session_mut(&mut self, handle: &PeerSessionHandle) -> Result<&mut SimSession, MediaError> {
        match self.sessions.get_mut(&handle.id) {
            Some(session) if !session.closed => Ok(session),
            _ => Err(MediaError::UnknownSession(handle.id.clone())),
        }
    }
}

/// Device-free media backend
///
/// Grants or denies devices per [`SimulatedMediaConfig`], produces
/// placeholder SDP, trickles fake host candidates, and keeps accounting of
/// acquired and released resources so tests can assert on leaks.
pub struct SimulatedMediaManager {
    config: Mutex<SimulatedMediaConfig>,
    state: Mutex<SimState>,
}

impl Default for SimulatedMediaManager {
    fn default() -> Self {
        Self::new(SimulatedMediaConfig::default())
    }
}

impl SimulatedMediaManager {
    /// Create a simulated backend
    #[must_use]
    pub fn new(config: SimulatedMediaConfig) -> Self {
        Self {
            config: Mutex::new(config),
            state: Mutex::new(SimState::default()),
        }
    }

    /// Change the microphone prompt result
    pub fn set_microphone_access(&self, access: DeviceAccess) {
        self.config.lock().microphone = access;
    }

    /// Change the camera prompt result
    pub fn set_camera_access(&self, access: DeviceAccess) {
        self.config.lock().camera = access;
    }

    /// Change the screen capture prompt result
    pub fn set_screen_access(&self, access: DeviceAccess) {
        self.config.lock().screen = access;
    }

    /// Make offer/answer creation fail
    pub fn set_fail_negotiation(&self, fail: bool) {
        self.config.lock().fail_negotiation = fail;
    }

    /// Hold permission prompts open for `delay`
    pub fn set_acquire_delay(&self, delay: Option<Duration>) {
        self.config.lock().acquire_delay = delay;
    }

    /// Report a connection failure on the open session of `call_id`
    ///
    /// Returns `false` if no open session exists for the call.
    pub fn fail_call(&self, call_id: CallId, reason: &str) -> bool {
        let state = self.state.lock();
        state
            .sessions
            .values()
            .find(|s| s.call_id == call_id && !s.closed)
            .map(|s| s.events.send(PeerEvent::Failed(reason.to_string())).is_ok())
            .unwrap_or(false)
    }

    /// Tracks currently captured
    #[must_use]
    pub fn live_track_count(&self) -> usize {
        self.state.lock().live_tracks.len()
    }

    /// Live tracks captured from `source`
    #[must_use]
    pub fn live_tracks_from(&self, source: TrackSource) -> usize {
        self.state
            .lock()
            .live_tracks
            .values()
            .filter(|t| t.source == source)
            .count()
    }

    /// Tracks ever captured
    #[must_use]
    pub fn tracks_acquired(&self) -> u64 {
        self.state.lock().tracks_acquired
    }

    /// Successful track releases
    #[must_use]
    pub fn release_count(&self) -> u64 {
        self.state.lock().releases
    }

    /// Releases of tracks that were already released
    #[must_use]
    pub fn double_release_count(&self) -> u64 {
        self.state.lock().double_releases
    }

    /// Peer sessions not yet torn down
    #[must_use]
    pub fn open_session_count(&self) -> usize {
        self.state.lock().sessions.values().filter(|s| !s.closed).count()
    }

    /// Peer sessions torn down
    #[must_use]
    pub fn teardown_count(&self) -> u64 {
        self.state.lock().teardowns
    }

    /// Teardowns of sessions that were already closed
    #[must_use]
    pub fn double_teardown_count(&self) -> u64 {
        self.state.lock().double_teardowns
    }

    /// Remote candidates applied across all sessions
    #[must_use]
    pub fn applied_candidate_count(&self) -> u64 {
        self.state.lock().applied_candidates
    }

    /// Successful `replace_track` calls
    #[must_use]
    pub fn track_replacement_count(&self) -> u64 {
        self.state.lock().track_replacements
    }

    /// Whether the open session of `call_id` has a live outgoing track of `kind`
    #[must_use]
    pub fn is_sending(&self, call_id: CallId, kind: TrackKind) -> bool {
        let state = self.state.lock();
        state
            .sessions
            .values()
            .filter(|s| s.call_id == call_id && !s.closed)
            .any(|s| matches!(s.outgoing.get(&kind), Some(Some(_))))
    }

    async fn prompt_delay(&self) {
        let delay = self.config.lock().acquire_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn capture(&self, source: TrackSource, device_id: Option<&str>) -> Result<LocalTrack, MediaError> {
        let (access, devices) = {
            let config = self.config.lock();
            let access = match source {
                TrackSource::Microphone => config.microphone,
                TrackSource::Camera => config.camera,
                TrackSource::Screen => config.screen,
            };
            (access, config.devices.clone())
        };
        access.check(source)?;
        let device_id = devices.resolve(source, device_id)?;

        let mut state = self.state.lock();
        let track = LocalTrack {
            id: state.next_id(&source.to_string()),
            source,
            device_id,
            enabled: true,
        };
        state.live_tracks.insert(track.id.clone(), track.clone());
        state.tracks_acquired += 1;
        tracing::debug!(track_id = %track.id, source = %source, "Captured local track");
        Ok(track)
    }

    fn fake_sdp(session_id: &str, role: SdpType, local: &MediaHandle) -> String {
        let mut sdp = format!(
            "v=0\r\no=duet-sim {} 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\na=setup:{}\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=rtpmap:111 opus/48000/2\r\n",
            session_id,
            match role {
                SdpType::Offer => "actpass",
                SdpType::Answer => "active",
            }
        );
        sdp.push_str("m=video 9 UDP/TLS/RTP/SAVPF 96\r\na=rtpmap:96 VP8/90000\r\n");
        if local.track(TrackKind::Video).is_none() {
            sdp.push_str("a=recvonly\r\n");
        }
        sdp
    }

    fn open_session(
        &self,
        call_id: CallId,
        role: SdpType,
        local: &MediaHandle,
        events: PeerEventSink,
    ) -> Result<(SessionDescription, PeerSessionHandle), MediaError> {
        let (fail, candidates, auto_connect) = {
            let config = self.config.lock();
            (config.fail_negotiation, config.candidates_per_session, config.auto_connect)
        };
        if fail {
            return Err(MediaError::Negotiation(format!(
                "simulated {} failure",
                match role {
                    SdpType::Offer => "offer",
                    SdpType::Answer => "answer",
                }
            )));
        }

        let mut state = self.state.lock();
        let session_id = state.next_id("pc");
        let mut outgoing = HashMap::new();
        outgoing.insert(TrackKind::Audio, local.track(TrackKind::Audio).map(|t| t.id.clone()));
        outgoing.insert(TrackKind::Video, local.track(TrackKind::Video).map(|t| t.id.clone()));

        for n in 0..candidates {
            let candidate = IceCandidate::new(format!(
                "candidate:{} 1 udp 2122260223 10.0.0.{} {} typ host",
                n + 1,
                n + 1,
                50000 + n
            ));
            let _ = events.send(PeerEvent::LocalCandidate(candidate));
        }

        // Callee has both descriptions once the answer exists
        let remote_applied = role == SdpType::Answer;
        if remote_applied && auto_connect {
            let _ = events.send(PeerEvent::Connected);
        }

        let sdp = Self::fake_sdp(&session_id, role, local);
        state.sessions.insert(
            session_id.clone(),
            SimSession {
                call_id,
                role,
                events,
                remote_applied,
                closed: false,
                outgoing,
            },
        );
        drop(state);

        let description = match role {
            SdpType::Offer => SessionDescription::offer(sdp),
            SdpType::Answer => SessionDescription::answer(sdp),
        };
        tracing::debug!(call_id = %call_id, session_id = %session_id, "Simulated peer session opened");
        Ok((
            description,
            PeerSessionHandle {
                id: session_id,
                call_id,
            },
        ))
    }
}

#[async_trait]
impl MediaSessionManager for SimulatedMediaManager {
    async fn acquire_local_media(&self, media_type: MediaType) -> Result<MediaHandle, MediaError> {
        self.prompt_delay().await;

        let microphone = self.capture(TrackSource::Microphone, None)?;
        let mut tracks = vec![microphone];
        if media_type == MediaType::Video {
            match self.capture(TrackSource::Camera, None) {
                Ok(camera) => tracks.push(camera),
                Err(e) => {
                    for track in &tracks {
                        self.release_track(track).await;
                    }
                    return Err(e);
                }
            }
        }

        let id = self.state.lock().next_id("media");
        Ok(MediaHandle {
            id,
            media_type,
            tracks,
        })
    }

    async fn acquire_track(
        &self,
        source: TrackSource,
        device_id: Option<&str>,
    ) -> Result<LocalTrack, MediaError> {
        self.prompt_delay().await;
        self.capture(source, device_id)
    }

    async fn create_offer(
        &self,
        call_id: CallId,
        local: &MediaHandle,
        events: PeerEventSink,
    ) -> Result<(SessionDescription, PeerSessionHandle), MediaError> {
        self.open_session(call_id, SdpType::Offer, local, events)
    }

    async fn create_answer(
        &self,
        call_id: CallId,
        offer: &SessionDescription,
        local: &MediaHandle,
        events: PeerEventSink,
    ) -> Result<(SessionDescription, PeerSessionHandle), MediaError> {
        if offer.sdp_type != SdpType::Offer || !offer.looks_valid() {
            return Err(MediaError::Negotiation("remote offer rejected".to_string()));
        }
        self.open_session(call_id, SdpType::Answer, local, events)
    }

    async fn apply_remote_description(
        &self,
        handle: &PeerSessionHandle,
        description: &SessionDescription,
    ) -> Result<(), MediaError> {
        if !description.looks_valid() {
            return Err(MediaError::Negotiation(
                "remote description rejected".to_string(),
            ));
        }
        let auto_connect = self.config.lock().auto_connect;
        let mut state = self.state.lock();
        let session = state.open_session_mut(handle)?;
        let first = !session.remote_applied;
        session.remote_applied = true;
        if first && auto_connect && session.role == SdpType::Offer {
            let _ = session.events.send(PeerEvent::Connected);
        }
        Ok(())
    }

    async fn apply_remote_candidate(
        &self,
        handle: &PeerSessionHandle,
        candidate: &IceCandidate,
    ) -> Result<(), MediaError> {
        let mut state = self.state.lock();
        state.open_session_mut(handle)?;
        state.applied_candidates += 1;
        tracing::trace!(session_id = %handle.id, candidate = %candidate.candidate, "Applied remote candidate");
        Ok(())
    }

    async fn replace_track(
        &self,
        handle: &PeerSessionHandle,
        kind: TrackKind,
        track: Option<&LocalTrack>,
    ) -> Result<(), MediaError> {
        if let Some(track) = track {
            if track.kind() != kind {
                return Err(MediaError::StreamError(format!(
                    "{} track cannot feed the {:?} slot",
                    track.source, kind
                )));
            }
        }
        let mut state = self.state.lock();
        let session = state.open_session_mut(handle)?;
        session.outgoing.insert(kind, track.map(|t| t.id.clone()));
        state.track_replacements += 1;
        Ok(())
    }

    async fn set_track_enabled(&self, track: &LocalTrack, enabled: bool) -> Result<(), MediaError> {
        let mut state = self.state.lock();
        let live = state
            .live_tracks
            .get_mut(&track.id)
            .ok_or_else(|| MediaError::StreamError(format!("track {} not live", track.id)))?;
        live.enabled = enabled;
        Ok(())
    }

    async fn release_track(&self, track: &LocalTrack) {
        let mut state = self.state.lock();
        if state.live_tracks.remove(&track.id).is_some() {
            state.releases += 1;
            tracing::debug!(track_id = %track.id, "Released local track");
        } else {
            state.double_releases += 1;
            tracing::warn!(track_id = %track.id, "Track already released");
        }
    }

    async fn teardown(&self, handle: &PeerSessionHandle) {
        let mut state = self.state.lock();
        let closed_now = match state.sessions.get_mut(&handle.id) {
            Some(session) if !session.closed => {
                session.closed = true;
                true
            }
            _ => false,
        };
        if closed_now {
            state.teardowns += 1;
            tracing::debug!(session_id = %handle.id, "Peer session closed");
        } else {
            state.double_teardowns += 1;
            tracing::debug!(session_id = %handle.id, "Peer session already closed");
        }
    }

    fn devices(&self) -> MediaDevices {
        self.config.lock().devices.clone()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_audio_only() {
        let media = SimulatedMediaManager::default();
        let handle = media.acquire_local_media(MediaType::Audio).await.unwrap();

        assert_eq!(handle.tracks.len(), 1);
        assert!(handle.track(TrackKind::Audio).is_some());
        assert!(handle.track(TrackKind::Video).is_none());
        assert_eq!(media.live_track_count(), 1);
    }

    #[tokio::test]
    async fn test_camera_denied_releases_microphone() {
        let media = SimulatedMediaManager::default();
        media.set_camera_access(DeviceAccess::Denied);

        let result = media.acquire_local_media(MediaType::Video).await;
        assert!(matches!(result, Err(MediaError::PermissionDenied(_))));
        assert_eq!(media.live_track_count(), 0);
        assert_eq!(media.release_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_microphone() {
        let media = SimulatedMediaManager::default();
        media.set_microphone_access(DeviceAccess::Missing);

        let result = media.acquire_local_media(MediaType::Audio).await;
        assert!(matches!(result, Err(MediaError::DeviceUnavailable(_))));
    }

    #[tokio::test]
    async fn test_offer_streams_candidates() {
        let media = SimulatedMediaManager::default();
        let local = media.acquire_local_media(MediaType::Audio).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let (offer, handle) = media.create_offer(CallId::new(), &local, tx).await.unwrap();
        assert!(offer.looks_valid());
        assert_eq!(offer.sdp_type, SdpType::Offer);

        let mut candidates = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, PeerEvent::LocalCandidate(_)) {
                candidates += 1;
            }
        }
        assert_eq!(candidates, 2);

        let answer = SessionDescription::answer("v=0\r\n");
        media.apply_remote_description(&handle, &answer).await.unwrap();
        assert_eq!(rx.try_recv().unwrap(), PeerEvent::Connected);
    }

    #[tokio::test]
    async fn test_answer_rejects_garbage_offer() {
        let media = SimulatedMediaManager::default();
        let local = media.acquire_local_media(MediaType::Audio).await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();

        let result = media
            .create_answer(CallId::new(), &SessionDescription::offer("garbage"), &local, tx)
            .await;
        assert!(matches!(result, Err(MediaError::Negotiation(_))));
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let media = SimulatedMediaManager::default();
        let local = media.acquire_local_media(MediaType::Audio).await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (_, handle) = media.create_offer(CallId::new(), &local, tx).await.unwrap();

        media.teardown(&handle).await;
        media.teardown(&handle).await;
        assert_eq!(media.teardown_count(), 1);
        assert_eq!(media.double_teardown_count(), 1);
        assert_eq!(media.open_session_count(), 0);

        let late = media
            .apply_remote_candidate(&handle, &IceCandidate::new("candidate:9"))
            .await;
        assert!(matches!(late, Err(MediaError::UnknownSession(_))));
    }

    #[tokio::test]
    async fn test_replace_track_checks_kind() {
        let media = SimulatedMediaManager::default();
        let call_id = CallId::new();
        let local = media.acquire_local_media(MediaType::Audio).await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (_, handle) = media.create_offer(call_id, &local, tx).await.unwrap();

        let screen = media.acquire_track(TrackSource::Screen, None).await.unwrap();
        media
            .replace_track(&handle, TrackKind::Video, Some(&screen))
            .await
            .unwrap();
        assert!(media.is_sending(call_id, TrackKind::Video));

        let mic = local.track(TrackKind::Audio).unwrap();
        let wrong = media.replace_track(&handle, TrackKind::Video, Some(mic)).await;
        assert!(matches!(wrong, Err(MediaError::StreamError(_))));
    }

    #[tokio::test]
    async fn test_unknown_device_is_unavailable() {
        let media = SimulatedMediaManager::default();
        let result = media
            .acquire_track(TrackSource::Camera, Some("usb-cam-7"))
            .await;
        assert!(matches!(result, Err(MediaError::DeviceUnavailable(_))));

        let track = media
            .acquire_track(TrackSource::Camera, Some("default-video"))
            .await
            .unwrap();
        assert_eq!(track.device_id, "default-video");
    }

    #[tokio::test]
    async fn test_double_release_is_counted() {
        let media = SimulatedMediaManager::default();
        let handle = media.acquire_local_media(MediaType::Video).await.unwrap();

        media.release_media(&handle).await;
        media.release_media(&handle).await;
        assert_eq!(media.release_count(), 2);
        assert_eq!(media.double_release_count(), 2);
    }

    #[test]
    fn test_media_handle_slots() {
        let mut handle = MediaHandle {
            id: "m".to_string(),
            media_type: MediaType::Video,
            tracks: vec![LocalTrack {
                id: "cam".to_string(),
                source: TrackSource::Camera,
                device_id: "default-video".to_string(),
                enabled: true,
            }],
        };
        let screen = LocalTrack {
            id: "scr".to_string(),
            source: TrackSource::Screen,
            device_id: "screen".to_string(),
            enabled: true,
        };

        let previous = handle.set_track(screen).unwrap();
        assert_eq!(previous.id, "cam");
        assert_eq!(handle.track(TrackKind::Video).unwrap().id, "scr");
        assert!(handle.take_track(TrackKind::Audio).is_none());
    }

    #[test]
    fn test_config_parses_humantime_delay() {
        let config: SimulatedMediaConfig =
            serde_json::from_str(r#"{"camera":"denied","acquire_delay":"250ms"}"#).unwrap();
        assert_eq!(config.camera, DeviceAccess::Denied);
        assert_eq!(config.acquire_delay, Some(Duration::from_millis(250)));
        assert_eq!(config.microphone, DeviceAccess::Granted);
    }
}
