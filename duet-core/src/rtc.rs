//! webrtc-rs backed peer sessions
//!
//! Each call gets its own `RTCPeerConnection`. Local tracks are
//! `TrackLocalStaticSample`s the application feeds with encoded frames; the
//! video slot always exists (as an empty transceiver on audio calls) so that
//! audio↔video and camera↔screen switches are a `replace_track` on the
//! existing sender rather than a renegotiation.

use crate::media::{
    LocalTrack, MediaDevices, MediaError, MediaHandle, MediaSessionManager, PeerEvent,
    PeerEventSink, PeerSessionHandle, TrackKind, TrackSource,
};
use crate::types::{CallId, IceCandidate, MediaType, SdpType, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// webrtc-rs backend configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RtcMediaConfig {
    /// STUN/TURN server URLs
    pub ice_servers: Vec<String>,
    /// Capture devices to expose
    pub devices: MediaDevices,
}

impl Default for RtcMediaConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            devices: MediaDevices::default(),
        }
    }
}

struct RtcTrack {
    track: LocalTrack,
    sample: Arc<TrackLocalStaticSample>,
}

struct RtcSession {
    pc: Arc<RTCPeerConnection>,
    senders: HashMap<TrackKind, Arc<RTCRtpSender>>,
}

fn negotiation(context: &str, err: impl std::fmt::Display) -> MediaError {
    MediaError::Negotiation(format!("{}: {}", context, err))
}

/// Media manager backed by webrtc-rs
pub struct RtcMediaManager {
    config: RtcMediaConfig,
    api: API,
    tracks: Mutex<HashMap<String, RtcTrack>>,
    sessions: Mutex<HashMap<String, RtcSession>>,
    next_id: Mutex<u64>,
}

impl RtcMediaManager {
    /// Build the webrtc-rs API with default codecs and interceptors
    ///
    /// # Errors
    ///
    /// Returns error if codec or interceptor registration fails
    pub fn new(config: RtcMediaConfig) -> Result<Self, MediaError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| MediaError::StreamError(format!("Failed to register codecs: {}", e)))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| {
                MediaError::StreamError(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            config,
            api,
            tracks: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            next_id: Mutex::new(0),
        })
    }

    fn next_id(&self, prefix: &str) -> String {
        let mut next = self.next_id.lock();
        *next += 1;
        format!("{}-{}", prefix, *next)
    }

    fn sample_track(&self, track_id: &str) -> Option<Arc<TrackLocalStaticSample>> {
        self.tracks.lock().get(track_id).map(|t| Arc::clone(&t.sample))
    }

    /// Feed one encoded frame into a local track
    ///
    /// Frames written while the track is disabled are dropped and
    /// `Ok(false)` is returned.
    ///
    /// # Errors
    ///
    /// Returns error if the track is not live or the write fails
    pub async fn write_sample(&self, track_id: &str, sample: &Sample) -> Result<bool, MediaError> {
        let (sample_track, enabled) = {
            let tracks = self.tracks.lock();
            let live = tracks
                .get(track_id)
                .ok_or_else(|| MediaError::StreamError(format!("track {} not live", track_id)))?;
            (Arc::clone(&live.sample), live.track.enabled)
        };
        if !enabled {
            return Ok(false);
        }
        sample_track
            .write_sample(sample)
            .await
            .map_err(|e| MediaError::StreamError(format!("Failed to write sample: {}", e)))?;
        Ok(true)
    }

    fn create_sample_track(&self, source: TrackSource, track_id: &str) -> Arc<TrackLocalStaticSample> {
        let codec = match source.kind() {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "".to_string(),
                rtcp_feedback: vec![],
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: "video/VP8".to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: "".to_string(),
                rtcp_feedback: vec![],
            },
        };
        tracing::debug!(track_id = %track_id, codec = %codec.mime_type, "Creating sample track");
        Arc::new(TrackLocalStaticSample::new(
            codec,
            track_id.to_string(),
            format!("duet-{}", source),
        ))
    }

    fn local_sample(&self, track: &LocalTrack) -> Result<Arc<dyn TrackLocal + Send + Sync>, MediaError> {
        self.sample_track(&track.id)
            .map(|s| s as Arc<dyn TrackLocal + Send + Sync>)
            .ok_or_else(|| MediaError::StreamError(format!("track {} not live", track.id)))
    }

    async fn new_peer_connection(
        &self,
        events: PeerEventSink,
    ) -> Result<Arc<RTCPeerConnection>, MediaError> {
        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.config.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(rtc_config)
                .await
                .map_err(|e| negotiation("Failed to create peer connection", e))?,
        );

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(PeerEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to serialize local candidate"),
                }
            })
        }));

        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            tracing::debug!(state = %state, "Peer connection state changed");
            match state {
                RTCPeerConnectionState::Connected => {
                    let _ = events.send(PeerEvent::Connected);
                }
                RTCPeerConnectionState::Failed => {
                    let _ = events.send(PeerEvent::Failed("ICE connection failed".to_string()));
                }
                _ => {}
            }
            Box::pin(async {})
        }));

        Ok(pc)
    }

    async fn attach_local(
        &self,
        pc: &Arc<RTCPeerConnection>,
        local: &MediaHandle,
    ) -> Result<HashMap<TrackKind, Arc<RTCRtpSender>>, MediaError> {
        for track in &local.tracks {
            let sample = self.local_sample(track)?;
            pc.add_track(sample)
                .await
                .map_err(|e| negotiation("Failed to add track", e))?;
        }

        if local.track(TrackKind::Video).is_none() {
            let has_video_slot = {
                let mut found = false;
                for transceiver in pc.get_transceivers().await {
                    if transceiver.kind() == RTPCodecType::Video {
                        found = true;
                    }
                }
                found
            };
            if !has_video_slot {
                pc.add_transceiver_from_kind(RTPCodecType::Video, None)
                    .await
                    .map_err(|e| negotiation("Failed to add video transceiver", e))?;
            }
        }

        let mut senders = HashMap::new();
        for transceiver in pc.get_transceivers().await {
            let kind = match transceiver.kind() {
                RTPCodecType::Audio => TrackKind::Audio,
                RTPCodecType::Video => TrackKind::Video,
                _ => continue,
            };
            if !senders.contains_key(&kind) {
                senders.insert(kind, transceiver.sender().await);
            }
        }
        Ok(senders)
    }

    fn store_session(
        &self,
        call_id: CallId,
        pc: Arc<RTCPeerConnection>,
        senders: HashMap<TrackKind, Arc<RTCRtpSender>>,
    ) -> PeerSessionHandle {
        let id = self.next_id("pc");
        self.sessions
            .lock()
            .insert(id.clone(), RtcSession { pc, senders });
        tracing::info!(call_id = %call_id, session_id = %id, "Peer session created");
        PeerSessionHandle { id, call_id }
    }

    /// Close a connection whose negotiation failed before it was stored
    async fn abandon(&self, pc: &RTCPeerConnection, err: MediaError) -> MediaError {
        if let Err(e) = pc.close().await {
            tracing::warn!(error = %e, "Error closing abandoned peer connection");
        }
        tracing::debug!(error = %err, "Peer connection abandoned");
        err
    }

    fn peer(&self, handle: &PeerSessionHandle) -> Result<Arc<RTCPeerConnection>, MediaError> {
        self.sessions
            .lock()
            .get(&handle.id)
            .map(|s| Arc::clone(&s.pc))
            .ok_or_else(|| MediaError::UnknownSession(handle.id.clone()))
    }
}

#[async_trait]
impl MediaSessionManager for RtcMediaManager {
    async fn acquire_local_media(&self, media_type: MediaType) -> Result<MediaHandle, MediaError> {
        let mut tracks = vec![self.acquire_track(TrackSource::Microphone, None).await?];
        if media_type == MediaType::Video {
            match self.acquire_track(TrackSource::Camera, None).await {
                Ok(track) => tracks.push(track),
                Err(e) => {
                    for track in &tracks {
                        self.release_track(track).await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(MediaHandle {
            id: self.next_id("media"),
            media_type,
            tracks,
        })
    }

    async fn acquire_track(
        &self,
        source: TrackSource,
        device_id: Option<&str>,
    ) -> Result<LocalTrack, MediaError> {
        let device_id = self.config.devices.resolve(source, device_id)?;
        let id = self.next_id(&source.to_string());
        let sample = self.create_sample_track(source, &id);
        let track = LocalTrack {
            id: id.clone(),
            source,
            device_id,
            enabled: true,
        };
        self.tracks.lock().insert(
            id,
            RtcTrack {
                track: track.clone(),
                sample,
            },
        );
        Ok(track)
    }

    async fn create_offer(
        &self,
        call_id: CallId,
        local: &MediaHandle,
        events: PeerEventSink,
    ) -> Result<(SessionDescription, PeerSessionHandle), MediaError> {
        let pc = self.new_peer_connection(events).await?;
        let negotiated = async {
            let senders = self.attach_local(&pc, local).await?;
            let offer = pc
                .create_offer(None)
                .await
                .map_err(|e| negotiation("Failed to create offer", e))?;
            pc.set_local_description(offer.clone())
                .await
                .map_err(|e| negotiation("Failed to set local description", e))?;
            Ok::<_, MediaError>((senders, offer.sdp))
        }
        .await;

        match negotiated {
            Ok((senders, sdp)) => {
                let handle = self.store_session(call_id, pc, senders);
                Ok((SessionDescription::offer(sdp), handle))
            }
            Err(e) => Err(self.abandon(&pc, e).await),
        }
    }

    async fn create_answer(
        &self,
        call_id: CallId,
        offer: &SessionDescription,
        local: &MediaHandle,
        events: PeerEventSink,
    ) -> Result<(SessionDescription, PeerSessionHandle), MediaError> {
        let pc = self.new_peer_connection(events).await?;
        let negotiated = async {
            let remote = RTCSessionDescription::offer(offer.sdp.clone())
                .map_err(|e| negotiation("Invalid remote offer", e))?;
            pc.set_remote_description(remote)
                .await
                .map_err(|e| negotiation("Failed to apply remote offer", e))?;

            let senders = self.attach_local(&pc, local).await?;

            let answer = pc
                .create_answer(None)
                .await
                .map_err(|e| negotiation("Failed to create answer", e))?;
            pc.set_local_description(answer.clone())
                .await
                .map_err(|e| negotiation("Failed to set local description", e))?;
            Ok::<_, MediaError>((senders, answer.sdp))
        }
        .await;

        match negotiated {
            Ok((senders, sdp)) => {
                let handle = self.store_session(call_id, pc, senders);
                Ok((SessionDescription::answer(sdp), handle))
            }
            Err(e) => Err(self.abandon(&pc, e).await),
        }
    }

    async fn apply_remote_description(
        &self,
        handle: &PeerSessionHandle,
        description: &SessionDescription,
    ) -> Result<(), MediaError> {
        let pc = self.peer(handle)?;
        let remote = match description.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp.clone()),
            SdpType::Answer => RTCSessionDescription::answer(description.sdp.clone()),
        }
        .map_err(|e| negotiation("Invalid remote description", e))?;
        pc.set_remote_description(remote)
            .await
            .map_err(|e| negotiation("Failed to apply remote description", e))
    }

    async fn apply_remote_candidate(
        &self,
        handle: &PeerSessionHandle,
        candidate: &IceCandidate,
    ) -> Result<(), MediaError> {
        let pc = self.peer(handle)?;
        pc.add_ice_candidate(RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        })
        .await
        .map_err(|e| negotiation("Failed to add remote candidate", e))
    }

    async fn replace_track(
        &self,
        handle: &PeerSessionHandle,
        kind: TrackKind,
        track: Option<&LocalTrack>,
    ) -> Result<(), MediaError> {
        let sender = self
            .sessions
            .lock()
            .get(&handle.id)
            .ok_or_else(|| MediaError::UnknownSession(handle.id.clone()))?
            .senders
            .get(&kind)
            .cloned()
            .ok_or_else(|| MediaError::StreamError(format!("no {:?} sender", kind)))?;

        let sample = match track {
            Some(track) if track.kind() != kind => {
                return Err(MediaError::StreamError(format!(
                    "{} track cannot feed the {:?} slot",
                    track.source, kind
                )))
            }
            Some(track) => Some(self.local_sample(track)?),
            None => None,
        };

        sender
            .replace_track(sample)
            .await
            .map_err(|e| MediaError::StreamError(format!("Failed to replace track: {}", e)))
    }

    /// Disabled tracks stay bound to their sender; `write_sample` drops their frames
    async fn set_track_enabled(&self, track: &LocalTrack, enabled: bool) -> Result<(), MediaError> {
        let mut tracks = self.tracks.lock();
        let live = tracks
            .get_mut(&track.id)
            .ok_or_else(|| MediaError::StreamError(format!("track {} not live", track.id)))?;
        live.track.enabled = enabled;
        Ok(())
    }

    async fn release_track(&self, track: &LocalTrack) {
        if self.tracks.lock().remove(&track.id).is_none() {
            tracing::warn!(track_id = %track.id, "Track already released");
        }
    }

    async fn teardown(&self, handle: &PeerSessionHandle) {
        let session = self.sessions.lock().remove(&handle.id);
        match session {
            Some(session) => {
                if let Err(e) = session.pc.close().await {
                    tracing::warn!(session_id = %handle.id, error = %e, "Error closing peer connection");
                }
                tracing::info!(session_id = %handle.id, "Peer session closed");
            }
            None => tracing::debug!(session_id = %handle.id, "Peer session already closed"),
        }
    }

    fn devices(&self) -> MediaDevices {
        self.config.devices.clone()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_acquire_creates_sample_tracks() {
        let media = RtcMediaManager::new(RtcMediaConfig::default()).unwrap();
        let handle = media.acquire_local_media(MediaType::Video).await.unwrap();

        assert_eq!(handle.tracks.len(), 2);
        let camera = handle.track(TrackKind::Video).unwrap();
        assert!(media.sample_track(&camera.id).is_some());

        media.release_media(&handle).await;
        assert!(media.sample_track(&camera.id).is_none());
    }

    #[tokio::test]
    async fn test_offer_contains_audio_and_video_sections() {
        let media = RtcMediaManager::new(RtcMediaConfig {
            ice_servers: vec![],
            ..Default::default()
        })
        .unwrap();
        let local = media.acquire_local_media(MediaType::Audio).await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();

        let (offer, handle) = media.create_offer(CallId::new(), &local, tx).await.unwrap();
        assert!(offer.looks_valid());
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));

        media.teardown(&handle).await;
        media.teardown(&handle).await;
        assert!(matches!(
            media.apply_remote_candidate(&handle, &IceCandidate::new("candidate:1")).await,
            Err(MediaError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_answer_leaves_no_session() {
        let media = RtcMediaManager::new(RtcMediaConfig {
            ice_servers: vec![],
            ..Default::default()
        })
        .unwrap();
        let local = media.acquire_local_media(MediaType::Audio).await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();

        let garbage = SessionDescription::offer("not an sdp".to_string());
        let result = media.create_answer(CallId::new(), &garbage, &local, tx).await;
        assert!(matches!(result, Err(MediaError::Negotiation(_))));
        assert!(media.sessions.lock().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_track_drops_samples() {
        let media = RtcMediaManager::new(RtcMediaConfig::default()).unwrap();
        let mic = media.acquire_track(TrackSource::Microphone, None).await.unwrap();
        let frame = Sample {
            duration: std::time::Duration::from_millis(20),
            ..Default::default()
        };

        assert!(media.write_sample(&mic.id, &frame).await.unwrap());
        media.set_track_enabled(&mic, false).await.unwrap();
        assert!(!media.write_sample(&mic.id, &frame).await.unwrap());
        media.set_track_enabled(&mic, true).await.unwrap();
        assert!(media.write_sample(&mic.id, &frame).await.unwrap());

        media.release_track(&mic).await;
        assert!(matches!(
            media.write_sample(&mic.id, &frame).await,
            Err(MediaError::StreamError(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_camera_is_unavailable() {
        let media = RtcMediaManager::new(RtcMediaConfig::default()).unwrap();
        let result = media.acquire_track(TrackSource::Camera, Some("nope")).await;
        assert!(matches!(result, Err(MediaError::DeviceUnavailable(_))));
    }
}
