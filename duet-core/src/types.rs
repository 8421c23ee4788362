//! Call types and data structures

use crate::identity::PeerIdentity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a call attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Create a new random call ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of call: voice only or voice plus camera
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    /// Audio-only call
    Audio,
    /// Audio and video call
    Video,
}

impl MediaType {
    /// Lowercase wire name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MediaType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "audio" => Ok(Self::Audio),
            "video" => Ok(Self::Video),
            other => anyhow::bail!("unknown media type: {other}"),
        }
    }
}

/// Which side placed the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    /// Placed by the local user
    Outgoing,
    /// Placed by the remote user
    Incoming,
}

/// Call state of the local endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallState {
    /// No active call
    Idle,
    /// Outgoing call ringing the remote peer
    Calling,
    /// Incoming call ringing locally
    Incoming,
    /// Call connected
    InCall,
}

impl CallState {
    /// Whether a session exists in this state
    #[must_use]
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Idle)
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Calling => "calling",
            Self::Incoming => "incoming",
            Self::InCall => "in-call",
        };
        f.write_str(s)
    }
}

/// Type of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer from the caller
    Offer,
    /// Answer from the callee
    Answer,
}

/// Session description exchanged during negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    pub sdp_type: SdpType,
    /// SDP content
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// Minimal structural check: non-empty and starts with a version line
    #[must_use]
    pub fn looks_valid(&self) -> bool {
        self.sdp.trim_start().starts_with("v=")
    }
}

/// ICE candidate trickled between peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// ICE candidate string
    pub candidate: String,
    /// SDP media ID
    pub sdp_mid: Option<String>,
    /// SDP media line index
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    /// Host candidate helper
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }
}

/// Why a call was ended, carried in the `end` signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndReason {
    /// Connected call hung up
    Hangup,
    /// Caller gave up before an answer
    Cancelled,
    /// Callee declined
    Rejected,
    /// Callee already in another call
    Busy,
    /// Nobody answered within the ring timeout
    Timeout,
    /// Negotiation or connection failure
    Failed,
}

/// Final outcome of a call attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallOutcome {
    /// Call was connected and later ended
    Completed,
    /// Incoming call was never answered
    Missed,
    /// Call was declined
    Rejected,
    /// Callee was in another call
    Busy,
    /// Outgoing call was never answered
    NoAnswer,
}

impl std::fmt::Display for CallOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Completed => "completed",
            Self::Missed => "missed",
            Self::Rejected => "rejected",
            Self::Busy => "busy",
            Self::NoAnswer => "no-answer",
        };
        f.write_str(s)
    }
}

/// Snapshot of the active call on this endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct CallSession<I: PeerIdentity> {
    /// Call identifier
    pub call_id: CallId,
    /// Local user
    pub local_user: I,
    /// Remote user
    pub remote_user: I,
    /// Who placed the call
    pub direction: CallDirection,
    /// Call media type: video while either side sends video
    pub media_type: MediaType,
    /// What the remote peer last said it sends
    pub remote_media_type: MediaType,
    /// Current state
    pub state: CallState,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Time the call entered `in-call`
    pub started_at: Option<DateTime<Utc>>,
    /// Offer awaiting acknowledgment
    pub pending_offer: Option<SessionDescription>,
    /// Answer awaiting acknowledgment
    pub pending_answer: Option<SessionDescription>,
    /// Whether our camera track is enabled
    pub local_video_enabled: bool,
    /// Whether the remote peer reports its camera enabled
    pub remote_video_enabled: bool,
    /// Whether our microphone track is enabled
    pub microphone_enabled: bool,
    /// Whether we are sharing our screen in place of the camera
    pub screen_sharing: bool,
}

impl<I: PeerIdentity> CallSession<I> {
    /// Create a new call session
    pub fn new(
        call_id: CallId,
        local_user: I,
        remote_user: I,
        direction: CallDirection,
        media_type: MediaType,
        state: CallState,
    ) -> Self {
        let video = media_type == MediaType::Video;
        Self {
            call_id,
            local_user,
            remote_user,
            direction,
            media_type,
            remote_media_type: media_type,
            state,
            created_at: Utc::now(),
            started_at: None,
            pending_offer: None,
            pending_answer: None,
            local_video_enabled: video,
            remote_video_enabled: video,
            microphone_enabled: true,
            screen_sharing: false,
        }
    }
}

/// User-facing notices for failures handled inside the state machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallNotice {
    /// Camera or microphone permission denied
    PermissionDenied(String),
    /// Camera or microphone missing
    DeviceUnavailable(String),
    /// Peer connection could not be established or dropped
    ConnectionFailed(String),
    /// Signaling relay unreachable
    SignalingUnavailable(String),
    /// Remote user is in another call
    RemoteBusy,
}

/// Call event for UI layers
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent<I: PeerIdentity> {
    /// Incoming call received
    IncomingCall {
        /// Call identifier
        call_id: CallId,
        /// Who is calling
        caller: I,
        /// Offered media type
        media_type: MediaType,
    },
    /// Local state changed
    StateChanged {
        /// Call identifier
        call_id: CallId,
        /// Previous state
        old_state: CallState,
        /// New state
        new_state: CallState,
    },
    /// Media type switched mid-call
    MediaTypeChanged {
        /// Call identifier
        call_id: CallId,
        /// New media type
        media_type: MediaType,
        /// Whether the remote peer initiated the switch
        remote: bool,
    },
    /// Remote camera enabled flag changed
    RemoteVideoToggled {
        /// Call identifier
        call_id: CallId,
        /// Remote camera enabled
        enabled: bool,
    },
    /// Local screen share started or stopped
    ScreenShareChanged {
        /// Call identifier
        call_id: CallId,
        /// Sharing active
        active: bool,
    },
    /// Periodic call duration update while in a call
    DurationTick {
        /// Call identifier
        call_id: CallId,
        /// Whole seconds since the call connected
        elapsed_secs: u64,
    },
    /// Call reached a terminal state
    CallEnded {
        /// Call identifier
        call_id: CallId,
        /// Outcome from this endpoint's perspective
        outcome: CallOutcome,
        /// Connected duration in seconds
        duration_secs: u64,
    },
    /// Failure surfaced to the user
    Notice {
        /// Call the notice relates to
        call_id: Option<CallId>,
        /// What happened
        notice: CallNotice,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::identity::UserId;

    #[test]
    fn test_call_id() {
        let id1 = CallId::new();
        let id2 = CallId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_call_state_wire_names() {
        assert_eq!(
            serde_json::to_string(&CallState::InCall).unwrap(),
            "\"in-call\""
        );
        assert_eq!(CallState::InCall.to_string(), "in-call");
        assert!(!CallState::Idle.is_active());
        assert!(CallState::Incoming.is_active());
    }

    #[test]
    fn test_outcome_wire_names() {
        assert_eq!(
            serde_json::to_string(&CallOutcome::NoAnswer).unwrap(),
            "\"no-answer\""
        );
        assert_eq!(CallOutcome::NoAnswer.to_string(), "no-answer");
    }

    #[test]
    fn test_media_type_parse() {
        assert_eq!("Video".parse::<MediaType>().unwrap(), MediaType::Video);
        assert!("hologram".parse::<MediaType>().is_err());
    }

    #[test]
    fn test_session_description_validity() {
        assert!(SessionDescription::offer("v=0\r\n").looks_valid());
        assert!(!SessionDescription::answer("").looks_valid());
        assert!(!SessionDescription::answer("not-an-sdp").looks_valid());
    }

    #[test]
    fn test_call_session_video_flags() {
        let session = CallSession::new(
            CallId::new(),
            UserId::new("a"),
            UserId::new("b"),
            CallDirection::Outgoing,
            MediaType::Video,
            CallState::Calling,
        );
        assert!(session.local_video_enabled);
        assert!(session.remote_video_enabled);
        assert!(session.microphone_enabled);
        assert!(session.started_at.is_none());
        assert_eq!(session.remote_media_type, MediaType::Video);
    }
}
