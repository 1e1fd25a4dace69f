//! Call types and data structures

use crate::identity::ParticipantId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Opaque call identifier assigned by the record service
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    /// Wrap an identifier issued by the record service
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner token
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Kind of call requested by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    /// Audio only
    Voice,
    /// Audio and video
    Video,
}

impl CallType {
    /// Capture constraints needed for this call type
    pub fn constraints(self) -> MediaConstraints {
        match self {
            Self::Voice => MediaConstraints::audio_only(),
            Self::Video => MediaConstraints::video_call(),
        }
    }
}

impl std::fmt::Display for CallType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Voice => write!(f, "voice"),
            Self::Video => write!(f, "video"),
        }
    }
}

impl std::str::FromStr for CallType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "voice" | "audio" => Ok(Self::Voice),
            "video" => Ok(Self::Video),
            other => Err(format!("unknown call type: {other}")),
        }
    }
}

/// Media constraints for a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Enable audio
    pub audio: bool,
    /// Enable video
    pub video: bool,
}

impl MediaConstraints {
    /// Audio-only call
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    /// Video call with audio
    pub fn video_call() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }

    /// Check if audio is enabled
    pub fn has_audio(&self) -> bool {
        self.audio
    }

    /// Check if video is enabled
    pub fn has_video(&self) -> bool {
        self.video
    }

    /// Convert to media kinds
    pub fn to_media_kinds(&self) -> Vec<MediaKind> {
        let mut kinds = Vec::new();
        if self.audio {
            kinds.push(MediaKind::Audio);
        }
        if self.video {
            kinds.push(MediaKind::Video);
        }
        kinds
    }
}

/// Kind of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Microphone audio
    Audio,
    /// Camera video
    Video,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// Status of a call record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    /// Created, not yet answered
    Pending,
    /// Answered by the receiver
    Accepted,
    /// Declined by the receiver
    Rejected,
    /// Hung up after being accepted
    Ended,
    /// Never answered
    Missed,
}

impl CallStatus {
    /// Whether a record in this status may move to `next`
    ///
    /// Only `pending -> {accepted, rejected, missed}` and `accepted -> ended`
    /// are allowed.
    #[must_use]
    pub fn can_transition_to(self, next: CallStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Accepted)
                | (Self::Pending, Self::Rejected)
                | (Self::Pending, Self::Missed)
                | (Self::Accepted, Self::Ended)
        )
    }

    /// Terminal records must not be signaled on again
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Ended | Self::Missed)
    }
}

/// Rejected record status change
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid call status transition {from:?} -> {to:?}")]
pub struct StatusTransitionError {
    /// Current status
    pub from: CallStatus,
    /// Requested status
    pub to: CallStatus,
}

/// Call record as held by the record service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Call {
    /// Record identifier
    pub id: CallId,
    /// Who placed the call
    pub caller_id: ParticipantId,
    /// Who is being called
    pub receiver_id: ParticipantId,
    /// Voice or video
    #[serde(rename = "type")]
    pub call_type: CallType,
    /// Record status
    pub status: CallStatus,
    /// When the call was answered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    /// When the call finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Talk time in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp
    pub updated_at: DateTime<Utc>,
}

impl Call {
    /// Create a pending record (used by record service fakes and tests)
    pub fn pending(
        id: impl Into<String>,
        caller_id: ParticipantId,
        receiver_id: ParticipantId,
        call_type: CallType,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: CallId::new(id),
            caller_id,
            receiver_id,
            call_type,
            status: CallStatus::Pending,
            start_time: None,
            end_time: None,
            duration: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a status change, keeping timestamps consistent
    ///
    /// # Errors
    ///
    /// Returns error if the change violates the record status order
    pub fn transition(
        &mut self,
        next: CallStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StatusTransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(StatusTransitionError {
                from: self.status,
                to: next,
            });
        }
        match next {
            CallStatus::Accepted => self.start_time = Some(at),
            CallStatus::Ended => {
                self.end_time = Some(at);
                self.duration = self
                    .start_time
                    .map(|start| u64::try_from((at - start).num_seconds()).unwrap_or(0));
            }
            CallStatus::Rejected | CallStatus::Missed => self.end_time = Some(at),
            CallStatus::Pending => {}
        }
        self.status = next;
        self.updated_at = at;
        Ok(())
    }

    /// Whether this participant placed the call
    pub fn is_outgoing_for(&self, participant: &ParticipantId) -> bool {
        &self.caller_id == participant
    }

    /// The other end of the call from `participant`'s point of view
    pub fn peer_of(&self, participant: &ParticipantId) -> &ParticipantId {
        if self.is_outgoing_for(participant) {
            &self.receiver_id
        } else {
            &self.caller_id
        }
    }

    /// Talk time as `m:ss`, `0:00` when unknown
    pub fn format_duration(&self) -> String {
        let seconds = self.duration.unwrap_or(0);
        format!("{}:{:02}", seconds / 60, seconds % 60)
    }
}

/// Session description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer
    Offer,
    /// Provisional answer
    Pranswer,
    /// Final answer
    Answer,
    /// Rollback
    Rollback,
}

/// Session description exchanged during negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Description type
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// SDP body
    pub sdp: String,
}

impl SessionDescription {
    /// Offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate exchanged during negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Candidate attribute line
    pub candidate: String,
    /// SDP media ID
    #[serde(default)]
    pub sdp_mid: Option<String>,
    /// SDP media line index
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    /// ICE username fragment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Candidate with only the attribute line set
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Wire name of a call signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    /// Session offer
    Offer,
    /// Session answer
    Answer,
    /// Trickled candidate
    IceCandidate,
    /// Far end hung up
    Hangup,
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Offer => write!(f, "offer"),
            Self::Answer => write!(f, "answer"),
            Self::IceCandidate => write!(f, "ice-candidate"),
            Self::Hangup => write!(f, "hangup"),
        }
    }
}

/// Payload carried by a call signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalPayload {
    /// Session offer
    Offer(SessionDescription),
    /// Session answer
    Answer(SessionDescription),
    /// Trickled candidate
    IceCandidate(IceCandidate),
    /// Far end hung up
    Hangup,
}

impl SignalPayload {
    /// Wire name of this payload
    pub fn kind(&self) -> SignalKind {
        match self {
            Self::Offer(_) => SignalKind::Offer,
            Self::Answer(_) => SignalKind::Answer,
            Self::IceCandidate(_) => SignalKind::IceCandidate,
            Self::Hangup => SignalKind::Hangup,
        }
    }
}

/// Negotiation message scoped to exactly one call
///
/// On the wire this is `{"callId": .., "type": .., "data": ..}` where `data`
/// is absent for `hangup`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSignal {
    /// Call this signal belongs to
    pub call_id: CallId,
    /// Typed payload
    pub payload: SignalPayload,
}

impl CallSignal {
    /// Offer signal
    pub fn offer(call_id: CallId, description: SessionDescription) -> Self {
        Self {
            call_id,
            payload: SignalPayload::Offer(description),
        }
    }

    /// Answer signal
    pub fn answer(call_id: CallId, description: SessionDescription) -> Self {
        Self {
            call_id,
            payload: SignalPayload::Answer(description),
        }
    }

    /// Candidate signal
    pub fn ice_candidate(call_id: CallId, candidate: IceCandidate) -> Self {
        Self {
            call_id,
            payload: SignalPayload::IceCandidate(candidate),
        }
    }

    /// Hangup signal
    pub fn hangup(call_id: CallId) -> Self {
        Self {
            call_id,
            payload: SignalPayload::Hangup,
        }
    }

    /// Wire name of this signal
    pub fn kind(&self) -> SignalKind {
        self.payload.kind()
    }
}

#[derive(Serialize)]
#[serde(untagged)]
enum WirePayload<'a> {
    Description(&'a SessionDescription),
    Candidate(&'a IceCandidate),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireSignalOut<'a> {
    call_id: &'a CallId,
    #[serde(rename = "type")]
    kind: SignalKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<WirePayload<'a>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireSignalIn {
    call_id: CallId,
    #[serde(rename = "type")]
    kind: SignalKind,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

impl Serialize for CallSignal {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let data = match &self.payload {
            SignalPayload::Offer(d) | SignalPayload::Answer(d) => Some(WirePayload::Description(d)),
            SignalPayload::IceCandidate(c) => Some(WirePayload::Candidate(c)),
            SignalPayload::Hangup => None,
        };
        WireSignalOut {
            call_id: &self.call_id,
            kind: self.kind(),
            data,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CallSignal {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error as _;

        let wire = WireSignalIn::deserialize(deserializer)?;
        let data = |kind: SignalKind| {
            wire.data
                .clone()
                .ok_or_else(|| D::Error::custom(format!("{kind} signal without data")))
        };
        let payload = match wire.kind {
            SignalKind::Offer => SignalPayload::Offer(
                serde_json::from_value(data(SignalKind::Offer)?).map_err(D::Error::custom)?,
            ),
            SignalKind::Answer => SignalPayload::Answer(
                serde_json::from_value(data(SignalKind::Answer)?).map_err(D::Error::custom)?,
            ),
            SignalKind::IceCandidate => SignalPayload::IceCandidate(
                serde_json::from_value(data(SignalKind::IceCandidate)?)
                    .map_err(D::Error::custom)?,
            ),
            SignalKind::Hangup => SignalPayload::Hangup,
        };
        Ok(Self {
            call_id: wire.call_id,
            payload,
        })
    }
}

/// Phase of the local call state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallPhase {
    /// No call
    Idle,
    /// Outbound, waiting for the far end to answer
    Calling,
    /// Inbound, waiting for a local decision
    Ringing,
    /// Accepted, descriptions in flight
    Connecting,
    /// Media session established
    InCall,
    /// Releasing resources on the way back to Idle
    Ending,
}

impl CallPhase {
    /// Phases that own (or are acquiring) call resources
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Idle | Self::Ending)
    }
}

impl std::fmt::Display for CallPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Ephemeral local call state exposed to presentation code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallState {
    /// Media session established
    pub is_in_call: bool,
    /// Local audio track disabled
    pub is_muted: bool,
    /// Local video track enabled
    pub is_video_enabled: bool,
    /// A local capture stream is held
    pub has_local_stream: bool,
    /// The far end's media has arrived
    pub has_remote_stream: bool,
}

impl Default for CallState {
    fn default() -> Self {
        Self {
            is_in_call: false,
            is_muted: false,
            is_video_enabled: true,
            has_local_stream: false,
            has_remote_stream: false,
        }
    }
}

/// Why a call left the active phases
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// Local user hung up
    LocalHangup,
    /// Far end hung up or cancelled
    RemoteHangup,
    /// Far end declined
    Rejected,
    /// Local user declined
    Declined,
    /// Signaling channel dropped mid-call
    ChannelLost,
    /// Acquisition, negotiation or record failure
    Failed(String),
}

/// Call events for presentation code
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// Phase changed
    PhaseChanged {
        /// Previous phase
        from: CallPhase,
        /// New phase
        to: CallPhase,
    },
    /// Incoming call is ringing
    IncomingCall {
        /// The ringing call
        call: Call,
    },
    /// Outgoing call record created and offer sent
    OutgoingCall {
        /// The outgoing call
        call: Call,
    },
    /// Media session established
    Connected {
        /// Call identifier
        call_id: CallId,
    },
    /// Mute, video or stream flags changed
    StateChanged(CallState),
    /// Call torn down
    CallEnded {
        /// Last known record, if one existed
        call: Option<Call>,
        /// Why it ended
        reason: EndReason,
    },
}
