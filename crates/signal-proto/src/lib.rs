//! Wire protocol for the televisit signaling relay.
//!
//! Both the relay server and the client core speak this protocol over a
//! persistent WebSocket carrying JSON-encoded events. The event tags and
//! payload field names match the platform's original socket contract
//! (`join-session`, `session-joined`, `targetUserId`, ...), so third-party
//! clients interoperate without a translation layer.

use serde::{Deserialize, Serialize};

/// Role of a participant within a clinical session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParticipantRole {
    Therapist,
    Patient,
}

/// Discrete connection quality level derived from transport statistics.
///
/// Ordered from best to worst; `worst` on two levels picks the more
/// degraded one, which the connection monitor relies on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum QualityLevel {
    Excellent,
    Good,
    Fair,
    Poor,
    Disconnected,
}

impl QualityLevel {
    pub fn worst(self, other: QualityLevel) -> QualityLevel {
        self.max(other)
    }
}

/// Raw metrics a quality level was computed from. Derived, never persisted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct QualityMetrics {
    /// Round-trip time in milliseconds.
    pub rtt_ms: f64,
    /// Packet loss as a fraction in `[0, 1]`.
    pub packet_loss: f64,
    /// Jitter in milliseconds.
    pub jitter_ms: f64,
    /// Available outgoing bitrate in kbit/s.
    pub available_kbps: f64,
}

/// An ICE candidate as exchanged between peers. The relay never inspects
/// this; it is an opaque pass-through.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidatePayload {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u32>,
}

/// Minimal participant view announced to room members.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantSummary {
    pub id: String,
    pub role: ParticipantRole,
}

/// Events sent from a client to the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    /// Bind this connection to a session room. Requires an authenticated
    /// connection and a non-empty session id.
    JoinSession {
        session_id: String,
        role: ParticipantRole,
    },
    /// Leave the current room. Idempotent; a no-op outside a session.
    LeaveSession,
    /// Forward an SDP offer to another room member.
    Offer { target_user_id: String, sdp: String },
    /// Forward an SDP answer to another room member.
    Answer { target_user_id: String, sdp: String },
    /// Forward a discovered ICE candidate to another room member.
    IceCandidate {
        target_user_id: String,
        candidate: IceCandidatePayload,
    },
    /// Fire-and-forget quality report, rebroadcast to the rest of the room.
    ConnectionQuality {
        level: QualityLevel,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metrics: Option<QualityMetrics>,
    },
}

/// Events sent from the relay to a client. The `user_id` on forwarded
/// signals is attached server-side from the authenticated identity and
/// never taken from the sending client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// Join acknowledgment, listing every *other* participant in the room.
    SessionJoined {
        session_id: String,
        user_id: String,
        role: ParticipantRole,
        participants: Vec<ParticipantSummary>,
    },
    ParticipantJoined {
        user_id: String,
        role: ParticipantRole,
    },
    ParticipantLeft {
        user_id: String,
    },
    Offer {
        user_id: String,
        sdp: String,
    },
    Answer {
        user_id: String,
        sdp: String,
    },
    IceCandidate {
        user_id: String,
        candidate: IceCandidatePayload,
    },
    ParticipantConnectionQuality {
        user_id: String,
        level: QualityLevel,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metrics: Option<QualityMetrics>,
    },
    Error {
        message: String,
    },
}
