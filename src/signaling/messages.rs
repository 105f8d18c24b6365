//! Message Types für das Relay-Protokoll
//!
//! Jede Nachricht ist ein JSON-Objekt mit `type`-Diskriminator, die
//! Payload-Felder liegen flach daneben:
//!
//! ```json
//! {"type":"joinRoom","roomId":"R1"}
//! {"type":"createOffer","sdp":"v=0..."}
//! {"type":"iceCandidate","candidate":{"candidate":"candidate:...","sdpMid":"0","sdpMLineIndex":0}}
//! ```

use serde::{Deserialize, Serialize};

// ============================================================================
// NETWORK CANDIDATE
// ============================================================================

/// Ein entdeckter Transportpfad (Form von `RTCIceCandidateInit`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl NetworkCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

// ============================================================================
// SIGNALING MESSAGE
// ============================================================================

/// Alle Nachrichten zwischen Client und Relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SignalingMessage {
    /// Client → Relay: Raum betreten
    JoinRoom {
        #[serde(rename = "roomId")]
        room_id: String,
    },

    /// SDP Offer, vom Relay an das andere Mitglied weitergeleitet
    CreateOffer { sdp: String },

    /// SDP Answer, vom Relay an das andere Mitglied weitergeleitet
    CreateAnswer { sdp: String },

    /// ICE Candidate, vom Relay an das andere Mitglied weitergeleitet
    IceCandidate { candidate: NetworkCandidate },

    /// Relay → Client: Fehlermeldung
    Error { message: String },
}

impl SignalingMessage {
    /// Name des Wire-Typs (für Logging)
    pub fn kind(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "joinRoom",
            Self::CreateOffer { .. } => "createOffer",
            Self::CreateAnswer { .. } => "createAnswer",
            Self::IceCandidate { .. } => "iceCandidate",
            Self::Error { .. } => "error",
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

// ============================================================================
// TESTS
// ============================================================================
