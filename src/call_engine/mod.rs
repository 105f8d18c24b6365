//! Call Engine Module - Verhandlung und Peer Connection
//!
//! Dieses Modul verwaltet:
//! - Die Verhandlungs-Zustandsmaschine einer Session
//! - Das Puffern von Remote-Candidates
//! - WebRTC Peer Connections (webrtc-rs)

mod candidates;
mod connection;
mod rtc;
mod session;

pub use candidates::{CandidateBuffer, FlushReport, PushOutcome};
pub use connection::{
    ConnectionError, ConnectionEvent, ConnectionEvents, ConnectionFactory, ConnectionId,
    PeerConnection, SdpKind, SessionDescription, TransportState,
};
pub use rtc::{RtcConnection, RtcConnectionFactory};
pub use session::{CallEngineError, CallPhase, NegotiationRole, PeerSessionController, Role};
