//! Connection-Abstraktion
//!
//! Die Session spricht nur mit `PeerConnection`; das WebRTC-Backend und die
//! In-Memory-Verbindungen der Tests implementieren dieselbe Schnittstelle.

use crate::media::{LocalStream, LocalTrack, RemoteTrack};
use crate::signaling::NetworkCandidate;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Generation einer Connection innerhalb einer Session
pub type ConnectionId = u64;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Connection is closed")]
    Closed,
}

// ============================================================================
// SESSION DESCRIPTION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub body: String,
}

impl SessionDescription {
    pub fn offer(body: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            body: body.into(),
        }
    }

    pub fn answer(body: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            body: body.into(),
        }
    }
}

// ============================================================================
// CONNECTION EVENTS
// ============================================================================

/// Transportzustand der Connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Lokal entdeckter Candidate, sofort an den Peer weiterzuleiten
    LocalCandidate(NetworkCandidate),
    /// Eingehender Remote-Track
    RemoteTrack(RemoteTrack),
    StateChanged(TransportState),
}

/// Sendet Events einer Connection an die Session
///
/// Jedes Event trägt die Generation seiner Connection, damit Events einer
/// verworfenen Connection erkannt werden.
#[derive(Debug, Clone)]
pub struct ConnectionEvents {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<(ConnectionId, ConnectionEvent)>,
}

impl ConnectionEvents {
    pub fn new(id: ConnectionId, tx: mpsc::UnboundedSender<(ConnectionId, ConnectionEvent)>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn emit(&self, event: ConnectionEvent) {
        if self.tx.send((self.id, event)).is_err() {
            tracing::debug!("Session gone, dropping event of connection {}", self.id);
        }
    }
}

// ============================================================================
// TRAITS
// ============================================================================

/// Die live Transport-/Media-Verbindung zum Peer
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Hängt einen lokalen Track an
    ///
    /// Audio-Tracks senden die aufgenommenen Samples aus `stream`.
    async fn add_track(
        &self,
        track: Arc<LocalTrack>,
        stream: &LocalStream,
    ) -> Result<(), ConnectionError>;

    /// Erstellt ein Offer und setzt es als Local Description
    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError>;

    /// Erstellt ein Answer und setzt es als Local Description
    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError>;

    async fn add_candidate(&self, candidate: NetworkCandidate) -> Result<(), ConnectionError>;

    /// Anzahl der angehängten lokalen Tracks
    async fn track_count(&self) -> usize;

    async fn close(&self);
}

#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create(
        &self,
        events: ConnectionEvents,
    ) -> Result<Arc<dyn PeerConnection>, ConnectionError>;
}
