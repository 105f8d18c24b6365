//! PeerSessionController - Verhandlungs-Zustandsmaschine
//!
//! Besitzt alle langlebigen Handles einer Session (Gerätestream,
//! Relay-Verbindung, Connection) und ist ihr einziger Eigentümer.
//! `close()` ist die einzige Teardown-Methode.
//!
//! ```text
//! Idle -> Joined -> Negotiating(Offering | Answering) -> Connected -> Closed
//!                          \                                  /
//!                           +------------> Failed <----------+
//! ```

use super::candidates::{CandidateBuffer, PushOutcome};
use super::connection::*;
use crate::events::EventHub;
use crate::media::{MediaController, MediaError};
use crate::signaling::{CloseCause, NetworkCandidate, SignalingClient, SignalingError, SignalingMessage};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallEngineError {
    #[error("Failed to apply session description: {0}")]
    DescriptionApplyFailure(String),

    #[error("Failed to apply network candidate: {0}")]
    CandidateApplyFailure(String),

    #[error("Negotiation failed: {0}")]
    NegotiationFailure(String),

    #[error("Rejected out-of-order '{message}' message in phase {phase}")]
    OutOfOrder {
        message: &'static str,
        phase: CallPhase,
    },

    #[error("'{operation}' is not permitted in phase {phase}")]
    InvalidState {
        operation: &'static str,
        phase: CallPhase,
    },

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Media(#[from] MediaError),
}

impl CallEngineError {
    /// Fatale Fehler beenden die Session
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::DescriptionApplyFailure(_)
                | Self::NegotiationFailure(_)
                | Self::Signaling(SignalingError::UnexpectedClose)
        )
    }
}

// ============================================================================
// CALL STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    Offering,
    Answering,
}

/// Aktuelle Phase einer Session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CallPhase {
    #[default]
    Idle,
    /// Im Raum, noch kein Peer gesehen
    Joined,
    Negotiating(NegotiationRole),
    Connected,
    Failed,
    Closed,
}

impl fmt::Display for CallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Joined => write!(f, "joined"),
            Self::Negotiating(NegotiationRole::Offering) => write!(f, "negotiating(offering)"),
            Self::Negotiating(NegotiationRole::Answering) => write!(f, "negotiating(answering)"),
            Self::Connected => write!(f, "connected"),
            Self::Failed => write!(f, "failed"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Role {
    #[default]
    Unresolved,
    Caller,
    Callee,
}

// ============================================================================
// PEER SESSION CONTROLLER
// ============================================================================

struct ActiveConnection {
    id: ConnectionId,
    peer: Arc<dyn PeerConnection>,
    remote_description_set: bool,
}

pub struct PeerSessionController {
    role: Role,
    phase: CallPhase,
    media: MediaController,
    signaling: SignalingClient,
    factory: Arc<dyn ConnectionFactory>,
    connection: Option<ActiveConnection>,
    candidates: CandidateBuffer,
    /// Body des eigenen, noch unbeantworteten Offers (für Glare)
    local_offer: Option<String>,
    next_connection_id: ConnectionId,
    event_tx: mpsc::UnboundedSender<(ConnectionId, ConnectionEvent)>,
    hub: EventHub,
}

impl PeerSessionController {
    /// Erstellt den Controller
    ///
    /// Der zurückgegebene Receiver liefert die Events aller Connections
    /// dieser Session.
    pub fn new(
        media: MediaController,
        signaling: SignalingClient,
        factory: Arc<dyn ConnectionFactory>,
        hub: EventHub,
    ) -> (Self, mpsc::UnboundedReceiver<(ConnectionId, ConnectionEvent)>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let controller = Self {
            role: Role::Unresolved,
            phase: CallPhase::Idle,
            media,
            signaling,
            factory,
            connection: None,
            candidates: CandidateBuffer::new(),
            local_offer: None,
            next_connection_id: 1,
            event_tx,
            hub,
        };
        (controller, event_rx)
    }

    pub fn phase(&self) -> CallPhase {
        self.phase
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Anzahl lokaler Tracks auf der aktiven Connection
    pub async fn connection_track_count(&self) -> Option<usize> {
        match &self.connection {
            Some(conn) => Some(conn.peer.track_count().await),
            None => None,
        }
    }

    // ========================================================================
    // CALLER ACTIONS
    // ========================================================================

    /// Kündigt den Raum an: `Idle -> Joined`
    pub async fn announce(&mut self, room_id: &str) -> Result<(), CallEngineError> {
        if self.phase != CallPhase::Idle {
            return Err(CallEngineError::InvalidState {
                operation: "join",
                phase: self.phase,
            });
        }

        self.signaling.announce(room_id).await?;
        self.hub.set_room(Some(room_id.to_string()));
        self.set_phase(CallPhase::Joined);
        Ok(())
    }

    /// Startet den Anruf: `Joined -> Negotiating(Offering)`
    pub async fn start_call(&mut self) -> Result<(), CallEngineError> {
        if self.phase != CallPhase::Joined {
            return Err(CallEngineError::InvalidState {
                operation: "startCall",
                phase: self.phase,
            });
        }

        self.set_role(Role::Caller);
        self.set_phase(CallPhase::Negotiating(NegotiationRole::Offering));

        let peer = self.create_connection().await?;
        let offer = peer
            .create_offer()
            .await
            .map_err(|e| CallEngineError::NegotiationFailure(e.to_string()))?;

        self.local_offer = Some(offer.body.clone());
        self.signaling
            .send(SignalingMessage::CreateOffer { sdp: offer.body })
            .await
            .map_err(|e| CallEngineError::NegotiationFailure(e.to_string()))?;

        tracing::info!("Offer sent");
        Ok(())
    }

    pub fn set_audio_enabled(&mut self, enabled: bool) {
        self.media.set_audio_enabled(enabled);
        self.hub.set_media_state(self.media.state());
    }

    pub fn set_video_enabled(&mut self, enabled: bool) {
        self.media.set_video_enabled(enabled);
        self.hub.set_media_state(self.media.state());
    }

    // ========================================================================
    // INBOUND
    // ========================================================================

    /// Verarbeitet eine Nachricht vom Relay
    pub async fn handle_signaling(&mut self, msg: SignalingMessage) -> Result<(), CallEngineError> {
        match msg {
            SignalingMessage::CreateOffer { sdp } => self.on_offer(sdp).await,
            SignalingMessage::CreateAnswer { sdp } => self.on_answer(sdp).await,
            SignalingMessage::IceCandidate { candidate } => self.on_remote_candidate(candidate).await,
            SignalingMessage::Error { message } => {
                tracing::error!("Relay error: {}", message);
                self.hub.notify(format!("Relay error: {}", message), false);
                Ok(())
            }
            SignalingMessage::JoinRoom { .. } => Err(CallEngineError::OutOfOrder {
                message: "joinRoom",
                phase: self.phase,
            }),
        }
    }

    /// Die Relay-Verbindung wurde beendet
    pub fn handle_relay_closed(&mut self, cause: CloseCause) -> Result<(), CallEngineError> {
        match cause {
            CloseCause::Local => Ok(()),
            CloseCause::Remote | CloseCause::Network(_) => {
                Err(SignalingError::UnexpectedClose.into())
            }
        }
    }

    /// Verarbeitet ein Event der Connection
    pub async fn handle_connection_event(
        &mut self,
        id: ConnectionId,
        event: ConnectionEvent,
    ) -> Result<(), CallEngineError> {
        if self.connection.as_ref().map(|c| c.id) != Some(id) {
            tracing::debug!("Ignoring event of discarded connection {}: {:?}", id, event);
            return Ok(());
        }

        match event {
            ConnectionEvent::LocalCandidate(candidate) => {
                // Sofort und einzeln weiterleiten
                if let Err(e) = self
                    .signaling
                    .send(SignalingMessage::IceCandidate { candidate })
                    .await
                {
                    tracing::warn!("Failed to forward local candidate: {}", e);
                }
            }
            ConnectionEvent::RemoteTrack(track) => {
                tracing::info!("Remote {:?} track {} attached", track.kind, track.id);
                self.hub.add_remote_track(track);
                if self.phase == CallPhase::Negotiating(NegotiationRole::Answering) {
                    self.set_phase(CallPhase::Connected);
                }
            }
            ConnectionEvent::StateChanged(state) => match state {
                TransportState::Connected => {
                    if self.phase == CallPhase::Negotiating(NegotiationRole::Answering) {
                        self.set_phase(CallPhase::Connected);
                    }
                }
                TransportState::Failed => {
                    if matches!(self.phase, CallPhase::Negotiating(_) | CallPhase::Connected) {
                        return Err(CallEngineError::NegotiationFailure(
                            "transport failed".to_string(),
                        ));
                    }
                }
                TransportState::Disconnected => {
                    tracing::warn!("Transport disconnected, waiting for recovery");
                }
                other => tracing::debug!("Transport state: {:?}", other),
            },
        }
        Ok(())
    }

    async fn on_offer(&mut self, sdp: String) -> Result<(), CallEngineError> {
        match self.phase {
            CallPhase::Joined => self.answer_offer(sdp, false).await,
            CallPhase::Negotiating(NegotiationRole::Offering) => {
                // Glare: beide Seiten kennen beide Offers, die kleinere demotet
                let local = self.local_offer.as_deref().unwrap_or_default();
                if local.as_bytes() > sdp.as_bytes() {
                    tracing::info!("Glare: keeping local offer, peer will answer");
                    Ok(())
                } else {
                    tracing::info!("Glare: discarding local offer, answering peer");
                    self.answer_offer(sdp, true).await
                }
            }
            CallPhase::Connected => {
                tracing::info!("Peer restarted negotiation");
                self.answer_offer(sdp, true).await
            }
            phase => Err(CallEngineError::OutOfOrder {
                message: "createOffer",
                phase,
            }),
        }
    }

    /// `* -> Negotiating(Answering)`: Offer anwenden, Answer senden
    async fn answer_offer(&mut self, sdp: String, fresh: bool) -> Result<(), CallEngineError> {
        self.local_offer = None;
        self.set_role(Role::Callee);
        self.set_phase(CallPhase::Negotiating(NegotiationRole::Answering));

        let existing = if fresh {
            None
        } else {
            self.connection.as_ref().map(|c| Arc::clone(&c.peer))
        };
        let peer = match existing {
            Some(peer) => peer,
            None => self.create_connection().await?,
        };

        self.apply_remote_description(&peer, SessionDescription::offer(sdp))
            .await?;

        let answer = peer
            .create_answer()
            .await
            .map_err(|e| CallEngineError::NegotiationFailure(e.to_string()))?;

        self.signaling
            .send(SignalingMessage::CreateAnswer { sdp: answer.body })
            .await
            .map_err(|e| CallEngineError::NegotiationFailure(e.to_string()))?;

        tracing::info!("Answer sent");
        Ok(())
    }

    /// `Negotiating(Offering) -> Connected`
    async fn on_answer(&mut self, sdp: String) -> Result<(), CallEngineError> {
        let peer = match (&self.phase, &self.connection) {
            (CallPhase::Negotiating(NegotiationRole::Offering), Some(conn))
                if !conn.remote_description_set =>
            {
                Arc::clone(&conn.peer)
            }
            _ => {
                return Err(CallEngineError::OutOfOrder {
                    message: "createAnswer",
                    phase: self.phase,
                })
            }
        };

        self.apply_remote_description(&peer, SessionDescription::answer(sdp))
            .await?;
        self.local_offer = None;
        self.set_phase(CallPhase::Connected);
        Ok(())
    }

    async fn on_remote_candidate(
        &mut self,
        candidate: NetworkCandidate,
    ) -> Result<(), CallEngineError> {
        match self.phase {
            CallPhase::Joined | CallPhase::Negotiating(_) | CallPhase::Connected => {
                let peer = self.connection.as_ref().map(|c| c.peer.as_ref());
                if self.candidates.push(candidate, peer).await == PushOutcome::Rejected {
                    self.report_rejected_candidates(1);
                }
                Ok(())
            }
            phase => Err(CallEngineError::OutOfOrder {
                message: "iceCandidate",
                phase,
            }),
        }
    }

    // ========================================================================
    // CONNECTION
    // ========================================================================

    /// Erstellt eine neue Connection und hängt die lokalen Tracks an
    ///
    /// Eine bestehende Connection wird vorher geschlossen.
    async fn create_connection(&mut self) -> Result<Arc<dyn PeerConnection>, CallEngineError> {
        if let Some(old) = self.connection.take() {
            tracing::info!("Discarding connection {}", old.id);
            old.peer.close().await;
            // Tracks der alten Connection gehören nicht zum neuen Peer
            self.hub.clear_remote_stream();
        }
        self.candidates.reset();

        let id = self.next_connection_id;
        self.next_connection_id += 1;

        let peer = self
            .factory
            .create(ConnectionEvents::new(id, self.event_tx.clone()))
            .await
            .map_err(|e| CallEngineError::NegotiationFailure(e.to_string()))?;

        if let Some(stream) = self.media.stream() {
            for track in stream.tracks() {
                peer.add_track(Arc::clone(track), &stream)
                    .await
                    .map_err(|e| CallEngineError::NegotiationFailure(e.to_string()))?;
            }
        }

        tracing::info!("Created connection {}", id);
        self.connection = Some(ActiveConnection {
            id,
            peer: Arc::clone(&peer),
            remote_description_set: false,
        });
        Ok(peer)
    }

    /// Setzt die Remote Description und leert danach den CandidateBuffer
    async fn apply_remote_description(
        &mut self,
        peer: &Arc<dyn PeerConnection>,
        description: SessionDescription,
    ) -> Result<(), CallEngineError> {
        peer.set_remote_description(description)
            .await
            .map_err(|e| CallEngineError::DescriptionApplyFailure(e.to_string()))?;

        if let Some(conn) = self.connection.as_mut() {
            conn.remote_description_set = true;
        }

        let report = self.candidates.flush(peer.as_ref()).await;
        if report.rejected > 0 {
            self.report_rejected_candidates(report.rejected);
        }
        Ok(())
    }

    /// Abgelehnte Candidates: eine Warnung, eine nicht-fatale Meldung
    fn report_rejected_candidates(&self, count: usize) {
        let err = CallEngineError::CandidateApplyFailure(format!(
            "{} remote candidate(s) rejected",
            count
        ));
        tracing::warn!("{}", err);
        self.hub.notify(err.to_string(), false);
    }

    // ========================================================================
    // TEARDOWN
    // ========================================================================

    /// Fataler Fehler: `Failed`, eine Meldung, dann Teardown
    pub async fn fail(&mut self, error: CallEngineError) {
        tracing::error!("Session failed: {}", error);
        if matches!(self.phase, CallPhase::Negotiating(_) | CallPhase::Connected) {
            self.set_phase(CallPhase::Failed);
        }
        self.hub.notify(error.to_string(), true);
        self.close().await;
    }

    /// Gibt Connection, Gerätestream und Relay-Verbindung frei
    ///
    /// Mehrfache Aufrufe sind wirkungslos.
    pub async fn close(&mut self) {
        if self.phase == CallPhase::Closed {
            return;
        }

        if let Some(conn) = self.connection.take() {
            conn.peer.close().await;
        }
        self.candidates.clear();
        self.local_offer = None;
        self.media.release();
        self.signaling.close();

        self.hub.set_local_stream(None);
        self.hub.clear_remote_stream();
        self.set_role(Role::Unresolved);
        self.set_phase(CallPhase::Closed);
    }

    fn set_phase(&mut self, phase: CallPhase) {
        if self.phase != phase {
            tracing::info!("Session phase: {} -> {}", self.phase, phase);
        }
        self.phase = phase;
        self.hub.set_phase(phase);
    }

    fn set_role(&mut self, role: Role) {
        self.role = role;
        self.hub.set_role(role);
    }
}

impl fmt::Debug for PeerSessionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSessionController")
            .field("role", &self.role)
            .field("phase", &self.phase)
            .field("connection", &self.connection.as_ref().map(|c| c.id))
            .field("buffered_candidates", &self.candidates.len())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MediaConstraints;
    use crate::events::RoomEvent;
    use crate::media::{LocalStream, TrackKind};
    use crate::signaling::SignalingEvent;
    use crate::testing::{
        loopback_answer, loopback_offer, FakeDevices, LoopbackFactory, MemoryRelay, RELAY_URL,
    };
    use std::time::Duration;
    use tokio::sync::broadcast;

    struct Harness {
        controller: PeerSessionController,
        events: mpsc::UnboundedReceiver<(ConnectionId, ConnectionEvent)>,
        hub: EventHub,
        factory: LoopbackFactory,
        peer: SignalingClient,
        peer_rx: mpsc::UnboundedReceiver<SignalingEvent>,
        _own_rx: mpsc::UnboundedReceiver<SignalingEvent>,
    }

    impl Harness {
        /// Liefert alle anstehenden Connection-Events an den Controller
        async fn pump(&mut self) {
            while let Ok((id, event)) = self.events.try_recv() {
                self.controller.handle_connection_event(id, event).await.unwrap();
            }
        }

        fn remote_ids(&self) -> Vec<String> {
            let mut ids = self
                .hub
                .snapshot()
                .remote_stream
                .map(|s| s.track_ids())
                .unwrap_or_default();
            ids.sort();
            ids
        }

        /// Nächste Nachricht der Gegenseite, Candidates werden übersprungen
        async fn next_peer_message(&mut self) -> SignalingMessage {
            loop {
                let event = tokio::time::timeout(Duration::from_secs(1), self.peer_rx.recv())
                    .await
                    .expect("timed out waiting for peer message");
                match event {
                    Some(SignalingEvent::Message(SignalingMessage::IceCandidate { .. })) => {}
                    Some(SignalingEvent::Message(msg)) => return msg,
                    other => panic!("expected message, got {:?}", other),
                }
            }
        }
    }

    fn track_ids(stream: &LocalStream) -> Vec<String> {
        let mut ids: Vec<String> = stream.tracks().iter().map(|t| t.id().to_string()).collect();
        ids.sort();
        ids
    }

    fn drain(rx: &mut broadcast::Receiver<RoomEvent>) -> Vec<RoomEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Controller im Raum "R1" plus roher Signaling-Client als Gegenseite
    async fn harness() -> Harness {
        let relay = MemoryRelay::new();
        let factory = LoopbackFactory::named("alice");

        let mut media = MediaController::new(Arc::new(FakeDevices::new()), MediaConstraints::default());
        media.acquire().await.unwrap();

        let mut signaling = SignalingClient::new(Arc::new(relay.clone()), Duration::from_secs(1));
        let own_rx = signaling.connect(RELAY_URL).await.unwrap();

        let hub = EventHub::new();
        let (mut controller, events) = PeerSessionController::new(
            media,
            signaling,
            Arc::new(factory.clone()),
            hub.clone(),
        );
        controller.announce("R1").await.unwrap();

        let mut peer = SignalingClient::new(Arc::new(relay.clone()), Duration::from_secs(1));
        let peer_rx = peer.connect(RELAY_URL).await.unwrap();
        peer.announce("R1").await.unwrap();
        relay.wait_for_members("R1", 2).await;

        Harness {
            controller,
            events,
            hub,
            factory,
            peer,
            peer_rx,
            _own_rx: own_rx,
        }
    }

    #[tokio::test]
    async fn test_start_call_only_from_joined() {
        let mut h = harness().await;
        h.controller.start_call().await.unwrap();
        assert_eq!(
            h.controller.phase(),
            CallPhase::Negotiating(NegotiationRole::Offering)
        );
        assert_eq!(h.controller.role(), Role::Caller);

        let again = h.controller.start_call().await;
        assert!(matches!(again, Err(CallEngineError::InvalidState { .. })));

        match h.peer_rx.recv().await {
            Some(SignalingEvent::Message(SignalingMessage::CreateOffer { .. })) => {}
            other => panic!("expected offer, got {:?}", other),
        }
        drop(h.peer);
    }

    #[tokio::test]
    async fn test_answer_without_offer_is_rejected() {
        let mut h = harness().await;
        let result = h
            .controller
            .handle_signaling(SignalingMessage::CreateAnswer { sdp: "x".into() })
            .await;

        assert!(matches!(
            result,
            Err(CallEngineError::OutOfOrder {
                message: "createAnswer",
                phase: CallPhase::Joined
            })
        ));
        assert!(!result.unwrap_err().is_fatal());
        assert_eq!(h.controller.phase(), CallPhase::Joined);
    }

    #[tokio::test]
    async fn test_early_candidate_is_applied_after_offer() {
        let mut h = harness().await;

        h.controller
            .handle_signaling(SignalingMessage::IceCandidate {
                candidate: NetworkCandidate::new("candidate:remote:0"),
            })
            .await
            .unwrap();
        assert!(h.factory.latest().is_none());

        h.controller
            .handle_signaling(SignalingMessage::CreateOffer {
                sdp: loopback_offer("remote", &[]),
            })
            .await
            .unwrap();

        assert_eq!(
            h.controller.phase(),
            CallPhase::Negotiating(NegotiationRole::Answering)
        );
        let conn = h.factory.latest().unwrap();
        assert_eq!(conn.applied_candidates(), vec!["candidate:remote:0".to_string()]);
        assert_eq!(h.factory.early_candidate_count(), 0);
    }

    #[tokio::test]
    async fn test_bad_offer_is_fatal() {
        let mut h = harness().await;
        let result = h
            .controller
            .handle_signaling(SignalingMessage::CreateOffer {
                sdp: "garbage".into(),
            })
            .await;

        let err = result.unwrap_err();
        assert!(matches!(err, CallEngineError::DescriptionApplyFailure(_)));
        assert!(err.is_fatal());

        h.controller.fail(err).await;
        assert_eq!(h.controller.phase(), CallPhase::Closed);
        assert!(h.factory.latest().unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_events_of_discarded_connection_are_ignored() {
        let mut h = harness().await;
        h.controller.start_call().await.unwrap();

        // Glare: das Offer von "zed" ist größer, Connection 1 wird verworfen
        h.controller
            .handle_signaling(SignalingMessage::CreateOffer {
                sdp: loopback_offer("zed", &[]),
            })
            .await
            .unwrap();
        assert_eq!(h.controller.role(), Role::Callee);
        assert_eq!(
            h.controller.phase(),
            CallPhase::Negotiating(NegotiationRole::Answering)
        );
        assert_eq!(h.factory.connections().len(), 2);
        assert!(h.factory.connections()[0].is_closed());

        let result = h
            .controller
            .handle_connection_event(1, ConnectionEvent::StateChanged(TransportState::Failed))
            .await;
        assert!(result.is_ok());
        assert_eq!(
            h.controller.phase(),
            CallPhase::Negotiating(NegotiationRole::Answering)
        );
    }

    #[tokio::test]
    async fn test_glare_winner_keeps_offer() {
        let mut h = harness().await;
        h.controller.start_call().await.unwrap();

        h.controller
            .handle_signaling(SignalingMessage::CreateOffer {
                sdp: loopback_offer("aaron", &[]),
            })
            .await
            .unwrap();

        assert_eq!(h.controller.role(), Role::Caller);
        assert_eq!(
            h.controller.phase(),
            CallPhase::Negotiating(NegotiationRole::Offering)
        );
        assert_eq!(h.factory.connections().len(), 1);
    }

    #[tokio::test]
    async fn test_glare_loser_answers_peer() {
        let mut h = harness().await;
        h.controller.start_call().await.unwrap();
        assert!(matches!(
            h.next_peer_message().await,
            SignalingMessage::CreateOffer { .. }
        ));

        h.controller
            .handle_signaling(SignalingMessage::CreateOffer {
                sdp: loopback_offer("zed", &[]),
            })
            .await
            .unwrap();

        assert_eq!(h.controller.role(), Role::Callee);
        assert!(h.factory.connections()[0].is_closed());
        assert_eq!(h.factory.latest().unwrap().remote_origin().as_deref(), Some("zed"));
        match h.next_peer_message().await {
            SignalingMessage::CreateAnswer { sdp } => assert!(sdp.contains("\"answer\"")),
            other => panic!("expected answer, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_offer_while_connected_replaces_remote_stream() {
        let mut h = harness().await;
        h.controller.start_call().await.unwrap();

        let first = LocalStream::new(&[TrackKind::Audio, TrackKind::Video]);
        h.controller
            .handle_signaling(SignalingMessage::CreateAnswer {
                sdp: loopback_answer("bob", first.tracks()),
            })
            .await
            .unwrap();
        h.pump().await;
        assert_eq!(h.controller.phase(), CallPhase::Connected);
        assert_eq!(h.remote_ids(), track_ids(&first));

        // Der Peer ist mit neuen Tracks zurück und verhandelt neu
        let second = LocalStream::new(&[TrackKind::Audio, TrackKind::Video]);
        h.controller
            .handle_signaling(SignalingMessage::CreateOffer {
                sdp: loopback_offer("bob", second.tracks()),
            })
            .await
            .unwrap();
        assert_eq!(
            h.controller.phase(),
            CallPhase::Negotiating(NegotiationRole::Answering)
        );
        assert!(h.factory.connections()[0].is_closed());
        assert!(h.hub.snapshot().remote_stream.is_none());

        h.pump().await;
        assert_eq!(h.controller.phase(), CallPhase::Connected);
        assert_eq!(h.remote_ids(), track_ids(&second));
    }

    #[tokio::test]
    async fn test_transport_failure_fails_then_closes() {
        let mut h = harness().await;
        h.controller.start_call().await.unwrap();
        let mut rx = h.hub.subscribe();

        let err = h
            .controller
            .handle_connection_event(1, ConnectionEvent::StateChanged(TransportState::Failed))
            .await
            .unwrap_err();
        assert!(matches!(err, CallEngineError::NegotiationFailure(_)));
        assert!(err.is_fatal());

        h.controller.fail(err).await;
        assert_eq!(h.controller.phase(), CallPhase::Closed);
        assert!(h.factory.latest().unwrap().is_closed());

        let events = drain(&mut rx);
        let failed = events
            .iter()
            .position(|e| matches!(e, RoomEvent::PhaseChanged(CallPhase::Failed)))
            .expect("no Failed phase");
        let notice = events
            .iter()
            .position(|e| matches!(e, RoomEvent::Notice(n) if n.fatal))
            .expect("no fatal notice");
        let closed = events
            .iter()
            .position(|e| matches!(e, RoomEvent::PhaseChanged(CallPhase::Closed)))
            .expect("no Closed phase");
        assert!(failed < notice && notice < closed);
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, RoomEvent::Notice(_)))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_rejected_candidates_raise_one_notice_each() {
        let mut h = harness().await;
        let mut rx = h.hub.subscribe();

        // Gepuffert, beim Flush abgelehnt
        h.controller
            .handle_signaling(SignalingMessage::IceCandidate {
                candidate: NetworkCandidate::new("candidate:stale:0"),
            })
            .await
            .unwrap();
        h.controller
            .handle_signaling(SignalingMessage::CreateOffer {
                sdp: loopback_offer("remote", &[]),
            })
            .await
            .unwrap();

        // Pass-Through, direkt abgelehnt
        h.controller
            .handle_signaling(SignalingMessage::IceCandidate {
                candidate: NetworkCandidate::new("candidate:stale:1"),
            })
            .await
            .unwrap();

        assert_eq!(
            h.controller.phase(),
            CallPhase::Negotiating(NegotiationRole::Answering)
        );
        let notices: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                RoomEvent::Notice(n) => Some(n),
                _ => None,
            })
            .collect();
        assert_eq!(notices.len(), 2);
        assert!(notices.iter().all(|n| !n.fatal));
        assert!(notices[0].message.contains("candidate"));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut h = harness().await;
        h.controller.close().await;
        h.controller.close().await;
        assert_eq!(h.controller.phase(), CallPhase::Closed);
        assert_eq!(h.controller.connection_track_count().await, None);
    }
}
