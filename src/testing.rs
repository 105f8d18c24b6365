//! In-Memory Backends für Tests
//!
//! - `FakeDevices`: Gerätestream ohne Hardware
//! - `LoopbackFactory`: Connections mit JSON-Descriptions statt SDP
//! - `MemoryRelay`: Relay mit Raum-Paarung (höchstens zwei Teilnehmer)

use crate::call_engine::{
    ConnectionError, ConnectionEvent, ConnectionEvents, ConnectionFactory, PeerConnection,
    SdpKind, SessionDescription, TransportState,
};
use crate::config::MediaConstraints;
use crate::media::{LocalStream, LocalTrack, MediaDevices, MediaError, RemoteTrack, TrackKind};
use crate::signaling::{
    CloseCause, NetworkCandidate, RelayConnector, RelayFrame, RelayLink, SignalingError,
    SignalingMessage,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;

pub const RELAY_URL: &str = "ws://relay.test";

/// Anzahl lokaler Candidates pro Description
const CANDIDATES_PER_DESCRIPTION: usize = 2;

// ============================================================================
// FAKE DEVICES
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct FakeDevices {
    failure: Option<MediaError>,
    opened: Arc<AtomicUsize>,
}

impl FakeDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(error: MediaError) -> Self {
        Self {
            failure: Some(error),
            ..Self::default()
        }
    }

    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn open(&self, constraints: MediaConstraints) -> Result<LocalStream, MediaError> {
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        self.opened.fetch_add(1, Ordering::SeqCst);

        let mut kinds = Vec::new();
        if constraints.audio {
            kinds.push(TrackKind::Audio);
        }
        if constraints.video {
            kinds.push(TrackKind::Video);
        }
        Ok(LocalStream::new(&kinds))
    }
}

// ============================================================================
// LOOPBACK CONNECTIONS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LoopbackTrack {
    id: String,
    stream_id: String,
    kind: TrackKind,
}

/// Description-Body der Loopback-Connections
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LoopbackDescription {
    kind: String,
    origin: String,
    tracks: Vec<LoopbackTrack>,
}

/// Offer-Body, wie ihn eine Loopback-Connection von `origin` erzeugen würde
pub fn loopback_offer(origin: &str, tracks: &[Arc<LocalTrack>]) -> String {
    describe("offer", origin, tracks)
}

/// Answer-Body, wie ihn eine Loopback-Connection von `origin` erzeugen würde
pub fn loopback_answer(origin: &str, tracks: &[Arc<LocalTrack>]) -> String {
    describe("answer", origin, tracks)
}

fn describe(kind: &str, origin: &str, tracks: &[Arc<LocalTrack>]) -> String {
    let description = LoopbackDescription {
        kind: kind.to_string(),
        origin: origin.to_string(),
        tracks: tracks
            .iter()
            .map(|t| LoopbackTrack {
                id: t.id().to_string(),
                stream_id: t.stream_id().to_string(),
                kind: t.kind(),
            })
            .collect(),
    };
    serde_json::to_string(&description).unwrap_or_default()
}

#[derive(Clone)]
pub struct LoopbackFactory {
    origin: String,
    connections: Arc<Mutex<Vec<Arc<LoopbackConnection>>>>,
    early_candidates: Arc<AtomicUsize>,
    fail_remote: Arc<AtomicBool>,
}

impl LoopbackFactory {
    pub fn new() -> Self {
        Self::named(&uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn named(origin: &str) -> Self {
        Self {
            origin: origin.to_string(),
            connections: Arc::new(Mutex::new(Vec::new())),
            early_candidates: Arc::new(AtomicUsize::new(0)),
            fail_remote: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn connections(&self) -> Vec<Arc<LoopbackConnection>> {
        self.connections.lock().clone()
    }

    pub fn latest(&self) -> Option<Arc<LoopbackConnection>> {
        self.connections.lock().last().cloned()
    }

    /// Offene Connections mit lokaler und Remote Description
    pub fn established(&self) -> Vec<Arc<LoopbackConnection>> {
        self.connections
            .lock()
            .iter()
            .filter(|c| c.is_established() && !c.is_closed())
            .cloned()
            .collect()
    }

    /// Candidates, die vor der Remote Description angewendet werden sollten
    pub fn early_candidate_count(&self) -> usize {
        self.early_candidates.load(Ordering::SeqCst)
    }

    /// Jede folgende Remote Description schlägt fehl
    pub fn fail_remote_descriptions(&self, fail: bool) {
        self.fail_remote.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectionFactory for LoopbackFactory {
    async fn create(
        &self,
        events: ConnectionEvents,
    ) -> Result<Arc<dyn PeerConnection>, ConnectionError> {
        let conn = Arc::new(LoopbackConnection {
            origin: self.origin.clone(),
            events,
            state: Mutex::new(LoopbackState::default()),
            early_candidates: Arc::clone(&self.early_candidates),
            fail_remote: Arc::clone(&self.fail_remote),
        });
        self.connections.lock().push(Arc::clone(&conn));
        Ok(conn)
    }
}

#[derive(Debug, Default)]
struct LoopbackState {
    tracks: Vec<Arc<LocalTrack>>,
    local: Option<SdpKind>,
    remote: Option<LoopbackDescription>,
    applied: Vec<String>,
    emitted_candidates: usize,
    established: bool,
    closed: bool,
}

pub struct LoopbackConnection {
    origin: String,
    events: ConnectionEvents,
    state: Mutex<LoopbackState>,
    early_candidates: Arc<AtomicUsize>,
    fail_remote: Arc<AtomicBool>,
}

impl LoopbackConnection {
    pub fn applied_candidates(&self) -> Vec<String> {
        self.state.lock().applied.clone()
    }

    pub fn local_track_ids(&self) -> Vec<String> {
        self.state.lock().tracks.iter().map(|t| t.id().to_string()).collect()
    }

    pub fn remote_origin(&self) -> Option<String> {
        self.state.lock().remote.as_ref().map(|d| d.origin.clone())
    }

    pub fn is_established(&self) -> bool {
        self.state.lock().established
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn set_local(&self, kind: SdpKind) -> Result<String, ConnectionError> {
        let (body, candidates) = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(ConnectionError::Closed);
            }
            state.local = Some(kind);
            let label = match kind {
                SdpKind::Offer => "offer",
                SdpKind::Answer => "answer",
            };
            let body = describe(label, &self.origin, &state.tracks);

            let first = state.emitted_candidates;
            state.emitted_candidates += CANDIDATES_PER_DESCRIPTION;
            let candidates: Vec<String> = (first..state.emitted_candidates)
                .map(|n| format!("candidate:{}:{}", self.origin, n))
                .collect();
            (body, candidates)
        };

        for candidate in candidates {
            self.events
                .emit(ConnectionEvent::LocalCandidate(NetworkCandidate::new(candidate)));
        }
        self.establish_if_ready();
        Ok(body)
    }

    /// Lokale und Remote Description gesetzt: Tracks und `Connected` melden
    fn establish_if_ready(&self) {
        let remote_tracks = {
            let mut state = self.state.lock();
            if state.established || state.local.is_none() {
                return;
            }
            let Some(remote) = &state.remote else {
                return;
            };
            let tracks = remote.tracks.clone();
            state.established = true;
            tracks
        };

        for track in remote_tracks {
            self.events.emit(ConnectionEvent::RemoteTrack(RemoteTrack {
                id: track.id,
                stream_id: track.stream_id,
                kind: track.kind,
            }));
        }
        self.events
            .emit(ConnectionEvent::StateChanged(TransportState::Connected));
    }
}

#[async_trait]
impl PeerConnection for LoopbackConnection {
    async fn add_track(
        &self,
        track: Arc<LocalTrack>,
        _stream: &LocalStream,
    ) -> Result<(), ConnectionError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ConnectionError::Closed);
        }
        state.tracks.push(track);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError> {
        self.set_local(SdpKind::Offer).map(SessionDescription::offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError> {
        if self.state.lock().remote.is_none() {
            return Err(ConnectionError::WebRTC("no remote offer".to_string()));
        }
        self.set_local(SdpKind::Answer).map(SessionDescription::answer)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError> {
        if self.fail_remote.load(Ordering::SeqCst) {
            return Err(ConnectionError::InvalidSdp("rejected by test".to_string()));
        }

        let parsed: LoopbackDescription = serde_json::from_str(&description.body)
            .map_err(|e| ConnectionError::InvalidSdp(e.to_string()))?;
        let expected = match description.kind {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        };
        if parsed.kind != expected {
            return Err(ConnectionError::InvalidSdp(format!(
                "expected {}, got {}",
                expected, parsed.kind
            )));
        }

        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(ConnectionError::Closed);
            }
            state.remote = Some(parsed);
        }
        self.establish_if_ready();
        Ok(())
    }

    async fn add_candidate(&self, candidate: NetworkCandidate) -> Result<(), ConnectionError> {
        let mut state = self.state.lock();
        let Some(remote) = &state.remote else {
            self.early_candidates.fetch_add(1, Ordering::SeqCst);
            return Err(ConnectionError::WebRTC(
                "candidate before remote description".to_string(),
            ));
        };

        let prefix = format!("candidate:{}:", remote.origin);
        if !candidate.candidate.starts_with(&prefix) {
            return Err(ConnectionError::WebRTC(format!(
                "unknown candidate {}",
                candidate.candidate
            )));
        }
        state.applied.push(candidate.candidate);
        Ok(())
    }

    async fn track_count(&self) -> usize {
        self.state.lock().tracks.len()
    }

    async fn close(&self) {
        self.state.lock().closed = true;
    }
}

// ============================================================================
// MEMORY RELAY
// ============================================================================

/// Maximale Teilnehmer pro Raum
const ROOM_CAPACITY: usize = 2;

struct Member {
    inbound: mpsc::Sender<RelayFrame>,
    room: Option<String>,
}

#[derive(Default)]
struct RelayState {
    members: HashMap<u64, Member>,
    next_id: u64,
    refuse: bool,
    stall: bool,
}

/// Relay im Speicher: leitet Nachrichten an die anderen Teilnehmer des Raums weiter
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse = refuse;
    }

    /// Verbindungsaufbau hängt, bis der Timeout greift
    pub fn stall_connections(&self, stall: bool) {
        self.state.lock().stall = stall;
    }

    /// Schließt alle Verbindungen von Relay-Seite
    pub fn disconnect_all(&self) {
        let members: Vec<Member> = self.state.lock().members.drain().map(|(_, m)| m).collect();
        for member in members {
            let _ = member
                .inbound
                .try_send(RelayFrame::Closed(CloseCause::Remote));
        }
    }

    /// Schickt einen rohen Frame an alle Teilnehmer des Raums
    pub fn inject_raw(&self, room_id: &str, text: &str) {
        for inbound in self.room_members(room_id, None) {
            let _ = inbound.try_send(RelayFrame::Text(text.to_string()));
        }
    }

    pub fn member_count(&self, room_id: &str) -> usize {
        self.room_members(room_id, None).len()
    }

    /// Wartet, bis `count` Teilnehmer im Raum angekündigt sind
    pub async fn wait_for_members(&self, room_id: &str, count: usize) {
        while self.member_count(room_id) < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn room_members(&self, room_id: &str, except: Option<u64>) -> Vec<mpsc::Sender<RelayFrame>> {
        self.state
            .lock()
            .members
            .iter()
            .filter(|(id, m)| Some(**id) != except && m.room.as_deref() == Some(room_id))
            .map(|(_, m)| m.inbound.clone())
            .collect()
    }

    async fn route(&self, from: u64, text: String) {
        let message = match SignalingMessage::decode(&text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Relay dropping malformed frame: {}", e);
                return;
            }
        };

        if let SignalingMessage::JoinRoom { room_id } = message {
            let reply = {
                let mut state = self.state.lock();
                let occupied = state
                    .members
                    .iter()
                    .filter(|(id, m)| **id != from && m.room.as_deref() == Some(room_id.as_str()))
                    .count();
                match state.members.get_mut(&from) {
                    Some(member) if occupied < ROOM_CAPACITY => {
                        member.room = Some(room_id);
                        None
                    }
                    Some(member) => Some(member.inbound.clone()),
                    None => None,
                }
            };
            if let Some(inbound) = reply {
                let full = SignalingMessage::Error {
                    message: "Room is full".to_string(),
                };
                if let Ok(text) = full.encode() {
                    let _ = inbound.send(RelayFrame::Text(text)).await;
                }
            }
            return;
        }

        let room = self
            .state
            .lock()
            .members
            .get(&from)
            .and_then(|m| m.room.clone());
        let Some(room) = room else {
            return;
        };
        for inbound in self.room_members(&room, Some(from)) {
            let _ = inbound.send(RelayFrame::Text(text.clone())).await;
        }
    }
}

#[async_trait]
impl RelayConnector for MemoryRelay {
    async fn connect(&self, _address: &Url) -> Result<RelayLink, SignalingError> {
        let (refuse, stall) = {
            let state = self.state.lock();
            (state.refuse, state.stall)
        };
        if refuse {
            return Err(SignalingError::ConnectionRefused("refused by test".to_string()));
        }
        if stall {
            futures::future::pending::<()>().await;
        }

        let (link, mut outbound, inbound) = RelayLink::channel();
        let id = {
            let mut state = self.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.members.insert(id, Member { inbound, room: None });
            id
        };

        let relay = self.clone();
        tokio::spawn(async move {
            while let Some(text) = outbound.recv().await {
                relay.route(id, text).await;
            }
            // Client hat die Verbindung geschlossen
            relay.state.lock().members.remove(&id);
        });

        Ok(link)
    }
}
