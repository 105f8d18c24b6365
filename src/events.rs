//! Beobachtbarer Zustand eines Raums
//!
//! Die Session schreibt Zustandsänderungen in den `EventHub`; Aufrufer lesen
//! den aktuellen Snapshot oder abonnieren die Events.

use crate::call_engine::{CallPhase, Role};
use crate::media::{LocalMediaState, LocalStream, RemoteStream, RemoteTrack};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Kapazität des Event-Channels
const EVENT_CAPACITY: usize = 100;

/// Einmalige, menschenlesbare Meldung
#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    pub message: String,
    /// Die Session wurde deswegen beendet
    pub fatal: bool,
    pub at: DateTime<Utc>,
}

/// Events die vom RoomCoordinator ausgelöst werden
#[derive(Debug, Clone)]
pub enum RoomEvent {
    PhaseChanged(CallPhase),
    /// Lokaler Stream verfügbar (`None` nach Freigabe)
    LocalStream(Option<Arc<LocalStream>>),
    RemoteTrack(RemoteTrack),
    MediaStateChanged(LocalMediaState),
    Notice(Notice),
}

#[derive(Debug, Clone, Default)]
pub struct RoomSnapshot {
    pub room_id: Option<String>,
    pub phase: CallPhase,
    pub role: Role,
    pub local_stream: Option<Arc<LocalStream>>,
    /// Erst vorhanden, sobald der erste Remote-Track angekommen ist
    pub remote_stream: Option<RemoteStream>,
    pub media: LocalMediaState,
}

#[derive(Debug, Clone)]
pub struct EventHub {
    snapshot: Arc<RwLock<RoomSnapshot>>,
    event_tx: broadcast::Sender<RoomEvent>,
}

impl EventHub {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            snapshot: Arc::new(RwLock::new(RoomSnapshot::default())),
            event_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.event_tx.subscribe()
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        self.snapshot.read().clone()
    }

    pub fn phase(&self) -> CallPhase {
        self.snapshot.read().phase
    }

    pub fn set_phase(&self, phase: CallPhase) {
        self.snapshot.write().phase = phase;
        let _ = self.event_tx.send(RoomEvent::PhaseChanged(phase));
    }

    pub fn set_role(&self, role: Role) {
        self.snapshot.write().role = role;
    }

    pub fn set_room(&self, room_id: Option<String>) {
        self.snapshot.write().room_id = room_id;
    }

    pub fn set_local_stream(&self, stream: Option<Arc<LocalStream>>) {
        self.snapshot.write().local_stream = stream.clone();
        let _ = self.event_tx.send(RoomEvent::LocalStream(stream));
    }

    pub fn add_remote_track(&self, track: RemoteTrack) {
        let added = self
            .snapshot
            .write()
            .remote_stream
            .get_or_insert_with(RemoteStream::default)
            .add(track.clone());
        if added {
            let _ = self.event_tx.send(RoomEvent::RemoteTrack(track));
        }
    }

    pub fn clear_remote_stream(&self) {
        self.snapshot.write().remote_stream = None;
    }

    pub fn set_media_state(&self, media: LocalMediaState) {
        self.snapshot.write().media = media;
        let _ = self.event_tx.send(RoomEvent::MediaStateChanged(media));
    }

    pub fn notify(&self, message: impl Into<String>, fatal: bool) {
        let notice = Notice {
            message: message.into(),
            fatal,
            at: Utc::now(),
        };
        let _ = self.event_tx.send(RoomEvent::Notice(notice));
    }

    /// Zurück auf `Idle`; Mute-Einstellungen bleiben erhalten
    pub fn reset(&self) {
        let changed = {
            let mut snapshot = self.snapshot.write();
            let changed = snapshot.phase != CallPhase::Idle;
            let media = snapshot.media;
            *snapshot = RoomSnapshot {
                media,
                ..RoomSnapshot::default()
            };
            changed
        };
        if changed {
            let _ = self.event_tx.send(RoomEvent::PhaseChanged(CallPhase::Idle));
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}
