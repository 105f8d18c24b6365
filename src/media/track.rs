//! Lokale und entfernte Media-Tracks

use super::devices::{AudioCapture, CaptureBuffer};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

// ============================================================================
// LOCAL TRACK
// ============================================================================

/// Ein lokaler Track (Mikrofon oder Kamera)
///
/// `enabled` schaltet den Track stumm ohne ihn zu entfernen; `live` wird
/// nur durch `stop()` beendet.
#[derive(Debug)]
pub struct LocalTrack {
    id: String,
    stream_id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    live: AtomicBool,
}

impl LocalTrack {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Beendet den Track endgültig
    pub fn stop(&self) {
        self.live.store(false, Ordering::Release);
    }
}

// ============================================================================
// LOCAL STREAM
// ============================================================================

/// Der lokale Gerätestream
pub struct LocalStream {
    id: String,
    tracks: Vec<Arc<LocalTrack>>,
    audio: Arc<CaptureBuffer>,
    capture: Mutex<Option<AudioCapture>>,
}

impl LocalStream {
    /// Erstellt einen Stream mit je einem Track pro Art
    pub fn new(kinds: &[TrackKind]) -> Self {
        let id = Uuid::new_v4().to_string();
        let tracks = kinds
            .iter()
            .map(|kind| {
                Arc::new(LocalTrack {
                    id: Uuid::new_v4().to_string(),
                    stream_id: id.clone(),
                    kind: *kind,
                    enabled: AtomicBool::new(true),
                    live: AtomicBool::new(true),
                })
            })
            .collect();

        Self {
            id,
            tracks,
            audio: Arc::new(CaptureBuffer::new()),
            capture: Mutex::new(None),
        }
    }

    /// Buffer für aufgenommene Audio-Samples
    pub fn audio_buffer(&self) -> Arc<CaptureBuffer> {
        Arc::clone(&self.audio)
    }

    /// Hängt die laufende Mikrofon-Aufnahme an den Stream
    pub(crate) fn attach_capture(&self, capture: AudioCapture) {
        *self.capture.lock() = Some(capture);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &Arc<LocalTrack>> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    /// Aktiv solange mindestens ein Track nicht gestoppt wurde
    pub fn is_live(&self) -> bool {
        self.tracks.iter().any(|t| t.is_live())
    }

    /// Eingangspegel des Mikrofons (0.0 - 1.0)
    pub fn input_level(&self) -> f32 {
        self.audio.level()
    }

    /// Stoppt alle Tracks und gibt das Gerät frei
    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
        if let Some(mut capture) = self.capture.lock().take() {
            capture.stop();
        }
    }
}

impl std::fmt::Debug for LocalStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStream")
            .field("id", &self.id)
            .field("tracks", &self.tracks)
            .finish()
    }
}

// ============================================================================
// REMOTE MEDIA
// ============================================================================

/// Ein vom Peer empfangener Track
///
/// `id` entspricht der Track-ID auf der sendenden Seite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
}

/// Alle bisher empfangenen Tracks des Peers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteStream {
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    /// Fügt einen Track hinzu; doppelte IDs werden ignoriert
    pub fn add(&mut self, track: RemoteTrack) -> bool {
        if self.tracks.iter().any(|t| t.id == track.id) {
            return false;
        }
        self.tracks.push(track);
        true
    }

    pub fn track_ids(&self) -> Vec<String> {
        self.tracks.iter().map(|t| t.id.clone()).collect()
    }
}
