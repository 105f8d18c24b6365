//! MediaController - lokale Kamera und Mikrofon
//!
//! Besitzt den Gerätestream einer Session. Mute/Unmute setzt nur das
//! `enabled`-Flag der Tracks; Tracks werden dabei weder entfernt noch
//! gestoppt.

use super::devices::{MediaDevices, MediaError};
use super::track::{LocalStream, TrackKind};
use crate::config::MediaConstraints;
use std::sync::Arc;

/// Mute-Zustand der lokalen Geräte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalMediaState {
    pub audio_enabled: bool,
    pub video_enabled: bool,
}

impl Default for LocalMediaState {
    fn default() -> Self {
        Self {
            audio_enabled: true,
            video_enabled: true,
        }
    }
}

pub struct MediaController {
    devices: Arc<dyn MediaDevices>,
    constraints: MediaConstraints,
    stream: Option<Arc<LocalStream>>,
    state: LocalMediaState,
}

impl MediaController {
    pub fn new(devices: Arc<dyn MediaDevices>, constraints: MediaConstraints) -> Self {
        Self {
            devices,
            constraints,
            stream: None,
            state: LocalMediaState::default(),
        }
    }

    /// Fordert den Gerätestream an
    ///
    /// Wiederholte Aufrufe vor `release()` liefern denselben Stream.
    pub async fn acquire(&mut self) -> Result<Arc<LocalStream>, MediaError> {
        if let Some(stream) = &self.stream {
            return Ok(Arc::clone(stream));
        }

        let stream = Arc::new(self.devices.open(self.constraints).await?);

        // Vorher gesetzte Mute-Einstellungen übernehmen
        Self::apply(&stream, TrackKind::Audio, self.state.audio_enabled);
        Self::apply(&stream, TrackKind::Video, self.state.video_enabled);

        self.stream = Some(Arc::clone(&stream));
        Ok(stream)
    }

    /// Stoppt alle Tracks und gibt den Stream frei
    pub fn release(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.stop();
            tracing::info!("Released local stream {}", stream.id());
        }
    }

    pub fn set_audio_enabled(&mut self, enabled: bool) {
        self.state.audio_enabled = enabled;
        if let Some(stream) = &self.stream {
            Self::apply(stream, TrackKind::Audio, enabled);
        }
        tracing::debug!("Audio enabled: {}", enabled);
    }

    pub fn set_video_enabled(&mut self, enabled: bool) {
        self.state.video_enabled = enabled;
        if let Some(stream) = &self.stream {
            Self::apply(stream, TrackKind::Video, enabled);
        }
        tracing::debug!("Video enabled: {}", enabled);
    }

    pub fn state(&self) -> LocalMediaState {
        self.state
    }

    pub fn stream(&self) -> Option<Arc<LocalStream>> {
        self.stream.clone()
    }

    fn apply(stream: &LocalStream, kind: TrackKind, enabled: bool) {
        for track in stream.tracks_of(kind) {
            track.set_enabled(enabled);
        }
    }
}

impl Drop for MediaController {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for MediaController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaController")
            .field("constraints", &self.constraints)
            .field("stream", &self.stream.as_ref().map(|s| s.id().to_string()))
            .field("state", &self.state)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
