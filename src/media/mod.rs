//! Media Module - lokale Geräte
//!
//! Dieses Modul verwaltet:
//! - Gerätestream anfordern und freigeben
//! - Mute/Unmute über das `enabled`-Flag der Tracks
//! - Mikrofon Capture (cpal)

mod controller;
mod devices;
mod track;

pub use controller::{LocalMediaState, MediaController};
pub use devices::{
    AudioCapture, CaptureBuffer, MediaDevices, MediaError, SystemDevices, FRAME_SIZE, SAMPLE_RATE,
};
pub use track::{LocalStream, LocalTrack, RemoteStream, RemoteTrack, TrackKind};
