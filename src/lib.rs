//! roomcall - Zwei-Personen-Anrufe über einen Relay-Server
//!
//! Zwei Teilnehmer treffen sich über eine gemeinsame Raum-ID:
//! - Relay-Server (WebSocket) nur für das Signaling
//! - WebRTC für die direkte Audio-/Video-Verbindung
//! - Glare-Auflösung, wenn beide gleichzeitig anrufen

pub mod call_engine;
pub mod config;
pub mod events;
pub mod media;
pub mod room;
pub mod signaling;

#[cfg(test)]
mod testing;

pub use call_engine::{CallEngineError, CallPhase, NegotiationRole, Role};
pub use config::{CallConfig, IceServer, MediaConstraints};
pub use events::{Notice, RoomEvent, RoomSnapshot};
pub use media::{LocalMediaState, LocalStream, MediaError, RemoteStream, RemoteTrack, TrackKind};
pub use room::{RoomCoordinator, RoomError};
pub use signaling::SignalingError;

// ============================================================================
// LOGGING
// ============================================================================

/// Initialisiert das Logging (`RUST_LOG` überschreibt die Standardwerte)
///
/// Mehrfache Aufrufe sind wirkungslos.
pub fn init_logging() {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    for directive in ["roomcall=debug", "webrtc=warn"] {
        match directive.parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => eprintln!("Invalid log directive {}: {}", directive, e),
        }
    }

    if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_ok() {
        tracing::info!("Logging initialized");
    }
}
