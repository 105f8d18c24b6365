//! Konfiguration für RoomCoordinator
//!
//! Relay-Adresse und ICE-Server werden nicht mehr als Modul-Konstanten
//! gehalten, sondern beim Erzeugen des Coordinators injiziert.

use std::time::Duration;

// ============================================================================
// DEFAULTS
// ============================================================================

/// Standard-Adresse des Relay-Servers
pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:8080";

/// Standard STUN Server
pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";

/// Maximale Wartezeit für den Verbindungsaufbau zum Relay
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// ICE SERVER
// ============================================================================

/// Ein STUN/TURN Server für den Verbindungsaufbau
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

impl IceServer {
    /// STUN Server ohne Credentials
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: String::new(),
            credential: String::new(),
        }
    }
}

// ============================================================================
// MEDIA CONSTRAINTS
// ============================================================================

/// Welche Geräte beim Beitreten angefordert werden
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

// ============================================================================
// CALL CONFIG
// ============================================================================

#[derive(Debug, Clone)]
pub struct CallConfig {
    /// WebSocket-Adresse des Relays (`ws://` oder `wss://`)
    pub relay_url: String,
    /// Traversal-Helper für die Peer Connection
    pub ice_servers: Vec<IceServer>,
    pub connect_timeout: Duration,
    pub constraints: MediaConstraints,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            ice_servers: vec![IceServer::stun(DEFAULT_ICE_SERVER)],
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            constraints: MediaConstraints::default(),
        }
    }
}

impl CallConfig {
    /// Liest die Konfiguration aus Umgebungsvariablen
    ///
    /// - `SIGNALING_URL`: Relay-Adresse
    /// - `ICE_SERVER_URL`: STUN Server
    /// - `SIGNALING_CONNECT_TIMEOUT_MS`: Timeout in Millisekunden
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("SIGNALING_URL") {
            config.relay_url = url;
        }

        if let Ok(url) = std::env::var("ICE_SERVER_URL") {
            config.ice_servers = vec![IceServer::stun(url)];
        }

        if let Ok(raw) = std::env::var("SIGNALING_CONNECT_TIMEOUT_MS") {
            match raw.parse::<u64>() {
                Ok(ms) => config.connect_timeout = Duration::from_millis(ms),
                Err(e) => tracing::warn!("Ignoring SIGNALING_CONNECT_TIMEOUT_MS={}: {}", raw, e),
            }
        }

        config
    }

    /// Fügt einen TURN Server mit Credentials hinzu
    pub fn with_turn_server(
        mut self,
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        self.ice_servers.push(IceServer {
            urls: vec![url.into()],
            username: username.into(),
            credential: credential.into(),
        });
        self
    }
}

// ============================================================================
// TESTS
// ============================================================================
