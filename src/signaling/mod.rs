//! Signaling Module - Relay-Verbindung
//!
//! Dieses Modul verwaltet die Kommunikation mit dem Relay-Server:
//! - Verbindung aufbauen (WebSocket) und Raum ankündigen
//! - Nachrichten serialisieren und senden
//! - Eingehende Nachrichten parsen und in Reihenfolge weiterleiten
//!

mod client;
mod messages;
mod transport;

pub use client::{SignalingClient, SignalingError, SignalingEvent};
pub use messages::*;
pub use transport::{CloseCause, RelayConnector, RelayFrame, RelayLink, WebSocketConnector};
