//! Signaling Client für den Relay-Server
//!
//! Verwaltet genau eine Relay-Verbindung:
//! - Verbindungsaufbau mit Timeout
//! - Raum ankündigen und Nachrichten senden (nur im verbundenen Zustand)
//! - Eingehende Nachrichten in Ankunftsreihenfolge weiterleiten
//! - `Closed` genau einmal pro Verbindung melden

use super::messages::*;
use super::transport::{CloseCause, RelayConnector, RelayFrame};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use url::Url;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("Invalid relay address: {0}")]
    InvalidAddress(String),

    #[error("Relay refused the connection: {0}")]
    ConnectionRefused(String),

    #[error("Timed out connecting to relay")]
    Timeout,

    #[error("Relay connection closed unexpectedly")]
    UnexpectedClose,

    #[error("Not connected to relay")]
    NotConnected,

    #[error("Already connected to relay")]
    AlreadyConnected,

    #[error("Malformed relay message: {0}")]
    MalformedMessage(String),

    #[error("Failed to send message: {0}")]
    SendFailed(String),
}

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

/// Events die vom SignalingClient ausgelöst werden
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    /// Nachricht vom Relay (in Ankunftsreihenfolge)
    Message(SignalingMessage),

    /// Verbindung beendet, genau einmal pro Verbindung
    Closed(CloseCause),
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
    room_id: Option<String>,
}

/// Sorgt dafür, dass `Closed` pro Verbindung genau einmal gemeldet wird
#[derive(Debug, Clone)]
struct CloseLatch {
    fired: Arc<AtomicBool>,
    event_tx: mpsc::UnboundedSender<SignalingEvent>,
}

impl CloseLatch {
    fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    fn fire(&self, cause: CloseCause) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        tracing::info!("Relay connection closed: {:?}", cause);
        let _ = self.event_tx.send(SignalingEvent::Closed(cause));
        true
    }
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// Client für genau eine Relay-Verbindung
pub struct SignalingClient {
    connector: Arc<dyn RelayConnector>,
    connect_timeout: Duration,
    state: Arc<RwLock<ClientState>>,
    tx: Option<mpsc::Sender<String>>,
    latch: Option<CloseLatch>,
}

impl SignalingClient {
    /// Erstellt einen neuen SignalingClient
    pub fn new(connector: Arc<dyn RelayConnector>, connect_timeout: Duration) -> Self {
        Self {
            connector,
            connect_timeout,
            state: Arc::new(RwLock::new(ClientState::default())),
            tx: None,
            latch: None,
        }
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.tx.is_some() && self.state.read().is_connected
    }

    /// Angekündigter Raum (falls vorhanden)
    pub fn room_id(&self) -> Option<String> {
        self.state.read().room_id.clone()
    }

    /// Verbindet mit dem Relay
    ///
    /// Gibt den Receiver zurück, über den eingehende Nachrichten und das
    /// einmalige `Closed` geliefert werden.
    pub async fn connect(
        &mut self,
        address: &str,
    ) -> Result<mpsc::UnboundedReceiver<SignalingEvent>, SignalingError> {
        if self.tx.is_some() {
            return Err(SignalingError::AlreadyConnected);
        }

        let url = parse_relay_address(address)?;

        let link = tokio::time::timeout(self.connect_timeout, self.connector.connect(&url))
            .await
            .map_err(|_| SignalingError::Timeout)??;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let latch = CloseLatch {
            fired: Arc::new(AtomicBool::new(false)),
            event_tx: event_tx.clone(),
        };

        {
            let mut state = self.state.write();
            state.is_connected = true;
            state.room_id = None;
        }
        self.tx = Some(link.outbound);
        self.latch = Some(latch.clone());

        // Read-Task: eine Nachricht nach der anderen, in Ankunftsreihenfolge
        let state = Arc::clone(&self.state);
        let mut inbound = link.inbound;
        tokio::spawn(async move {
            let cause = loop {
                match inbound.recv().await {
                    Some(RelayFrame::Text(text)) => {
                        if latch.is_fired() {
                            return;
                        }
                        match SignalingMessage::decode(&text) {
                            Ok(msg) => {
                                tracing::debug!("Relay message: {}", msg.kind());
                                if event_tx.send(SignalingEvent::Message(msg)).is_err() {
                                    break CloseCause::Local;
                                }
                            }
                            Err(e) => {
                                let err = SignalingError::MalformedMessage(e.to_string());
                                tracing::warn!("Dropping relay frame: {}", err);
                            }
                        }
                    }
                    Some(RelayFrame::Closed(cause)) => break cause,
                    None => break CloseCause::Remote,
                }
            };

            state.write().is_connected = false;
            latch.fire(cause);
        });

        tracing::info!("Connected to relay {}", url);
        Ok(event_rx)
    }

    /// Kündigt den Raum beim Relay an
    pub async fn announce(&self, room_id: &str) -> Result<(), SignalingError> {
        self.send(SignalingMessage::JoinRoom {
            room_id: room_id.to_string(),
        })
        .await?;
        self.state.write().room_id = Some(room_id.to_string());
        tracing::info!("Announced room {}", room_id);
        Ok(())
    }

    /// Sendet eine Nachricht an das Relay
    pub async fn send(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        let tx = self.tx.as_ref().ok_or(SignalingError::NotConnected)?;
        if !self.state.read().is_connected {
            return Err(SignalingError::NotConnected);
        }

        let text = message
            .encode()
            .map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        tx.send(text)
            .await
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    /// Schließt die Verbindung
    ///
    /// Mehrfache Aufrufe sind erlaubt; `Closed` wird nur einmal gemeldet.
    pub fn close(&mut self) {
        // Sender droppen schließt den Transport
        self.tx = None;
        {
            let mut state = self.state.write();
            state.is_connected = false;
            state.room_id = None;
        }
        if let Some(latch) = self.latch.take() {
            latch.fire(CloseCause::Local);
        }
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("connect_timeout", &self.connect_timeout)
            .field("state", &*self.state.read())
            .finish()
    }
}

/// Prüft die Relay-Adresse (nur `ws` und `wss`)
fn parse_relay_address(address: &str) -> Result<Url, SignalingError> {
    let url = Url::parse(address).map_err(|e| SignalingError::InvalidAddress(e.to_string()))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(SignalingError::InvalidAddress(format!(
            "unsupported scheme '{}'",
            other
        ))),
    }
}

// ============================================================================
// TESTS
// ============================================================================
