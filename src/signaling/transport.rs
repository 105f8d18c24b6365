//! Relay-Transport
//!
//! Ein `RelayConnector` öffnet die rohe Verbindung zum Relay und überbrückt
//! sie auf zwei Channels. Der SignalingClient arbeitet nur mit diesen
//! Channels und kennt das darunterliegende Protokoll nicht.

use super::client::SignalingError;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite, tungstenite::Message};
use url::Url;

/// Kapazität der Sende-/Empfangs-Channels
const LINK_CAPACITY: usize = 100;

// ============================================================================
// LINK TYPES
// ============================================================================

/// Warum eine Relay-Verbindung beendet wurde
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseCause {
    /// Lokal geschlossen (leave)
    Local,
    /// Vom Relay geschlossen
    Remote,
    /// Netzwerkfehler
    Network(String),
}

/// Eingehender Frame vom Relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayFrame {
    Text(String),
    Closed(CloseCause),
}

/// Eine geöffnete Relay-Verbindung
///
/// Wird `outbound` gedroppt, schließt der Transport die Verbindung.
pub struct RelayLink {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<RelayFrame>,
}

impl RelayLink {
    /// Erstellt ein Channel-Paar; die Gegenseite gehört dem Transport
    pub fn channel() -> (Self, mpsc::Receiver<String>, mpsc::Sender<RelayFrame>) {
        let (out_tx, out_rx) = mpsc::channel(LINK_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(LINK_CAPACITY);
        (
            Self {
                outbound: out_tx,
                inbound: in_rx,
            },
            out_rx,
            in_tx,
        )
    }
}

#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn connect(&self, address: &Url) -> Result<RelayLink, SignalingError>;
}

// ============================================================================
// WEBSOCKET CONNECTOR
// ============================================================================

/// Relay über WebSocket (`ws://` / `wss://`)
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

#[async_trait]
impl RelayConnector for WebSocketConnector {
    async fn connect(&self, address: &Url) -> Result<RelayLink, SignalingError> {
        tracing::info!("Connecting to relay: {}", address);

        let (ws_stream, _) = connect_async(address.as_str())
            .await
            .map_err(map_connect_error)?;

        let (mut write, mut read) = ws_stream.split();
        let (link, mut out_rx, in_tx) = RelayLink::channel();

        // Read-Task
        tokio::spawn(async move {
            let cause = loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if in_tx.send(RelayFrame::Text(text)).await.is_err() {
                            break CloseCause::Local;
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => {
                            if in_tx.send(RelayFrame::Text(text)).await.is_err() {
                                break CloseCause::Local;
                            }
                        }
                        Err(_) => tracing::warn!("Dropping non UTF-8 binary frame from relay"),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!("WebSocket closed by relay");
                        break CloseCause::Remote;
                    }
                    Some(Err(e)) => {
                        tracing::error!("WebSocket error: {}", e);
                        break CloseCause::Network(e.to_string());
                    }
                    Some(Ok(_)) => {}
                }
            };
            let _ = in_tx.send(RelayFrame::Closed(cause)).await;
        });

        // Write-Task
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    return;
                }
            }
            // Sender gedroppt: Verbindung sauber schließen
            let _ = write.close().await;
        });

        Ok(link)
    }
}

fn map_connect_error(e: tungstenite::Error) -> SignalingError {
    match e {
        tungstenite::Error::Io(ref io) if io.kind() == std::io::ErrorKind::TimedOut => {
            SignalingError::Timeout
        }
        other => SignalingError::ConnectionRefused(other.to_string()),
    }
}

// ============================================================================
// TESTS
// ============================================================================
