//! RoomCoordinator - öffentliche Schnittstelle
//!
//! Einziger Einstiegspunkt für Aufrufer: join, leave, startCall und
//! Mute-Einstellungen. Pro Raum-Beitritt läuft genau eine Session als
//! eigener Task; der Coordinator hält nur deren Handle.

use super::actor::{run_session, Command, SessionSetup, COMMAND_CAPACITY};
use crate::call_engine::{
    CallEngineError, CallPhase, ConnectionFactory, Role, RtcConnectionFactory,
};
use crate::config::CallConfig;
use crate::events::{EventHub, RoomEvent, RoomSnapshot};
use crate::media::{
    LocalMediaState, LocalStream, MediaDevices, MediaError, RemoteStream, SystemDevices,
};
use crate::signaling::{RelayConnector, SignalingError, WebSocketConnector};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoomError {
    #[error("Already joined room {0}")]
    AlreadyJoined(String),

    #[error("Not joined to a room")]
    NotJoined,

    #[error("Room id must not be empty")]
    InvalidRoomId,

    #[error("Join was cancelled by leave")]
    Cancelled,

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Call(#[from] CallEngineError),
}

// ============================================================================
// SESSION HANDLE
// ============================================================================

struct SessionHandle {
    room_id: String,
    /// Unterscheidet aufeinanderfolgende Beitritte
    generation: u64,
    commands: mpsc::Sender<Command>,
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

// ============================================================================
// ROOM COORDINATOR
// ============================================================================

pub struct RoomCoordinator {
    config: CallConfig,
    devices: Arc<dyn MediaDevices>,
    connector: Arc<dyn RelayConnector>,
    factory: Arc<dyn ConnectionFactory>,
    hub: EventHub,
    session: Mutex<Option<SessionHandle>>,
    next_generation: AtomicU64,
}

impl RoomCoordinator {
    /// Coordinator mit Systemgeräten, WebSocket-Relay und WebRTC
    pub fn new(config: CallConfig) -> Self {
        let factory = Arc::new(RtcConnectionFactory::new(&config.ice_servers));
        Self::with_backends(config, Arc::new(SystemDevices), Arc::new(WebSocketConnector), factory)
    }

    pub fn with_backends(
        config: CallConfig,
        devices: Arc<dyn MediaDevices>,
        connector: Arc<dyn RelayConnector>,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        Self {
            config,
            devices,
            connector,
            factory,
            hub: EventHub::new(),
            session: Mutex::new(None),
            next_generation: AtomicU64::new(1),
        }
    }

    // ========================================================================
    // ENTRY POINTS
    // ========================================================================

    /// Tritt einem Raum bei: Geräte anfordern, Relay verbinden, Raum ankündigen
    ///
    /// Der Aufbau läuft im Session-Task; ein gleichzeitiges `leave()` bricht
    /// ihn ab und `join` liefert dann `RoomError::Cancelled`.
    pub async fn join(&self, room_id: &str) -> Result<(), RoomError> {
        let room_id = room_id.trim();
        if room_id.is_empty() {
            return Err(RoomError::InvalidRoomId);
        }

        let (generation, ready_rx) = {
            let mut session = self.session.lock().await;
            if let Some(handle) = session.take() {
                if handle.is_active() && self.hub.phase() != CallPhase::Closed {
                    let joined = handle.room_id.clone();
                    *session = Some(handle);
                    return Err(RoomError::AlreadyJoined(joined));
                }
                // Selbst beendete Session aufräumen
                let _ = handle.task.await;
            }
            self.hub.reset();

            tracing::info!("Joining room {}", room_id);

            let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
            let (cancel_tx, cancel_rx) = watch::channel(false);
            let (ready_tx, ready_rx) = oneshot::channel();

            let setup = SessionSetup {
                room_id: room_id.to_string(),
                config: self.config.clone(),
                devices: Arc::clone(&self.devices),
                connector: Arc::clone(&self.connector),
                factory: Arc::clone(&self.factory),
                hub: self.hub.clone(),
            };
            let task = tokio::spawn(run_session(setup, command_rx, cancel_rx, ready_tx));

            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            *session = Some(SessionHandle {
                room_id: room_id.to_string(),
                generation,
                commands: command_tx,
                cancel: cancel_tx,
                task,
            });
            (generation, ready_rx)
        };

        // Ohne Lock warten, damit leave() den Aufbau abbrechen kann
        match ready_rx.await {
            Ok(Ok(())) => {
                tracing::info!("Joined room {}", room_id);
                Ok(())
            }
            Ok(Err(e)) => {
                self.discard(generation).await;
                Err(e)
            }
            Err(_) => {
                tracing::info!("Join of room {} cancelled", room_id);
                Err(RoomError::Cancelled)
            }
        }
    }

    /// Räumt einen fehlgeschlagenen Beitritt ab, sofern `leave()` es nicht schon tat
    async fn discard(&self, generation: u64) {
        let mut session = self.session.lock().await;
        if session.as_ref().map(|h| h.generation) != Some(generation) {
            return;
        }
        if let Some(handle) = session.take() {
            let _ = handle.task.await;
        }
        self.hub.reset();
    }

    /// Verlässt den Raum und gibt alle Ressourcen frei
    ///
    /// Ohne aktive Session wirkungslos; mehrfache Aufrufe sind erlaubt.
    pub async fn leave(&self) {
        let handle = self.session.lock().await.take();

        if let Some(handle) = handle {
            tracing::info!("Leaving room {}", handle.room_id);
            let _ = handle.cancel.send(true);
            if let Err(e) = handle.task.await {
                tracing::error!("Session task ended abnormally: {}", e);
            }
        }

        self.hub.reset();
    }

    /// Startet den Anruf (nur im Raum, solange noch verhandelt werden kann)
    pub async fn start_call(&self) -> Result<(), RoomError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_command(Command::StartCall(reply_tx)).await?;
        reply_rx.await.map_err(|_| RoomError::NotJoined)??;
        Ok(())
    }

    pub async fn set_audio_enabled(&self, enabled: bool) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.send_command(Command::SetAudioEnabled(enabled, ack_tx)).await.is_ok()
            && ack_rx.await.is_ok()
        {
            return;
        }

        // Ohne Session: Einstellung für den nächsten Beitritt merken
        let mut media = self.hub.snapshot().media;
        media.audio_enabled = enabled;
        self.hub.set_media_state(media);
    }

    pub async fn set_video_enabled(&self, enabled: bool) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.send_command(Command::SetVideoEnabled(enabled, ack_tx)).await.is_ok()
            && ack_rx.await.is_ok()
        {
            return;
        }

        let mut media = self.hub.snapshot().media;
        media.video_enabled = enabled;
        self.hub.set_media_state(media);
    }

    /// Schickt einen Befehl an die aktive Session
    ///
    /// Der Lock wird vor dem Warten auf die Antwort wieder freigegeben.
    async fn send_command(&self, command: Command) -> Result<(), RoomError> {
        let commands = {
            let session = self.session.lock().await;
            match session.as_ref().filter(|h| h.is_active()) {
                Some(handle) => handle.commands.clone(),
                None => return Err(RoomError::NotJoined),
            }
        };
        commands
            .send(command)
            .await
            .map_err(|_| RoomError::NotJoined)
    }

    // ========================================================================
    // OBSERVABLE STATE
    // ========================================================================

    pub fn phase(&self) -> CallPhase {
        self.hub.phase()
    }

    pub fn role(&self) -> Role {
        self.hub.snapshot().role
    }

    pub fn room_id(&self) -> Option<String> {
        self.hub.snapshot().room_id
    }

    pub fn local_stream(&self) -> Option<Arc<LocalStream>> {
        self.hub.snapshot().local_stream
    }

    /// Erst vorhanden, sobald der erste Remote-Track angekommen ist
    pub fn remote_stream(&self) -> Option<RemoteStream> {
        self.hub.snapshot().remote_stream
    }

    pub fn media_state(&self) -> LocalMediaState {
        self.hub.snapshot().media
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        self.hub.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.hub.subscribe()
    }
}

impl Drop for RoomCoordinator {
    fn drop(&mut self) {
        // Session beendet sich selbst und gibt ihre Ressourcen frei
        if let Some(handle) = self.session.get_mut().take() {
            let _ = handle.cancel.send(true);
        }
    }
}

impl std::fmt::Debug for RoomCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomCoordinator")
            .field("config", &self.config)
            .field("snapshot", &self.hub.snapshot())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
