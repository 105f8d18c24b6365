//! Session-Actor
//!
//! Ein Task pro Session: erst der Aufbau (Geräte, Relay, Ankündigung), dann
//! laufen Befehle des Coordinators, Relay-Nachrichten und Connection-Events
//! nacheinander durch den PeerSessionController. Aufbau und jeder Handler
//! werden gegen das Abbruchsignal von `leave()` gerannt; ein abgebrochener
//! Schritt wird gedroppt und hat keine Wirkung mehr.

use super::coordinator::RoomError;
use crate::call_engine::{
    CallEngineError, CallPhase, ConnectionEvent, ConnectionFactory, ConnectionId,
    PeerSessionController,
};
use crate::config::CallConfig;
use crate::events::EventHub;
use crate::media::{MediaController, MediaDevices};
use crate::signaling::{RelayConnector, SignalingClient, SignalingEvent};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

/// Kapazität des Befehls-Channels
pub(crate) const COMMAND_CAPACITY: usize = 32;

/// Befehle vom RoomCoordinator an die Session
#[derive(Debug)]
pub(crate) enum Command {
    StartCall(oneshot::Sender<Result<(), CallEngineError>>),
    SetAudioEnabled(bool, oneshot::Sender<()>),
    SetVideoEnabled(bool, oneshot::Sender<()>),
}

// ============================================================================
// SETUP
// ============================================================================

/// Alles, was der Session-Task für den Aufbau braucht
pub(crate) struct SessionSetup {
    pub room_id: String,
    pub config: CallConfig,
    pub devices: Arc<dyn MediaDevices>,
    pub connector: Arc<dyn RelayConnector>,
    pub factory: Arc<dyn ConnectionFactory>,
    pub hub: EventHub,
}

impl SessionSetup {
    /// Geräte anfordern, Relay verbinden, Raum ankündigen
    ///
    /// Wird der Future gedroppt, geben die Drops von MediaController und
    /// SignalingClient Gerätestream und Relay-Verbindung frei.
    async fn open(
        self,
        commands: mpsc::Receiver<Command>,
        cancel: watch::Receiver<bool>,
    ) -> Result<SessionActor, RoomError> {
        let preferences = self.hub.snapshot().media;
        let mut media = MediaController::new(self.devices, self.config.constraints);
        media.set_audio_enabled(preferences.audio_enabled);
        media.set_video_enabled(preferences.video_enabled);

        let stream = media.acquire().await?;
        self.hub.set_local_stream(Some(stream));

        let mut signaling = SignalingClient::new(self.connector, self.config.connect_timeout);
        let relay_events = match signaling.connect(&self.config.relay_url).await {
            Ok(rx) => rx,
            Err(e) => {
                tracing::error!("Failed to connect to relay: {}", e);
                media.release();
                return Err(e.into());
            }
        };

        let (mut controller, connection_events) =
            PeerSessionController::new(media, signaling, self.factory, self.hub.clone());

        if let Err(e) = controller.announce(&self.room_id).await {
            tracing::error!("Failed to announce room: {}", e);
            controller.close().await;
            return Err(e.into());
        }

        Ok(SessionActor {
            controller,
            commands,
            relay_events,
            connection_events,
            cancel,
            hub: self.hub,
        })
    }
}

/// Session-Task: Aufbau, dann Event-Schleife
///
/// Das Ergebnis des Aufbaus geht an `ready`. Bricht `leave()` den Aufbau
/// ab, wird `ready` ohne Antwort gedroppt.
pub(crate) async fn run_session(
    setup: SessionSetup,
    commands: mpsc::Receiver<Command>,
    mut cancel: watch::Receiver<bool>,
    ready: oneshot::Sender<Result<(), RoomError>>,
) {
    let room_id = setup.room_id.clone();
    let actor_cancel = cancel.clone();
    let opened = tokio::select! {
        biased;
        _ = cancelled(&mut cancel) => {
            tracing::info!("Join of room {} cancelled", room_id);
            return;
        }
        opened = setup.open(commands, actor_cancel) => opened,
    };

    match opened {
        Ok(actor) => {
            if ready.send(Ok(())).is_err() {
                tracing::debug!("Join caller went away, session keeps running");
            }
            actor.run().await;
        }
        Err(e) => {
            let _ = ready.send(Err(e));
        }
    }
}

// ============================================================================
// EVENT LOOP
// ============================================================================

enum Input {
    Command(Command),
    Relay(SignalingEvent),
    Connection(ConnectionId, ConnectionEvent),
}

pub(crate) struct SessionActor {
    controller: PeerSessionController,
    commands: mpsc::Receiver<Command>,
    relay_events: mpsc::UnboundedReceiver<SignalingEvent>,
    connection_events: mpsc::UnboundedReceiver<(ConnectionId, ConnectionEvent)>,
    cancel: watch::Receiver<bool>,
    hub: EventHub,
}

impl SessionActor {
    pub async fn run(mut self) {
        tracing::debug!("Session actor started");

        loop {
            let input = tokio::select! {
                biased;
                _ = cancelled(&mut self.cancel) => break,
                Some(command) = self.commands.recv() => Input::Command(command),
                Some(event) = self.relay_events.recv() => Input::Relay(event),
                Some((id, event)) = self.connection_events.recv() => Input::Connection(id, event),
                else => break,
            };

            let result = tokio::select! {
                biased;
                _ = cancelled(&mut self.cancel) => break,
                result = dispatch(&mut self.controller, input) => result,
            };

            if let Err(err) = result {
                if err.is_fatal() {
                    self.controller.fail(err).await;
                    break;
                }
                tracing::warn!("Rejected: {}", err);
                self.hub.notify(err.to_string(), false);
            }

            if self.controller.phase() == CallPhase::Closed {
                break;
            }
        }

        self.controller.close().await;
        tracing::debug!("Session actor stopped");
    }
}

async fn dispatch(
    controller: &mut PeerSessionController,
    input: Input,
) -> Result<(), CallEngineError> {
    match input {
        Input::Command(Command::StartCall(reply)) => {
            let result = controller.start_call().await;
            let fatal = matches!(&result, Err(e) if e.is_fatal());
            let _ = reply.send(result.clone());
            // Nicht-fatale Fehler gehen nur an den Aufrufer
            match result {
                Err(e) if fatal => Err(e),
                _ => Ok(()),
            }
        }
        Input::Command(Command::SetAudioEnabled(enabled, ack)) => {
            controller.set_audio_enabled(enabled);
            let _ = ack.send(());
            Ok(())
        }
        Input::Command(Command::SetVideoEnabled(enabled, ack)) => {
            controller.set_video_enabled(enabled);
            let _ = ack.send(());
            Ok(())
        }
        Input::Relay(SignalingEvent::Message(msg)) => controller.handle_signaling(msg).await,
        Input::Relay(SignalingEvent::Closed(cause)) => controller.handle_relay_closed(cause),
        Input::Connection(id, event) => controller.handle_connection_event(id, event).await,
    }
}

/// Wird fertig, sobald `leave()` das Signal setzt oder der Sender gedroppt ist
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|cancelled| *cancelled).await;
}
