//! roomcall CLI
//!
//! ```text
//! roomcall <room-id> [--call]
//! ```
//!
//! Tritt dem Raum bei, startet optional den Anruf und gibt alle Events aus,
//! bis Ctrl-C gedrückt wird.

use anyhow::{bail, Context};
use roomcall::{CallConfig, RoomCoordinator, RoomEvent};
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    roomcall::init_logging();

    let mut args = std::env::args().skip(1);
    let Some(room_id) = args.next() else {
        bail!("usage: roomcall <room-id> [--call]");
    };
    let start_call = match args.next().as_deref() {
        None => false,
        Some("--call") => true,
        Some(other) => bail!("unknown argument '{}'", other),
    };

    let config = CallConfig::from_env();
    tracing::info!("Using relay {}", config.relay_url);

    let room = RoomCoordinator::new(config);
    let mut events = room.subscribe();

    room.join(&room_id)
        .await
        .with_context(|| format!("failed to join room {}", room_id))?;
    println!("joined room {}", room_id);

    if start_call {
        room.start_call().await.context("failed to start call")?;
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                println!("leaving room {}", room_id);
                break;
            }
            event = events.recv() => match event {
                Ok(RoomEvent::PhaseChanged(phase)) => println!("phase: {}", phase),
                Ok(RoomEvent::LocalStream(Some(stream))) => {
                    println!("local stream {} ({} tracks)", stream.id(), stream.tracks().len())
                }
                Ok(RoomEvent::LocalStream(None)) => println!("local stream released"),
                Ok(RoomEvent::RemoteTrack(track)) => {
                    println!("remote {:?} track {}", track.kind, track.id)
                }
                Ok(RoomEvent::MediaStateChanged(media)) => println!(
                    "audio: {}, video: {}",
                    media.audio_enabled, media.video_enabled
                ),
                Ok(RoomEvent::Notice(notice)) => {
                    let level = if notice.fatal { "error" } else { "notice" };
                    println!("[{}] {}: {}", notice.at.format("%H:%M:%S"), level, notice.message);
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    room.leave().await;
    Ok(())
}
