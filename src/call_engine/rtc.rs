//! WebRTC Connection (webrtc-rs)
//!
//! Erstellt Peer Connections mit den konfigurierten ICE Servern und leitet
//! Candidate-, Track- und State-Callbacks als `ConnectionEvent` weiter.

use super::connection::*;
use crate::config::IceServer;
use crate::media::{CaptureBuffer, LocalStream, LocalTrack, RemoteTrack, TrackKind, SAMPLE_RATE};
use crate::signaling::NetworkCandidate;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Dauer eines Audio-Frames (960 Samples @ 48kHz)
const FRAME_DURATION: Duration = Duration::from_millis(20);

/// Maximale Größe eines Opus-Pakets
const MAX_PACKET_SIZE: usize = 4000;

/// Bitrate für Sprache
const OPUS_BITRATE: i32 = 32_000;

fn webrtc_err(e: webrtc::Error) -> ConnectionError {
    ConnectionError::WebRTC(e.to_string())
}

// ============================================================================
// FACTORY
// ============================================================================

/// Erstellt WebRTC Peer Connections
#[derive(Debug, Clone)]
pub struct RtcConnectionFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl RtcConnectionFactory {
    pub fn new(ice_servers: &[IceServer]) -> Self {
        Self {
            ice_servers: ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone(),
                    credential: s.credential.clone(),
                    ..Default::default()
                })
                .collect(),
        }
    }
}

#[async_trait]
impl ConnectionFactory for RtcConnectionFactory {
    async fn create(
        &self,
        events: ConnectionEvents,
    ) -> Result<Arc<dyn PeerConnection>, ConnectionError> {
        // Media Engine mit Standard-Codecs (Opus, VP8, ...)
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(webrtc_err)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(webrtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await.map_err(webrtc_err)?);
        register_handlers(&pc, events);

        let (closed, _) = watch::channel(false);
        Ok(Arc::new(RtcConnection {
            pc,
            tracks: Mutex::new(Vec::new()),
            closed,
        }))
    }
}

/// Registriert die Callbacks der Peer Connection
fn register_handlers(pc: &Arc<RTCPeerConnection>, events: ConnectionEvents) {
    let id = events.id();

    // Connection State Handler
    let state_events = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        tracing::info!("Peer connection {} state: {:?}", id, s);
        let state = match s {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
                TransportState::New
            }
            RTCPeerConnectionState::Connecting => TransportState::Connecting,
            RTCPeerConnectionState::Connected => TransportState::Connected,
            RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
            RTCPeerConnectionState::Failed => TransportState::Failed,
            RTCPeerConnectionState::Closed => TransportState::Closed,
        };
        state_events.emit(ConnectionEvent::StateChanged(state));
        Box::pin(async {})
    }));

    // ICE Candidate Handler: jeder Candidate wird einzeln weitergegeben
    let candidate_events = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        if let Some(c) = candidate {
            match c.to_json() {
                Ok(init) => candidate_events.emit(ConnectionEvent::LocalCandidate(
                    NetworkCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    },
                )),
                Err(e) => tracing::warn!("Failed to serialize local candidate: {}", e),
            }
        }
        Box::pin(async {})
    }));

    // Track Handler für eingehende Media
    pc.on_track(Box::new(move |track, _, _| {
        let kind = match track.kind() {
            RTPCodecType::Audio => Some(TrackKind::Audio),
            RTPCodecType::Video => Some(TrackKind::Video),
            _ => None,
        };

        match kind {
            Some(kind) => {
                tracing::info!("Received {:?} track {} on connection {}", kind, track.id(), id);
                events.emit(ConnectionEvent::RemoteTrack(RemoteTrack {
                    id: track.id(),
                    stream_id: track.stream_id(),
                    kind,
                }));

                // RTP lesen, damit die Interceptor-Pipeline nicht blockiert
                tokio::spawn(async move { while track.read_rtp().await.is_ok() {} });
            }
            None => tracing::warn!("Ignoring track with unspecified kind"),
        }

        Box::pin(async {})
    }));
}

// ============================================================================
// CONNECTION
// ============================================================================

pub struct RtcConnection {
    pc: Arc<RTCPeerConnection>,
    tracks: Mutex<Vec<Arc<TrackLocalStaticSample>>>,
    /// Beendet die Audio-Pumpen
    closed: watch::Sender<bool>,
}

#[async_trait]
impl PeerConnection for RtcConnection {
    async fn add_track(
        &self,
        track: Arc<LocalTrack>,
        stream: &LocalStream,
    ) -> Result<(), ConnectionError> {
        let capability = match track.kind() {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
        };

        let local = Arc::new(TrackLocalStaticSample::new(
            capability,
            track.id().to_string(),
            track.stream_id().to_string(),
        ));

        let sender = self
            .pc
            .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(webrtc_err)?;

        // RTCP lesen, sonst laufen die Interceptor-Buffer voll
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });

        if track.kind() == TrackKind::Audio {
            spawn_audio_pump(
                Arc::clone(&local),
                track,
                stream.audio_buffer(),
                self.closed.subscribe(),
            )?;
        }

        self.tracks.lock().push(local);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError> {
        let offer = self.pc.create_offer(None).await.map_err(webrtc_err)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(webrtc_err)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError> {
        let answer = self.pc.create_answer(None).await.map_err(webrtc_err)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(webrtc_err)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError> {
        let rtc_description = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.body),
            SdpKind::Answer => RTCSessionDescription::answer(description.body),
        }
        .map_err(|e| ConnectionError::InvalidSdp(e.to_string()))?;

        self.pc
            .set_remote_description(rtc_description)
            .await
            .map_err(webrtc_err)
    }

    async fn add_candidate(&self, candidate: NetworkCandidate) -> Result<(), ConnectionError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(webrtc_err)
    }

    async fn track_count(&self) -> usize {
        self.tracks.lock().len()
    }

    async fn close(&self) {
        self.closed.send_replace(true);
        if let Err(e) = self.pc.close().await {
            tracing::warn!("Failed to close peer connection: {}", e);
        }
    }
}

// ============================================================================
// AUDIO SEND PATH
// ============================================================================

struct OpusEncoder(opus::Encoder);

// SAFETY: der Encoder gehört genau einem Pump-Task und wird nie geteilt
unsafe impl Send for OpusEncoder {}

impl OpusEncoder {
    /// Mono, 48kHz, für Sprache optimiert
    fn new() -> Result<Self, ConnectionError> {
        let mut encoder =
            opus::Encoder::new(SAMPLE_RATE, opus::Channels::Mono, opus::Application::Voip)
                .map_err(|e| ConnectionError::WebRTC(format!("Failed to create Opus encoder: {}", e)))?;
        encoder
            .set_bitrate(opus::Bitrate::Bits(OPUS_BITRATE))
            .map_err(|e| ConnectionError::WebRTC(format!("Failed to set Opus bitrate: {}", e)))?;
        Ok(Self(encoder))
    }

    fn encode(&mut self, frame: &[f32]) -> Result<Vec<u8>, opus::Error> {
        let mut packet = vec![0u8; MAX_PACKET_SIZE];
        let len = self.0.encode_float(frame, &mut packet)?;
        packet.truncate(len);
        Ok(packet)
    }
}

/// Liest alle 20ms die aufgenommenen Frames, kodiert sie als Opus und
/// schreibt sie auf den Sende-Track
///
/// Endet, wenn die Connection geschlossen oder der Track gestoppt wird.
fn spawn_audio_pump(
    output: Arc<TrackLocalStaticSample>,
    track: Arc<LocalTrack>,
    buffer: Arc<CaptureBuffer>,
    mut closed: watch::Receiver<bool>,
) -> Result<(), ConnectionError> {
    let mut encoder = OpusEncoder::new()?;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(FRAME_DURATION);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = closed.wait_for(|c| *c) => break,
                _ = ticker.tick() => {}
            }
            if !track.is_live() {
                break;
            }

            while let Some(frame) = buffer.read_frame() {
                let data = match encoder.encode(&frame) {
                    Ok(data) => data,
                    Err(e) => {
                        tracing::warn!("Opus encoding failed: {}", e);
                        continue;
                    }
                };
                let sample = Sample {
                    data: data.into(),
                    duration: FRAME_DURATION,
                    timestamp: std::time::SystemTime::now(),
                    ..Default::default()
                };
                if let Err(e) = output.write_sample(&sample).await {
                    tracing::debug!("Failed to write audio sample: {}", e);
                }
            }
        }
        tracing::debug!("Audio pump for track {} stopped", track.id());
    });

    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
