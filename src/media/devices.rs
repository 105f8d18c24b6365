//! Geräte-Backend - Mikrofon Capture
//!
//! Verwendet cpal für Cross-Platform Audio I/O. Der cpal-Stream ist nicht
//! `Send` und lebt deshalb auf einem eigenen Capture-Thread; nach außen
//! bleibt nur ein Handle zum Stoppen.
//!
//! Für Video gibt es in diesem Stack kein Capture-Backend: der Video-Track
//! wird von der einbettenden Anwendung gespeist.

use super::track::{LocalStream, LocalTrack, TrackKind};
use crate::config::MediaConstraints;
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz ist der Standard für WebRTC)
pub const SAMPLE_RATE: u32 = 48000;

/// Frame Size in Samples (20ms @ 48kHz = 960 samples)
pub const FRAME_SIZE: usize = 960;

/// Buffer Size für den Capture-Ring-Buffer
const RING_BUFFER_SIZE: usize = FRAME_SIZE * 10;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Permission to access media devices was denied: {0}")]
    PermissionDenied(String),

    #[error("Media device unavailable: {0}")]
    DeviceUnavailable(String),
}

impl MediaError {
    /// Ordnet eine Backend-Meldung der passenden Fehlerart zu
    fn from_backend(message: String) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized")
        {
            Self::PermissionDenied(message)
        } else {
            Self::DeviceUnavailable(message)
        }
    }
}

// ============================================================================
// DEVICE BACKEND
// ============================================================================

/// Quelle für lokale Gerätestreams
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn open(&self, constraints: MediaConstraints) -> Result<LocalStream, MediaError>;
}

/// Systemgeräte über cpal
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDevices;

#[async_trait]
impl MediaDevices for SystemDevices {
    async fn open(&self, constraints: MediaConstraints) -> Result<LocalStream, MediaError> {
        let mut kinds = Vec::new();
        if constraints.audio {
            kinds.push(TrackKind::Audio);
        }
        if constraints.video {
            kinds.push(TrackKind::Video);
        }
        if kinds.is_empty() {
            return Err(MediaError::DeviceUnavailable(
                "no media kinds requested".to_string(),
            ));
        }

        let stream = LocalStream::new(&kinds);

        if let Some(track) = stream.tracks_of(TrackKind::Audio).next() {
            let capture = AudioCapture::start(Arc::clone(track), stream.audio_buffer()).await?;
            stream.attach_capture(capture);
        }

        tracing::info!(
            "Opened local stream {} ({} track(s))",
            stream.id(),
            stream.tracks().len()
        );
        Ok(stream)
    }
}

// ============================================================================
// AUDIO CAPTURE
// ============================================================================

/// Aufgenommene Mono-Samples (48kHz) plus Eingangspegel
///
/// Wird vom Capture-Thread gefüllt und vom Sende-Pfad in Frames gelesen.
pub struct CaptureBuffer {
    samples: Mutex<HeapRb<f32>>,

    /// Audio Level (0.0 - 1.0) für Visualisierung
    level: Mutex<f32>,
}

impl CaptureBuffer {
    pub fn new() -> Self {
        Self {
            samples: Mutex::new(HeapRb::new(RING_BUFFER_SIZE)),
            level: Mutex::new(0.0),
        }
    }

    /// Schreibt Samples; bei vollem Buffer gehen die neuesten verloren
    pub fn push(&self, data: &[f32]) {
        let mut samples = self.samples.lock();
        for sample in data {
            let _ = samples.try_push(*sample);
        }
    }

    /// Liest einen vollen Frame (`FRAME_SIZE` Samples)
    pub fn read_frame(&self) -> Option<Vec<f32>> {
        let mut samples = self.samples.lock();
        if samples.occupied_len() < FRAME_SIZE {
            return None;
        }
        Some((0..FRAME_SIZE).filter_map(|_| samples.try_pop()).collect())
    }

    /// Anzahl wartender Samples
    pub fn pending(&self) -> usize {
        self.samples.lock().occupied_len()
    }

    pub fn level(&self) -> f32 {
        *self.level.lock()
    }

    pub(crate) fn set_level(&self, level: f32) {
        *self.level.lock() = level;
    }
}

impl Default for CaptureBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Laufende Mikrofon-Aufnahme
pub struct AudioCapture {
    stop_tx: Option<std::sync::mpsc::Sender<()>>,
}

impl AudioCapture {
    /// Startet die Aufnahme vom Standard-Mikrofon in `buffer`
    ///
    /// Ist der Track deaktiviert, werden Samples verworfen.
    pub async fn start(track: Arc<LocalTrack>, buffer: Arc<CaptureBuffer>) -> Result<Self, MediaError> {
        let (ready_tx, ready_rx) = oneshot::channel::<Result<StreamConfig, MediaError>>();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

        std::thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                let (stream, config) = match build_input_stream(track, buffer) {
                    Ok(built) => built,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(MediaError::from_backend(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(config));

                // Blockiert bis stop() oder das Handle gedroppt wird
                let _ = stop_rx.recv();
                drop(stream);
                tracing::info!("Audio capture stopped");
            })
            .map_err(|e| MediaError::DeviceUnavailable(e.to_string()))?;

        let config = ready_rx.await.map_err(|_| {
            MediaError::DeviceUnavailable("audio capture thread exited".to_string())
        })??;

        tracing::info!(
            "Starting audio capture: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        Ok(Self {
            stop_tx: Some(stop_tx),
        })
    }

    /// Stoppt die Aufnahme und gibt das Gerät frei
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Wandelt interleavte Geräte-Samples in Mono mit `SAMPLE_RATE`
///
/// Die Leseposition wird zwischen Callbacks in `position` fortgeführt.
fn to_mono_48k(data: &[f32], channels: usize, rate: u32, position: &mut f64) -> Vec<f32> {
    let mono: Vec<f32> = data
        .chunks(channels.max(1))
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();
    if rate == SAMPLE_RATE || mono.is_empty() {
        return mono;
    }

    // Lineare Interpolation
    let step = rate as f64 / SAMPLE_RATE as f64;
    let mut out = Vec::with_capacity((mono.len() as f64 / step) as usize + 1);
    while (*position as usize) < mono.len() {
        let index = *position as usize;
        let next = mono.get(index + 1).copied().unwrap_or(mono[index]);
        let frac = (*position - index as f64) as f32;
        out.push(mono[index] + (next - mono[index]) * frac);
        *position += step;
    }
    *position -= mono.len() as f64;
    out
}

fn build_input_stream(
    track: Arc<LocalTrack>,
    buffer: Arc<CaptureBuffer>,
) -> Result<(cpal::Stream, StreamConfig), MediaError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| MediaError::DeviceUnavailable("no audio input device found".to_string()))?;

    let configs = device.supported_input_configs().map_err(|e| match e {
        cpal::SupportedStreamConfigsError::DeviceNotAvailable => {
            MediaError::DeviceUnavailable(e.to_string())
        }
        other => MediaError::from_backend(other.to_string()),
    })?;
    let config = select_best_config(configs.collect())?;

    let channels = config.channels as usize;
    let rate = config.sample_rate.0;
    let mut position = 0.0f64;

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                // Audio Level berechnen (RMS)
                if !data.is_empty() {
                    let rms = (data.iter().map(|s| s * s).sum::<f32>() / data.len() as f32).sqrt();
                    buffer.set_level(rms.min(1.0));
                }

                if !track.is_enabled() || !track.is_live() {
                    return;
                }

                buffer.push(&to_mono_48k(data, channels, rate, &mut position));
            },
            |err| {
                tracing::error!("Audio capture error: {}", err);
            },
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => {
                MediaError::DeviceUnavailable(e.to_string())
            }
            other => MediaError::from_backend(other.to_string()),
        })?;

    Ok((stream, config))
}

/// Wählt die beste Konfiguration aus einer Liste
///
/// Priorität: F32 mit 48kHz > F32 mit höchster Rate > erste verfügbare.
fn select_best_config(configs: Vec<SupportedStreamConfigRange>) -> Result<StreamConfig, MediaError> {
    let target_rate = cpal::SampleRate(SAMPLE_RATE);

    let f32_configs = configs
        .iter()
        .filter(|c| c.sample_format() == SampleFormat::F32);

    for config in f32_configs.clone() {
        if config.min_sample_rate() <= target_rate && config.max_sample_rate() >= target_rate {
            return Ok(config.clone().with_sample_rate(target_rate).into());
        }
    }

    if let Some(config) = f32_configs.max_by_key(|c| c.max_sample_rate().0) {
        return Ok(config.clone().with_max_sample_rate().into());
    }

    configs
        .first()
        .map(|c| c.clone().with_max_sample_rate().into())
        .ok_or_else(|| {
            MediaError::DeviceUnavailable("no suitable audio configuration found".to_string())
        })
}

// ============================================================================
// TESTS
// ============================================================================
