//! Narration playback.
//!
//! Speech arrives as base64-encoded raw PCM: signed 16-bit little-endian,
//! mono, 24 kHz, no container header. [`decode_pcm`] turns it into normalized
//! `f32` samples without touching any audio device. [`Player`] drives a
//! single playback stream over an [`AudioSink`] with toggle semantics.

use std::future::Future;
use std::sync::Arc;

use base64::Engine;

pub const SAMPLE_RATE: u32 = 24_000;
pub const CHANNELS: u16 = 1;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum AudioError {
    #[error("invalid base64 audio: {0}")]
    InvalidBase64(String),
    #[error("audio payload has an odd number of bytes ({0})")]
    TruncatedSample(usize),
    #[error("no audio available for this story")]
    Unavailable,
    #[error("audio device error: {0}")]
    Device(String),
}

/// Decoded mono buffer ready for a playback device.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBuffer {
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<f32>,
}

impl PcmBuffer {
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    pub fn duration_secs(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }
}

/// Decode base64 PCM into samples in `[-1.0, 1.0)`.
pub fn decode_pcm(encoded: &str) -> Result<PcmBuffer, AudioError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| AudioError::InvalidBase64(e.to_string()))?;
    pcm_from_bytes(&bytes)
}

pub fn pcm_from_bytes(bytes: &[u8]) -> Result<PcmBuffer, AudioError> {
    if bytes.len() % 2 != 0 {
        return Err(AudioError::TruncatedSample(bytes.len()));
    }
    let samples = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect();
    Ok(PcmBuffer {
        sample_rate: SAMPLE_RATE,
        channels: CHANNELS,
        samples,
    })
}

/// Output device seam. Implementations own whatever handle the platform
/// needs; `stop` must be safe to call when nothing is playing.
pub trait AudioSink {
    fn start(&mut self, buffer: Arc<PcmBuffer>) -> Result<(), AudioError>;
    fn stop(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Loading,
    Playing,
}

/// Single-stream player. Audio is fetched and decoded at most once per
/// player; the decoded buffer is reused for later plays. Dropping the player
/// stops any audible stream.
pub struct Player<S: AudioSink> {
    sink: S,
    state: PlaybackState,
    buffer: Option<Arc<PcmBuffer>>,
    last_error: Option<AudioError>,
}

impl<S: AudioSink> Player<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            state: PlaybackState::Idle,
            buffer: None,
            last_error: None,
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn last_error(&self) -> Option<&AudioError> {
        self.last_error.as_ref()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Play when idle, stop when playing. `fetch` yields the base64 PCM and
    /// is only awaited when no decoded buffer is cached yet.
    pub async fn toggle<F, Fut>(&mut self, fetch: F) -> Result<PlaybackState, AudioError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Option<String>>,
    {
        match self.state {
            PlaybackState::Playing => {
                self.sink.stop();
                self.state = PlaybackState::Idle;
                return Ok(self.state);
            }
            // A load is already in flight; toggling again is a no-op.
            PlaybackState::Loading => return Ok(self.state),
            PlaybackState::Idle => {}
        }

        self.state = PlaybackState::Loading;
        self.last_error = None;
        match self.load_and_start(fetch).await {
            Ok(()) => {
                self.state = PlaybackState::Playing;
                Ok(self.state)
            }
            Err(err) => {
                tracing::warn!(error = %err, "narration playback failed");
                self.state = PlaybackState::Idle;
                self.last_error = Some(err.clone());
                Err(err)
            }
        }
    }

    async fn load_and_start<F, Fut>(&mut self, fetch: F) -> Result<(), AudioError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Option<String>>,
    {
        let buffer = match &self.buffer {
            Some(buffer) => buffer.clone(),
            None => {
                let encoded = fetch().await.ok_or(AudioError::Unavailable)?;
                let decoded = Arc::new(decode_pcm(&encoded)?);
                self.buffer = Some(decoded.clone());
                decoded
            }
        };
        self.sink.start(buffer)
    }

    /// The device reached the end of the buffer.
    pub fn finished(&mut self) {
        if self.state == PlaybackState::Playing {
            self.state = PlaybackState::Idle;
        }
    }
}

impl<S: AudioSink> Drop for Player<S> {
    fn drop(&mut self) {
        if self.state == PlaybackState::Playing {
            self.sink.stop();
        }
    }
}
