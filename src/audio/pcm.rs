//! PCM16 codec for the live audio stream
//!
//! Outbound microphone audio and inbound model speech both travel as
//! base64-wrapped, little-endian, signed 16-bit PCM. This module converts
//! between that wire form and floating point samples.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

/// Sample rate of microphone audio sent to the model
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of model speech received from the stream
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Scale between f32 [-1, 1] and i16
const PCM16_SCALE: f32 = 32768.0;

/// Errors that can occur while decoding inbound audio
#[derive(Debug, Clone, PartialEq)]
pub enum CodecError {
    /// Base64 payload had an invalid alphabet or padding
    MalformedInput(String),
    /// Byte length is not a whole number of PCM16 frames
    InvalidBufferLength { len: usize, channels: u16 },
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::MalformedInput(e) => write!(f, "Malformed base64 audio: {}", e),
            CodecError::InvalidBufferLength { len, channels } => write!(
                f,
                "PCM16 buffer of {} bytes is not a multiple of {} ({} channel(s))",
                len,
                2 * *channels as usize,
                channels
            ),
        }
    }
}

impl std::error::Error for CodecError {}

/// A base64 media payload tagged with its MIME descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaBlob {
    pub mime_type: String,
    pub data: String,
}

/// An immutable block of mono PCM16 samples
#[derive(Debug, Clone)]
pub struct AudioFrame {
    samples: Arc<[i16]>,
    sample_rate: u32,
}

impl AudioFrame {
    /// Quantize float samples into a frame
    pub fn from_samples(samples: &[f32], sample_rate: u32) -> Self {
        let samples: Vec<i16> = samples.iter().map(|&s| quantize(s)).collect();
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Little-endian byte serialization
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    /// Wire representation: `audio/pcm;rate=N` plus base64 payload
    pub fn to_media_blob(&self) -> MediaBlob {
        MediaBlob {
            mime_type: pcm_mime_type(self.sample_rate),
            data: STANDARD.encode(self.to_le_bytes()),
        }
    }
}

/// Decoded, playable audio in planar f32 layout
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    sample_rate: u32,
    channels: Vec<Vec<f32>>,
}

impl AudioBuffer {
    pub fn new(sample_rate: u32, channels: Vec<Vec<f32>>) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Frames per channel
    pub fn frames(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        self.channels.get(index).map(Vec::as_slice)
    }

    /// Duration in seconds
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Average of all channels, for mono playback
    pub fn mixdown(&self) -> Vec<f32> {
        let count = self.channels.len();
        match count {
            0 => Vec::new(),
            1 => self.channels[0].clone(),
            _ => (0..self.frames())
                .map(|i| self.channels.iter().map(|c| c[i]).sum::<f32>() / count as f32)
                .collect(),
        }
    }
}

/// Convert one float sample to i16, clamping out-of-range input
fn quantize(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    (sample * PCM16_SCALE)
        .round()
        .clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Encode float samples as PCM16 little-endian bytes (`2 * len` bytes)
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&s| quantize(s).to_le_bytes())
        .collect()
}

/// Standard base64 decoding of an inbound payload
pub fn decode_base64(text: &str) -> Result<Vec<u8>, CodecError> {
    STANDARD
        .decode(text)
        .map_err(|e| CodecError::MalformedInput(e.to_string()))
}

/// Reinterpret interleaved PCM16 LE bytes as a planar float buffer
pub fn bytes_to_audio_buffer(
    bytes: &[u8],
    sample_rate: u32,
    channel_count: u16,
) -> Result<AudioBuffer, CodecError> {
    let stride = 2 * channel_count as usize;
    if stride == 0 || bytes.len() % stride != 0 {
        return Err(CodecError::InvalidBufferLength {
            len: bytes.len(),
            channels: channel_count,
        });
    }

    let frames = bytes.len() / stride;
    let mut channels = vec![Vec::with_capacity(frames); channel_count as usize];

    for (i, pair) in bytes.chunks_exact(2).enumerate() {
        let sample = i16::from_le_bytes([pair[0], pair[1]]);
        channels[i % channel_count as usize].push(sample as f32 / PCM16_SCALE);
    }

    Ok(AudioBuffer::new(sample_rate, channels))
}

/// MIME descriptor for raw PCM at the given rate
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

/// Extract the `rate=` parameter from a PCM MIME descriptor
pub fn parse_pcm_rate(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .filter_map(|part| part.trim().strip_prefix("rate="))
        .find_map(|rate| rate.trim().parse::<u32>().ok().filter(|r| *r > 0))
}
