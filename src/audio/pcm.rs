//! PCM framing between captured f32 samples and the Live API wire format
//!
//! Outbound audio is 16-bit signed little-endian PCM, base64 encoded and tagged
//! with an `audio/pcm;rate=<hz>` mime type. Inbound audio uses the same
//! encoding and is decoded back into f32 playback buffers.

use base64::{engine::general_purpose::STANDARD, Engine};
use thiserror::Error;

use crate::streaming::Blob;

/// Bytes per 16-bit sample
const BYTES_PER_SAMPLE: usize = 2;

/// Errors produced when decoding inbound audio
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("invalid base64 audio payload: {0}")]
    Base64(String),
    #[error("audio payload of {len} bytes is not aligned to {channels} channel(s) of 16-bit samples")]
    Misaligned { len: usize, channels: u16 },
    #[error("invalid audio format: {0}")]
    InvalidFormat(String),
}

/// Wire representation of one captured frame
pub type EncodedChunk = Blob;

/// Decoded audio ready for playback
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackBuffer {
    /// Interleaved samples in [-1.0, 1.0)
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl PlaybackBuffer {
    /// Number of sample frames (samples per channel)
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    /// Duration in seconds
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Collapse to a single channel by averaging
    pub fn into_mono(self) -> Vec<f32> {
        let channels = self.channels.max(1) as usize;
        if channels == 1 {
            return self.samples;
        }
        self.samples
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    }
}

/// Mime type for raw 16-bit PCM at the given rate
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

/// Extract the sample rate from an `audio/pcm;rate=24000` mime type.
pub fn parse_pcm_rate(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .map(str::trim)
        .find_map(|param| param.strip_prefix("rate="))
        .and_then(|rate| rate.trim().parse::<u32>().ok())
        .filter(|&rate| rate > 0)
}

/// Whether a mime type describes raw PCM audio
pub fn is_pcm_audio(mime_type: &str) -> bool {
    mime_type
        .split(';')
        .next()
        .map(|base| base.trim().eq_ignore_ascii_case("audio/pcm"))
        .unwrap_or(false)
}

/// Convert a normalized sample to i16.
///
/// The negative end maps to -32768 and the positive end saturates at 32767, so
/// decoding by dividing by 32768 stays within one quantization step.
pub fn sample_to_i16(sample: f32) -> i16 {
    let clamped = sample.clamp(-1.0, 1.0);
    (clamped * 32768.0)
        .round()
        .clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Convert an i16 sample back to a normalized f32
pub fn i16_to_sample(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// Encode a captured frame as base64 PCM16 tagged with its sample rate.
pub fn encode(frame: &[f32], sample_rate: u32) -> EncodedChunk {
    let bytes: Vec<u8> = frame
        .iter()
        .flat_map(|&s| sample_to_i16(s).to_le_bytes())
        .collect();

    Blob {
        mime_type: pcm_mime_type(sample_rate),
        data: STANDARD.encode(&bytes),
    }
}

/// Reverse the transport's base64 encoding.
pub fn decode(data: &str) -> Result<Vec<u8>, DecodeError> {
    STANDARD
        .decode(data.trim())
        .map_err(|e| DecodeError::Base64(e.to_string()))
}

/// Interpret bytes as interleaved i16 LE PCM and convert to a playback buffer.
pub fn decode_audio_data(
    bytes: &[u8],
    sample_rate: u32,
    channels: u16,
) -> Result<PlaybackBuffer, DecodeError> {
    if channels == 0 {
        return Err(DecodeError::InvalidFormat("zero channels".to_string()));
    }
    if sample_rate == 0 {
        return Err(DecodeError::InvalidFormat("zero sample rate".to_string()));
    }
    if bytes.len() % (BYTES_PER_SAMPLE * channels as usize) != 0 {
        return Err(DecodeError::Misaligned {
            len: bytes.len(),
            channels,
        });
    }

    let samples = bytes
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|pair| i16_to_sample(i16::from_le_bytes([pair[0], pair[1]])))
        .collect();

    Ok(PlaybackBuffer {
        samples,
        sample_rate,
        channels,
    })
}

/// Resample a whole buffer with linear interpolation.
///
/// Returns the input unchanged if either rate is zero or the rates match.
pub fn resample_linear(samples: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == 0 || target_rate == 0 {
        log::warn!(
            "Invalid sample rate (source: {}, target: {}), returning original",
            source_rate,
            target_rate
        );
        return samples.to_vec();
    }
    if source_rate == target_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let mut resampler = LinearResampler::new(source_rate, target_rate);
    let mut out = Vec::with_capacity(
        (samples.len() as u64 * target_rate as u64 / source_rate as u64) as usize + 1,
    );
    resampler.process(samples, &mut out);
    out
}

/// Streaming linear resampler that keeps its phase across calls.
#[derive(Debug, Clone)]
pub struct LinearResampler {
    step: f64,
    /// Position of the next output sample relative to `prev`
    position: f64,
    prev: Option<f32>,
}

impl LinearResampler {
    pub fn new(source_rate: u32, target_rate: u32) -> Self {
        Self {
            step: source_rate.max(1) as f64 / target_rate.max(1) as f64,
            position: 0.0,
            prev: None,
        }
    }

    /// Whether this resampler actually changes the rate
    pub fn is_passthrough(&self) -> bool {
        (self.step - 1.0).abs() < f64::EPSILON
    }

    /// Resample `input` and append results to `out`.
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) {
        if self.is_passthrough() {
            out.extend_from_slice(input);
            return;
        }

        for &next in input {
            let Some(prev) = self.prev else {
                self.prev = Some(next);
                out.push(next);
                self.position = self.step;
                continue;
            };

            // Emit every output point that falls between prev and next
            while self.position <= 1.0 {
                let t = self.position as f32;
                out.push(prev + (next - prev) * t);
                self.position += self.step;
            }
            self.position -= 1.0;
            self.prev = Some(next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_to_i16() {
        assert_eq!(sample_to_i16(0.0), 0);
        assert_eq!(sample_to_i16(1.0), i16::MAX);
        assert_eq!(sample_to_i16(-1.0), i16::MIN);

        // Clamping
        assert_eq!(sample_to_i16(2.0), i16::MAX);
        assert_eq!(sample_to_i16(-2.0), i16::MIN);

        // NaN encodes as silence
        assert_eq!(sample_to_i16(f32::NAN), 0);
    }

    #[test]
    fn test_encode_little_endian() {
        let chunk = encode(&[0.5, -0.5], 16000);
        let bytes = STANDARD.decode(&chunk.data).unwrap();

        // 0.5 * 32768 = 16384 = 0x4000, -16384 = 0xC000
        assert_eq!(bytes, vec![0x00, 0x40, 0x00, 0xC0]);
        assert_eq!(chunk.mime_type, "audio/pcm;rate=16000");
    }

    #[test]
    fn test_encode_length_is_twice_frame_length() {
        for len in [0usize, 1, 7, 4096] {
            let frame: Vec<f32> = (0..len).map(|i| (i as f32 / 100.0).sin()).collect();
            let chunk = encode(&frame, 16000);
            let bytes = decode(&chunk.data).unwrap();
            assert_eq!(bytes.len(), 2 * len);
        }
    }

    #[test]
    fn test_round_trip_within_quantization_error() {
        let frame: Vec<f32> = (0..4096)
            .map(|i| ((i as f32) / 4095.0) * 2.0 - 1.0)
            .collect();

        let chunk = encode(&frame, 16000);
        let bytes = decode(&chunk.data).unwrap();
        let buffer = decode_audio_data(&bytes, 16000, 1).unwrap();

        assert_eq!(buffer.samples.len(), frame.len());
        for (original, decoded) in frame.iter().zip(buffer.samples.iter()) {
            assert!(
                (original - decoded).abs() <= 1.0 / 32768.0 + f32::EPSILON,
                "sample {} decoded as {}",
                original,
                decoded
            );
        }
    }

    #[test]
    fn test_decode_audio_data_duration() {
        let bytes = vec![0u8; 48000]; // 24000 samples
        let buffer = decode_audio_data(&bytes, 24000, 1).unwrap();
        assert_eq!(buffer.frames(), 24000);
        assert!((buffer.duration() - 1.0).abs() < 1e-9);

        let stereo = decode_audio_data(&bytes, 24000, 2).unwrap();
        assert_eq!(stereo.frames(), 12000);
        assert!((stereo.duration() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_decode_audio_data_rejects_misaligned() {
        assert_eq!(
            decode_audio_data(&[0u8; 3], 24000, 1),
            Err(DecodeError::Misaligned {
                len: 3,
                channels: 1
            })
        );
        assert!(matches!(
            decode_audio_data(&[0u8; 6], 24000, 2),
            Err(DecodeError::Misaligned { .. })
        ));
        assert!(decode_audio_data(&[0u8; 4], 0, 1).is_err());
        assert!(decode_audio_data(&[0u8; 4], 24000, 0).is_err());
    }

    #[test]
    fn test_decode_rejects_bad_base64() {
        assert!(matches!(decode("not base64!!"), Err(DecodeError::Base64(_))));
    }

    #[test]
    fn test_parse_pcm_rate() {
        assert_eq!(parse_pcm_rate("audio/pcm;rate=24000"), Some(24000));
        assert_eq!(parse_pcm_rate("audio/pcm; rate=16000"), Some(16000));
        assert_eq!(parse_pcm_rate("audio/pcm"), None);
        assert_eq!(parse_pcm_rate("audio/pcm;rate=abc"), None);
        assert_eq!(parse_pcm_rate("audio/pcm;rate=0"), None);
    }

    #[test]
    fn test_is_pcm_audio() {
        assert!(is_pcm_audio("audio/pcm;rate=24000"));
        assert!(is_pcm_audio("audio/PCM"));
        assert!(!is_pcm_audio("image/png"));
    }

    #[test]
    fn test_into_mono_averages_channels() {
        let buffer = PlaybackBuffer {
            samples: vec![0.2, 0.4, -0.5, 0.5],
            sample_rate: 24000,
            channels: 2,
        };
        let mono = buffer.into_mono();
        assert_eq!(mono.len(), 2);
        assert!((mono[0] - 0.3).abs() < 1e-6);
        assert!(mono[1].abs() < 1e-6);
    }

    #[test]
    fn test_resample_same_rate() {
        let input = vec![0.1f32, 0.2, 0.3];
        assert_eq!(resample_linear(&input, 24000, 24000), input);
    }

    #[test]
    fn test_resample_zero_rate() {
        let input = vec![0.1f32, 0.2, 0.3];
        assert_eq!(resample_linear(&input, 0, 24000), input);
        assert_eq!(resample_linear(&input, 48000, 0), input);
    }

    #[test]
    fn test_resample_downsample_length() {
        // 48kHz -> 16kHz is a 3:1 ratio
        let input: Vec<f32> = (0..4800).map(|i| (i as f32 / 50.0).sin()).collect();
        let output = resample_linear(&input, 48000, 16000);
        assert!((output.len() as i64 - 1600).abs() <= 1, "got {}", output.len());
    }

    #[test]
    fn test_resample_upsample_interpolates() {
        let output = resample_linear(&[0.0, 1.0], 1, 2);
        // 0.0, 0.5, 1.0
        assert_eq!(output.len(), 3);
        assert!((output[1] - 0.5).abs() < 1e-6);
        assert!((output[2] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_streaming_resampler_matches_batch() {
        let input: Vec<f32> = (0..3000).map(|i| (i as f32 / 30.0).sin()).collect();
        let batch = resample_linear(&input, 44100, 16000);

        let mut resampler = LinearResampler::new(44100, 16000);
        let mut streamed = Vec::new();
        for chunk in input.chunks(441) {
            resampler.process(chunk, &mut streamed);
        }

        assert_eq!(batch.len(), streamed.len());
        for (a, b) in batch.iter().zip(streamed.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }
}
