//! Microphone capture sliced into fixed-size frames
//!
//! The cpal callback down-mixes to mono, resamples to the session input rate
//! and accumulates samples until a full frame is ready. Each frame is handed to
//! the [`FrameSink`] on the device thread; encoding and sending happen in the
//! session loop.

use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{Device, Sample, SampleFormat, SizedSample, StreamConfig};

use super::device_thread::DeviceThread;
use super::pcm::LinearResampler;
use super::{classify_build_error, AudioError, FrameSink, InputDevice};

/// Upper bound of the visualization scale
pub const MAX_VOLUME: f32 = 100.0;

/// Capture parameters for one session
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureConfig {
    /// Rate the remote endpoint expects (16kHz)
    pub sample_rate: u32,
    /// Samples per frame (4096)
    pub frame_size: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            frame_size: 4096,
        }
    }
}

/// Root-mean-square amplitude of a frame mapped to 0..=100.
pub fn frame_volume(frame: &[f32], gain: f32) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = frame
        .iter()
        .map(|&s| {
            let s = if s.is_finite() { s as f64 } else { 0.0 };
            s * s
        })
        .sum();
    let rms = (sum_squares / frame.len() as f64).sqrt() as f32;

    (rms * gain).clamp(0.0, MAX_VOLUME)
}

/// Accumulates arbitrary callback buffers into fixed-size frames
#[derive(Debug)]
pub struct FrameAccumulator {
    buffer: Vec<f32>,
    frame_size: usize,
}

impl FrameAccumulator {
    pub fn new(frame_size: usize) -> Self {
        let frame_size = frame_size.max(1);
        Self {
            buffer: Vec::with_capacity(frame_size * 2),
            frame_size,
        }
    }

    /// Add samples and pass every completed frame to `emit`, in order.
    pub fn push(&mut self, samples: &[f32], mut emit: impl FnMut(Vec<f32>)) {
        self.buffer.extend_from_slice(samples);

        while self.buffer.len() >= self.frame_size {
            let frame: Vec<f32> = self.buffer.drain(..self.frame_size).collect();
            emit(frame);
        }
    }

    /// Samples waiting for the next frame
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// Per-stream processing state living inside the cpal callback
struct CaptureProcessor {
    channels: usize,
    resampler: LinearResampler,
    accumulator: FrameAccumulator,
    mono: Vec<f32>,
    resampled: Vec<f32>,
    sink: FrameSink,
}

impl CaptureProcessor {
    fn new(channels: u16, device_rate: u32, config: CaptureConfig, sink: FrameSink) -> Self {
        Self {
            channels: channels.max(1) as usize,
            resampler: LinearResampler::new(device_rate, config.sample_rate),
            accumulator: FrameAccumulator::new(config.frame_size),
            mono: Vec::new(),
            resampled: Vec::new(),
            sink,
        }
    }

    fn process<T>(&mut self, data: &[T])
    where
        T: SizedSample,
        f32: cpal::FromSample<T>,
    {
        self.mono.clear();
        self.mono.extend(data.chunks(self.channels).map(|frame| {
            frame.iter().map(|&s| f32::from_sample(s)).sum::<f32>() / frame.len() as f32
        }));

        self.resampled.clear();
        self.resampler.process(&self.mono, &mut self.resampled);

        let sink = &mut self.sink;
        self.accumulator.push(&self.resampled, |frame| sink(frame));
    }
}

/// Microphone input on the default cpal device.
pub struct CpalInput {
    thread: DeviceThread,
}

impl CpalInput {
    /// Open the default input device. The stream stays paused until `start()`.
    pub fn open(config: CaptureConfig, sink: FrameSink) -> Result<Self, AudioError> {
        let thread = DeviceThread::spawn(
            "live-capture",
            move || build_capture_stream(config, sink),
            false,
        )?;
        Ok(Self { thread })
    }
}

impl InputDevice for CpalInput {
    fn start(&mut self) -> Result<(), AudioError> {
        self.thread.play()
    }

    fn close(&mut self) {
        if !self.thread.is_closed() {
            log::info!("Capture: stopping microphone");
        }
        self.thread.close();
    }
}

/// Pick a config at the session rate if the device supports it, else its default.
fn select_input_config(
    device: &Device,
    sample_rate: u32,
) -> Result<(StreamConfig, SampleFormat), AudioError> {
    let target = cpal::SampleRate(sample_rate);

    if let Ok(ranges) = device.supported_input_configs() {
        let mut candidates: Vec<_> = ranges
            .filter(|r| r.min_sample_rate() <= target && target <= r.max_sample_rate())
            .filter(|r| {
                matches!(
                    r.sample_format(),
                    SampleFormat::F32 | SampleFormat::I16 | SampleFormat::U16
                )
            })
            .collect();
        // Prefer mono, then f32
        candidates.sort_by_key(|r| (r.channels(), r.sample_format() != SampleFormat::F32));

        if let Some(range) = candidates.into_iter().next() {
            let supported = range.with_sample_rate(target);
            let format = supported.sample_format();
            return Ok((supported.into(), format));
        }
    }

    let supported = device
        .default_input_config()
        .map_err(|e| AudioError::NoSupportedConfig(e.to_string()))?;
    let format = supported.sample_format();
    Ok((supported.into(), format))
}

fn build_capture_stream(config: CaptureConfig, sink: FrameSink) -> Result<cpal::Stream, AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(AudioError::NoInputDevice)?;

    log::info!("Using audio input device: {:?}", device.name());

    let (stream_config, sample_format) = select_input_config(&device, config.sample_rate)?;

    log::info!(
        "Capture config: {} Hz, {} channels, {:?} -> {} Hz mono, {} sample frames",
        stream_config.sample_rate.0,
        stream_config.channels,
        sample_format,
        config.sample_rate,
        config.frame_size
    );

    let processor = CaptureProcessor::new(
        stream_config.channels,
        stream_config.sample_rate.0,
        config,
        sink,
    );

    match sample_format {
        SampleFormat::F32 => build_stream_typed::<f32>(&device, &stream_config, processor),
        SampleFormat::I16 => build_stream_typed::<i16>(&device, &stream_config, processor),
        SampleFormat::U16 => build_stream_typed::<u16>(&device, &stream_config, processor),
        other => Err(AudioError::NoSupportedConfig(format!(
            "unsupported sample format {:?}",
            other
        ))),
    }
}

fn build_stream_typed<T>(
    device: &Device,
    config: &StreamConfig,
    mut processor: CaptureProcessor,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    let err_fn = |err| log::error!("Audio input stream error: {}", err);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| processor.process(data),
            err_fn,
            None,
        )
        .map_err(classify_build_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_silent_frame_volume_is_zero() {
        assert_eq!(frame_volume(&[0.0; 4096], 1000.0), 0.0);
        assert_eq!(frame_volume(&[], 1000.0), 0.0);
    }

    #[test]
    fn test_volume_scales_and_clamps() {
        // RMS of a constant 0.05 signal is 0.05 -> 50
        let volume = frame_volume(&[0.05; 4096], 1000.0);
        assert!((volume - 50.0).abs() < 1e-3, "got {}", volume);

        // Loud input saturates at the top of the scale
        assert_eq!(frame_volume(&[0.9; 4096], 1000.0), MAX_VOLUME);
    }

    #[test]
    fn test_volume_ignores_non_finite_samples() {
        let mut frame = vec![0.0f32; 16];
        frame[3] = f32::NAN;
        frame[7] = f32::INFINITY;
        assert_eq!(frame_volume(&frame, 1000.0), 0.0);
    }

    #[test]
    fn test_accumulator_emits_fixed_frames() {
        let mut acc = FrameAccumulator::new(4);
        let mut frames = Vec::new();

        acc.push(&[1.0, 2.0, 3.0], |f| frames.push(f));
        assert!(frames.is_empty());
        assert_eq!(acc.pending(), 3);

        acc.push(&[4.0, 5.0, 6.0, 7.0, 8.0, 9.0], |f| frames.push(f));
        assert_eq!(frames, vec![vec![1.0, 2.0, 3.0, 4.0], vec![5.0, 6.0, 7.0, 8.0]]);
        assert_eq!(acc.pending(), 1);

        acc.clear();
        assert_eq!(acc.pending(), 0);
    }

    #[test]
    fn test_processor_downmixes_and_frames() {
        let frames: Arc<Mutex<Vec<Vec<f32>>>> = Arc::new(Mutex::new(Vec::new()));
        let captured = frames.clone();
        let sink: FrameSink = Box::new(move |frame| captured.lock().unwrap().push(frame));

        let config = CaptureConfig {
            sample_rate: 16_000,
            frame_size: 4,
        };
        let mut processor = CaptureProcessor::new(2, 16_000, config, sink);

        // Stereo pairs average to 0.5, 0.0, -0.5, 0.25
        processor.process::<f32>(&[0.5, 0.5, 1.0, -1.0, -0.5, -0.5, 0.0, 0.5]);

        let frames = frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], vec![0.5, 0.0, -0.5, 0.25]);
    }

    #[test]
    fn test_processor_converts_integer_samples() {
        let frames: Arc<Mutex<Vec<Vec<f32>>>> = Arc::new(Mutex::new(Vec::new()));
        let captured = frames.clone();
        let sink: FrameSink = Box::new(move |frame| captured.lock().unwrap().push(frame));

        let config = CaptureConfig {
            sample_rate: 16_000,
            frame_size: 2,
        };
        let mut processor = CaptureProcessor::new(1, 16_000, config, sink);
        processor.process::<i16>(&[0, i16::MIN]);

        let frames = frames.lock().unwrap();
        assert_eq!(frames[0], vec![0.0, -1.0]);
    }
}
