//! cpal output device with a sample clock and scheduled voices
//!
//! The output stream runs continuously from open to close. Its clock is the
//! number of frames rendered so far; scheduled buffers become voices that are
//! mixed in from their start frame. A voice that runs to its end is removed by
//! the callback and reported through the [`EndedNotifier`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{Device, FromSample, SampleFormat, SizedSample, StreamConfig};

use super::device_thread::DeviceThread;
use super::pcm::{resample_linear, PlaybackBuffer};
use super::playback::BufferId;
use super::{classify_build_error, AudioError, EndedNotifier, OutputDevice};

#[derive(Debug)]
struct Voice {
    id: BufferId,
    start_frame: u64,
    samples: Vec<f32>,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Output frame at which `seconds` on the output clock begins
fn time_to_frame(seconds: f64, rate: u32) -> u64 {
    (seconds.max(0.0) * rate as f64).round() as u64
}

/// State shared between the control side and the audio callback
struct Mixer {
    voices: Mutex<Vec<Voice>>,
    /// Frames rendered since the stream started
    clock: AtomicU64,
    ended: EndedNotifier,
}

impl Mixer {
    fn new(ended: EndedNotifier) -> Self {
        Self {
            voices: Mutex::new(Vec::new()),
            clock: AtomicU64::new(0),
            ended,
        }
    }

    /// Add a voice covering exactly the frames `[when, when + duration)`.
    ///
    /// Resampling can shorten a buffer by a frame; the voice is padded with its
    /// last sample (or trimmed) so consecutive buffers meet without a hole.
    fn place(&self, id: BufferId, buffer: PlaybackBuffer, when: f64, device_rate: u32) {
        let duration = buffer.duration();
        let source_rate = buffer.sample_rate;
        let mut samples = resample_linear(&buffer.into_mono(), source_rate, device_rate);

        let first = time_to_frame(when, device_rate);
        let frames = time_to_frame(when + duration, device_rate).saturating_sub(first) as usize;
        let tail = samples.last().copied().unwrap_or(0.0);
        samples.resize(frames, tail);

        match self.voices.lock() {
            Ok(mut voices) => {
                let now = self.clock.load(Ordering::Acquire);
                voices.push(Voice {
                    id,
                    start_frame: first.max(now),
                    samples,
                });
            }
            Err(_) => log::error!("Playback: mixer lock poisoned, dropping buffer {}", id),
        }
    }

    /// Render one callback buffer of interleaved output.
    fn render<T>(&self, data: &mut [T], channels: usize)
    where
        T: SizedSample + FromSample<f32>,
    {
        let channels = channels.max(1);
        let frames = (data.len() / channels) as u64;
        let base = self.clock.load(Ordering::Acquire);
        let end = base + frames;
        let mut finished = Vec::new();

        match self.voices.lock() {
            Ok(mut voices) => {
                for (offset, frame) in data.chunks_mut(channels).enumerate() {
                    let t = base + offset as u64;
                    let mut mix = 0.0f32;
                    for voice in voices.iter() {
                        if t >= voice.start_frame {
                            if let Some(&s) = voice.samples.get((t - voice.start_frame) as usize) {
                                mix += s;
                            }
                        }
                    }
                    let value = T::from_sample(mix.clamp(-1.0, 1.0));
                    for out in frame.iter_mut() {
                        *out = value;
                    }
                }

                voices.retain(|voice| {
                    let done = voice.end_frame() <= end;
                    if done {
                        finished.push(voice.id);
                    }
                    !done
                });

                // Advance the clock while still holding the lock so a voice
                // placed concurrently never lands in the rendered window
                self.clock.store(end, Ordering::Release);
            }
            Err(_) => {
                let silence = T::from_sample(0.0f32);
                data.iter_mut().for_each(|s| *s = silence);
                self.clock.store(end, Ordering::Release);
            }
        }

        for id in finished {
            (self.ended)(id);
        }
    }
}

/// Speaker output on the default cpal device.
pub struct CpalOutput {
    mixer: Arc<Mixer>,
    device_rate: u32,
    thread: DeviceThread,
}

impl CpalOutput {
    /// Open the default output device, preferring `sample_rate`.
    pub fn open(sample_rate: u32, ended: EndedNotifier) -> Result<Self, AudioError> {
        let mixer = Arc::new(Mixer::new(ended));
        let (rate_tx, rate_rx) = std::sync::mpsc::sync_channel::<u32>(1);

        let stream_mixer = mixer.clone();
        let thread = DeviceThread::spawn(
            "live-playback",
            move || {
                let (stream, rate) = build_playback_stream(sample_rate, stream_mixer)?;
                let _ = rate_tx.send(rate);
                Ok(stream)
            },
            true,
        )?;

        let device_rate = rate_rx.recv().unwrap_or(sample_rate);

        Ok(Self {
            mixer,
            device_rate,
            thread,
        })
    }
}

impl OutputDevice for CpalOutput {
    fn current_time(&self) -> f64 {
        self.mixer.clock.load(Ordering::Acquire) as f64 / self.device_rate as f64
    }

    fn start(&mut self, id: BufferId, buffer: PlaybackBuffer, when: f64) {
        if self.thread.is_closed() {
            log::debug!("Playback: ignoring buffer {} on closed output", id);
            return;
        }

        self.mixer.place(id, buffer, when, self.device_rate);
    }

    fn stop(&mut self, id: BufferId) {
        if let Ok(mut voices) = self.mixer.voices.lock() {
            voices.retain(|voice| voice.id != id);
        }
    }

    fn close(&mut self) {
        if !self.thread.is_closed() {
            log::info!("Playback: closing output device");
        }
        if let Ok(mut voices) = self.mixer.voices.lock() {
            voices.clear();
        }
        self.thread.close();
    }
}

fn select_output_config(
    device: &Device,
    sample_rate: u32,
) -> Result<(StreamConfig, SampleFormat), AudioError> {
    let target = cpal::SampleRate(sample_rate);

    if let Ok(ranges) = device.supported_output_configs() {
        let mut candidates: Vec<_> = ranges
            .filter(|r| r.min_sample_rate() <= target && target <= r.max_sample_rate())
            .filter(|r| {
                matches!(
                    r.sample_format(),
                    SampleFormat::F32 | SampleFormat::I16 | SampleFormat::U16
                )
            })
            .collect();
        candidates.sort_by_key(|r| (r.sample_format() != SampleFormat::F32, r.channels()));

        if let Some(range) = candidates.into_iter().next() {
            let supported = range.with_sample_rate(target);
            let format = supported.sample_format();
            return Ok((supported.into(), format));
        }
    }

    let supported = device
        .default_output_config()
        .map_err(|e| AudioError::NoSupportedConfig(e.to_string()))?;
    let format = supported.sample_format();
    Ok((supported.into(), format))
}

fn build_playback_stream(
    sample_rate: u32,
    mixer: Arc<Mixer>,
) -> Result<(cpal::Stream, u32), AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(AudioError::NoOutputDevice)?;

    log::info!("Using audio output device: {:?}", device.name());

    let (config, sample_format) = select_output_config(&device, sample_rate)?;
    let device_rate = config.sample_rate.0;

    log::info!(
        "Playback config: {} Hz, {} channels, {:?}",
        device_rate,
        config.channels,
        sample_format
    );

    let stream = match sample_format {
        SampleFormat::F32 => build_stream_typed::<f32>(&device, &config, mixer),
        SampleFormat::I16 => build_stream_typed::<i16>(&device, &config, mixer),
        SampleFormat::U16 => build_stream_typed::<u16>(&device, &config, mixer),
        other => Err(AudioError::NoSupportedConfig(format!(
            "unsupported sample format {:?}",
            other
        ))),
    }?;

    Ok((stream, device_rate))
}

fn build_stream_typed<T>(
    device: &Device,
    config: &StreamConfig,
    mixer: Arc<Mixer>,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample + FromSample<f32> + Send + 'static,
{
    let channels = config.channels as usize;
    let err_fn = |err| log::error!("Audio output stream error: {}", err);

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| mixer.render(data, channels),
            err_fn,
            None,
        )
        .map_err(classify_build_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording_mixer() -> (Mixer, Arc<Mutex<Vec<BufferId>>>) {
        let ended = Arc::new(Mutex::new(Vec::new()));
        let sink = ended.clone();
        let notifier: EndedNotifier = Arc::new(move |id| sink.lock().unwrap().push(id));
        (Mixer::new(notifier), ended)
    }

    #[test]
    fn test_render_plays_voice_from_start_frame() {
        let (mixer, ended) = recording_mixer();
        mixer.voices.lock().unwrap().push(Voice {
            id: BufferId(1),
            start_frame: 2,
            samples: vec![0.5, 0.25],
        });

        let mut out = vec![0.0f32; 6];
        mixer.render(&mut out, 1);

        assert_eq!(out, vec![0.0, 0.0, 0.5, 0.25, 0.0, 0.0]);
        assert_eq!(mixer.clock.load(Ordering::Acquire), 6);
        assert_eq!(*ended.lock().unwrap(), vec![BufferId(1)]);
        assert!(mixer.voices.lock().unwrap().is_empty());
    }

    #[test]
    fn test_render_duplicates_across_channels() {
        let (mixer, _ended) = recording_mixer();
        mixer.voices.lock().unwrap().push(Voice {
            id: BufferId(1),
            start_frame: 0,
            samples: vec![0.5],
        });

        let mut out = vec![0.0f32; 4];
        mixer.render(&mut out, 2);
        assert_eq!(out, vec![0.5, 0.5, 0.0, 0.0]);
    }

    #[test]
    fn test_voice_spanning_callbacks_ends_once() {
        let (mixer, ended) = recording_mixer();
        mixer.voices.lock().unwrap().push(Voice {
            id: BufferId(7),
            start_frame: 0,
            samples: vec![0.1; 5],
        });

        let mut out = vec![0.0f32; 4];
        mixer.render(&mut out, 1);
        assert!(ended.lock().unwrap().is_empty());

        mixer.render(&mut out, 1);
        assert_eq!(out[0], 0.1);
        assert_eq!(out[1], 0.0);
        assert_eq!(*ended.lock().unwrap(), vec![BufferId(7)]);
    }

    #[test]
    fn test_render_integer_output() {
        let (mixer, _ended) = recording_mixer();
        mixer.voices.lock().unwrap().push(Voice {
            id: BufferId(1),
            start_frame: 0,
            samples: vec![2.0],
        });

        let mut out = vec![0i16; 1];
        mixer.render(&mut out, 1);
        assert_eq!(out[0], i16::MAX);
    }

    fn constant(value: f32, frames: usize, sample_rate: u32) -> PlaybackBuffer {
        PlaybackBuffer {
            samples: vec![value; frames],
            sample_rate,
            channels: 1,
        }
    }

    #[test]
    fn test_resampled_voices_play_back_to_back() {
        for device_rate in [48_000, 44_100] {
            let (mixer, ended) = recording_mixer();

            // Three 40ms chunks at 24kHz, scheduled back to back
            let mut when = 0.0;
            for id in 0..3 {
                let buffer = constant(0.5, 960, 24_000);
                let duration = buffer.duration();
                mixer.place(BufferId(id), buffer, when, device_rate);
                when += duration;
            }

            let span = time_to_frame(when, device_rate) as usize;
            let mut out = vec![0.0f32; span + 8];
            mixer.render(&mut out, 1);

            let holes: Vec<usize> = (0..span).filter(|&i| (out[i] - 0.5).abs() > 1e-6).collect();
            assert!(holes.is_empty(), "{} Hz: silent frames at {:?}", device_rate, holes);
            assert!(out[span..].iter().all(|&s| s == 0.0));
            assert_eq!(ended.lock().unwrap().len(), 3);
        }
    }

    #[test]
    fn test_place_never_starts_before_rendered_clock() {
        let (mixer, _ended) = recording_mixer();
        let mut out = vec![0.0f32; 10];
        mixer.render(&mut out, 1);

        mixer.place(BufferId(1), constant(0.25, 4, 24_000), 0.0, 24_000);
        let voices = mixer.voices.lock().unwrap();
        assert_eq!(voices[0].start_frame, 10);
        assert_eq!(voices[0].samples.len(), 4);
    }

    #[test]
    fn test_place_matches_native_rate_length() {
        let (mixer, _ended) = recording_mixer();
        mixer.place(BufferId(1), constant(0.1, 240, 24_000), 0.5, 24_000);
        let voices = mixer.voices.lock().unwrap();
        assert_eq!(voices[0].start_frame, 12_000);
        assert_eq!(voices[0].samples.len(), 240);
    }
}
