//! Simulated loudspeaker and microphone sharing one room.
//!
//! Audio written to the speaker is converted to the microphone format,
//! attenuated, and queued behind `echo_delay_ms` of silence in a
//! [`RingByteBuffer`]. The microphone reads that echo back one frame at a
//! time, optionally mixed with a near-end tone. Both devices block like real
//! hardware so the session runs in real time.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::Mutex;

use crate::audio::format::{i16_to_le_bytes, le_bytes_to_i16};
use crate::audio::{
    AudioFormat, CaptureDevice, FrameResampler, PlaybackDevice, Resampler, RingByteBuffer,
};
use crate::config::SimulationConfig;

/// Headroom kept in the echo path beyond the configured delay.
const ECHO_HEADROOM_MS: u32 = 500;

/// Running energy of the echo reaching the microphone.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct MicLevels {
    pub echo_energy: f64,
    pub capture_energy: f64,
    pub samples: u64,
}

/// Shared handle for reading and resetting the microphone levels.
#[derive(Clone, Default)]
pub struct RoomMeter {
    levels: Arc<Mutex<MicLevels>>,
}

impl RoomMeter {
    /// Levels accumulated since the previous call.
    pub fn take(&self) -> MicLevels {
        std::mem::take(&mut *self.levels.lock())
    }
}

pub struct SimulatedRoom {
    speaker: SimulatedSpeaker,
    microphone: SimulatedMicrophone,
    meter: RoomMeter,
}

impl SimulatedRoom {
    pub fn new(recorded: AudioFormat, played: AudioFormat, config: &SimulationConfig) -> Result<Self> {
        if recorded.bytes_per_sample() != 2 {
            anyhow::bail!("simulated microphone needs 16-bit samples, got {}", recorded);
        }

        let delay_bytes = recorded.interleaved_samples_per_ms(config.echo_delay_ms) * 2;
        let capacity =
            recorded.interleaved_samples_per_ms(config.echo_delay_ms + ECHO_HEADROOM_MS) * 2;
        let echo_path = Arc::new(RingByteBuffer::new(capacity));
        echo_path.write(&vec![0u8; delay_bytes]);

        let converter =
            Resampler::new(played, recorded).context("speaker to microphone conversion")?;
        let meter = RoomMeter::default();

        log::info!(
            "Simulated room: echo {}ms x{:.2}, near-end {}Hz @ {}",
            config.echo_delay_ms,
            config.echo_gain,
            config.near_end_hz,
            config.near_end_amplitude,
        );

        Ok(Self {
            speaker: SimulatedSpeaker {
                format: played,
                converter,
                echo_path: echo_path.clone(),
                echo_gain: config.echo_gain,
                frame_bytes: vec![0u8; recorded.bytes_per_frame()],
                frame: vec![0i16; recorded.interleaved_samples_per_frame()],
                pacer: Pacer::new(),
            },
            microphone: SimulatedMicrophone {
                format: recorded,
                echo_path,
                tone: Tone::new(
                    config.near_end_hz,
                    config.near_end_amplitude,
                    recorded.sample_rate(),
                ),
                meter: meter.clone(),
                echo: vec![0i16; recorded.interleaved_samples_per_frame()],
                echo_bytes: vec![0u8; recorded.bytes_per_frame()],
                pacer: Pacer::new(),
            },
            meter,
        })
    }

    pub fn meter(&self) -> RoomMeter {
        self.meter.clone()
    }

    pub fn into_devices(self) -> (SimulatedMicrophone, SimulatedSpeaker) {
        (self.microphone, self.speaker)
    }
}

pub struct SimulatedSpeaker {
    format: AudioFormat,
    converter: Resampler,
    echo_path: Arc<RingByteBuffer>,
    echo_gain: f32,
    frame_bytes: Vec<u8>,
    frame: Vec<i16>,
    pacer: Pacer,
}

impl PlaybackDevice for SimulatedSpeaker {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.format.check_buffer(data.len())?;
        self.converter.write(data);
        while self.converter.read(&mut self.frame_bytes) {
            le_bytes_to_i16(&self.frame_bytes, &mut self.frame);
            for s in self.frame.iter_mut() {
                *s = (*s as f32 * self.echo_gain).round() as i16;
            }
            i16_to_le_bytes(&self.frame, &mut self.frame_bytes);
            self.echo_path.write(&self.frame_bytes);
        }

        let samples = data.len() / self.format.block_align();
        let period = Duration::from_secs_f64(samples as f64 / self.format.sample_rate() as f64);
        self.pacer.wait(period);
        Ok(())
    }
}

pub struct SimulatedMicrophone {
    format: AudioFormat,
    echo_path: Arc<RingByteBuffer>,
    tone: Tone,
    meter: RoomMeter,
    echo: Vec<i16>,
    echo_bytes: Vec<u8>,
    pacer: Pacer,
}

impl CaptureDevice for SimulatedMicrophone {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.pacer
            .wait(Duration::from_millis(self.format.milliseconds_per_frame() as u64));

        let n = self.format.bytes_per_frame().min(buf.len());
        let n = n - n % self.format.block_align();
        let echo_bytes = &mut self.echo_bytes[..n];
        self.echo_path.read_padded(echo_bytes);
        let echo = &mut self.echo[..n / 2];
        le_bytes_to_i16(echo_bytes, echo);

        let channels = self.format.channels() as usize;
        let mut levels = self.meter.levels.lock();
        for (i, s) in echo.iter_mut().enumerate() {
            let e = *s as f64;
            levels.echo_energy += e * e;
            // one tone sample per sample frame, shared by all channels
            let near = if i % channels == 0 { self.tone.next_sample() } else { self.tone.current() };
            *s = (e + near as f64).clamp(i16::MIN as f64, i16::MAX as f64) as i16;
            levels.capture_energy += (*s as f64) * (*s as f64);
        }
        levels.samples += echo.len() as u64;
        drop(levels);

        i16_to_le_bytes(echo, &mut buf[..n]);
        Ok(n)
    }
}

/// Sine generator used for both the far-end and near-end talkers.
#[derive(Debug, Clone)]
pub struct Tone {
    phase: f64,
    step: f64,
    amplitude: f64,
    current: i16,
}

impl Tone {
    pub fn new(frequency_hz: f32, amplitude: i16, sample_rate: u32) -> Self {
        Self {
            phase: 0.0,
            step: std::f64::consts::TAU * frequency_hz as f64 / sample_rate as f64,
            amplitude: amplitude as f64,
            current: 0,
        }
    }

    pub fn next_sample(&mut self) -> i16 {
        self.current = (self.phase.sin() * self.amplitude).round() as i16;
        self.phase = (self.phase + self.step) % std::f64::consts::TAU;
        self.current
    }

    pub fn current(&self) -> i16 {
        self.current
    }

    /// One frame of 16-bit LE PCM in `format`.
    pub fn frame(&mut self, format: AudioFormat) -> Vec<u8> {
        let channels = format.channels() as usize;
        let mut samples = Vec::with_capacity(format.interleaved_samples_per_frame());
        for _ in 0..format.samples_per_frame() {
            let s = self.next_sample();
            samples.extend(std::iter::repeat_n(s, channels));
        }
        let mut bytes = vec![0u8; samples.len() * 2];
        i16_to_le_bytes(&samples, &mut bytes);
        bytes
    }
}

/// Sleeps so that successive periods line up with the wall clock.
struct Pacer {
    next: Option<Instant>,
}

impl Pacer {
    fn new() -> Self {
        Self { next: None }
    }

    fn wait(&mut self, period: Duration) {
        let now = Instant::now();
        let deadline = match self.next {
            // more than a second behind: resynchronise instead of bursting
            Some(t) if now.saturating_duration_since(t) < Duration::from_secs(1) => t,
            _ => now,
        };
        if deadline > now {
            std::thread::sleep(deadline - now);
        }
        self.next = Some(deadline + period);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(rate: u32) -> AudioFormat {
        AudioFormat::pcm16(rate, 1, 10).unwrap()
    }

    fn quiet_config(delay_ms: u32) -> SimulationConfig {
        SimulationConfig {
            echo_delay_ms: delay_ms,
            echo_gain: 0.5,
            near_end_amplitude: 0,
            ..SimulationConfig::default()
        }
    }

    #[test]
    fn echo_arrives_after_delay() {
        let f = format(8000);
        let room = SimulatedRoom::new(f, f, &quiet_config(20)).unwrap();
        let (mut mic, mut speaker) = room.into_devices();

        let loud: Vec<u8> = std::iter::repeat_n(1000i16.to_le_bytes(), 80).flatten().collect();
        speaker.write(&loud).unwrap();

        let mut buf = vec![0u8; f.bytes_per_frame()];
        let mut frames = Vec::new();
        for _ in 0..3 {
            assert_eq!(mic.read(&mut buf).unwrap(), buf.len());
            frames.push(i16::from_le_bytes([buf[0], buf[1]]));
        }
        assert_eq!(frames, [0, 0, 500]);
    }

    #[test]
    fn meter_reports_and_resets() {
        let f = format(8000);
        let room = SimulatedRoom::new(f, f, &quiet_config(0)).unwrap();
        let meter = room.meter();
        let (mut mic, mut speaker) = room.into_devices();

        let loud: Vec<u8> = std::iter::repeat_n(100i16.to_le_bytes(), 80).flatten().collect();
        speaker.write(&loud).unwrap();
        let mut buf = vec![0u8; f.bytes_per_frame()];
        mic.read(&mut buf).unwrap();

        let levels = meter.take();
        assert_eq!(levels.samples, 80);
        assert_eq!(levels.echo_energy, 80.0 * 50.0 * 50.0);
        assert_eq!(levels.capture_energy, levels.echo_energy);
        assert_eq!(meter.take(), MicLevels::default());
    }

    #[test]
    fn speaker_converts_to_mic_rate() {
        let room = SimulatedRoom::new(format(16000), format(8000), &quiet_config(0)).unwrap();
        let (mut mic, mut speaker) = room.into_devices();
        let loud: Vec<u8> = std::iter::repeat_n(2000i16.to_le_bytes(), 80).flatten().collect();
        speaker.write(&loud).unwrap();

        let mut buf = vec![0u8; format(16000).bytes_per_frame()];
        assert_eq!(mic.read(&mut buf).unwrap(), 320);
        let samples: Vec<i16> = buf.chunks_exact(2).map(|b| i16::from_le_bytes([b[0], b[1]])).collect();
        assert!(samples.iter().all(|&s| s == 1000));
    }

    #[test]
    fn tone_frame_fills_all_channels() {
        let f = AudioFormat::pcm16(8000, 2, 10).unwrap();
        let mut tone = Tone::new(1000.0, 10_000, 8000);
        let frame = tone.frame(f);
        assert_eq!(frame.len(), f.bytes_per_frame());
        let samples: Vec<i16> = frame.chunks_exact(2).map(|b| i16::from_le_bytes([b[0], b[1]])).collect();
        assert!(samples.chunks(2).all(|lr| lr[0] == lr[1]));
        assert_eq!(samples[0], 0);
        assert_eq!(samples[4], 10_000);
    }
}
