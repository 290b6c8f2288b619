//! PCM stream shape descriptor and little-endian sample helpers.

use super::error::{AudioError, AudioResult};
use std::fmt;

/// Shape of a PCM stream, fixed at stream-format negotiation time.
///
/// `samples_per_frame` counts samples of a single channel; one frame holds
/// `samples_per_frame * channels` interleaved samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AudioFormat {
    sample_rate: u32,
    channels: u16,
    bytes_per_sample: u16,
    milliseconds_per_frame: u32,
    samples_per_frame: usize,
}

impl AudioFormat {
    /// Create a validated format.
    ///
    /// * `sample_rate`      - Samples per second per channel (e.g. 16000, 48000)
    /// * `channels`         - 1 (mono) or 2 (interleaved stereo)
    /// * `bytes_per_sample` - 1, 2 or 4
    /// * `milliseconds_per_frame` - Duration of one logical frame (e.g. 20)
    pub fn new(
        sample_rate: u32,
        channels: u16,
        bytes_per_sample: u16,
        milliseconds_per_frame: u32,
    ) -> AudioResult<Self> {
        if sample_rate == 0 {
            return Err(AudioError::config("sample rate must be positive"));
        }
        if !matches!(channels, 1 | 2) {
            return Err(AudioError::config(format!(
                "unsupported channel count {}",
                channels
            )));
        }
        if !matches!(bytes_per_sample, 1 | 2 | 4) {
            return Err(AudioError::config(format!(
                "unsupported sample width {} bytes",
                bytes_per_sample
            )));
        }
        if milliseconds_per_frame == 0 {
            return Err(AudioError::config("frame duration must be positive"));
        }
        let per_frame = sample_rate as u64 * milliseconds_per_frame as u64;
        if per_frame % 1000 != 0 {
            return Err(AudioError::config(format!(
                "{} ms at {} Hz is not a whole number of samples",
                milliseconds_per_frame, sample_rate
            )));
        }

        Ok(Self {
            sample_rate,
            channels,
            bytes_per_sample,
            milliseconds_per_frame,
            samples_per_frame: (per_frame / 1000) as usize,
        })
    }

    /// 16-bit PCM, the only width the processing chain consumes.
    pub fn pcm16(sample_rate: u32, channels: u16, milliseconds_per_frame: u32) -> AudioResult<Self> {
        Self::new(sample_rate, channels, 2, milliseconds_per_frame)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn bytes_per_sample(&self) -> u16 {
        self.bytes_per_sample
    }

    pub fn milliseconds_per_frame(&self) -> u32 {
        self.milliseconds_per_frame
    }

    /// Samples of one channel in one frame.
    pub fn samples_per_frame(&self) -> usize {
        self.samples_per_frame
    }

    /// Interleaved samples (all channels) in one frame.
    pub fn interleaved_samples_per_frame(&self) -> usize {
        self.samples_per_frame * self.channels as usize
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.interleaved_samples_per_frame() * self.bytes_per_sample as usize
    }

    /// Bytes making up one sample across all channels.
    pub fn block_align(&self) -> usize {
        self.channels as usize * self.bytes_per_sample as usize
    }

    /// Interleaved samples per `ms` milliseconds of audio.
    pub fn interleaved_samples_per_ms(&self, ms: u32) -> usize {
        (self.sample_rate as u64 * ms as u64 / 1000) as usize * self.channels as usize
    }

    /// Whether `len` bytes is a non-empty run of whole sample blocks.
    pub fn check_buffer(&self, len: usize) -> AudioResult<()> {
        if len == 0 {
            return Err(AudioError::input("empty PCM buffer"));
        }
        if len % self.block_align() != 0 {
            return Err(AudioError::input(format!(
                "{} bytes is not a multiple of the {}-byte sample block",
                len,
                self.block_align()
            )));
        }
        Ok(())
    }
}

impl Default for AudioFormat {
    /// 48 kHz mono 16-bit, 20 ms frames.
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 1,
            bytes_per_sample: 2,
            milliseconds_per_frame: 20,
            samples_per_frame: 960,
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}Hz/{}ch/{}bit/{}ms",
            self.sample_rate,
            self.channels,
            self.bytes_per_sample * 8,
            self.milliseconds_per_frame
        )
    }
}

/// Decode little-endian 16-bit samples. `out` must hold `bytes.len() / 2` samples.
pub fn le_bytes_to_i16(bytes: &[u8], out: &mut [i16]) {
    for (dst, src) in out.iter_mut().zip(bytes.chunks_exact(2)) {
        *dst = i16::from_le_bytes([src[0], src[1]]);
    }
}

/// Encode samples as little-endian bytes. `out` must hold `samples.len() * 2` bytes.
pub fn i16_to_le_bytes(samples: &[i16], out: &mut [u8]) {
    for (dst, &s) in out.chunks_exact_mut(2).zip(samples) {
        dst.copy_from_slice(&s.to_le_bytes());
    }
}
