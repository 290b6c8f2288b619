//! Byte-level PCM resampling between two [`AudioFormat`]s.
//!
//! - `Resampler`: rate + channel conversion by nearest-sample mapping over the
//!   interleaved stream, with smoothing where oversampling would repeat a
//!   source sample
//! - `PassThroughResampler`: re-frames input of the target format unchanged
//!
//! Both emit whole output frames only and are owned by a single thread.

use super::error::{AudioError, AudioResult};
use super::format::AudioFormat;
use super::ring_buffer::RingByteBuffer;
use super::should_log;

/// Number of output frames the scratch buffer holds before compaction.
const SCRATCH_FRAMES: usize = 100;

/// A pre-stage that turns arbitrary PCM chunks into fixed-size frames of its
/// output format.
pub trait FrameResampler: Send {
    fn input_format(&self) -> AudioFormat;

    fn output_format(&self) -> AudioFormat;

    /// Accept a run of input PCM bytes. Never blocks and never fails; when the
    /// internal buffer cannot absorb the data, buffered output is discarded.
    fn write(&mut self, data: &[u8]);

    /// Copy one output frame into `frame[..output_format().bytes_per_frame()]`.
    /// Returns false when no whole frame is buffered.
    fn read(&mut self, frame: &mut [u8]) -> bool;

    /// Whole output frames currently buffered.
    fn frames_available(&self) -> usize;

    /// Drop all buffered output.
    fn reset(&mut self);

    /// How many times buffered output had to be discarded to fit new input.
    fn overflow_resets(&self) -> u64 {
        0
    }
}

// ======================== Resampler ========================

pub struct Resampler {
    input: AudioFormat,
    output: AudioFormat,
    scaling_factor: f64,
    scratch: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
    resets: u64,
}

impl Resampler {
    /// Create a resampler from `input` to `output`.
    ///
    /// Conversions that change rate or channel count only support 16-bit
    /// samples; sample width conversion is not supported at all.
    pub fn new(input: AudioFormat, output: AudioFormat) -> AudioResult<Self> {
        if !matches!(output.channels(), 1 | 2) {
            return Err(AudioError::config(format!(
                "resampler output must be mono or stereo, got {} channels",
                output.channels()
            )));
        }
        if input.bytes_per_sample() != output.bytes_per_sample() {
            return Err(AudioError::config(format!(
                "cannot convert {}-byte samples to {}-byte samples",
                input.bytes_per_sample(),
                output.bytes_per_sample()
            )));
        }
        let converts = input.sample_rate() != output.sample_rate()
            || input.channels() != output.channels();
        if converts && output.bytes_per_sample() != 2 {
            return Err(AudioError::config(format!(
                "resampling {} -> {} requires 16-bit samples",
                input, output
            )));
        }

        let scaling_factor = (input.sample_rate() as f64 * input.channels() as f64)
            / (output.sample_rate() as f64 * output.channels() as f64);

        log::debug!(
            "Resampler {} -> {} (scaling factor {:.5})",
            input,
            output,
            scaling_factor
        );

        Ok(Self {
            input,
            output,
            scaling_factor,
            scratch: vec![0u8; output.bytes_per_frame() * SCRATCH_FRAMES],
            read_pos: 0,
            write_pos: 0,
            resets: 0,
        })
    }

    pub fn scaling_factor(&self) -> f64 {
        self.scaling_factor
    }

    /// Output bytes produced for `input_len` input bytes.
    pub fn scaled_len(&self, input_len: usize) -> usize {
        let bps = self.output.bytes_per_sample() as usize;
        let in_samples = (input_len / bps) as f64;
        let mut out_samples = (in_samples / self.scaling_factor + 1e-9).floor() as usize;
        // keep interleaved channels in step across writes
        out_samples -= out_samples % self.output.channels() as usize;
        out_samples * bps
    }

    fn unread(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Make room for `len` more bytes: grow for bursts, compact when the tail
    /// is full, and as a last resort drop everything buffered.
    fn reserve(&mut self, len: usize) {
        if self.scratch.len() < len {
            log::debug!(
                "Resampler scratch grows from {} to {} bytes",
                self.scratch.len(),
                len
            );
            self.scratch.resize(len, 0);
        }
        if self.write_pos + len <= self.scratch.len() {
            return;
        }

        let unread = self.unread();
        self.scratch.copy_within(self.read_pos..self.write_pos, 0);
        self.read_pos = 0;
        self.write_pos = unread;

        if unread + len > self.scratch.len() {
            self.resets += 1;
            if should_log(self.resets) {
                log::warn!(
                    "Resampler {} -> {} overflow, dropping {} buffered bytes (reset #{})",
                    self.input,
                    self.output,
                    unread,
                    self.resets
                );
            }
            self.write_pos = 0;
        }
    }
}

impl FrameResampler for Resampler {
    fn input_format(&self) -> AudioFormat {
        self.input
    }

    fn output_format(&self) -> AudioFormat {
        self.output
    }

    fn write(&mut self, data: &[u8]) {
        let scaled_len = self.scaled_len(data.len());
        if scaled_len == 0 {
            return;
        }
        self.reserve(scaled_len);

        let start = self.write_pos;
        let dst = &mut self.scratch[start..start + scaled_len];
        if scaled_len == data.len() && self.input.channels() == self.output.channels() {
            dst.copy_from_slice(data);
        } else {
            let in_len = data.len() - data.len() % 2;
            scale_pcm16(&data[..in_len], dst);
        }
        self.write_pos += scaled_len;
    }

    fn read(&mut self, frame: &mut [u8]) -> bool {
        let bpf = self.output.bytes_per_frame();
        if frame.len() < bpf || self.unread() < bpf {
            return false;
        }
        frame[..bpf].copy_from_slice(&self.scratch[self.read_pos..self.read_pos + bpf]);
        self.read_pos += bpf;
        if self.read_pos == self.write_pos {
            self.read_pos = 0;
            self.write_pos = 0;
        }
        true
    }

    fn frames_available(&self) -> usize {
        self.unread() / self.output.bytes_per_frame()
    }

    fn reset(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }

    fn overflow_resets(&self) -> u64 {
        self.resets
    }
}

/// Map `src` onto `dst` (both 16-bit LE) by nearest-sample position.
///
/// Output sample `i` takes source sample `floor(i * in/out)`. A run of `r > 1`
/// outputs landing on the same source sample is spread over the half-sample
/// neighbourhood of that sample, interpolating toward the previous sample for
/// the first half of the run and toward the next one for the second half, so
/// upsampled audio ramps instead of stepping.
fn scale_pcm16(src: &[u8], dst: &mut [u8]) {
    let in_n = src.len() / 2;
    let out_n = dst.len() / 2;
    if in_n == 0 || out_n == 0 {
        dst.fill(0);
        return;
    }

    let step = in_n as f64 / out_n as f64;
    let sample = |i: usize| i16::from_le_bytes([src[2 * i], src[2 * i + 1]]) as f64;
    let source_of = |i: usize| ((i as f64 * step) as usize).min(in_n - 1);
    let mut put = |i: usize, v: f64| {
        let s = v.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16;
        dst[2 * i..2 * i + 2].copy_from_slice(&s.to_le_bytes());
    };

    let mut i = 0;
    while i < out_n {
        let s = source_of(i);
        let mut run = 1;
        while i + run < out_n && source_of(i + run) == s {
            run += 1;
        }

        let cur = sample(s);
        if run == 1 {
            put(i, cur);
        } else {
            let prev = if s > 0 { sample(s - 1) } else { cur };
            let next = if s + 1 < in_n { sample(s + 1) } else { 2.0 * cur - prev };
            for k in 0..run {
                let t = (k as f64 + 0.5) / run as f64 - 0.5;
                let v = if t < 0.0 {
                    cur + t * (cur - prev)
                } else {
                    cur + t * (next - cur)
                };
                put(i + k, v);
            }
        }
        i += run;
    }
}

// ======================== PassThroughResampler ========================

/// Frames input that is already in the target format.
pub struct PassThroughResampler {
    format: AudioFormat,
    ring: RingByteBuffer,
    dropped: u64,
}

impl PassThroughResampler {
    pub fn new(format: AudioFormat) -> Self {
        Self {
            format,
            ring: RingByteBuffer::new(format.bytes_per_frame() * SCRATCH_FRAMES),
            dropped: 0,
        }
    }
}

impl FrameResampler for PassThroughResampler {
    fn input_format(&self) -> AudioFormat {
        self.format
    }

    fn output_format(&self) -> AudioFormat {
        self.format
    }

    fn write(&mut self, data: &[u8]) {
        let evicted = self.ring.write(data);
        if evicted > 0 {
            self.dropped += 1;
            if should_log(self.dropped) {
                log::warn!(
                    "Pass-through buffer for {} full, evicted {} bytes",
                    self.format,
                    evicted
                );
            }
        }
    }

    fn read(&mut self, frame: &mut [u8]) -> bool {
        let bpf = self.format.bytes_per_frame();
        if frame.len() < bpf || self.ring.len() < bpf {
            return false;
        }
        self.ring.read(&mut frame[..bpf]) == bpf
    }

    fn frames_available(&self) -> usize {
        self.ring.len() / self.format.bytes_per_frame()
    }

    fn reset(&mut self) {
        self.ring.clear();
    }

    fn overflow_resets(&self) -> u64 {
        self.dropped
    }
}
