//! Acoustic processing stages used by the processing chain.
//!
//! Each stage sits behind a trait so the chain can be driven by other
//! implementations (hardware DSP, test doubles). The defaults are:
//!
//!   Mic frame → HighPassFilter → DigitalGainControl (analyze)
//!             → NlmsEchoCanceller → RnnoiseSuppressor (10 ms blocks)
//!             → DigitalGainControl (apply) → output

pub mod aec;
pub mod agc;
pub mod high_pass;
pub mod noise;

pub use aec::NlmsEchoCanceller;
pub use agc::DigitalGainControl;
pub use high_pass::HighPassFilter;
pub use noise::RnnoiseSuppressor;

/// In-place pre-filter applied to every recorded frame.
pub trait HighPass: Send {
    fn filter(&mut self, frame: &mut [i16]);

    /// Clear the filter history.
    fn reset(&mut self) {}
}

/// Result of applying capture gain to a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GainOutcome {
    /// Level to feed into the next frame's analysis.
    pub level: i32,
    /// The frame clipped while applying the gain.
    pub saturated: bool,
}

/// Automatic gain control driven frame by frame.
///
/// The level is an opaque integer owned by the implementation; the caller
/// only carries it from one frame to the next.
pub trait GainControl: Send {
    /// Observe a frame that was sent to the loudspeaker.
    fn add_farend(&mut self, frame: &[i16]);

    /// Analyze a recorded frame starting from `level`; returns the level to apply.
    fn analyze_capture(&mut self, frame: &[i16], level: i32) -> i32;

    /// Apply `level` to the outgoing frame in place.
    fn apply_capture(&mut self, frame: &mut [i16], level: i32) -> GainOutcome;

    /// Level a fresh call starts from.
    fn initial_level(&self) -> i32 {
        0
    }
}

/// Acoustic echo canceller operating on time-aligned frame pairs.
pub trait EchoCanceller: Send {
    /// Remove the echo of `played` from `recorded`, writing the result to `out`.
    /// `stream_delay_ms` is the latency still unaccounted for by the caller's
    /// alignment.
    fn process_frame(
        &mut self,
        recorded: &[i16],
        played: &[i16],
        out: &mut [i16],
        stream_delay_ms: u32,
    );

    /// Forget the learned echo path.
    fn reset(&mut self) {}
}

/// Noise suppressor with a fixed sub-block size.
pub trait NoiseSuppressor: Send {
    /// Interleaved samples consumed per call (10 ms of audio).
    fn block_len(&self) -> usize;

    /// Suppress `input[in_offset..in_offset + block_len()]` into
    /// `output[out_offset..out_offset + block_len()]`.
    fn process_frame(&mut self, input: &[i16], in_offset: usize, output: &mut [i16], out_offset: usize);
}

/// Saturate a float sample into the i16 range.
pub(crate) fn clamp_i16(v: f32) -> i16 {
    v.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Mean square of a frame in i16 units.
pub(crate) fn mean_square(frame: &[i16]) -> f64 {
    if frame.is_empty() {
        return 0.0;
    }
    let sum: f64 = frame.iter().map(|&s| (s as f64) * (s as f64)).sum();
    sum / frame.len() as f64
}
