//! audio - Full-duplex capture/playback pipeline with echo cancellation
//!
//! Played audio is resampled into the microphone format and queued until the
//! acoustic latency has elapsed; each recorded frame is then paired with the
//! played frame whose echo it contains and run through the processing chain
//! (high-pass, AGC, AEC, noise suppression).

pub mod chain;
pub mod dsp;
pub mod duplex;
pub mod error;
pub mod format;
pub mod resampler;
pub mod ring_buffer;
pub mod session;

pub use chain::{ProcessingChain, ProcessingOptions};
pub use duplex::{
    CaptureEnd, Cancellation, DuplexSettings, FilterStats, FrameMode,
    LatencyAlignedDuplexFilter, PassThroughCancellation, PlaybackEnd, Processed,
};
pub use error::{AudioError, AudioResult};
pub use format::AudioFormat;
pub use resampler::{FrameResampler, PassThroughResampler, Resampler};
pub use ring_buffer::RingByteBuffer;
pub use session::{CaptureDevice, DuplexSession, PlaybackDevice};

/// Duplex filter running the default processing chain.
pub type DuplexPipeline = LatencyAlignedDuplexFilter<ProcessingChain>;

/// Build a duplex filter with the default stages for `settings`.
pub fn build_pipeline(
    settings: DuplexSettings,
    options: &ProcessingOptions,
) -> AudioResult<DuplexPipeline> {
    let chain = ProcessingChain::new(&settings, options)?;
    LatencyAlignedDuplexFilter::new(settings, chain)
}

/// Rate limit for recovered-fault warnings: the first one, then every 100th.
pub(crate) fn should_log(count: u64) -> bool {
    count == 1 || count % 100 == 0
}
