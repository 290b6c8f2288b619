//! Latency-aligned duplex filter.
//!
//! The microphone hears the loudspeaker some `system_latency_ms` after a frame
//! was handed to the playback device. Played frames are therefore held in a
//! bounded FIFO, and recorded frames are only paired with played frames once
//! the FIFO has filled to the depth matching that latency:
//!
//!   Idle ─(first played frame)→ Filling ─(depth ≥ queue size)→ Aligned
//!   Aligned ─(queue empty when a recorded frame arrives)→ Filling
//!
//! While not aligned, recorded frames pass through untouched. The FIFO is
//! the only state shared between the playback thread (`PlaybackEnd`) and the
//! capture thread (`CaptureEnd`); everything else is owned by one side.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

use super::error::{AudioError, AudioResult};
use super::format::{AudioFormat, i16_to_le_bytes, le_bytes_to_i16};
use super::resampler::{FrameResampler, PassThroughResampler, Resampler};
use super::should_log;

/// The cancellation step run on each aligned (recorded, played) frame pair.
///
/// Implementations own whatever adaptive state they need and must not rely on
/// anything but the two frames they are given.
pub trait Cancellation: Send {
    /// Write the cleaned version of `recorded` into `out`. All three slices
    /// hold one frame of interleaved samples in the recorded format.
    fn perform_cancellation(&mut self, recorded: &[i16], played: &[i16], out: &mut [i16]);

    /// Forget adaptive state when the filter is reset for a new call.
    fn reset(&mut self) {}
}

/// Cancellation step that leaves the recorded audio untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThroughCancellation;

impl Cancellation for PassThroughCancellation {
    fn perform_cancellation(&mut self, recorded: &[i16], _played: &[i16], out: &mut [i16]) {
        out.copy_from_slice(recorded);
    }
}

/// Construction parameters of a duplex filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DuplexSettings {
    /// Delay between handing audio to the speaker and hearing it at the mic.
    pub system_latency_ms: u32,
    /// Echo tail the cancellation step should model.
    pub filter_length_ms: u32,
    /// Microphone format; also the format the cancellation step works in.
    pub recorded: AudioFormat,
    /// Format of the audio registered as played.
    pub played: AudioFormat,
}

impl DuplexSettings {
    /// Played frames to buffer before pairing starts.
    pub fn queue_size(&self) -> usize {
        ((self.system_latency_ms / self.recorded.milliseconds_per_frame()) as usize).max(1)
    }

    /// Latency left over after whole-frame alignment.
    pub fn residual_delay_ms(&self) -> u32 {
        let aligned = self.queue_size() as u32 * self.recorded.milliseconds_per_frame();
        self.system_latency_ms.saturating_sub(aligned)
    }
}

/// Counters describing how a filter has behaved so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterStats {
    pub frames_played: u64,
    pub played_frames_dropped: u64,
    pub underruns: u64,
    pub frames_cancelled: u64,
    pub frames_passed_through: u64,
    pub played_resampler_resets: u64,
    pub recorded_resampler_resets: u64,
    pub queue_depth: usize,
    pub aligned: bool,
}

/// How a recorded frame left the filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameMode {
    Cancelled,
    PassedThrough,
}

/// One frame written to the caller's output buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Processed {
    pub mode: FrameMode,
    /// More whole recorded frames are buffered and can be read right away.
    pub more: bool,
}

// ======================== Played-frame queue ========================

enum Dequeued {
    Aligned,
    Filling,
    Underrun,
}

struct QueueState {
    frames: VecDeque<Box<[i16]>>,
    /// Recycled frame buffers, so steady-state operation does not allocate.
    spare: Vec<Box<[i16]>>,
    target_reached: bool,
    frames_played: u64,
    dropped: u64,
    underruns: u64,
    resampler_resets: u64,
}

struct PlayedQueue {
    queue_size: usize,
    frame_len: usize,
    state: Mutex<QueueState>,
}

impl PlayedQueue {
    fn new(queue_size: usize, frame_len: usize) -> Self {
        let capacity = queue_size + 1;
        Self {
            queue_size,
            frame_len,
            state: Mutex::new(QueueState {
                frames: VecDeque::with_capacity(capacity + 1),
                spare: (0..=capacity)
                    .map(|_| vec![0i16; frame_len].into_boxed_slice())
                    .collect(),
                target_reached: false,
                frames_played: 0,
                dropped: 0,
                underruns: 0,
                resampler_resets: 0,
            }),
        }
    }

    /// Enqueue a played frame, dropping the oldest beyond `queue_size + 1`.
    fn push(&self, frame: &[i16], resampler_resets: u64) {
        let mut st = self.state.lock();
        let mut slot = st
            .spare
            .pop()
            .unwrap_or_else(|| vec![0i16; self.frame_len].into_boxed_slice());
        slot.copy_from_slice(frame);
        st.frames.push_back(slot);
        st.frames_played += 1;
        st.resampler_resets = resampler_resets;

        while st.frames.len() > self.queue_size + 1 {
            if let Some(old) = st.frames.pop_front() {
                st.spare.push(old);
                st.dropped += 1;
                if should_log(st.dropped) {
                    log::debug!("Played queue full, dropped oldest frame (#{})", st.dropped);
                }
            }
        }
    }

    /// Pop the played frame matching the next recorded frame, if aligned.
    fn pop_aligned(&self, dest: &mut [i16]) -> Dequeued {
        let mut st = self.state.lock();
        if !st.target_reached {
            if st.frames.len() < self.queue_size {
                return Dequeued::Filling;
            }
            st.target_reached = true;
            log::debug!("Played queue reached {} frames, cancelling", self.queue_size);
        }

        match st.frames.pop_front() {
            Some(frame) => {
                dest.copy_from_slice(&frame);
                st.spare.push(frame);
                Dequeued::Aligned
            }
            None => {
                st.target_reached = false;
                st.underruns += 1;
                if should_log(st.underruns) {
                    log::warn!(
                        "Played queue underrun (#{}), passing capture through until refilled",
                        st.underruns
                    );
                }
                Dequeued::Underrun
            }
        }
    }

    fn clear(&self) {
        let mut st = self.state.lock();
        while let Some(frame) = st.frames.pop_front() {
            st.spare.push(frame);
        }
        st.target_reached = false;
    }

    fn fill_stats(&self, stats: &mut FilterStats) {
        let st = self.state.lock();
        stats.frames_played = st.frames_played;
        stats.played_frames_dropped = st.dropped;
        stats.underruns = st.underruns;
        stats.played_resampler_resets = st.resampler_resets;
        stats.queue_depth = st.frames.len();
        stats.aligned = st.target_reached;
    }
}

// ======================== Playback side ========================

/// Playback-thread half of a duplex filter.
pub struct PlaybackEnd {
    resampler: Box<dyn FrameResampler>,
    queue: Arc<PlayedQueue>,
    frame_bytes: Vec<u8>,
    frame: Vec<i16>,
}

impl PlaybackEnd {
    /// Register audio that was just handed to the loudspeaker.
    pub fn register_frame_played(&mut self, played: &[u8]) -> AudioResult<()> {
        self.resampler.input_format().check_buffer(played.len())?;
        self.resampler.write(played);

        let resets = self.resampler.overflow_resets();
        while self.resampler.read(&mut self.frame_bytes) {
            le_bytes_to_i16(&self.frame_bytes, &mut self.frame);
            self.queue.push(&self.frame, resets);
        }
        Ok(())
    }

    pub fn played_format(&self) -> AudioFormat {
        self.resampler.input_format()
    }

    fn reset(&mut self) {
        self.resampler.reset();
    }
}

// ======================== Capture side ========================

/// Capture-thread half of a duplex filter, owning the cancellation step.
pub struct CaptureEnd<C> {
    resampler: Box<dyn FrameResampler>,
    queue: Arc<PlayedQueue>,
    canceller: C,
    format: AudioFormat,
    frame_bytes: Vec<u8>,
    recorded: Vec<i16>,
    played: Vec<i16>,
    out: Vec<i16>,
    cancelled: u64,
    passed_through: u64,
}

impl<C: Cancellation> CaptureEnd<C> {
    /// Buffer captured audio without producing output.
    pub fn write(&mut self, recorded: &[u8]) -> AudioResult<()> {
        self.resampler.input_format().check_buffer(recorded.len())?;
        self.resampler.write(recorded);
        Ok(())
    }

    /// Produce the next outgoing frame into `out` (one frame of the recorded
    /// format), or `None` when no whole recorded frame is buffered.
    pub fn read(&mut self, out: &mut [u8]) -> AudioResult<Option<Processed>> {
        if out.len() != self.format.bytes_per_frame() {
            return Err(AudioError::input(format!(
                "output buffer holds {} bytes, frame is {}",
                out.len(),
                self.format.bytes_per_frame()
            )));
        }
        if !self.resampler.read(&mut self.frame_bytes) {
            return Ok(None);
        }

        let mode = match self.queue.pop_aligned(&mut self.played) {
            Dequeued::Aligned => {
                le_bytes_to_i16(&self.frame_bytes, &mut self.recorded);
                self.canceller
                    .perform_cancellation(&self.recorded, &self.played, &mut self.out);
                i16_to_le_bytes(&self.out, out);
                self.cancelled += 1;
                FrameMode::Cancelled
            }
            Dequeued::Filling | Dequeued::Underrun => {
                out.copy_from_slice(&self.frame_bytes);
                self.passed_through += 1;
                FrameMode::PassedThrough
            }
        };

        log::trace!("capture frame {:?}", mode);
        Ok(Some(Processed {
            mode,
            more: self.resampler.frames_available() > 0,
        }))
    }

    /// Buffer `recorded` and produce the first outgoing frame, if any.
    /// Further frames are drained with [`CaptureEnd::read`] while `more` is set.
    pub fn process(&mut self, recorded: &[u8], out: &mut [u8]) -> AudioResult<Option<Processed>> {
        self.write(recorded)?;
        self.read(out)
    }

    /// Format the cancellation step works in.
    pub fn recorded_format(&self) -> AudioFormat {
        self.format
    }

    /// Format expected by [`CaptureEnd::write`].
    pub fn input_format(&self) -> AudioFormat {
        self.resampler.input_format()
    }

    pub fn canceller(&self) -> &C {
        &self.canceller
    }

    pub fn stats(&self) -> FilterStats {
        let mut stats = FilterStats {
            frames_cancelled: self.cancelled,
            frames_passed_through: self.passed_through,
            recorded_resampler_resets: self.resampler.overflow_resets(),
            ..FilterStats::default()
        };
        self.queue.fill_stats(&mut stats);
        stats
    }

    fn reset(&mut self) {
        self.resampler.reset();
        self.canceller.reset();
    }
}

// ======================== Filter ========================

/// Pairs recorded frames with the played frames they contain the echo of and
/// runs a [`Cancellation`] step over each pair.
pub struct LatencyAlignedDuplexFilter<C> {
    settings: DuplexSettings,
    playback: PlaybackEnd,
    capture: CaptureEnd<C>,
}

impl<C: Cancellation> LatencyAlignedDuplexFilter<C> {
    /// Filter with the default pre-stages: a [`Resampler`] from the played
    /// format and a pass-through for recorded audio.
    pub fn new(settings: DuplexSettings, canceller: C) -> AudioResult<Self> {
        Self::with_resamplers(settings, canceller, None, None)
    }

    /// Filter with custom pre-stages. Both must output the recorded format.
    pub fn with_resamplers(
        settings: DuplexSettings,
        canceller: C,
        played_resampler: Option<Box<dyn FrameResampler>>,
        recorded_resampler: Option<Box<dyn FrameResampler>>,
    ) -> AudioResult<Self> {
        let target = settings.recorded;
        if target.bytes_per_sample() != 2 {
            return Err(AudioError::config(format!(
                "recorded format {} must be 16-bit",
                target
            )));
        }

        let played_resampler = match played_resampler {
            Some(r) => r,
            None => Box::new(Resampler::new(settings.played, target)?),
        };
        let recorded_resampler = match recorded_resampler {
            Some(r) => r,
            None => Box::new(PassThroughResampler::new(target)),
        };
        for (side, r) in [("played", &played_resampler), ("recorded", &recorded_resampler)] {
            if r.output_format() != target {
                return Err(AudioError::config(format!(
                    "{} pre-stage outputs {}, expected {}",
                    side,
                    r.output_format(),
                    target
                )));
            }
        }

        let frame_len = target.interleaved_samples_per_frame();
        let queue = Arc::new(PlayedQueue::new(settings.queue_size(), frame_len));

        log::info!(
            "Duplex filter: recorded {}, played {}, latency {}ms -> queue {} frames",
            settings.recorded,
            settings.played,
            settings.system_latency_ms,
            settings.queue_size(),
        );

        Ok(Self {
            settings,
            playback: PlaybackEnd {
                resampler: played_resampler,
                queue: queue.clone(),
                frame_bytes: vec![0u8; target.bytes_per_frame()],
                frame: vec![0i16; frame_len],
            },
            capture: CaptureEnd {
                resampler: recorded_resampler,
                queue,
                canceller,
                format: target,
                frame_bytes: vec![0u8; target.bytes_per_frame()],
                recorded: vec![0i16; frame_len],
                played: vec![0i16; frame_len],
                out: vec![0i16; frame_len],
                cancelled: 0,
                passed_through: 0,
            },
        })
    }

    pub fn settings(&self) -> &DuplexSettings {
        &self.settings
    }

    pub fn queue_size(&self) -> usize {
        self.settings.queue_size()
    }

    pub fn register_frame_played(&mut self, played: &[u8]) -> AudioResult<()> {
        self.playback.register_frame_played(played)
    }

    pub fn process(&mut self, recorded: &[u8], out: &mut [u8]) -> AudioResult<Option<Processed>> {
        self.capture.process(recorded, out)
    }

    pub fn read(&mut self, out: &mut [u8]) -> AudioResult<Option<Processed>> {
        self.capture.read(out)
    }

    pub fn stats(&self) -> FilterStats {
        self.capture.stats()
    }

    pub fn canceller(&self) -> &C {
        self.capture.canceller()
    }

    /// Forget buffered audio and alignment, e.g. between calls.
    pub fn reset(&mut self) {
        self.playback.reset();
        self.capture.reset();
        self.capture.queue.clear();
    }

    /// Split into the halves driven by the playback and capture threads.
    pub fn into_split(self) -> (PlaybackEnd, CaptureEnd<C>) {
        (self.playback, self.capture)
    }
}
