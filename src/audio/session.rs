//! Duplex session that drives a filter from capture and playback threads.
//!
//! Uses std::thread (NOT tokio tasks) for real-time audio I/O to avoid
//! contention with async tasks feeding the uplink/downlink channels.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::duplex::{CaptureEnd, Cancellation, FilterStats, LatencyAlignedDuplexFilter, PlaybackEnd};
use super::format::AudioFormat;
use super::should_log;

/// How long `stop` waits for the playback thread to drain and exit.
const PLAYBACK_JOIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Microphone side of the audio hardware.
pub trait CaptureDevice: Send + 'static {
    fn format(&self) -> AudioFormat;

    /// Block until audio is captured into `buf`; returns the bytes written.
    /// `Ok(0)` means the device is closed.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
}

/// Loudspeaker side of the audio hardware.
pub trait PlaybackDevice: Send + 'static {
    fn format(&self) -> AudioFormat;

    /// Block until `data` has been handed to the speaker.
    fn write(&mut self, data: &[u8]) -> Result<()>;
}

/// The duplex session runs capture and playback in dedicated OS threads.
///
/// - Playback thread: `downlink_rx` → speaker → register frame played
/// - Recording thread: microphone → duplex filter → `uplink_tx`
pub struct DuplexSession {
    running: Arc<AtomicBool>,
    stats: Arc<Mutex<FilterStats>>,
    record_handle: Option<JoinHandle<()>>,
    play_handle: Option<JoinHandle<()>>,
}

impl DuplexSession {
    /// Start the session.
    ///
    /// * `filter`      - Duplex filter; split between the two threads
    /// * `uplink_tx`   - Sender for processed microphone frames
    /// * `downlink_rx` - Receiver for PCM to play, in the played format
    pub fn start<C, M, S>(
        filter: LatencyAlignedDuplexFilter<C>,
        capture: M,
        playback: S,
        uplink_tx: mpsc::Sender<Vec<u8>>,
        downlink_rx: mpsc::Receiver<Vec<u8>>,
    ) -> Result<Self>
    where
        C: Cancellation + 'static,
        M: CaptureDevice,
        S: PlaybackDevice,
    {
        let (playback_end, capture_end) = filter.into_split();

        if capture.format() != capture_end.input_format() {
            anyhow::bail!(
                "capture device delivers {}, filter expects {}",
                capture.format(),
                capture_end.input_format()
            );
        }
        if playback.format() != playback_end.played_format() {
            anyhow::bail!(
                "playback device takes {}, filter expects {}",
                playback.format(),
                playback_end.played_format()
            );
        }

        log::info!(
            "DuplexSession starting, capture: {}, playback: {}",
            capture.format(),
            playback.format(),
        );

        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(Mutex::new(FilterStats::default()));

        let play_handle = {
            let running = running.clone();
            thread::Builder::new()
                .name("audio-play".into())
                .spawn(move || {
                    if let Err(e) = play_thread(playback, playback_end, downlink_rx, &running) {
                        log::error!("Playback thread error: {:#}", e);
                    }
                })
                .context("Failed to spawn playback thread")?
        };

        let record_handle = {
            let running = running.clone();
            let stats = stats.clone();
            thread::Builder::new()
                .name("audio-record".into())
                .spawn(move || {
                    if let Err(e) = record_thread(capture, capture_end, uplink_tx, &running, &stats) {
                        log::error!("Recording thread error: {:#}", e);
                    }
                    running.store(false, Ordering::SeqCst);
                })
                .context("Failed to spawn recording thread")?
        };

        Ok(Self {
            running,
            stats,
            record_handle: Some(record_handle),
            play_handle: Some(play_handle),
        })
    }

    /// Latest filter counters published by the recording thread.
    pub fn stats(&self) -> FilterStats {
        *self.stats.lock()
    }

    /// Signal threads to stop and wait for them to finish.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.record_handle.take() {
            let _ = h.join();
        }
        // The playback thread is parked in `blocking_recv` until the downlink
        // sender is dropped, which may happen just after `stop` is called.
        if let Some(h) = self.play_handle.take() {
            let deadline = Instant::now() + PLAYBACK_JOIN_TIMEOUT;
            while !h.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            if h.is_finished() {
                let _ = h.join();
            } else {
                log::warn!("Playback thread still waiting for downlink audio, detaching it");
            }
        }
    }
}

impl Drop for DuplexSession {
    fn drop(&mut self) {
        self.stop();
    }
}

// ======================== Recording thread ========================

fn record_thread<C: Cancellation, M: CaptureDevice>(
    mut device: M,
    mut filter: CaptureEnd<C>,
    uplink_tx: mpsc::Sender<Vec<u8>>,
    running: &AtomicBool,
    stats: &Mutex<FilterStats>,
) -> Result<()> {
    let mut read_buf = vec![0u8; device.format().bytes_per_frame()];
    let mut frame = vec![0u8; filter.recorded_format().bytes_per_frame()];
    let mut rejected: u64 = 0;

    log::info!("Recording started: {}", device.format());

    while running.load(Ordering::Relaxed) {
        let n = device.read(&mut read_buf).context("capture device read failed")?;
        if n == 0 {
            log::info!("Capture device closed");
            break;
        }

        if let Err(e) = filter.write(&read_buf[..n]) {
            rejected += 1;
            if should_log(rejected) {
                log::warn!("Dropping captured chunk ({} so far): {}", rejected, e);
            }
            continue;
        }

        loop {
            match filter.read(&mut frame)? {
                Some(processed) => {
                    if uplink_tx.blocking_send(frame.clone()).is_err() {
                        log::warn!("Failed to send uplink frame, receiver dropped");
                        return Ok(());
                    }
                    if !processed.more {
                        break;
                    }
                }
                None => break,
            }
        }

        *stats.lock() = filter.stats();
    }

    log::info!("Recording stopped");
    Ok(())
}

// ======================== Playback thread ========================

fn play_thread<S: PlaybackDevice>(
    mut device: S,
    mut filter: PlaybackEnd,
    mut downlink_rx: mpsc::Receiver<Vec<u8>>,
    running: &AtomicBool,
) -> Result<()> {
    let mut rejected: u64 = 0;

    log::info!("Playback started: {}", device.format());

    while running.load(Ordering::Relaxed) {
        // Block until we receive an audio packet (or channel closes)
        let Some(pcm) = downlink_rx.blocking_recv() else {
            log::info!("Playback channel closed");
            break;
        };
        if pcm.is_empty() {
            continue;
        }

        device.write(&pcm).context("playback device write failed")?;

        if let Err(e) = filter.register_frame_played(&pcm) {
            rejected += 1;
            if should_log(rejected) {
                log::warn!("Played chunk not registered ({} so far): {}", rejected, e);
            }
        }
    }

    log::info!("Playback stopped");
    Ok(())
}
