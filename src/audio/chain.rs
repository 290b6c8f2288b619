//! Processing chain run on every aligned frame pair.
//!
//! Processing order (capture path):
//!   recorded → high-pass → [AGC analyze] → [AEC vs played] → [NS per 10 ms]
//!            → [AGC apply] → output
//!
//! Stage toggles are fixed when the chain is built.

use serde::{Deserialize, Serialize};

use super::dsp::{
    DigitalGainControl, EchoCanceller, GainControl, HighPass, HighPassFilter, NlmsEchoCanceller,
    NoiseSuppressor, RnnoiseSuppressor,
};
use super::duplex::{Cancellation, DuplexSettings};
use super::error::{AudioError, AudioResult};
use super::format::AudioFormat;

/// Which stages run, and how the default stages are tuned.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ProcessingOptions {
    pub gain_control: bool,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    /// AGC target RMS in dBFS.
    pub agc_target_dbfs: f32,
    /// AGC smoothing, 0.0..1.0 (higher = slower).
    pub agc_smoothing: f32,
    /// NLMS step size.
    pub aec_step_size: f32,
}

impl Default for ProcessingOptions {
    fn default() -> Self {
        Self {
            gain_control: true,
            echo_cancellation: true,
            noise_suppression: true,
            agc_target_dbfs: -18.0,
            agc_smoothing: 0.3,
            aec_step_size: 0.5,
        }
    }
}

pub struct ProcessingChain {
    frame_len: usize,
    stream_delay_ms: u32,
    high_pass: Box<dyn HighPass>,
    gain: Option<Box<dyn GainControl>>,
    echo: Option<Box<dyn EchoCanceller>>,
    noise: Option<Box<dyn NoiseSuppressor>>,
    /// Capture level carried from one frame to the next.
    capture_level: i32,
    filtered: Vec<i16>,
    aec_out: Vec<i16>,
}

impl ProcessingChain {
    /// Build the chain with the default stages for `settings.recorded`.
    pub fn new(settings: &DuplexSettings, options: &ProcessingOptions) -> AudioResult<Self> {
        let format = settings.recorded;
        let high_pass = Box::new(HighPassFilter::new(format.sample_rate(), format.channels())?);

        let gain: Option<Box<dyn GainControl>> = if options.gain_control {
            Some(Box::new(DigitalGainControl::new(
                options.agc_target_dbfs,
                options.agc_smoothing,
            )))
        } else {
            None
        };

        let echo: Option<Box<dyn EchoCanceller>> = if options.echo_cancellation {
            let taps = NlmsEchoCanceller::taps_for(
                format.sample_rate(),
                format.channels(),
                settings.filter_length_ms,
            );
            Some(Box::new(NlmsEchoCanceller::new(taps, options.aec_step_size)))
        } else {
            None
        };

        let noise: Option<Box<dyn NoiseSuppressor>> = if options.noise_suppression {
            Some(Box::new(RnnoiseSuppressor::new(
                format.sample_rate(),
                format.channels(),
            )?))
        } else {
            None
        };

        let chain = Self::from_stages(
            format,
            settings.residual_delay_ms(),
            high_pass,
            gain,
            echo,
            noise,
        )?;

        log::info!(
            "Processing chain for {}: agc={}, aec={} ({}ms), ns={}",
            format,
            options.gain_control,
            options.echo_cancellation,
            settings.filter_length_ms,
            options.noise_suppression,
        );
        Ok(chain)
    }

    /// Assemble a chain from explicit stages.
    ///
    /// Fails when the noise suppressor's block size does not evenly divide
    /// the frame.
    pub fn from_stages(
        format: AudioFormat,
        stream_delay_ms: u32,
        high_pass: Box<dyn HighPass>,
        gain: Option<Box<dyn GainControl>>,
        echo: Option<Box<dyn EchoCanceller>>,
        noise: Option<Box<dyn NoiseSuppressor>>,
    ) -> AudioResult<Self> {
        let frame_len = format.interleaved_samples_per_frame();
        if let Some(ns) = &noise {
            let block = ns.block_len();
            if block == 0 || frame_len % block != 0 {
                return Err(AudioError::config(format!(
                    "{}-sample frames cannot be split into {}-sample suppression blocks",
                    frame_len, block
                )));
            }
        }
        let capture_level = gain.as_ref().map(|g| g.initial_level()).unwrap_or(0);

        Ok(Self {
            frame_len,
            stream_delay_ms,
            high_pass,
            gain,
            echo,
            noise,
            capture_level,
            filtered: vec![0i16; frame_len],
            aec_out: vec![0i16; frame_len],
        })
    }

    pub fn capture_level(&self) -> i32 {
        self.capture_level
    }
}

impl Cancellation for ProcessingChain {
    fn perform_cancellation(&mut self, recorded: &[i16], played: &[i16], out: &mut [i16]) {
        debug_assert_eq!(recorded.len(), self.frame_len);

        self.filtered.copy_from_slice(recorded);
        self.high_pass.filter(&mut self.filtered);

        let mut level = self.capture_level;
        if let Some(gain) = self.gain.as_mut() {
            gain.add_farend(played);
            level = gain.analyze_capture(&self.filtered, level);
        }

        match self.echo.as_mut() {
            Some(echo) => {
                echo.process_frame(&self.filtered, played, &mut self.aec_out, self.stream_delay_ms)
            }
            None => self.aec_out.copy_from_slice(&self.filtered),
        }

        match self.noise.as_mut() {
            Some(ns) => {
                let block = ns.block_len();
                for offset in (0..self.frame_len).step_by(block) {
                    ns.process_frame(&self.aec_out, offset, out, offset);
                }
            }
            None => out.copy_from_slice(&self.aec_out),
        }

        if let Some(gain) = self.gain.as_mut() {
            let outcome = gain.apply_capture(out, level);
            if outcome.saturated {
                log::debug!(
                    "Capture gain saturated, level {} -> {}",
                    level,
                    outcome.level
                );
            }
            self.capture_level = outcome.level;
        }
    }

    fn reset(&mut self) {
        self.high_pass.reset();
        if let Some(echo) = self.echo.as_mut() {
            echo.reset();
        }
        self.capture_level = self.gain.as_ref().map(|g| g.initial_level()).unwrap_or(0);
    }
}
