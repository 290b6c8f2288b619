//! Automatic Gain Control (AGC).
//!
//! Envelope-following AGC that walks the capture gain toward a target RMS
//! level, with a slow attack and a fast release to avoid pumping. The level
//! handed between frames is the gain in tenths of a dB.
//!
//! While the far end is talking, gain increases are frozen so that residual
//! echo is not amplified.

use super::{GainControl, GainOutcome, mean_square};

pub const MIN_LEVEL: i32 = -200; // -20 dB max cut
pub const MAX_LEVEL: i32 = 300; // +30 dB max boost

/// Level drop applied after a clipped frame (1 dB).
const SATURATION_STEP: i32 = 10;
/// Frames quieter than this RMS leave the gain untouched.
const SILENCE_RMS: f64 = 10.0;
/// Smoothed far-end RMS above which the far end counts as active.
const FAREND_ACTIVE_RMS: f64 = 300.0;

pub struct DigitalGainControl {
    target_rms: f64,
    attack: f64,
    release: f64,
    farend_power: f64,
}

impl DigitalGainControl {
    /// Create an AGC with target level in dBFS and smoothing factor.
    ///
    /// * `target_db` - target RMS in dBFS (e.g. -18.0)
    /// * `smoothing` - 0.0..1.0, higher = slower adaptation
    pub fn new(target_db: f32, smoothing: f32) -> Self {
        let smoothing = smoothing.clamp(0.01, 0.99) as f64;
        Self {
            target_rms: Self::rms_for(target_db),
            attack: smoothing,
            release: (smoothing * 0.5).clamp(0.01, 0.99),
            farend_power: 0.0,
        }
    }

    fn rms_for(target_db: f32) -> f64 {
        32768.0 * 10f64.powf(target_db as f64 / 20.0)
    }

    pub fn farend_active(&self) -> bool {
        self.farend_power.sqrt() > FAREND_ACTIVE_RMS
    }

    /// Linear gain for a level.
    pub fn gain_for(level: i32) -> f32 {
        10f32.powf(level as f32 / 200.0)
    }
}

impl GainControl for DigitalGainControl {
    fn add_farend(&mut self, frame: &[i16]) {
        self.farend_power = self.farend_power * 0.8 + mean_square(frame) * 0.2;
    }

    fn analyze_capture(&mut self, frame: &[i16], level: i32) -> i32 {
        let rms = mean_square(frame).sqrt();
        if rms <= SILENCE_RMS {
            return level;
        }

        let current_db = level as f64 / 10.0;
        let desired_db = (20.0 * (self.target_rms / rms).log10())
            .clamp(MIN_LEVEL as f64 / 10.0, MAX_LEVEL as f64 / 10.0);

        if desired_db > current_db && self.farend_active() {
            return level;
        }

        let alpha = if desired_db > current_db {
            self.attack
        } else {
            self.release
        };
        let next_db = current_db * alpha + desired_db * (1.0 - alpha);
        ((next_db * 10.0).round() as i32).clamp(MIN_LEVEL, MAX_LEVEL)
    }

    fn apply_capture(&mut self, frame: &mut [i16], level: i32) -> GainOutcome {
        let level = level.clamp(MIN_LEVEL, MAX_LEVEL);
        if level == 0 {
            return GainOutcome { level, saturated: false };
        }

        let gain = Self::gain_for(level);
        let mut saturated = false;
        for s in frame.iter_mut() {
            let v = (*s as f32 * gain).round();
            if v > i16::MAX as f32 || v < i16::MIN as f32 {
                saturated = true;
            }
            *s = v.clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        }

        let level = if saturated {
            (level - SATURATION_STEP).max(MIN_LEVEL)
        } else {
            level
        };
        GainOutcome { level, saturated }
    }
}
