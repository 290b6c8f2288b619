//! DC / rumble removal ahead of echo cancellation.
//!
//! A 2nd-order Butterworth high-pass biquad with a 100 Hz corner. The
//! coefficients are precomputed per supported sample rate.

use super::{HighPass, clamp_i16};
use crate::audio::error::{AudioError, AudioResult};

/// `[b0, b1, b2, a1, a2]` normalised by `a0`.
type Coefficients = [f32; 5];

const COEFFICIENTS: [(u32, Coefficients); 8] = [
    (8_000, [0.945_976_86, -1.891_953_7, 0.945_976_86, -1.889_033_1, 0.894_874_34]),
    (11_025, [0.960_502_6, -1.921_005_2, 0.960_502_6, -1.919_444_6, 0.922_565_9]),
    (16_000, [0.972_613_9, -1.945_227_8, 0.972_613_9, -1.944_477_7, 0.945_977_9]),
    (22_050, [0.980_052_5, -1.960_105, 0.980_052_5, -1.959_707, 0.960_502_9]),
    (24_000, [0.981_658_3, -1.963_316_5, 0.981_658_3, -1.962_98, 0.963_653]),
    (32_000, [0.986_211_9, -1.972_423_8, 0.986_211_9, -1.972_233_7, 0.972_614]),
    (44_100, [0.989_976, -1.979_952, 0.989_976, -1.979_851_5, 0.980_052_5]),
    (48_000, [0.990_786_7, -1.981_573_4, 0.990_786_7, -1.981_488_5, 0.981_658_3]),
];

pub struct HighPassFilter {
    coefficients: Coefficients,
    channels: usize,
    // per-channel [x1, x2, y1, y2]
    state: Vec<[f32; 4]>,
}

impl HighPassFilter {
    pub fn new(sample_rate: u32, channels: u16) -> AudioResult<Self> {
        let coefficients = COEFFICIENTS
            .iter()
            .find(|(rate, _)| *rate == sample_rate)
            .map(|(_, c)| *c)
            .ok_or_else(|| {
                AudioError::config(format!("no high-pass filter for {} Hz", sample_rate))
            })?;
        let channels = channels.max(1) as usize;
        Ok(Self {
            coefficients,
            channels,
            state: vec![[0.0; 4]; channels],
        })
    }
}

impl HighPass for HighPassFilter {
    fn filter(&mut self, frame: &mut [i16]) {
        let [b0, b1, b2, a1, a2] = self.coefficients;
        for (i, s) in frame.iter_mut().enumerate() {
            let st = &mut self.state[i % self.channels];
            let x0 = *s as f32;
            let y0 = b0 * x0 + b1 * st[0] + b2 * st[1] - a1 * st[2] - a2 * st[3];
            *st = [x0, st[0], y0, st[2]];
            *s = clamp_i16(y0);
        }
    }

    fn reset(&mut self) {
        self.state.iter_mut().for_each(|s| *s = [0.0; 4]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removes_dc_offset() {
        let mut hpf = HighPassFilter::new(16_000, 1).unwrap();
        let mut frame = vec![4000i16; 16_000];
        hpf.filter(&mut frame);
        let tail = &frame[8_000..];
        assert!(tail.iter().all(|s| s.abs() < 10), "DC must decay");
    }

    #[test]
    fn passes_speech_band() {
        let mut hpf = HighPassFilter::new(48_000, 1).unwrap();
        let mut frame: Vec<i16> = (0..48_000)
            .map(|i| ((i as f32 * 2.0 * std::f32::consts::PI * 1000.0 / 48_000.0).sin() * 10_000.0) as i16)
            .collect();
        hpf.filter(&mut frame);
        let peak = frame[24_000..].iter().map(|s| s.unsigned_abs()).max().unwrap();
        assert!(peak > 9_500 && peak < 10_500, "peak was {}", peak);
    }

    #[test]
    fn unsupported_rate_is_configuration_error() {
        assert!(HighPassFilter::new(12_345, 1).is_err());
        assert!(HighPassFilter::new(44_100, 2).is_ok());
        // 11.025 kHz formats exist at 40 ms frames
        assert!(HighPassFilter::new(11_025, 1).is_ok());
    }

    #[test]
    fn reset_clears_history() {
        let mut hpf = HighPassFilter::new(8_000, 1).unwrap();
        let mut first = vec![3000i16; 64];
        hpf.filter(&mut first);
        let mut warm = vec![3000i16; 64];
        hpf.filter(&mut warm);
        assert_ne!(warm, first);

        hpf.reset();
        let mut again = vec![3000i16; 64];
        hpf.filter(&mut again);
        assert_eq!(again, first);
    }
}
