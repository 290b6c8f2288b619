//! Acoustic Echo Cancellation (AEC).
//!
//! Uses a Normalized Least Mean Squares (NLMS) adaptive filter to cancel
//! the echo of the played signal from the recorded signal. The frames are
//! already time-aligned by the duplex filter, so the adaptive filter only
//! has to model the room's impulse response over `filter_length_ms`.

use super::{EchoCanceller, clamp_i16};

/// NLMS-based Acoustic Echo Canceller.
pub struct NlmsEchoCanceller {
    /// Adaptive filter taps; `weights[j]` multiplies `history[i + j]`, the
    /// last entry pairs with the most recent reference sample.
    weights: Vec<f32>,
    /// Reference history: `taps - 1` past samples followed by the current frame.
    history: Vec<f32>,
    /// Step size (mu) for NLMS adaptation.
    mu: f32,
    /// Small constant to prevent division by zero.
    delta: f32,
}

impl NlmsEchoCanceller {
    /// Create a new AEC.
    /// `filter_len`: number of taps (e.g., 1600 = 100ms at 16kHz)
    /// `mu`: NLMS step size (0.0..1.0, typical 0.5)
    pub fn new(filter_len: usize, mu: f32) -> Self {
        let filter_len = filter_len.max(1);
        Self {
            weights: vec![0.0; filter_len],
            history: vec![0.0; filter_len - 1],
            mu: mu.clamp(0.01, 1.0),
            delta: 1.0,
        }
    }

    /// Taps covering `filter_length_ms` of interleaved audio.
    pub fn taps_for(sample_rate: u32, channels: u16, filter_length_ms: u32) -> usize {
        (sample_rate as usize * filter_length_ms as usize / 1000) * channels as usize
    }

}

impl EchoCanceller for NlmsEchoCanceller {
    fn process_frame(
        &mut self,
        recorded: &[i16],
        played: &[i16],
        out: &mut [i16],
        _stream_delay_ms: u32,
    ) {
        let taps = self.weights.len();
        let n = recorded.len().min(out.len());
        self.history.resize(taps - 1 + n, 0.0);
        for (i, h) in self.history[taps - 1..].iter_mut().enumerate() {
            *h = played.get(i).copied().unwrap_or(0) as f32;
        }

        let mut power: f32 = self.history[..taps - 1].iter().map(|r| r * r).sum();
        for i in 0..n {
            let newest = self.history[i + taps - 1];
            power += newest * newest;

            let window = &self.history[i..i + taps];
            let echo_est: f32 = self.weights.iter().zip(window).map(|(w, r)| w * r).sum();

            let error = recorded[i] as f32 - echo_est;
            let step = self.mu * error / (power + self.delta);
            for (w, r) in self.weights.iter_mut().zip(window) {
                *w += step * r;
            }

            out[i] = clamp_i16(error);

            let oldest = self.history[i];
            power = (power - oldest * oldest).max(0.0);
        }

        // keep the last taps - 1 reference samples for the next frame
        self.history.copy_within(n..n + taps - 1, 0);
        self.history.truncate(taps - 1);
    }

    fn reset(&mut self) {
        self.weights.fill(0.0);
        self.history.fill(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Lcg(u32);

    impl Lcg {
        fn next(&mut self) -> i16 {
            self.0 = self.0.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            ((self.0 >> 16) as i16) / 4
        }
    }

    fn energy(x: &[i16]) -> f64 {
        x.iter().map(|&s| (s as f64).powi(2)).sum()
    }

    #[test]
    fn converges_on_delayed_echo() {
        let frame = 80;
        let delay = 10;
        let mut aec = NlmsEchoCanceller::new(64, 0.5);
        let mut rng = Lcg(7);
        let reference: Vec<i16> = (0..frame * 200).map(|_| rng.next()).collect();

        let mut out = vec![0i16; frame];
        let mut first = (0.0, 0.0);
        let mut last = (0.0, 0.0);
        for (k, played) in reference.chunks(frame).enumerate() {
            let start = k * frame;
            let recorded: Vec<i16> = (0..frame)
                .map(|i| {
                    let t = start + i;
                    if t >= delay { reference[t - delay] / 2 } else { 0 }
                })
                .collect();
            aec.process_frame(&recorded, played, &mut out, 0);
            if k == 1 {
                first = (energy(&recorded), energy(&out));
            }
            if k == 199 {
                last = (energy(&recorded), energy(&out));
            }
        }

        assert!(first.1 > first.0 * 0.01);
        assert!(last.1 < last.0 * 0.01, "residual {} vs echo {}", last.1, last.0);
    }

    #[test]
    fn silent_reference_passes_capture() {
        let mut aec = NlmsEchoCanceller::new(32, 0.5);
        let recorded: Vec<i16> = (0..160).map(|i| (i * 10) as i16).collect();
        let mut out = vec![0i16; 160];
        aec.process_frame(&recorded, &[0i16; 160], &mut out, 0);
        assert_eq!(out, recorded);
    }

    #[test]
    fn reset_forgets_echo_path() {
        let mut aec = NlmsEchoCanceller::new(16, 0.5);
        let played: Vec<i16> = (0..160).map(|i| ((i * 37) % 400) as i16 - 200).collect();
        let recorded: Vec<i16> = played.iter().map(|&v| v / 2).collect();
        let mut out = vec![0i16; 160];
        for _ in 0..20 {
            aec.process_frame(&recorded, &played, &mut out, 0);
        }
        assert!(aec.weights.iter().any(|&w| w != 0.0));

        aec.reset();
        assert!(aec.weights.iter().all(|&w| w == 0.0));
        assert!(aec.history.iter().all(|&h| h == 0.0));
        // a fresh filter passes the first sample through unchanged
        aec.process_frame(&recorded, &played, &mut out, 0);
        assert_eq!(out[0], recorded[0]);
    }

    #[test]
    fn taps_cover_filter_length() {
        assert_eq!(NlmsEchoCanceller::taps_for(16_000, 1, 100), 1600);
        assert_eq!(NlmsEchoCanceller::taps_for(8_000, 2, 10), 160);
    }
}
