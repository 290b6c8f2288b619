//! RNNoise-based noise suppression using the `nnnoiseless` crate.
//!
//! RNNoise processes 480-sample frames (10ms at 48kHz) of f32 audio in i16
//! scale, so the suppressor only accepts 48 kHz mono streams.

use nnnoiseless::DenoiseState;

use super::{NoiseSuppressor, clamp_i16};
use crate::audio::error::{AudioError, AudioResult};

pub const SAMPLE_RATE: u32 = 48_000;

pub struct RnnoiseSuppressor {
    state: Box<DenoiseState<'static>>,
    /// Conversion buffers (480 samples each).
    input_buf: Vec<f32>,
    output_buf: Vec<f32>,
}

impl RnnoiseSuppressor {
    pub fn new(sample_rate: u32, channels: u16) -> AudioResult<Self> {
        if sample_rate != SAMPLE_RATE || channels != 1 {
            return Err(AudioError::config(format!(
                "noise suppression needs 48000 Hz mono, got {} Hz / {} ch",
                sample_rate, channels
            )));
        }
        Ok(Self {
            state: DenoiseState::new(),
            input_buf: vec![0.0; DenoiseState::FRAME_SIZE],
            output_buf: vec![0.0; DenoiseState::FRAME_SIZE],
        })
    }
}

impl NoiseSuppressor for RnnoiseSuppressor {
    fn block_len(&self) -> usize {
        DenoiseState::FRAME_SIZE
    }

    fn process_frame(&mut self, input: &[i16], in_offset: usize, output: &mut [i16], out_offset: usize) {
        let n = DenoiseState::FRAME_SIZE;
        for (dst, &s) in self.input_buf.iter_mut().zip(&input[in_offset..in_offset + n]) {
            *dst = s as f32;
        }

        // the voice activity estimate is not used by the chain
        let _ = self.state.process_frame(&mut self.output_buf, &self.input_buf);

        for (dst, &v) in output[out_offset..out_offset + n].iter_mut().zip(&self.output_buf) {
            *dst = clamp_i16(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_48k_mono() {
        assert!(RnnoiseSuppressor::new(16_000, 1).is_err());
        assert!(RnnoiseSuppressor::new(48_000, 2).is_err());
        let ns = RnnoiseSuppressor::new(48_000, 1).unwrap();
        assert_eq!(ns.block_len(), 480);
    }

    #[test]
    fn writes_only_its_block() {
        let mut ns = RnnoiseSuppressor::new(48_000, 1).unwrap();
        let input = vec![0i16; 960];
        let mut output = vec![123i16; 960];
        ns.process_frame(&input, 480, &mut output, 480);
        assert!(output[..480].iter().all(|&s| s == 123));
        assert!(output[480..].iter().all(|&s| s.abs() < 5));
    }
}
