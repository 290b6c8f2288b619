use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::audio::{AudioFormat, DuplexSettings, ProcessingOptions};

#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub pipeline: PipelineConfig,
    pub processing: ProcessingOptions,
    pub simulation: SimulationConfig,
}

/// Stream formats and acoustic parameters of the duplex filter.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Speaker-to-microphone latency in ms
    pub system_latency_ms: u32,
    /// Echo tail modelled by the canceller in ms
    pub filter_length_ms: u32,
    /// Microphone stream
    pub recorded: StreamFormatConfig,
    /// Downlink stream handed to the speaker
    pub played: StreamFormatConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            system_latency_ms: 100,
            filter_length_ms: 20,
            recorded: StreamFormatConfig::default(),
            played: StreamFormatConfig {
                sample_rate: 24000,
                ..StreamFormatConfig::default()
            },
        }
    }
}

impl PipelineConfig {
    pub fn to_settings(&self) -> Result<DuplexSettings> {
        Ok(DuplexSettings {
            system_latency_ms: self.system_latency_ms,
            filter_length_ms: self.filter_length_ms,
            recorded: self.recorded.to_format().context("invalid [pipeline.recorded]")?,
            played: self.played.to_format().context("invalid [pipeline.played]")?,
        })
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct StreamFormatConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub frame_duration_ms: u32,
}

impl Default for StreamFormatConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 1,
            bits_per_sample: 16,
            frame_duration_ms: 20,
        }
    }
}

impl StreamFormatConfig {
    pub fn to_format(&self) -> Result<AudioFormat> {
        if self.bits_per_sample % 8 != 0 {
            anyhow::bail!("bits_per_sample {} is not a whole byte count", self.bits_per_sample);
        }
        let format = AudioFormat::new(
            self.sample_rate,
            self.channels,
            self.bits_per_sample / 8,
            self.frame_duration_ms,
        )?;
        Ok(format)
    }
}

/// Parameters of the simulated room driven by the demo binary.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct SimulationConfig {
    /// Acoustic delay from speaker to microphone in ms
    pub echo_delay_ms: u32,
    /// Linear attenuation of the echo path
    pub echo_gain: f32,
    /// Far-end tone sent on the downlink (0 Hz = silence)
    pub far_end_hz: f32,
    pub far_end_amplitude: i16,
    /// Near-end talker picked up by the microphone (0 amplitude = none)
    pub near_end_hz: f32,
    pub near_end_amplitude: i16,
    /// Run time in seconds; 0 runs until Ctrl+C
    pub duration_secs: u64,
    pub report_interval_secs: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            echo_delay_ms: 100,
            echo_gain: 0.5,
            far_end_hz: 440.0,
            far_end_amplitude: 8000,
            near_end_hz: 0.0,
            near_end_amplitude: 0,
            duration_secs: 10,
            report_interval_secs: 1,
        }
    }
}

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).context("Failed to parse config")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Load `path`, or fall back to the defaults when it does not exist.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            log::warn!("{} not found, using default config", path.display());
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            [pipeline]
            system_latency_ms = 150

            [pipeline.played]
            sample_rate = 16000

            [processing]
            noise_suppression = false
            "#,
        )
        .unwrap();

        assert_eq!(config.pipeline.system_latency_ms, 150);
        assert_eq!(config.pipeline.filter_length_ms, 20);
        assert_eq!(config.pipeline.played.sample_rate, 16000);
        assert_eq!(config.pipeline.played.channels, 1);
        assert!(!config.processing.noise_suppression);
        assert!(config.processing.echo_cancellation);
        assert_eq!(config.simulation, SimulationConfig::default());

        let settings = config.pipeline.to_settings().unwrap();
        assert_eq!(settings.queue_size(), 7);
        assert_eq!(settings.residual_delay_ms(), 10);
    }

    #[test]
    fn invalid_format_is_reported() {
        let config = Config::from_toml_str(
            r#"
            [pipeline.recorded]
            channels = 3
            "#,
        )
        .unwrap();
        assert!(config.pipeline.to_settings().is_err());

        let odd_bits = StreamFormatConfig {
            bits_per_sample: 12,
            ..StreamFormatConfig::default()
        };
        assert!(odd_bits.to_format().is_err());
    }

    #[test]
    fn malformed_toml_fails() {
        assert!(Config::from_toml_str("[pipeline\nsystem_latency_ms = ").is_err());
    }

    #[test]
    fn missing_file_falls_back() {
        let config = Config::load_or_default("/nonexistent/intercom.toml").unwrap();
        assert_eq!(config, Config::default());
        assert!(Config::load("/nonexistent/intercom.toml").is_err());
    }
}
