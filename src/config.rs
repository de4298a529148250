//! Engine configuration, loadable from TOML.
//!
//! ```toml
//! sample_rate = 48000.0
//! block_size = 256
//! output_channels = 2
//!
//! [tempo]
//! bpm = 96.0
//!
//! [bypass]
//! guard_attempts = 4
//! ```
//!
//! Missing keys take their defaults.

use crate::bypass::WaitStrategy;
use crate::control::CONTROL_QUEUE_CAPACITY;
use crate::error::ConfigError;
use crate::graph::DEFAULT_MIDI_CAPACITY;
use crate::invariant_ppt::{assert_invariant, CONFIG_VALIDATED};
use crate::time::{Meter, Tempo, TempoMap};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Bypass protocol tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BypassConfig {
    /// Compare-and-swap attempts the audio thread makes before skipping a block.
    pub guard_attempts: u32,
    /// Busy-spin iterations a mutator makes before yielding.
    pub spin_count: u32,
    /// Yields a mutator makes before sleeping.
    pub yield_count: u32,
    /// Mutator sleep interval in microseconds.
    pub sleep_micros: u64,
}

impl Default for BypassConfig {
    fn default() -> Self {
        Self {
            guard_attempts: 4,
            spin_count: 100,
            yield_count: 10,
            sleep_micros: 500,
        }
    }
}

impl BypassConfig {
    /// The mutator-side wait escalation.
    pub fn wait_strategy(&self) -> WaitStrategy {
        WaitStrategy {
            spins: self.spin_count,
            yields: self.yield_count,
            sleep: Duration::from_micros(self.sleep_micros),
        }
    }
}

/// Everything [`Engine::new`](crate::engine::Engine::new) needs to size itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Device sample rate in Hz.
    pub sample_rate: f64,
    /// Maximum frames per device callback.
    pub block_size: usize,
    /// Device input channels.
    pub input_channels: usize,
    /// Device output channels.
    pub output_channels: usize,
    /// Ticks per quarter note.
    pub tpqn: u32,
    /// Events per MIDI port per sub-block.
    pub midi_event_capacity: usize,
    /// Slots in the control queue.
    pub control_queue_capacity: usize,
    /// Initial tempo.
    pub tempo: Tempo,
    /// Initial meter.
    pub meter: Meter,
    /// Bypass protocol tuning.
    pub bypass: BypassConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000.0,
            block_size: 512,
            input_channels: 2,
            output_channels: 2,
            tpqn: 480,
            midi_event_capacity: DEFAULT_MIDI_CAPACITY,
            control_queue_capacity: CONTROL_QUEUE_CAPACITY,
            tempo: Tempo::default(),
            meter: Meter::default(),
            bypass: BypassConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Check every field. Nothing is adjusted.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            return Err(ConfigError::InvalidSampleRate(self.sample_rate));
        }
        if self.block_size == 0 {
            return Err(ConfigError::ZeroBlockSize);
        }
        if self.tpqn == 0 {
            return Err(ConfigError::ZeroTpqn);
        }
        if !(self.tempo.bpm.is_finite() && self.tempo.bpm > 0.0) {
            return Err(ConfigError::InvalidTempo(self.tempo.bpm));
        }
        if !self.meter.is_valid() {
            return Err(ConfigError::InvalidMeter {
                numerator: self.meter.numerator,
                denominator: self.meter.denominator,
            });
        }
        if !self.meter.fits(self.tpqn) {
            return Err(ConfigError::MeterResolution {
                numerator: self.meter.numerator,
                denominator: self.meter.denominator,
                tpqn: self.tpqn,
            });
        }
        if self.midi_event_capacity == 0 {
            return Err(ConfigError::ZeroCapacity("midi_event_capacity"));
        }
        if self.control_queue_capacity == 0 {
            return Err(ConfigError::ZeroCapacity("control_queue_capacity"));
        }
        if self.bypass.guard_attempts == 0 {
            return Err(ConfigError::ZeroCapacity("bypass.guard_attempts"));
        }
        assert_invariant(CONFIG_VALIDATED, true, "configuration validated", Some("EngineConfig::validate"));
        Ok(())
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_toml_str(&source)?;
        tracing::info!(path = %path.as_ref().display(), "engine configuration loaded");
        Ok(config)
    }

    /// Serialize to TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string(self)?)
    }

    /// Tempo map with the configured rate, resolution, tempo and meter.
    pub fn tempo_map(&self) -> TempoMap {
        TempoMap::new(self.sample_rate, self.tpqn, self.tempo, self.meter)
    }
}
