//! Clock configuration files.
//!
//! A clock can be described in TOML:
//!
//! ```toml
//! name = "metronome"
//! beats_per_minute = 96.0
//! time_signature = "3/4"
//! slop = "1ms"
//! initial_measure = 1
//! ```
//!
//! Every field is optional; missing fields take the defaults below.

use crate::error::{ClockError, Result};
use crate::events::Change;
use crate::handle::ClockHandle;
use crate::runtime::StartOptions;
use crate::timing::TimeSignature;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Configuration for a clock and how it starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    /// Name used to tag log lines
    pub name: Option<String>,
    /// Tempo in beats per minute
    pub beats_per_minute: f64,
    /// Time signature, e.g. "4/4"
    pub time_signature: TimeSignature,
    /// Longest single wait of a real-time driver, e.g. "1ms"
    #[serde(with = "humantime_duration")]
    pub slop: Duration,
    /// Measure number at the start
    pub initial_measure: i64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            name: None,
            beats_per_minute: 120.0,
            time_signature: TimeSignature::COMMON,
            slop: crate::scheduler::DEFAULT_SLOP,
            initial_measure: 1,
        }
    }
}

impl ClockConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ClockError::Config(format!(
                "Config file not found at {:?}",
                path
            )));
        }
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Load configuration or return default if not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Save configuration to a TOML file, creating parent directories
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: ClockConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        Change::tempo(self.beats_per_minute).validate()?;
        if self.slop.is_zero() {
            return Err(ClockError::InvalidSlop(self.slop));
        }
        Ok(())
    }

    /// Start options matching this configuration.
    pub fn start_options(&self) -> StartOptions {
        StartOptions::default()
            .with_tempo(self.beats_per_minute)
            .with_signature(self.time_signature)
            .with_initial_measure(self.initial_measure)
    }

    /// Apply tempo, signature and slop to a stopped clock.
    pub(crate) fn apply(&self, handle: &ClockHandle) -> Result<()> {
        handle.change(
            Change::tempo(self.beats_per_minute).with_signature(self.time_signature),
        )?;
        handle.set_slop(self.slop)
    }
}

mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}
