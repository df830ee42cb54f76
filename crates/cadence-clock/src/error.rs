//! Error types for the cadence clock.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for clock operations.
pub type Result<T> = std::result::Result<T, ClockError>;

/// Errors reported by the clock.
///
/// Lookup misses (cancelling or rescheduling an unknown event) are not
/// errors; those calls return `None` instead.
#[derive(Debug, Error)]
pub enum ClockError {
    /// `start` was called on a clock that is already running.
    #[error("Clock is already running")]
    AlreadyRunning,

    /// The slop must be a positive duration.
    #[error("Invalid slop: {0:?} (must be positive)")]
    InvalidSlop(Duration),

    /// Event types are positive; zero is reserved for change events.
    #[error("Invalid event type {0}: must be a positive integer")]
    InvalidEventType(i64),

    /// Unrecognized quantization token.
    #[error("Invalid quantization: {0:?}")]
    InvalidQuantization(String),

    /// Schedule positions must be finite.
    #[error("Invalid schedule position: {0}")]
    InvalidScheduleTime(f64),

    /// Tempo must be finite and positive.
    #[error("Invalid tempo: {0} BPM")]
    InvalidTempo(f64),

    /// Time signature with a zero numerator or a non power-of-two denominator.
    #[error("Invalid time signature: {numerator}/{denominator}")]
    InvalidTimeSignature { numerator: u32, denominator: u32 },

    /// Unparseable time signature text.
    #[error("Invalid time signature: {0:?}")]
    MalformedTimeSignature(String),

    /// An event's stored offset disagrees with the offset derived from its
    /// due time. The reference state is corrupt.
    #[error("Offset mismatch for event {event_id}: stored {stored}, derived {derived}")]
    OffsetMismatch {
        event_id: u64,
        stored: f64,
        derived: f64,
    },

    /// The scheduler driver panicked outside of a user callback.
    #[error("Scheduler driver panicked")]
    DriverPanicked,

    /// The cooperative driver was started outside of a tokio runtime.
    #[error("No async runtime available: {0}")]
    NoRuntime(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}
