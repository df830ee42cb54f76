//! Timing primitives and the conversions between seconds, beats and measures.
//!
//! This module provides the time model used throughout the clock:
//!
//! - [`TimeSignature`] - Musical time signature (e.g., 4/4, 6/8)
//! - [`TimeUnit`] - Unit of a scheduling request
//! - [`ClockState`] - Tempo, signature and the reference anchors
//! - [`Moment`] - One instant expressed in all three coordinate systems
//!
//! Offsets are quarter-note beats counted from the clock's zero point. A
//! signature beat lasts `4 / denominator` quarter notes and tempo counts
//! signature beats per minute, so 6/8 at 120 BPM plays 120 eighth notes
//! per minute.

use crate::error::{ClockError, Result};
use crate::quantize::Quantization;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Musical time signature (numerator/denominator).
///
/// The numerator indicates beats per bar, and the denominator indicates
/// the note value that gets one beat (4 = quarter note, 8 = eighth note).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeSignature {
    numerator: u32,
    denominator: u32,
}

impl TimeSignature {
    /// 4/4.
    pub const COMMON: TimeSignature = TimeSignature {
        numerator: 4,
        denominator: 4,
    };

    /// Create a new time signature.
    ///
    /// The numerator must be at least 1 and the denominator a power of two.
    pub fn new(numerator: u32, denominator: u32) -> Result<Self> {
        if numerator == 0 || !denominator.is_power_of_two() {
            return Err(ClockError::InvalidTimeSignature {
                numerator,
                denominator,
            });
        }
        Ok(Self {
            numerator,
            denominator,
        })
    }

    pub fn numerator(&self) -> u32 {
        self.numerator
    }

    pub fn denominator(&self) -> u32 {
        self.denominator
    }

    /// Length of one signature beat in quarter notes.
    ///
    /// For 4/4: 1.0, for 6/8: 0.5, for 2/2: 2.0
    pub fn beat_duration(&self) -> f64 {
        4.0 / self.denominator as f64
    }

    /// Calculate the number of quarter-note beats per bar.
    ///
    /// For 4/4: 4 beats per bar
    /// For 3/4: 3 beats per bar
    /// For 6/8: 3 beats per bar (6 eighth notes = 3 quarter notes)
    pub fn beats_per_bar(&self) -> f64 {
        self.numerator as f64 * self.beat_duration()
    }
}

impl Default for TimeSignature {
    fn default() -> Self {
        Self::COMMON
    }
}

impl fmt::Display for TimeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

impl FromStr for TimeSignature {
    type Err = ClockError;

    fn from_str(s: &str) -> Result<Self> {
        let malformed = || ClockError::MalformedTimeSignature(s.to_string());
        let (numerator, denominator) = s.trim().split_once('/').ok_or_else(malformed)?;
        let numerator = numerator.trim().parse().map_err(|_| malformed())?;
        let denominator = denominator.trim().parse().map_err(|_| malformed())?;
        Self::new(numerator, denominator)
    }
}

impl TryFrom<String> for TimeSignature {
    type Error = ClockError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<TimeSignature> for String {
    fn from(value: TimeSignature) -> Self {
        value.to_string()
    }
}

/// Unit of a scheduling request or a reschedule delta.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    /// Quarter-note beats (offset units).
    #[default]
    Beats,
    /// Wall-clock seconds.
    Seconds,
    /// Whole measures under the active time signature.
    Measures,
}

/// Offset at which `measure` begins.
pub fn measure_to_offset(
    measure: i64,
    signature: TimeSignature,
    reference_measure: i64,
    reference_measure_offset: f64,
) -> f64 {
    (measure as f64 - reference_measure as f64) * signature.beats_per_bar() + reference_measure_offset
}

/// Measure containing `offset`.
pub fn offset_to_measure(
    offset: f64,
    signature: TimeSignature,
    reference_measure: i64,
    reference_measure_offset: f64,
) -> i64 {
    let (measures, _) = split_measures(offset, signature, reference_measure_offset);
    measures.saturating_add(reference_measure)
}

/// Distance of `offset` from the downbeat of its measure.
pub fn offset_to_measure_offset(
    offset: f64,
    signature: TimeSignature,
    reference_measure_offset: f64,
) -> f64 {
    let (_, measure_offset) = split_measures(offset, signature, reference_measure_offset);
    measure_offset
}

/// Wall-clock seconds at which `offset` falls.
pub fn offset_to_seconds(
    beats_per_minute: f64,
    offset: f64,
    reference_offset: f64,
    reference_seconds: f64,
    beat_duration: f64,
) -> f64 {
    (offset - reference_offset) / (beats_per_minute / 60.0) / beat_duration + reference_seconds
}

/// Offset reached at wall-clock `seconds`. Inverse of [`offset_to_seconds`].
pub fn seconds_to_offset(
    beats_per_minute: f64,
    seconds: f64,
    reference_offset: f64,
    reference_seconds: f64,
    beat_duration: f64,
) -> f64 {
    (seconds - reference_seconds) * (beats_per_minute / 60.0) * beat_duration + reference_offset
}

// Floor division and remainder computed together so that the measure number
// and the measure offset never disagree at a float boundary.
fn split_measures(
    offset: f64,
    signature: TimeSignature,
    reference_measure_offset: f64,
) -> (i64, f64) {
    let bar = signature.beats_per_bar();
    let position = offset - reference_measure_offset;
    let measure_offset = position.rem_euclid(bar);
    let measures = ((position - measure_offset) / bar).round() as i64;
    (measures, measure_offset)
}

/// A consistent snapshot of one instant in every coordinate system.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Moment {
    pub beats_per_minute: f64,
    pub measure: i64,
    pub measure_offset: f64,
    /// Quarter-note beats since zero.
    pub offset: f64,
    /// Wall-clock seconds.
    pub seconds: f64,
    pub time_signature: TimeSignature,
}

/// Where a request lands once bound to absolute time.
///
/// `offset` is set for events that must follow tempo changes; `measure` is
/// additionally set for events that must follow signature changes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SchedulePoint {
    pub seconds: f64,
    pub offset: Option<f64>,
    pub measure: Option<i64>,
}

impl SchedulePoint {
    /// A point pinned to wall-clock time only.
    pub fn at_seconds(seconds: f64) -> Self {
        Self {
            seconds,
            offset: None,
            measure: None,
        }
    }
}

/// Tempo, signature and the anchors every conversion is relative to.
///
/// Replaced wholesale whenever a change is applied; never edited field by
/// field while the clock runs.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClockState {
    pub beats_per_minute: f64,
    pub time_signature: TimeSignature,
    /// Wall-clock time of the last tempo anchor.
    pub reference_seconds: f64,
    /// Offset at `reference_seconds`.
    pub reference_offset: f64,
    /// Measure active at the last signature anchor.
    pub reference_measure: i64,
    /// Offset at which `reference_measure` began.
    pub reference_measure_change_offset: f64,
    /// Wall-clock time the clock was started.
    pub initial_seconds: f64,
}

impl Default for ClockState {
    fn default() -> Self {
        Self {
            beats_per_minute: 120.0,
            time_signature: TimeSignature::COMMON,
            reference_seconds: 0.0,
            reference_offset: 0.0,
            reference_measure: 1,
            reference_measure_change_offset: 0.0,
            initial_seconds: 0.0,
        }
    }
}

impl ClockState {
    pub fn measure_to_offset(&self, measure: i64) -> f64 {
        measure_to_offset(
            measure,
            self.time_signature,
            self.reference_measure,
            self.reference_measure_change_offset,
        )
    }

    pub fn offset_to_measure(&self, offset: f64) -> i64 {
        offset_to_measure(
            offset,
            self.time_signature,
            self.reference_measure,
            self.reference_measure_change_offset,
        )
    }

    pub fn offset_to_measure_offset(&self, offset: f64) -> f64 {
        offset_to_measure_offset(
            offset,
            self.time_signature,
            self.reference_measure_change_offset,
        )
    }

    pub fn offset_to_seconds(&self, offset: f64) -> f64 {
        offset_to_seconds(
            self.beats_per_minute,
            offset,
            self.reference_offset,
            self.reference_seconds,
            self.time_signature.beat_duration(),
        )
    }

    pub fn seconds_to_offset(&self, seconds: f64) -> f64 {
        seconds_to_offset(
            self.beats_per_minute,
            seconds,
            self.reference_offset,
            self.reference_seconds,
            self.time_signature.beat_duration(),
        )
    }

    /// Resolve a moment from a known offset.
    pub fn offset_to_moment(&self, offset: f64) -> Moment {
        let (measures, measure_offset) = split_measures(
            offset,
            self.time_signature,
            self.reference_measure_change_offset,
        );
        Moment {
            beats_per_minute: self.beats_per_minute,
            measure: measures.saturating_add(self.reference_measure),
            measure_offset,
            offset,
            seconds: self.offset_to_seconds(offset),
            time_signature: self.time_signature,
        }
    }

    /// Resolve a moment from a known wall-clock time.
    pub fn seconds_to_moment(&self, seconds: f64) -> Moment {
        let offset = self.seconds_to_offset(seconds);
        Moment {
            seconds,
            ..self.offset_to_moment(offset)
        }
    }

    /// Bind a beats or measures request to absolute time.
    ///
    /// Seconds requests depend on the clock's start time and are resolved
    /// by the core.
    pub fn schedule_point(&self, schedule_at: f64, time_unit: TimeUnit) -> SchedulePoint {
        match time_unit {
            TimeUnit::Measures => {
                let measure = schedule_at as i64;
                let offset = self.measure_to_offset(measure);
                SchedulePoint {
                    seconds: self.offset_to_seconds(offset),
                    offset: Some(offset),
                    measure: Some(measure),
                }
            }
            TimeUnit::Beats => SchedulePoint {
                seconds: self.offset_to_seconds(schedule_at),
                offset: Some(schedule_at),
                measure: None,
            },
            TimeUnit::Seconds => SchedulePoint::at_seconds(schedule_at),
        }
    }

    /// Round the instant `seconds` forward onto a quantization grid.
    ///
    /// A point already on the grid stays where it is: a `1M` cue issued
    /// exactly on a downbeat targets that downbeat.
    pub fn cue_point(&self, seconds: f64, quantization: Option<Quantization>) -> SchedulePoint {
        let moment = self.seconds_to_moment(seconds);
        let (offset, measure) = match quantization {
            None => (moment.offset, None),
            Some(Quantization::Measures(grid)) => {
                let grid = i64::from(grid);
                let grid_offset = moment.measure - 1 + i64::from(moment.measure_offset > 0.0);
                let count = grid_offset.div_euclid(grid) + i64::from(grid_offset.rem_euclid(grid) > 0);
                let measure = count * grid + 1;
                (self.measure_to_offset(measure), Some(measure))
            }
            Some(fraction) => {
                let grid = fraction.beats();
                let mut offset = moment.offset.div_euclid(grid) * grid;
                if moment.offset.rem_euclid(grid) != 0.0 {
                    offset += grid;
                }
                (offset, None)
            }
        };
        let seconds = self.offset_to_seconds(offset);
        SchedulePoint {
            seconds,
            offset: Some(offset),
            measure,
        }
    }
}
