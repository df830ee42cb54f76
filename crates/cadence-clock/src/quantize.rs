//! Quantization grids for cued events.

use crate::error::{ClockError, Result};
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// A grid that cued events snap forward onto.
///
/// Parsed from tokens such as `"1M"`, `"4M"`, `"1/4"` or `"1/8T"`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Quantization {
    /// Every `n` measures, counted from measure 1.
    Measures(u32),
    /// A note-value grid. `1/D` spans `4/D` quarter-note beats, a triplet
    /// two thirds of that.
    Fraction { denominator: u32, triplet: bool },
}

const MEASURE_GRIDS: [u32; 4] = [1, 2, 4, 8];
const FRACTION_GRIDS: [u32; 7] = [2, 4, 8, 16, 32, 64, 128];

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?:(?P<measures>\d+)M|1/(?P<denominator>\d+)(?P<triplet>T)?)$")
            .expect("quantization pattern is valid")
    })
}

impl Quantization {
    /// Grid spacing in quarter-note beats.
    ///
    /// Measure grids depend on the active signature; this reports them in
    /// common time.
    pub fn beats(&self) -> f64 {
        match *self {
            Quantization::Measures(n) => n as f64 * 4.0,
            Quantization::Fraction {
                denominator,
                triplet,
            } => {
                let beats = 4.0 / denominator as f64;
                if triplet {
                    beats * 2.0 / 3.0
                } else {
                    beats
                }
            }
        }
    }
}

impl FromStr for Quantization {
    type Err = ClockError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ClockError::InvalidQuantization(s.to_string());
        let captures = token_pattern().captures(s).ok_or_else(invalid)?;
        if let Some(measures) = captures.name("measures") {
            let n: u32 = measures.as_str().parse().map_err(|_| invalid())?;
            if !MEASURE_GRIDS.contains(&n) {
                return Err(invalid());
            }
            return Ok(Quantization::Measures(n));
        }
        let denominator: u32 = captures
            .name("denominator")
            .ok_or_else(invalid)?
            .as_str()
            .parse()
            .map_err(|_| invalid())?;
        let triplet = captures.name("triplet").is_some();
        // 1/128T is not an accepted token
        if !FRACTION_GRIDS.contains(&denominator) || (triplet && denominator == 128) {
            return Err(invalid());
        }
        Ok(Quantization::Fraction {
            denominator,
            triplet,
        })
    }
}

impl fmt::Display for Quantization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Quantization::Measures(n) => write!(f, "{n}M"),
            Quantization::Fraction {
                denominator,
                triplet,
            } => write!(f, "1/{denominator}{}", if triplet { "T" } else { "" }),
        }
    }
}
