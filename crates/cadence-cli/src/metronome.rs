//! Pieces shared by the metronome commands.

use crate::MetronomeArgs;
use anyhow::{Context, Result};
use cadence_clock::{
    Callback, Change, ClockConfig, ClockContext, ClockHandle, Reschedule, TimeSignature, TimeUnit,
};
use std::fmt;

/// One metronome click.
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    pub measure: i64,
    /// 1-based beat within the measure.
    pub beat: u32,
    pub offset: f64,
    /// Seconds since the clock started.
    pub seconds: f64,
    pub beats_per_minute: f64,
    pub time_signature: TimeSignature,
}

impl Tick {
    pub fn from_context(context: &ClockContext, initial_seconds: f64) -> Self {
        let moment = context.desired_moment;
        let beat_duration = moment.time_signature.beat_duration();
        Self {
            measure: moment.measure,
            beat: (moment.measure_offset / beat_duration + 1e-9).floor() as u32 + 1,
            offset: moment.offset,
            seconds: moment.seconds - initial_seconds,
            beats_per_minute: moment.beats_per_minute,
            time_signature: moment.time_signature,
        }
    }

    pub fn is_downbeat(&self) -> bool {
        self.beat == 1
    }
}

impl fmt::Display for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:>4}.{:<2} {:>8.3}o {:>9.3}s  {:>6.1} BPM  {}{}",
            self.measure,
            self.beat,
            self.offset,
            self.seconds,
            self.beats_per_minute,
            self.time_signature,
            if self.is_downbeat() { "  *" } else { "" }
        )
    }
}

/// Build the clock configuration from a config file and command-line
/// overrides.
pub fn load_config(args: &MetronomeArgs) -> Result<ClockConfig> {
    let mut config = match &args.config {
        Some(path) => ClockConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ClockConfig::default(),
    };
    if config.name.is_none() {
        config.name = Some("metronome".to_string());
    }
    if let Some(bpm) = args.bpm {
        config.beats_per_minute = bpm;
    }
    if let Some(signature) = &args.signature {
        config.time_signature = signature
            .parse()
            .with_context(|| format!("Invalid --signature {signature:?}"))?;
    }
    config.validate()?;
    Ok(config)
}

/// Parse `BEAT:BPM`.
pub fn parse_tempo_change(text: &str) -> Result<(f64, f64)> {
    let (beat, bpm) = text
        .split_once(':')
        .with_context(|| format!("Expected BEAT:BPM, got {text:?}"))?;
    let beat = beat.trim().parse().with_context(|| format!("Invalid beat in {text:?}"))?;
    let bpm = bpm.trim().parse().with_context(|| format!("Invalid tempo in {text:?}"))?;
    Ok((beat, bpm))
}

/// Parse `MEASURE:SIGNATURE`.
pub fn parse_meter_change(text: &str) -> Result<(i64, TimeSignature)> {
    let (measure, signature) = text
        .split_once(':')
        .with_context(|| format!("Expected MEASURE:SIGNATURE, got {text:?}"))?;
    let measure = measure
        .trim()
        .parse()
        .with_context(|| format!("Invalid measure in {text:?}"))?;
    let signature = signature
        .parse()
        .with_context(|| format!("Invalid signature in {text:?}"))?;
    Ok((measure, signature))
}

/// Schedule every requested tempo and signature change.
pub fn schedule_changes(handle: &ClockHandle, args: &MetronomeArgs) -> Result<()> {
    for text in &args.tempo_changes {
        let (beat, bpm) = parse_tempo_change(text)?;
        handle.schedule_change(Change::tempo(bpm), beat, TimeUnit::Beats)?;
        log::info!("Tempo {} BPM at beat {}", bpm, beat);
    }
    for text in &args.meter_changes {
        let (measure, signature) = parse_meter_change(text)?;
        handle.schedule_change(Change::signature(signature), measure as f64, TimeUnit::Measures)?;
        log::info!("Signature {} at measure {}", signature, measure);
    }
    Ok(())
}

/// A callback clicking on every beat of the active signature.
///
/// `emit` receives each tick; an error from it stops the metronome. With a
/// `limit`, the metronome stops after that many ticks.
pub fn click<F>(handle: ClockHandle, limit: Option<u32>, emit: F) -> Callback
where
    F: Fn(Tick) -> Result<()> + Send + Sync + 'static,
{
    Callback::new(move |context, _| {
        let initial_seconds = handle.state().initial_seconds;
        emit(Tick::from_context(context, initial_seconds))?;
        if limit.is_some_and(|limit| context.event.invocations() + 1 >= limit) {
            return Ok(Reschedule::Stop);
        }
        Ok(Reschedule::Beats(
            context.desired_moment.time_signature.beat_duration(),
        ))
    })
}
