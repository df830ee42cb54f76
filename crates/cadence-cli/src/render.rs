//! Offline click track rendering.
//!
//! Runs the metronome on an [`OfflineClock`], so the whole track is computed
//! without waiting and every tick lands at its exact scheduled moment.

use crate::metronome::{self, Tick};
use crate::RenderArgs;
use anyhow::{Context, Result};
use cadence_clock::{OfflineClock, TimeUnit};
use std::io::Write;
use std::sync::{Arc, Mutex};

/// Render a click track (standalone command with logger init).
pub fn render(args: RenderArgs) -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let ticks = render_ticks(&args)?;
    let mut stdout = std::io::stdout().lock();
    for tick in &ticks {
        writeln!(stdout, "{}", tick)?;
    }
    Ok(())
}

/// Render a click track and return its ticks (callable from other code).
pub fn render_ticks(args: &RenderArgs) -> Result<Vec<Tick>> {
    let config = metronome::load_config(&args.metronome)?;
    log::info!(
        "Rendering {} ticks at {} BPM in {}",
        args.ticks,
        config.beats_per_minute,
        config.time_signature
    );

    let clock = OfflineClock::from_config(&config).context("Failed to build clock")?;
    metronome::schedule_changes(&clock, &args.metronome)?;

    let ticks = Arc::new(Mutex::new(Vec::new()));
    if args.ticks > 0 {
        let sink = Arc::clone(&ticks);
        clock.schedule(
            metronome::click(clock.handle(), Some(args.ticks), move |tick| {
                sink.lock()
                    .map_err(|_| anyhow::anyhow!("Tick buffer poisoned"))?
                    .push(tick);
                Ok(())
            }),
            0.0,
            TimeUnit::Beats,
        )?;
    }
    clock.start(config.start_options())?;

    let ticks = ticks
        .lock()
        .map_err(|_| anyhow::anyhow!("Tick buffer poisoned"))?
        .clone();
    log::info!("Rendered {} ticks", ticks.len());
    Ok(ticks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MetronomeArgs;

    fn args(ticks: u32) -> RenderArgs {
        RenderArgs {
            metronome: MetronomeArgs {
                config: None,
                bpm: Some(60.0),
                signature: Some("3/4".to_string()),
                tempo_changes: Vec::new(),
                meter_changes: Vec::new(),
            },
            ticks,
        }
    }

    #[test]
    fn test_render_plain_track() {
        let ticks = render_ticks(&args(4)).unwrap();
        let positions: Vec<(i64, u32, f64)> =
            ticks.iter().map(|t| (t.measure, t.beat, t.seconds)).collect();
        assert_eq!(
            positions,
            vec![(1, 1, 0.0), (1, 2, 1.0), (1, 3, 2.0), (2, 1, 3.0)]
        );
    }

    #[test]
    fn test_render_with_tempo_change() {
        let mut args = args(4);
        args.metronome.tempo_changes.push("2:120".to_string());
        let ticks = render_ticks(&args).unwrap();
        let seconds: Vec<f64> = ticks.iter().map(|t| t.seconds).collect();
        assert_eq!(seconds, vec![0.0, 1.0, 2.0, 2.5]);
        assert_eq!(ticks[3].beats_per_minute, 120.0);
    }

    #[test]
    fn test_render_rejects_bad_input() {
        let mut bad_meter = args(4);
        bad_meter.metronome.meter_changes.push("two:3/4".to_string());
        assert!(render_ticks(&bad_meter).is_err());

        let mut bad_tempo = args(4);
        bad_tempo.metronome.bpm = Some(-1.0);
        assert!(render_ticks(&bad_tempo).is_err());
    }

    #[test]
    fn test_render_nothing() {
        assert!(render_ticks(&args(0)).unwrap().is_empty());
    }
}
