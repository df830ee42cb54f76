//! Real-time click track playback.
//!
//! The metronome runs on a threaded [`Clock`]; its callback hands each tick
//! to the main thread over a channel, which prints it as it arrives.

use crate::metronome::{self, Tick};
use crate::PlayArgs;
use anyhow::{Context, Result};
use cadence_clock::{Clock, TimeUnit};
use crossbeam_channel::RecvTimeoutError;
use std::time::Instant;

/// Play a click track until the duration elapses (standalone command with
/// logger init).
pub fn play(args: PlayArgs) -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    play_for(&args, |tick| println!("{}", tick))
}

/// Play a click track, handing every tick to `on_tick` (callable from other
/// code).
pub fn play_for(args: &PlayArgs, mut on_tick: impl FnMut(&Tick)) -> Result<()> {
    let config = metronome::load_config(&args.metronome)?;
    let clock = Clock::from_config(&config).context("Failed to build clock")?;
    if let Some(slop) = args.slop {
        clock.set_slop(slop)?;
    }
    metronome::schedule_changes(&clock, &args.metronome)?;

    let (tx, rx) = crossbeam_channel::unbounded::<Tick>();
    clock.schedule(
        metronome::click(clock.handle(), None, move |tick| {
            tx.send(tick).context("Tick receiver dropped")
        }),
        0.0,
        TimeUnit::Beats,
    )?;

    log::info!(
        "Playing for {} at {} BPM in {}",
        humantime::format_duration(args.duration),
        config.beats_per_minute,
        config.time_signature
    );
    let deadline = Instant::now() + args.duration;
    clock.start(config.start_options())?;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match rx.recv_timeout(remaining) {
            Ok(tick) => on_tick(&tick),
            Err(RecvTimeoutError::Timeout) => break,
            Err(RecvTimeoutError::Disconnected) => {
                log::warn!("Metronome stopped early");
                break;
            }
        }
    }

    clock.stop()?;
    log::info!("Stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MetronomeArgs;
    use std::time::Duration;

    #[test]
    fn test_play_short_track() {
        let args = PlayArgs {
            metronome: MetronomeArgs {
                config: None,
                bpm: Some(600.0),
                signature: Some("2/4".to_string()),
                tempo_changes: Vec::new(),
                meter_changes: Vec::new(),
            },
            duration: Duration::from_millis(450),
            slop: Some(Duration::from_millis(1)),
        };
        let mut ticks = Vec::new();
        play_for(&args, |tick| ticks.push(tick.clone())).unwrap();

        // A tick every 100ms; allow for scheduling jitter at the edges
        assert!(ticks.len() >= 3, "got {} ticks", ticks.len());
        assert_eq!((ticks[0].measure, ticks[0].beat), (1, 1));
        assert_eq!((ticks[1].measure, ticks[1].beat), (1, 2));
        assert_eq!((ticks[2].measure, ticks[2].beat), (2, 1));
        assert!((ticks[2].seconds - 0.2).abs() < 1e-5);
    }
}
