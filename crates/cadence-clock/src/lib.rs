//! Cadence Clock - Tempo-aware scheduling of callbacks in musical time.
//!
//! This crate provides a clock that runs user callbacks at positions given
//! in seconds, beats or measures, and keeps them in place while tempo and
//! time signature change underneath:
//!
//! - **Timing** - Time signatures and the seconds/offset/measure conversions
//! - **Quantize** - Grids such as `1M` or `1/8T` for cued events
//! - **Events** - Callbacks, changes, commands and queued events
//! - **Scheduler** - The scheduling algorithm, free of any waiting
//! - **Runtime** - Threaded, tokio and offline drivers
//! - **Config** - TOML clock configuration
//!
//! # Architecture
//!
//! Requests enter as [`Command`]s and are bound to absolute time by the
//! [`ClockCore`] once the clock runs. Bound [`Event`]s wait in a priority
//! queue ordered by due time, priority and id. A driver polls the core,
//! sleeps until the next event is due and performs it; callbacks run with
//! the core unlocked and answer with a [`Reschedule`].
//!
//! # Feature Flags
//!
//! - `async` (default) - [`AsyncClock`], a driver running on a tokio runtime

pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod global;
pub mod handle;
pub mod quantize;
pub mod queue;
pub mod runtime;
pub mod scheduler;
pub mod timing;

pub use config::ClockConfig;
pub use error::{ClockError, Result};
pub use events::{
    Action, Arguments, Callback, Change, ClockContext, Command, Event, EventId, EventType,
    Payload, Procedure, Reschedule,
};
pub use global::{default_clock, get_default_clock, teardown_default_clock};
pub use handle::{ClockHandle, ManualTimeSource, SystemTimeSource, TimeSource};
pub use quantize::Quantization;
pub use queue::EventQueue;
pub use runtime::{Clock, OfflineClock, StartOptions};
pub use scheduler::{ClockCore, Firing, Poll, Step, DEFAULT_SLOP};
pub use timing::{
    measure_to_offset, offset_to_measure, offset_to_measure_offset, offset_to_seconds,
    seconds_to_offset, ClockState, Moment, SchedulePoint, TimeSignature, TimeUnit,
};

#[cfg(feature = "async")]
pub use runtime::AsyncClock;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduling_smoke() {
        let clock = OfflineClock::with_name("smoke");
        let fired = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = std::sync::Arc::clone(&fired);
        clock
            .cue(
                Callback::new(move |context, arguments| {
                    let label = arguments.kwarg("label").and_then(|v| v.as_str());
                    sink.lock()
                        .push((label.map(str::to_string), context.desired_moment.measure));
                    Ok(Reschedule::Measures(1.0))
                })
                .with_kwarg("label", "bar"),
                Some("1M"),
            )
            .unwrap();
        clock
            .schedule_change(Change::tempo(60.0), 2.0, TimeUnit::Measures)
            .unwrap();
        let clock = clock.with_horizon(10.0);
        clock.start(StartOptions::default()).unwrap();

        // Bars at 0s and 2s, then four seconds per bar at 60 BPM
        let measures: Vec<i64> = fired.lock().iter().map(|(_, m)| *m).collect();
        assert_eq!(measures, vec![1, 2, 3, 4]);
        assert!(fired
            .lock()
            .iter()
            .all(|(label, _)| label.as_deref() == Some("bar")));
    }

    #[test]
    fn test_time_signature_display() {
        let signature: TimeSignature = "12/8".parse().unwrap();
        assert_eq!(signature.beats_per_bar(), 6.0);
        assert_eq!(signature.to_string(), "12/8");
    }
}
