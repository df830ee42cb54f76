//! Scheduler drivers.
//!
//! A driver owns the waiting: it polls the core, sleeps until the next event
//! is due (never longer than the slop), then runs a perform cycle. Three
//! drivers share the same cycle:
//! - [`Clock`] - a dedicated OS thread
//! - [`AsyncClock`] - a tokio task (feature `async`)
//! - [`OfflineClock`] - no waiting at all; time jumps to each event

#[cfg(feature = "async")]
pub mod cooperative;
pub mod offline;
pub mod thread;

#[cfg(feature = "async")]
pub use cooperative::AsyncClock;
pub use offline::OfflineClock;
pub use thread::Clock;

use crate::error::Result;
use crate::handle::Shared;
use crate::scheduler::Step;
use crate::timing::{Moment, TimeSignature};

/// How a clock starts.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StartOptions {
    /// Wall-clock start time. Defaults to the time source's "now".
    pub initial_seconds: Option<f64>,
    pub initial_offset: f64,
    pub initial_measure: i64,
    /// Defaults to the clock's current tempo.
    pub beats_per_minute: Option<f64>,
    /// Defaults to the clock's current signature.
    pub time_signature: Option<TimeSignature>,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            initial_seconds: None,
            initial_offset: 0.0,
            initial_measure: 1,
            beats_per_minute: None,
            time_signature: None,
        }
    }
}

impl StartOptions {
    pub fn with_initial_seconds(mut self, seconds: f64) -> Self {
        self.initial_seconds = Some(seconds);
        self
    }

    pub fn with_initial_offset(mut self, offset: f64) -> Self {
        self.initial_offset = offset;
        self
    }

    pub fn with_initial_measure(mut self, measure: i64) -> Self {
        self.initial_measure = measure;
        self
    }

    pub fn with_tempo(mut self, beats_per_minute: f64) -> Self {
        self.beats_per_minute = Some(beats_per_minute);
        self
    }

    pub fn with_signature(mut self, time_signature: TimeSignature) -> Self {
        self.time_signature = Some(time_signature);
        self
    }
}

/// Perform everything due at `current`, running callbacks on this thread.
///
/// The core's lock is released while a callback runs, so callbacks may
/// schedule, cancel or stop through any handle.
pub(crate) fn perform_cycle(shared: &Shared, mut current: Moment) -> Result<()> {
    loop {
        let step = shared.core.lock().perform_step(&mut current)?;
        match step {
            Step::Done => return Ok(()),
            Step::Continue => continue,
            Step::Fire(firing) => {
                let reschedule = firing.procedure.invoke_blocking(
                    &shared.label,
                    &firing.context,
                    &firing.arguments,
                );
                let mut core = shared.core.lock();
                core.finish_callback(firing, reschedule);
                core.process_commands(false);
            }
        }
    }
}

/// [`perform_cycle`] for tasks: async callbacks are awaited in place.
#[cfg(feature = "async")]
pub(crate) async fn perform_cycle_async(shared: &Shared, mut current: Moment) -> Result<()> {
    loop {
        let step = shared.core.lock().perform_step(&mut current)?;
        match step {
            Step::Done => return Ok(()),
            Step::Continue => continue,
            Step::Fire(firing) => {
                let reschedule = firing
                    .procedure
                    .invoke(
                        &shared.label,
                        firing.context.clone(),
                        firing.arguments.clone(),
                    )
                    .await;
                let mut core = shared.core.lock();
                core.finish_callback(firing, reschedule);
                core.process_commands(false);
            }
        }
    }
}
