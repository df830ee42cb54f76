//! Non-real-time driver: time jumps straight to each due event.

use super::{perform_cycle, StartOptions};
use crate::config::ClockConfig;
use crate::error::Result;
use crate::handle::{ClockHandle, ManualTimeSource, TimeSource};
use crate::scheduler::Poll;
use std::ops::Deref;
use std::sync::Arc;

/// A clock that never waits.
///
/// [`start`](OfflineClock::start) runs the whole schedule on the calling
/// thread and returns when nothing is left, when a callback halts the clock,
/// or when the next event lies past the horizon. Two clocks given the same
/// schedule fire the same events at the same moments.
pub struct OfflineClock {
    handle: ClockHandle,
    time: ManualTimeSource,
    horizon: Option<f64>,
}

impl Default for OfflineClock {
    fn default() -> Self {
        Self::new()
    }
}

impl OfflineClock {
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn with_name(name: impl Into<String>) -> Self {
        Self::build(Some(name.into()))
    }

    fn build(name: Option<String>) -> Self {
        let time = ManualTimeSource::new(0.0);
        Self {
            handle: ClockHandle::new(name, Arc::new(time.clone())),
            time,
            horizon: None,
        }
    }

    /// Build a stopped clock from configuration.
    pub fn from_config(config: &ClockConfig) -> Result<Self> {
        config.validate()?;
        let clock = Self::build(config.name.clone());
        config.apply(&clock.handle)?;
        Ok(clock)
    }

    /// Stop once the next event is more than `seconds` past the start.
    pub fn with_horizon(mut self, seconds: f64) -> Self {
        self.horizon = Some(seconds);
        self
    }

    pub fn handle(&self) -> ClockHandle {
        self.handle.clone()
    }

    /// The simulated time source.
    pub fn time(&self) -> &ManualTimeSource {
        &self.time
    }

    /// Start the clock and perform every event in order, then stop.
    pub fn start(&self, options: StartOptions) -> Result<()> {
        let shared = &self.handle.shared;
        let initial_seconds = {
            let mut core = shared.core.lock();
            core.start(&options, self.time.now())?;
            core.state().initial_seconds
        };
        loop {
            let next = {
                let mut core = shared.core.lock();
                if !core.is_running() {
                    break;
                }
                core.process_commands(false);
                core.next_due_seconds()
            };
            let Some(next) = next else {
                log::debug!("[{}] Nothing left to perform", shared.label);
                break;
            };
            if let Some(horizon) = self.horizon {
                if next - initial_seconds > horizon {
                    log::debug!("[{}] Reached horizon at {}s", shared.label, horizon);
                    break;
                }
            }
            let now = next.max(self.time.now());
            self.time.set(now);
            let poll = shared.core.lock().poll(now);
            match poll {
                Poll::Stopped => break,
                Poll::Sleep(_) => continue,
                Poll::Perform(moment) => {
                    if let Err(e) = perform_cycle(shared, moment) {
                        shared.core.lock().stop();
                        log::error!("[{}] Render stopped: {}", shared.label, e);
                        return Err(e);
                    }
                }
            }
        }
        self.handle.halt();
        Ok(())
    }

    /// Stop the clock. Returns whether it was running.
    pub fn stop(&self) -> bool {
        self.handle.halt()
    }
}

impl Deref for OfflineClock {
    type Target = ClockHandle;

    fn deref(&self) -> &ClockHandle {
        &self.handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClockError;
    use crate::events::{Callback, Change, EventId, Reschedule};
    use crate::timing::{TimeSignature, TimeUnit};
    use parking_lot::Mutex;

    type Log = Arc<Mutex<Vec<(u64, f64, f64)>>>;

    /// A callback recording `(id, desired seconds, desired offset)` and
    /// repeating every `every` beats, `times` times in total.
    fn recorder(log: &Log, every: f64, times: u32) -> Callback {
        let log = Arc::clone(log);
        Callback::new(move |context, _| {
            let desired = context.desired_moment;
            log.lock()
                .push((context.event.event_id.get(), desired.seconds, desired.offset));
            if context.event.invocations() + 1 >= times {
                Ok(Reschedule::Stop)
            } else {
                Ok(Reschedule::Beats(every))
            }
        })
    }

    fn seconds(log: &Log) -> Vec<f64> {
        log.lock().iter().map(|(_, s, _)| *s).collect()
    }

    #[test]
    fn test_metronome_at_120() {
        let clock = OfflineClock::new();
        let log = Log::default();
        clock.schedule(recorder(&log, 1.0, 4), 1.0, TimeUnit::Beats).unwrap();
        clock.start(StartOptions::default()).unwrap();
        assert_eq!(seconds(&log), vec![0.5, 1.0, 1.5, 2.0]);
        assert!(!clock.is_running());
    }

    #[test]
    fn test_cue_on_next_measure() {
        let clock = OfflineClock::new();
        let log = Log::default();
        let cued = Log::default();
        let handle = clock.handle();
        let cue_log = Arc::clone(&cued);
        clock
            .schedule(
                Callback::new(move |_, _| {
                    let cue_log = Arc::clone(&cue_log);
                    handle.cue(
                        Callback::new(move |context, _| {
                            let desired = context.desired_moment;
                            cue_log.lock().push((
                                desired.measure as u64,
                                desired.seconds,
                                desired.offset,
                            ));
                            Ok(Reschedule::Stop)
                        }),
                        Some("1M"),
                    )?;
                    Ok(Reschedule::Stop)
                }),
                0.5,
                TimeUnit::Beats,
            )
            .unwrap();
        clock.schedule(recorder(&log, 1.0, 1), 4.0, TimeUnit::Beats).unwrap();
        clock.start(StartOptions::default()).unwrap();
        assert_eq!(cued.lock().as_slice(), &[(2, 2.0, 4.0)]);
    }

    #[test]
    fn test_tempo_change_mid_run() {
        let clock = OfflineClock::new();
        let log = Log::default();
        clock.schedule(recorder(&log, 1.0, 5), 1.0, TimeUnit::Beats).unwrap();
        clock
            .schedule_change(Change::tempo(60.0), 3.0, TimeUnit::Beats)
            .unwrap();
        clock.start(StartOptions::default()).unwrap();
        // Beats 1-3 at 120 BPM, then a second per beat
        assert_eq!(seconds(&log), vec![0.5, 1.0, 1.5, 2.5, 3.5]);
        assert_eq!(clock.beats_per_minute(), 60.0);
    }

    #[test]
    fn test_signature_change_moves_downbeats() {
        let clock = OfflineClock::new();
        let log = Log::default();
        let downbeat = clock.schedule(recorder(&log, 1.0, 1), 3.0, TimeUnit::Measures).unwrap();
        clock
            .schedule_change(
                Change::signature(TimeSignature::new(3, 4).unwrap()),
                1.0,
                TimeUnit::Beats,
            )
            .unwrap();
        clock.start(StartOptions::default()).unwrap();
        // Measures are three beats long from measure 1 on
        assert_eq!(log.lock().as_slice(), &[(downbeat.get(), 3.0, 6.0)]);
        assert_eq!(clock.time_signature(), TimeSignature::new(3, 4).unwrap());
    }

    #[test]
    fn test_same_instant_ordering() {
        let clock = OfflineClock::new();
        let log = Log::default();
        let late_type = crate::events::EventType::new(5).unwrap();
        let b = clock
            .schedule(
                recorder(&log, 1.0, 1).with_event_type(late_type),
                2.0,
                TimeUnit::Beats,
            )
            .unwrap();
        let c = clock.schedule(recorder(&log, 1.0, 1), 2.0, TimeUnit::Beats).unwrap();
        let d = clock.schedule(recorder(&log, 1.0, 1), 2.0, TimeUnit::Beats).unwrap();
        clock
            .schedule_change(Change::tempo(240.0), 2.0, TimeUnit::Beats)
            .unwrap();
        clock.start(StartOptions::default()).unwrap();
        let ids: Vec<u64> = log.lock().iter().map(|(id, _, _)| *id).collect();
        assert_eq!(ids, vec![c.get(), d.get(), b.get()]);
        assert!(seconds(&log).iter().all(|s| *s == 1.0));
    }

    #[test]
    fn test_self_cancel_inside_callback() {
        let clock = OfflineClock::new();
        let handle = clock.handle();
        let fired = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&fired);
        clock
            .schedule(
                Callback::new(move |context, _| {
                    *counter.lock() += 1;
                    assert!(handle.cancel(context.event.event_id).is_some());
                    Ok(Reschedule::Beats(1.0))
                }),
                0.0,
                TimeUnit::Beats,
            )
            .unwrap();
        clock.start(StartOptions::default()).unwrap();
        assert_eq!(*fired.lock(), 1);
    }

    #[test]
    fn test_cancel_unknown_and_twice() {
        let clock = OfflineClock::new();
        let log = Log::default();
        let id = clock.schedule(recorder(&log, 1.0, 1), 1.0, TimeUnit::Beats).unwrap();
        assert!(clock.cancel(id).is_some());
        assert!(clock.cancel(id).is_none());
        assert!(clock.cancel(EventId::new(1234)).is_none());
        clock.start(StartOptions::default()).unwrap();
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_runs_are_deterministic() {
        fn run() -> Vec<(u64, f64, f64)> {
            let clock = OfflineClock::new();
            let log = Log::default();
            clock.schedule(recorder(&log, 0.75, 8), 0.0, TimeUnit::Beats).unwrap();
            clock.schedule(recorder(&log, 1.0, 6), 1.0, TimeUnit::Measures).unwrap();
            clock.schedule(recorder(&log, 0.5, 5), 0.3, TimeUnit::Seconds).unwrap();
            clock
                .schedule_change(Change::tempo(97.0), 2.0, TimeUnit::Beats)
                .unwrap();
            clock.start(StartOptions::default()).unwrap();
            let result = log.lock().clone();
            result
        }
        let first = run();
        assert_eq!(first.len(), 19);
        assert_eq!(first, run());
    }

    #[test]
    fn test_horizon_and_halt() {
        let clock = OfflineClock::new().with_horizon(1.0);
        let log = Log::default();
        clock.schedule(recorder(&log, 1.0, 100), 0.0, TimeUnit::Beats).unwrap();
        clock.start(StartOptions::default()).unwrap();
        assert_eq!(seconds(&log), vec![0.0, 0.5, 1.0]);

        let clock = OfflineClock::new();
        let handle = clock.handle();
        let count = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&count);
        clock
            .schedule(
                Callback::new(move |_, _| {
                    *counter.lock() += 1;
                    if *counter.lock() == 3 {
                        handle.halt();
                    }
                    Ok(Reschedule::Seconds(0.1))
                }),
                0.0,
                TimeUnit::Beats,
            )
            .unwrap();
        clock.start(StartOptions::default()).unwrap();
        assert_eq!(*count.lock(), 3);
    }

    #[test]
    fn test_start_options_apply() {
        let clock = OfflineClock::new();
        let log = Log::default();
        clock.schedule(recorder(&log, 1.0, 1), 2.0, TimeUnit::Measures).unwrap();
        clock
            .start(
                StartOptions::default()
                    .with_initial_seconds(10.0)
                    .with_tempo(60.0)
                    .with_signature(TimeSignature::new(3, 4).unwrap()),
            )
            .unwrap();
        assert_eq!(log.lock().as_slice(), &[(0, 13.0, 3.0)]);
        assert!(matches!(
            clock.start(StartOptions::default().with_tempo(0.0)),
            Err(ClockError::InvalidTempo(_))
        ));
    }
}
