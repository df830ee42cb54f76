//! Thread-safe access to a clock's core.
//!
//! Every driver wraps the same [`Shared`] state: the [`ClockCore`] behind a
//! mutex, the wake-up primitives its driver waits on, and the time source
//! that defines "now". [`ClockHandle`] is the cloneable, `Send + Sync`
//! surface for scheduling, cancelling and inspecting a clock from any
//! thread, including from inside a running callback.

use crate::scheduler::ClockCore;
use crate::error::{ClockError, Result};
use crate::events::{Action, Callback, Change, Command, EventId, EventType, Payload};
use crate::quantize::Quantization;
use crate::timing::{ClockState, Moment, TimeSignature, TimeUnit};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of wall-clock seconds.
pub trait TimeSource: Send + Sync + fmt::Debug {
    fn now(&self) -> f64;
}

/// Seconds since the UNIX epoch.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default()
    }
}

/// A time source that only moves when told to.
///
/// Clones share the same reading.
#[derive(Clone, Debug, Default)]
pub struct ManualTimeSource {
    now: Arc<Mutex<f64>>,
}

impl ManualTimeSource {
    pub fn new(now: f64) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn set(&self, now: f64) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, seconds: f64) {
        *self.now.lock() += seconds;
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> f64 {
        *self.now.lock()
    }
}

/// State shared between a clock's handles and its driver.
pub(crate) struct Shared {
    pub(crate) core: Mutex<ClockCore>,
    pub(crate) wakeup: Condvar,
    #[cfg(feature = "async")]
    pub(crate) notify: tokio::sync::Notify,
    pub(crate) time: Arc<dyn TimeSource>,
    pub(crate) label: String,
    /// Bumped on every start; a driver exits once it no longer matches.
    pub(crate) generation: AtomicU64,
    fatal: Mutex<Option<ClockError>>,
}

impl Shared {
    pub(crate) fn new(name: Option<String>, time: Arc<dyn TimeSource>) -> Self {
        let label = name.clone().unwrap_or_else(|| "clock".to_string());
        Self {
            core: Mutex::new(ClockCore::new(name)),
            wakeup: Condvar::new(),
            #[cfg(feature = "async")]
            notify: tokio::sync::Notify::new(),
            time,
            label,
            generation: AtomicU64::new(0),
            fatal: Mutex::new(None),
        }
    }

    pub(crate) fn now(&self) -> f64 {
        self.time.now()
    }

    /// Interrupt the driver's wait so it polls again.
    pub(crate) fn wake(&self) {
        self.wakeup.notify_all();
        #[cfg(feature = "async")]
        self.notify.notify_one();
    }

    pub(crate) fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Stop the clock after an unrecoverable error. The error is kept for
    /// the next `stop()`.
    pub(crate) fn fail(&self, error: ClockError) {
        log::error!("[{}] Scheduler stopped: {}", self.label, error);
        self.core.lock().stop();
        *self.fatal.lock() = Some(error);
        self.wake();
    }

    pub(crate) fn take_fatal(&self) -> Option<ClockError> {
        self.fatal.lock().take()
    }
}

fn check_position(schedule_at: f64) -> Result<()> {
    if !schedule_at.is_finite() {
        return Err(ClockError::InvalidScheduleTime(schedule_at));
    }
    Ok(())
}

/// Handle for scheduling on a clock.
///
/// Cheap to clone. Calls never block on user code: they only take the
/// core's lock for as long as bookkeeping needs.
#[derive(Clone)]
pub struct ClockHandle {
    pub(crate) shared: Arc<Shared>,
}

impl fmt::Debug for ClockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClockHandle")
            .field("name", &self.shared.label)
            .field("running", &self.is_running())
            .finish()
    }
}

impl ClockHandle {
    pub(crate) fn new(name: Option<String>, time: Arc<dyn TimeSource>) -> Self {
        Self {
            shared: Arc::new(Shared::new(name, time)),
        }
    }

    /// Read the core with a closure.
    pub fn with_core<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&ClockCore) -> R,
    {
        f(&self.shared.core.lock())
    }

    fn with_core_mut<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut ClockCore) -> R,
    {
        let result = f(&mut self.shared.core.lock());
        self.shared.wake();
        result
    }

    fn enqueue(
        &self,
        event_type: EventType,
        schedule_at: impl FnOnce(&ClockCore) -> f64,
        time_unit: Option<TimeUnit>,
        quantization: Option<Quantization>,
        payload: Payload,
    ) -> EventId {
        self.with_core_mut(|core| {
            let event_id = core.issue_event_id();
            let schedule_at = schedule_at(core);
            core.enqueue_command(Command {
                event_id,
                event_type,
                schedule_at,
                time_unit,
                quantization,
                payload,
            });
            event_id
        })
    }

    /// "Now" for a cue: the current time while running, otherwise zero so
    /// that the first drain clamps it to the start time.
    fn cue_time(&self) -> impl FnOnce(&ClockCore) -> f64 + '_ {
        move |core: &ClockCore| {
            if core.is_running() {
                self.shared.now()
            } else {
                0.0
            }
        }
    }

    /// Schedule a callback at an absolute position.
    ///
    /// Seconds given before the clock starts count from its start. Once it
    /// runs, seconds are absolute readings of its time source (see
    /// [`now`](Self::now)).
    pub fn schedule(
        &self,
        callback: Callback,
        schedule_at: f64,
        time_unit: TimeUnit,
    ) -> Result<EventId> {
        check_position(schedule_at)?;
        let event_type = callback.event_type;
        Ok(self.enqueue(
            event_type,
            |_| schedule_at,
            Some(time_unit),
            None,
            callback.into(),
        ))
    }

    /// Schedule a tempo and/or signature change at an absolute position.
    pub fn schedule_change(
        &self,
        change: Change,
        schedule_at: f64,
        time_unit: TimeUnit,
    ) -> Result<EventId> {
        change.validate()?;
        check_position(schedule_at)?;
        Ok(self.enqueue(
            EventType::CHANGE,
            |_| schedule_at,
            Some(time_unit),
            None,
            change.into(),
        ))
    }

    /// Schedule a callback as soon as possible, optionally snapped forward
    /// onto a grid such as `"1M"` or `"1/4"`.
    pub fn cue(&self, callback: Callback, quantization: Option<&str>) -> Result<EventId> {
        let quantization = quantization.map(str::parse::<Quantization>).transpose()?;
        let event_type = callback.event_type;
        Ok(self.enqueue(
            event_type,
            self.cue_time(),
            None,
            quantization,
            callback.into(),
        ))
    }

    /// Schedule a change as soon as possible, optionally quantized.
    pub fn cue_change(&self, change: Change, quantization: Option<&str>) -> Result<EventId> {
        change.validate()?;
        let quantization = quantization.map(str::parse::<Quantization>).transpose()?;
        Ok(self.enqueue(
            EventType::CHANGE,
            self.cue_time(),
            None,
            quantization,
            change.into(),
        ))
    }

    /// Apply a change now.
    ///
    /// On a stopped clock the change takes effect immediately and `None` is
    /// returned; otherwise it is queued for the driver.
    pub fn change(&self, change: Change) -> Result<Option<EventId>> {
        change.validate()?;
        let now = self.shared.now();
        Ok(self.with_core_mut(|core| {
            if !core.is_running() {
                core.apply_idle_change(&change);
                return None;
            }
            let event_id = core.issue_event_id();
            core.enqueue_command(Command {
                event_id,
                event_type: EventType::CHANGE,
                schedule_at: now,
                time_unit: None,
                quantization: None,
                payload: change.into(),
            });
            Some(event_id)
        }))
    }

    /// Move a callback or change to a new position. Returns `Ok(None)` if
    /// the id is unknown.
    pub fn reschedule(
        &self,
        event_id: EventId,
        schedule_at: f64,
        time_unit: TimeUnit,
    ) -> Result<Option<EventId>> {
        check_position(schedule_at)?;
        Ok(self.with_core_mut(|core| core.reschedule(event_id, schedule_at, time_unit, false)))
    }

    /// Like [`reschedule`](Self::reschedule), but only moves the event if
    /// the new position is earlier than the current one.
    pub fn reschedule_earliest(
        &self,
        event_id: EventId,
        schedule_at: f64,
        time_unit: TimeUnit,
    ) -> Result<Option<EventId>> {
        check_position(schedule_at)?;
        Ok(self.with_core_mut(|core| core.reschedule(event_id, schedule_at, time_unit, true)))
    }

    /// Cancel a callback or change. Returns what was pending, `None` if the
    /// id is unknown or already gone.
    pub fn cancel(&self, event_id: EventId) -> Option<Action> {
        self.with_core_mut(|core| core.cancel(event_id))
    }

    /// Stop the clock without waiting for its driver.
    ///
    /// Safe to call from inside a callback. Returns whether it was running.
    pub fn halt(&self) -> bool {
        self.with_core_mut(|core| core.stop())
    }

    pub fn is_running(&self) -> bool {
        self.with_core(|core| core.is_running())
    }

    pub fn name(&self) -> Option<String> {
        self.with_core(|core| core.name().map(str::to_string))
    }

    pub fn beats_per_minute(&self) -> f64 {
        self.with_core(|core| core.state().beats_per_minute)
    }

    pub fn time_signature(&self) -> TimeSignature {
        self.with_core(|core| core.state().time_signature)
    }

    pub fn state(&self) -> ClockState {
        self.with_core(|core| *core.state())
    }

    pub fn slop(&self) -> Duration {
        self.with_core(|core| core.slop())
    }

    /// Upper bound on how long the driver waits between polls.
    pub fn set_slop(&self, slop: Duration) -> Result<()> {
        self.with_core_mut(|core| core.set_slop(slop))
    }

    /// Where the clock is right now, or `None` while stopped.
    pub fn current_moment(&self) -> Option<Moment> {
        let now = self.shared.now();
        self.with_core(|core| core.current_moment(now))
    }

    /// Seconds reported by this clock's time source.
    pub fn now(&self) -> f64 {
        self.shared.now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Reschedule;

    fn handle() -> (ClockHandle, ManualTimeSource) {
        let time = ManualTimeSource::new(10.0);
        (
            ClockHandle::new(Some("handle".to_string()), Arc::new(time.clone())),
            time,
        )
    }

    fn noop() -> Callback {
        Callback::new(|_, _| Ok(Reschedule::Stop))
    }

    #[test]
    fn test_manual_time_source() {
        let time = ManualTimeSource::new(1.0);
        let shared = time.clone();
        time.advance(0.5);
        assert_eq!(shared.now(), 1.5);
        shared.set(3.0);
        assert_eq!(time.now(), 3.0);
    }

    #[test]
    fn test_ids_increase() {
        let (handle, _) = handle();
        let a = handle.schedule(noop(), 1.0, TimeUnit::Beats).unwrap();
        let b = handle.schedule(noop(), 0.0, TimeUnit::Beats).unwrap();
        let c = handle.cue(noop(), None).unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_invalid_quantization_rejected() {
        let (handle, _) = handle();
        assert!(matches!(
            handle.cue(noop(), Some("1/3")),
            Err(ClockError::InvalidQuantization(_))
        ));
        assert!(handle
            .cue_change(Change::tempo(90.0), Some("3M"))
            .is_err());
        assert!(handle.cue(noop(), Some("1/16T")).is_ok());
    }

    #[test]
    fn test_non_finite_positions_rejected() {
        let (handle, _) = handle();
        assert!(matches!(
            handle.schedule(noop(), f64::NAN, TimeUnit::Beats),
            Err(ClockError::InvalidScheduleTime(_))
        ));
        assert!(handle
            .schedule_change(Change::tempo(90.0), f64::INFINITY, TimeUnit::Seconds)
            .is_err());
        let id = handle.schedule(noop(), 1.0, TimeUnit::Beats).unwrap();
        assert!(handle
            .reschedule(id, f64::NEG_INFINITY, TimeUnit::Measures)
            .is_err());
        assert!(handle.reschedule_earliest(id, f64::NAN, TimeUnit::Beats).is_err());
        assert!(matches!(handle.cancel(id), Some(Action::Command(_))));
    }

    #[test]
    fn test_cancel_pending_command() {
        let (handle, _) = handle();
        let id = handle.schedule(noop(), 1.0, TimeUnit::Beats).unwrap();
        assert!(matches!(handle.cancel(id), Some(Action::Command(_))));
        assert!(handle.cancel(id).is_none());
        assert!(handle.reschedule(id, 2.0, TimeUnit::Beats).unwrap().is_none());
    }

    #[test]
    fn test_change_while_stopped_applies_immediately() {
        let (handle, _) = handle();
        let signature = TimeSignature::new(7, 8).unwrap();
        let id = handle
            .change(Change::tempo(90.0).with_signature(signature))
            .unwrap();
        assert!(id.is_none());
        assert_eq!(handle.beats_per_minute(), 90.0);
        assert_eq!(handle.time_signature(), signature);
        assert!(handle.change(Change::tempo(-1.0)).is_err());
        assert!(handle
            .schedule_change(Change::tempo(0.0), 1.0, TimeUnit::Beats)
            .is_err());
    }

    #[test]
    fn test_properties_while_stopped() {
        let (handle, time) = handle();
        assert!(!handle.is_running());
        assert_eq!(handle.name().as_deref(), Some("handle"));
        assert!(handle.current_moment().is_none());
        assert!(handle.set_slop(Duration::ZERO).is_err());
        handle.set_slop(Duration::from_millis(5)).unwrap();
        assert_eq!(handle.slop(), Duration::from_millis(5));
        time.advance(1.0);
        assert_eq!(handle.now(), 11.0);
        assert!(!handle.halt());
    }
}
