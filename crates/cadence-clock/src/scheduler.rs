//! The scheduling algorithm shared by every driver.
//!
//! [`ClockCore`] owns the reference state, the command buffer and the event
//! queue. It never waits and never runs user code: drivers ask it what to do
//! next ([`ClockCore::poll`]), pull due events out one at a time
//! ([`ClockCore::perform_step`]) and hand the callback's answer back
//! ([`ClockCore::finish_callback`]).

use crate::commands::CommandBuffer;
use crate::error::{ClockError, Result};
use crate::events::{
    Action, Arguments, Change, ClockContext, Command, Event, EventId, Payload, Procedure,
    Reschedule,
};
use crate::queue::EventQueue;
use crate::runtime::StartOptions;
use crate::timing::{ClockState, Moment, SchedulePoint, TimeSignature, TimeUnit};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Default upper bound on a single wait.
pub const DEFAULT_SLOP: Duration = Duration::from_millis(1);

/// Relative tolerance, in beats, between an event's stored offset and the
/// offset its due time maps to.
const OFFSET_TOLERANCE: f64 = 1e-4;

/// What a driver should do next.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Poll {
    /// The clock is not running.
    Stopped,
    /// Nothing is due; wait at most this long before polling again.
    Sleep(Duration),
    /// Something is due. Perform with this as the current moment.
    Perform(Moment),
}

/// Outcome of one [`ClockCore::perform_step`].
#[derive(Debug)]
pub enum Step {
    /// The perform cycle is over; poll again.
    Done,
    /// Keep stepping.
    Continue,
    /// Run this callback outside the lock, then report back.
    Fire(Firing),
}

/// A callback that is due, detached from the core so it can run unlocked.
#[derive(Clone, Debug)]
pub struct Firing {
    pub procedure: Procedure,
    pub arguments: Arc<Arguments>,
    pub context: ClockContext,
}

/// Scheduling state of one clock.
#[derive(Debug)]
pub struct ClockCore {
    name: Option<String>,
    state: ClockState,
    running: bool,
    buffer: CommandBuffer,
    queue: EventQueue,
    offset_relative: BTreeSet<EventId>,
    measure_relative: BTreeSet<EventId>,
    slop: Duration,
    next_event_id: u64,
}

impl ClockCore {
    pub fn new(name: Option<String>) -> Self {
        Self {
            name,
            state: ClockState::default(),
            running: false,
            buffer: CommandBuffer::new(),
            queue: EventQueue::new(),
            offset_relative: BTreeSet::new(),
            measure_relative: BTreeSet::new(),
            slop: DEFAULT_SLOP,
            next_event_id: 0,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Tag used in log lines.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or("clock")
    }

    pub fn state(&self) -> &ClockState {
        &self.state
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn slop(&self) -> Duration {
        self.slop
    }

    pub fn set_slop(&mut self, slop: Duration) -> Result<()> {
        if slop.is_zero() {
            return Err(ClockError::InvalidSlop(slop));
        }
        self.slop = slop;
        Ok(())
    }

    pub fn issue_event_id(&mut self) -> EventId {
        let id = EventId::new(self.next_event_id);
        self.next_event_id += 1;
        id
    }

    /// Start the clock at `now` (or the configured initial time) and bind
    /// every command queued so far.
    pub fn start(&mut self, options: &StartOptions, now: f64) -> Result<()> {
        if self.running {
            return Err(ClockError::AlreadyRunning);
        }
        let beats_per_minute = options
            .beats_per_minute
            .unwrap_or(self.state.beats_per_minute);
        Change::tempo(beats_per_minute).validate()?;
        let initial_seconds = options.initial_seconds.unwrap_or(now);
        self.state = ClockState {
            beats_per_minute,
            time_signature: options.time_signature.unwrap_or(self.state.time_signature),
            reference_seconds: initial_seconds,
            reference_offset: options.initial_offset,
            reference_measure: options.initial_measure,
            reference_measure_change_offset: options.initial_offset,
            initial_seconds,
        };
        self.running = true;
        log::info!(
            "[{}] Starting at {}s, {} BPM, {}",
            self.label(),
            initial_seconds,
            self.state.beats_per_minute,
            self.state.time_signature
        );
        self.process_commands(true);
        Ok(())
    }

    /// Stop the clock and forget everything scheduled. Returns whether it
    /// was running.
    pub fn stop(&mut self) -> bool {
        let was_running = self.running;
        self.running = false;
        self.buffer.clear();
        self.queue.clear();
        self.offset_relative.clear();
        self.measure_relative.clear();
        if was_running {
            log::info!("[{}] Stopped", self.label());
        }
        was_running
    }

    pub fn enqueue_command(&mut self, command: Command) {
        log::debug!(
            "[{}] Enqueued command {} at {} {:?}",
            self.label(),
            command.event_id,
            command.schedule_at,
            command.time_unit
        );
        self.buffer.push(command);
    }

    pub fn enqueue_event(&mut self, event: Event) {
        let event_id = event.event_id;
        self.offset_relative.remove(&event_id);
        self.measure_relative.remove(&event_id);
        if event.offset.is_some() {
            self.offset_relative.insert(event_id);
            if event.measure.is_some() {
                self.measure_relative.insert(event_id);
            }
        }
        self.queue.put(event.clone());
        self.buffer.insert(Action::Event(event));
    }

    /// Forget an id. Returns what was held for it, `None` if unknown.
    pub fn cancel(&mut self, event_id: EventId) -> Option<Action> {
        let action = self.buffer.take(event_id)?;
        if let Action::Event(_) = action {
            self.queue.remove(event_id);
            self.offset_relative.remove(&event_id);
            self.measure_relative.remove(&event_id);
        }
        log::debug!("[{}] Cancelled {}", self.label(), event_id);
        Some(action)
    }

    /// Move a pending callback or change to a new time.
    ///
    /// With `earliest_wins`, a request later than the current due time is
    /// ignored. Returns the id, or `None` if it is unknown.
    pub fn reschedule(
        &mut self,
        event_id: EventId,
        schedule_at: f64,
        time_unit: TimeUnit,
        earliest_wins: bool,
    ) -> Option<EventId> {
        let current_seconds = match self.buffer.get(event_id)? {
            Action::Event(event) => Some(event.seconds),
            Action::Command(command) if self.running => {
                Some(self.resolve_command(command, false).seconds)
            }
            Action::Command(_) => None,
        };
        if earliest_wins && self.running {
            let requested = self.resolve_unit(schedule_at, time_unit, false).seconds;
            if let Some(current) = current_seconds {
                if current <= requested {
                    log::debug!(
                        "[{}] Keeping {} at {}s, earlier than {}s",
                        self.label(),
                        event_id,
                        current,
                        requested
                    );
                    return Some(event_id);
                }
            }
        }
        let (event_type, payload) = match self.cancel(event_id)? {
            Action::Command(command) => (command.event_type, command.payload),
            Action::Event(event) => (event.event_type, event.payload),
        };
        self.enqueue_command(Command {
            event_id,
            event_type,
            schedule_at,
            time_unit: Some(time_unit),
            quantization: None,
            payload,
        });
        Some(event_id)
    }

    /// Apply a change directly to a stopped clock.
    pub fn apply_idle_change(&mut self, change: &Change) {
        if let Some(bpm) = change.beats_per_minute {
            self.state.beats_per_minute = bpm;
        }
        if let Some(signature) = change.time_signature {
            self.state.time_signature = signature;
        }
    }

    /// The moment `now` maps to, if running.
    pub fn current_moment(&self, now: f64) -> Option<Moment> {
        self.running.then(|| self.state.seconds_to_moment(now))
    }

    /// Due time of the earliest queued event.
    pub fn next_due_seconds(&mut self) -> Option<f64> {
        self.queue.peek_min().map(|event| event.seconds)
    }

    pub fn has_pending_commands(&self) -> bool {
        self.buffer.has_pending()
    }

    /// Bind every pending command to absolute time. No-op while stopped.
    pub fn process_commands(&mut self, first_run: bool) {
        if !self.running {
            return;
        }
        while let Some(command) = self.buffer.pop_live() {
            let point = self.resolve_command(&command, first_run);
            if !point.seconds.is_finite() {
                log::warn!(
                    "[{}] Dropping {}: {} {:?} is out of range",
                    self.label(),
                    command.event_id,
                    command.schedule_at,
                    command.time_unit
                );
                self.buffer.take(command.event_id);
                continue;
            }
            let event = Event {
                event_id: command.event_id,
                event_type: command.event_type,
                seconds: point.seconds,
                offset: point.offset,
                measure: point.measure,
                payload: command.payload,
            };
            log::debug!(
                "[{}] Bound {} to {}s / {:?}:o / {:?}:m",
                self.label(),
                event.event_id,
                event.seconds - self.state.initial_seconds,
                event.offset,
                event.measure
            );
            self.enqueue_event(event);
        }
    }

    fn resolve_command(&self, command: &Command, first_run: bool) -> SchedulePoint {
        let initial_seconds = self.state.initial_seconds;
        if command.quantization.is_some() {
            let at = if first_run {
                command.schedule_at.max(initial_seconds)
            } else {
                command.schedule_at
            };
            let point = self.state.cue_point(at, command.quantization);
            log::debug!(
                "[{}] Cueing {} on {:?} to {}s / {:?}:o / {:?}:m",
                self.label(),
                command.event_id,
                command.quantization.map(|q| q.to_string()),
                point.seconds - initial_seconds,
                point.offset,
                point.measure
            );
            return point;
        }
        match command.time_unit {
            Some(unit) => self.resolve_unit(command.schedule_at, unit, first_run),
            None if first_run => SchedulePoint::at_seconds(command.schedule_at.max(initial_seconds)),
            None => SchedulePoint::at_seconds(command.schedule_at),
        }
    }

    /// Seconds queued before the start count from the start; afterwards
    /// they are absolute.
    fn resolve_unit(&self, schedule_at: f64, unit: TimeUnit, first_run: bool) -> SchedulePoint {
        match unit {
            TimeUnit::Seconds if first_run => {
                SchedulePoint::at_seconds(self.state.initial_seconds + schedule_at)
            }
            TimeUnit::Seconds => SchedulePoint::at_seconds(schedule_at),
            unit => self.state.schedule_point(schedule_at, unit),
        }
    }

    /// Decide whether to wait or perform at wall-clock `now`.
    pub fn poll(&mut self, now: f64) -> Poll {
        if !self.running {
            return Poll::Stopped;
        }
        self.process_commands(false);
        match self.next_due_seconds() {
            Some(seconds) if seconds <= now => Poll::Perform(self.state.seconds_to_moment(now)),
            Some(seconds) => Poll::Sleep(
                Duration::try_from_secs_f64(seconds - now).map_or(self.slop, |d| d.min(self.slop)),
            ),
            None => Poll::Sleep(self.slop),
        }
    }

    /// Pull the next due event and either apply it or hand it out to fire.
    ///
    /// `current` is revised in place when a change moves the reference.
    pub fn perform_step(&mut self, current: &mut Moment) -> Result<Step> {
        if !self.running {
            return Ok(Step::Done);
        }
        let Some(event) = self.queue.pop_min() else {
            return Ok(Step::Done);
        };
        if !matches!(self.buffer.get(event.event_id), Some(Action::Event(_))) {
            return Ok(Step::Continue);
        }
        if current.seconds < event.seconds {
            self.enqueue_event(event);
            return Ok(Step::Done);
        }
        self.offset_relative.remove(&event.event_id);
        self.measure_relative.remove(&event.event_id);
        let desired = self.desired_moment(&event)?;
        match &event.payload {
            Payload::Change(change) => {
                let change = *change;
                self.buffer.take(event.event_id);
                let halt = self.apply_change(&change, current, &desired);
                Ok(if halt { Step::Done } else { Step::Continue })
            }
            Payload::Callback {
                procedure,
                arguments,
                ..
            } => {
                log::debug!(
                    "[{}] Performing {} at {}s / {}:o",
                    self.label(),
                    event.event_id,
                    desired.seconds - self.state.initial_seconds,
                    desired.offset
                );
                Ok(Step::Fire(Firing {
                    procedure: procedure.clone(),
                    arguments: Arc::clone(arguments),
                    context: ClockContext {
                        current_moment: *current,
                        desired_moment: desired,
                        event: event.clone(),
                    },
                }))
            }
        }
    }

    fn desired_moment(&self, event: &Event) -> Result<Moment> {
        let Some(offset) = event.offset else {
            return Ok(self.state.seconds_to_moment(event.seconds));
        };
        let derived = self.state.seconds_to_offset(event.seconds);
        if (derived - offset).abs() > OFFSET_TOLERANCE * offset.abs().max(1.0) {
            return Err(ClockError::OffsetMismatch {
                event_id: event.event_id.get(),
                stored: offset,
                derived,
            });
        }
        Ok(self.state.offset_to_moment(offset))
    }

    /// Apply a change at `desired`. Returns true when the perform cycle must
    /// end because the reference moved.
    fn apply_change(&mut self, change: &Change, current: &mut Moment, desired: &Moment) -> bool {
        log::debug!(
            "[{}] Changing at {}s: {:?}",
            self.label(),
            desired.seconds - self.state.initial_seconds,
            change
        );
        let mut halt = false;
        if let Some(signature) = change.time_signature {
            halt |= self.apply_signature(signature, current, desired);
        }
        if let Some(beats_per_minute) = change.beats_per_minute {
            self.state = ClockState {
                beats_per_minute,
                reference_seconds: desired.seconds,
                reference_offset: desired.offset,
                ..self.state
            };
            self.reschedule_offset_relative();
            let revised = self.state.seconds_to_offset(current.seconds);
            log::debug!(
                "[{}] Revised offset from {} to {}",
                self.label(),
                current.offset,
                revised
            );
            *current = Moment {
                seconds: current.seconds,
                ..self.state.offset_to_moment(revised)
            };
            halt = true;
        }
        halt
    }

    fn apply_signature(
        &mut self,
        signature: TimeSignature,
        current: &mut Moment,
        desired: &Moment,
    ) -> bool {
        let old = self.state.time_signature;
        let (reference_measure, reference_measure_change_offset) =
            if desired.measure_offset < signature.beats_per_bar() {
                (desired.measure, desired.offset - desired.measure_offset)
            } else {
                // The new bar is shorter than the distance already covered:
                // it starts right here.
                (desired.measure + 1, desired.offset)
            };
        self.state = ClockState {
            time_signature: signature,
            reference_measure,
            reference_measure_change_offset,
            ..self.state
        };
        let halt = if old.beat_duration() != signature.beat_duration() {
            self.state = ClockState {
                reference_seconds: desired.seconds,
                reference_offset: desired.offset,
                ..self.state
            };
            self.reschedule_offset_relative();
            true
        } else {
            self.reschedule_measure_relative();
            false
        };
        let offset = if halt {
            self.state.seconds_to_offset(current.seconds)
        } else {
            current.offset
        };
        *current = Moment {
            seconds: current.seconds,
            ..self.state.offset_to_moment(offset)
        };
        halt
    }

    fn reschedule_offset_relative(&mut self) {
        let ids: Vec<EventId> = self.offset_relative.iter().copied().collect();
        for event_id in ids {
            let Some(Action::Event(mut event)) = self.cancel(event_id) else {
                continue;
            };
            let Some(offset) = event.offset else {
                continue;
            };
            let offset = match event.measure {
                Some(measure) => self.state.measure_to_offset(measure),
                None => offset,
            };
            let seconds = self.state.offset_to_seconds(offset);
            log::debug!(
                "[{}] Moving offset-relative {} from {}s to {}s",
                self.label(),
                event_id,
                event.seconds,
                seconds
            );
            event.offset = Some(offset);
            event.seconds = seconds;
            self.enqueue_event(event);
        }
    }

    fn reschedule_measure_relative(&mut self) {
        let ids: Vec<EventId> = self.measure_relative.iter().copied().collect();
        for event_id in ids {
            let Some(Action::Event(mut event)) = self.cancel(event_id) else {
                continue;
            };
            let Some(measure) = event.measure else {
                continue;
            };
            let offset = self.state.measure_to_offset(measure);
            log::debug!(
                "[{}] Moving measure-relative {} from {:?}:o to {}:o",
                self.label(),
                event_id,
                event.offset,
                offset
            );
            event.offset = Some(offset);
            event.seconds = self.state.offset_to_seconds(offset);
            self.enqueue_event(event);
        }
    }

    /// Record what a fired callback asked for.
    pub fn finish_callback(&mut self, firing: Firing, reschedule: Reschedule) {
        if !self.running {
            return;
        }
        let event_id = firing.context.event.event_id;
        if !matches!(self.buffer.get(event_id), Some(Action::Event(_))) {
            // Cancelled or rescheduled while it ran.
            return;
        }
        let Some((delta, unit)) = reschedule.delta() else {
            self.buffer.take(event_id);
            return;
        };
        let desired = firing.context.desired_moment;
        let point = match unit {
            TimeUnit::Beats => {
                let offset = desired.offset + delta;
                SchedulePoint {
                    seconds: self.state.offset_to_seconds(offset),
                    offset: Some(offset),
                    measure: None,
                }
            }
            TimeUnit::Measures => match desired.measure.checked_add((delta.trunc() as i64).max(1)) {
                Some(measure) => self.state.schedule_point(measure as f64, TimeUnit::Measures),
                None => SchedulePoint::at_seconds(f64::INFINITY),
            },
            TimeUnit::Seconds => SchedulePoint::at_seconds(desired.seconds + delta),
        };
        if !point.seconds.is_finite() {
            log::warn!(
                "[{}] Not rescheduling {}: {:?} is out of range",
                self.label(),
                event_id,
                reschedule
            );
            self.buffer.take(event_id);
            return;
        }
        let mut event = firing.context.event;
        if let Payload::Callback { invocations, .. } = &mut event.payload {
            *invocations += 1;
        }
        event.seconds = point.seconds;
        event.offset = point.offset;
        event.measure = point.measure;
        log::debug!(
            "[{}] Rescheduling {} at {}s",
            self.label(),
            event_id,
            event.seconds - self.state.initial_seconds
        );
        self.enqueue_event(event);
    }
}
