//! Scheduled work and the records the clock keeps about it.
//!
//! - [`Callback`] - User procedure plus arguments and priority
//! - [`Change`] - Tempo and/or time signature change request
//! - [`Command`] - A request not yet bound to absolute time
//! - [`Event`] - A request bound to absolute time, waiting in the queue
//! - [`Reschedule`] - What a callback asks for after it fires

use crate::error::{ClockError, Result};
use crate::timing::{Moment, TimeSignature, TimeUnit};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{Map, Value};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Identifier of a scheduled callback or change.
///
/// Issued in increasing order by the clock that accepted the request and
/// stable across reschedules.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(u64);

impl EventId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Priority among events due at the same instant. Lower fires first.
///
/// Zero is reserved for changes so that they always precede callbacks
/// scheduled for the same moment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventType(i64);

impl EventType {
    pub const CHANGE: EventType = EventType(0);
    pub const SCHEDULE: EventType = EventType(1);

    /// A user priority. Must be positive.
    pub fn new(value: i64) -> Result<Self> {
        if value <= 0 {
            return Err(ClockError::InvalidEventType(value));
        }
        Ok(Self(value))
    }

    pub fn get(&self) -> i64 {
        self.0
    }
}

impl Default for EventType {
    fn default() -> Self {
        Self::SCHEDULE
    }
}

/// Positional and keyword arguments handed to a callback on every firing.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Arguments {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl Arguments {
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }
}

/// A callback's answer to "when should I run again?".
///
/// Deltas are measured from the moment the callback was due, not from when
/// it actually ran, so a late callback does not drift.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum Reschedule {
    /// Do not fire again.
    #[default]
    Stop,
    Beats(f64),
    Seconds(f64),
    /// Whole measures; fractions are truncated and anything below one
    /// measure becomes one.
    Measures(f64),
}

impl Reschedule {
    /// The delta and its unit, or `None` when the event should not repeat.
    ///
    /// Non-positive and non-finite deltas count as [`Reschedule::Stop`].
    pub fn delta(&self) -> Option<(f64, TimeUnit)> {
        let (delta, unit) = match *self {
            Reschedule::Stop => return None,
            Reschedule::Beats(delta) => (delta, TimeUnit::Beats),
            Reschedule::Seconds(delta) => (delta, TimeUnit::Seconds),
            Reschedule::Measures(delta) => (delta, TimeUnit::Measures),
        };
        (delta.is_finite() && delta > 0.0).then_some((delta, unit))
    }
}

impl From<f64> for Reschedule {
    fn from(delta: f64) -> Self {
        Reschedule::Beats(delta)
    }
}

impl From<Option<f64>> for Reschedule {
    fn from(delta: Option<f64>) -> Self {
        delta.map_or(Reschedule::Stop, Reschedule::Beats)
    }
}

impl From<(f64, TimeUnit)> for Reschedule {
    fn from((delta, unit): (f64, TimeUnit)) -> Self {
        match unit {
            TimeUnit::Beats => Reschedule::Beats(delta),
            TimeUnit::Seconds => Reschedule::Seconds(delta),
            TimeUnit::Measures => Reschedule::Measures(delta),
        }
    }
}

/// What a callback sees when it fires.
#[derive(Clone, Debug)]
pub struct ClockContext {
    /// Where the clock actually was when the callback ran.
    pub current_moment: Moment,
    /// Where the event was due.
    pub desired_moment: Moment,
    pub event: Event,
}

type BlockingFn = dyn Fn(&ClockContext, &Arguments) -> anyhow::Result<Reschedule> + Send + Sync;
type AsyncFn =
    dyn Fn(ClockContext, Arc<Arguments>) -> BoxFuture<'static, anyhow::Result<Reschedule>>
        + Send
        + Sync;

/// The user code behind a callback.
#[derive(Clone)]
pub enum Procedure {
    Blocking(Arc<BlockingFn>),
    Async(Arc<AsyncFn>),
}

impl fmt::Debug for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Procedure::Blocking(_) => f.write_str("Procedure::Blocking"),
            Procedure::Async(_) => f.write_str("Procedure::Async"),
        }
    }
}

impl Procedure {
    /// Run the procedure on the calling thread.
    ///
    /// Async procedures are driven to completion with a local executor.
    /// Errors and panics are logged and turn into [`Reschedule::Stop`].
    pub(crate) fn invoke_blocking(
        &self,
        name: &str,
        context: &ClockContext,
        arguments: &Arc<Arguments>,
    ) -> Reschedule {
        let event_id = context.event.event_id;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match self {
            Procedure::Blocking(f) => f(context, arguments),
            Procedure::Async(f) => {
                futures::executor::block_on(f(context.clone(), Arc::clone(arguments)))
            }
        }));
        settle(name, event_id, outcome)
    }

    /// Run the procedure from a task, awaiting async procedures in place.
    pub(crate) async fn invoke(
        &self,
        name: &str,
        context: ClockContext,
        arguments: Arc<Arguments>,
    ) -> Reschedule {
        let event_id = context.event.event_id;
        let outcome = match self {
            Procedure::Blocking(f) => {
                panic::catch_unwind(AssertUnwindSafe(|| f(&context, &arguments)))
            }
            Procedure::Async(f) => {
                AssertUnwindSafe(f(context, arguments)).catch_unwind().await
            }
        };
        settle(name, event_id, outcome)
    }
}

fn settle(
    name: &str,
    event_id: EventId,
    outcome: std::thread::Result<anyhow::Result<Reschedule>>,
) -> Reschedule {
    match outcome {
        Ok(Ok(reschedule)) => reschedule,
        Ok(Err(e)) => {
            log::error!("[{name}] Callback {event_id} failed: {e:#}");
            Reschedule::Stop
        }
        Err(payload) => {
            log::error!(
                "[{name}] Callback {event_id} panicked: {}",
                panic_message(payload.as_ref())
            );
            Reschedule::Stop
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// A user procedure with its arguments and priority.
#[derive(Clone, Debug)]
pub struct Callback {
    pub procedure: Procedure,
    pub arguments: Arguments,
    pub event_type: EventType,
}

impl Callback {
    /// Wrap a synchronous procedure.
    pub fn new<F>(procedure: F) -> Self
    where
        F: Fn(&ClockContext, &Arguments) -> anyhow::Result<Reschedule> + Send + Sync + 'static,
    {
        Procedure::Blocking(Arc::new(procedure)).into()
    }

    /// Wrap an async procedure. The cooperative driver awaits it; the other
    /// drivers block on it.
    pub fn new_async<F, Fut>(procedure: F) -> Self
    where
        F: Fn(ClockContext, Arc<Arguments>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Reschedule>> + Send + 'static,
    {
        Procedure::Async(Arc::new(move |context, arguments| {
            procedure(context, arguments).boxed()
        }))
        .into()
    }

    /// Append a positional argument.
    pub fn with_arg(mut self, value: impl Into<Value>) -> Self {
        self.arguments.args.push(value.into());
        self
    }

    /// Set a keyword argument.
    pub fn with_kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.kwargs.insert(name.into(), value.into());
        self
    }

    pub fn with_event_type(mut self, event_type: EventType) -> Self {
        self.event_type = event_type;
        self
    }
}

impl From<Procedure> for Callback {
    fn from(procedure: Procedure) -> Self {
        Self {
            procedure,
            arguments: Arguments::default(),
            event_type: EventType::SCHEDULE,
        }
    }
}

/// A tempo and/or time signature change.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Change {
    pub beats_per_minute: Option<f64>,
    pub time_signature: Option<TimeSignature>,
}

impl Change {
    pub fn tempo(beats_per_minute: f64) -> Self {
        Self::default().with_tempo(beats_per_minute)
    }

    pub fn signature(time_signature: TimeSignature) -> Self {
        Self::default().with_signature(time_signature)
    }

    pub fn with_tempo(mut self, beats_per_minute: f64) -> Self {
        self.beats_per_minute = Some(beats_per_minute);
        self
    }

    pub fn with_signature(mut self, time_signature: TimeSignature) -> Self {
        self.time_signature = Some(time_signature);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.beats_per_minute.is_none() && self.time_signature.is_none()
    }

    pub fn validate(&self) -> Result<()> {
        match self.beats_per_minute {
            Some(bpm) if !bpm.is_finite() || bpm <= 0.0 => Err(ClockError::InvalidTempo(bpm)),
            _ => Ok(()),
        }
    }
}

/// The work attached to a command or event.
#[derive(Clone, Debug)]
pub enum Payload {
    Callback {
        procedure: Procedure,
        arguments: Arc<Arguments>,
        /// Completed firings so far.
        invocations: u32,
    },
    Change(Change),
}

impl From<Callback> for Payload {
    fn from(callback: Callback) -> Self {
        Payload::Callback {
            procedure: callback.procedure,
            arguments: Arc::new(callback.arguments),
            invocations: 0,
        }
    }
}

impl From<Change> for Payload {
    fn from(change: Change) -> Self {
        Payload::Change(change)
    }
}

/// A request waiting to be bound to absolute time.
#[derive(Clone, Debug)]
pub struct Command {
    pub event_id: EventId,
    pub event_type: EventType,
    pub schedule_at: f64,
    /// `None` means `schedule_at` is an absolute timestamp.
    pub time_unit: Option<TimeUnit>,
    pub quantization: Option<crate::quantize::Quantization>,
    pub payload: Payload,
}

/// A request bound to absolute time.
#[derive(Clone, Debug)]
pub struct Event {
    pub event_id: EventId,
    pub event_type: EventType,
    pub seconds: f64,
    /// Set for events that follow tempo changes.
    pub offset: Option<f64>,
    /// Set for events that follow time signature changes.
    pub measure: Option<i64>,
    pub payload: Payload,
}

impl Event {
    pub fn invocations(&self) -> u32 {
        match self.payload {
            Payload::Callback { invocations, .. } => invocations,
            Payload::Change(_) => 0,
        }
    }

    pub fn is_change(&self) -> bool {
        matches!(self.payload, Payload::Change(_))
    }
}

/// What the clock currently holds for an id.
#[derive(Clone, Debug)]
pub enum Action {
    Command(Command),
    Event(Event),
}

impl Action {
    pub fn event_id(&self) -> EventId {
        match self {
            Action::Command(command) => command.event_id,
            Action::Event(event) => event.event_id,
        }
    }

    pub fn event_type(&self) -> EventType {
        match self {
            Action::Command(command) => command.event_type,
            Action::Event(event) => event.event_type,
        }
    }

    pub fn payload(&self) -> &Payload {
        match self {
            Action::Command(command) => &command.payload,
            Action::Event(event) => &event.payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::ClockState;

    fn context(event_id: u64) -> ClockContext {
        let moment = ClockState::default().offset_to_moment(0.0);
        ClockContext {
            current_moment: moment,
            desired_moment: moment,
            event: Event {
                event_id: EventId::new(event_id),
                event_type: EventType::SCHEDULE,
                seconds: 0.0,
                offset: Some(0.0),
                measure: None,
                payload: Payload::Change(Change::default()),
            },
        }
    }

    #[test]
    fn test_event_type_rejects_reserved_values() {
        assert!(matches!(
            EventType::new(0),
            Err(ClockError::InvalidEventType(0))
        ));
        assert!(EventType::new(-3).is_err());
        assert_eq!(EventType::new(2).unwrap().get(), 2);
        assert!(EventType::CHANGE < EventType::SCHEDULE);
    }

    #[test]
    fn test_reschedule_conversions() {
        assert_eq!(Reschedule::from(0.5), Reschedule::Beats(0.5));
        assert_eq!(Reschedule::from(None), Reschedule::Stop);
        assert_eq!(
            Reschedule::from((2.0, TimeUnit::Measures)),
            Reschedule::Measures(2.0)
        );
        assert_eq!(Reschedule::Beats(0.0).delta(), None);
        assert_eq!(Reschedule::Seconds(-1.0).delta(), None);
        assert_eq!(Reschedule::Beats(f64::NAN).delta(), None);
        assert_eq!(Reschedule::Measures(f64::INFINITY).delta(), None);
        assert_eq!(
            Reschedule::Seconds(0.25).delta(),
            Some((0.25, TimeUnit::Seconds))
        );
    }

    #[test]
    fn test_callback_builder() {
        let callback = Callback::new(|_, _| Ok(Reschedule::Stop))
            .with_arg(1)
            .with_arg("two")
            .with_kwarg("velocity", 0.8)
            .with_event_type(EventType::new(3).unwrap());
        assert_eq!(callback.arguments.arg(1), Some(&Value::from("two")));
        assert_eq!(callback.arguments.kwarg("velocity"), Some(&Value::from(0.8)));
        assert_eq!(callback.event_type.get(), 3);
    }

    #[test]
    fn test_change_validation() {
        assert!(Change::tempo(90.0).validate().is_ok());
        assert!(Change::tempo(0.0).validate().is_err());
        assert!(Change::tempo(f64::NAN).validate().is_err());
        assert!(Change::default().is_empty());
    }

    #[test]
    fn test_failing_procedures_stop() {
        let arguments = Arc::new(Arguments::default());
        let failing = Callback::new(|_, _| Err(anyhow::anyhow!("boom")));
        assert_eq!(
            failing.procedure.invoke_blocking("test", &context(1), &arguments),
            Reschedule::Stop
        );
        let panicking = Callback::new(|_, _| panic!("kaboom"));
        assert_eq!(
            panicking.procedure.invoke_blocking("test", &context(2), &arguments),
            Reschedule::Stop
        );
    }

    #[test]
    fn test_async_procedure_runs_blocking() {
        let arguments = Arc::new(Arguments::default());
        let callback = Callback::new_async(|context, _| async move {
            Ok::<_, anyhow::Error>(Reschedule::Beats(context.event.event_id.get() as f64))
        });
        assert_eq!(
            callback.procedure.invoke_blocking("test", &context(4), &arguments),
            Reschedule::Beats(4.0)
        );
    }
}
