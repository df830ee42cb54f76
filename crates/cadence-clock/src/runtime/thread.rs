//! Real-time driver on a dedicated OS thread.

use super::{perform_cycle, StartOptions};
use crate::config::ClockConfig;
use crate::error::{ClockError, Result};
use crate::handle::{ClockHandle, Shared, SystemTimeSource, TimeSource};
use crate::scheduler::Poll;
use parking_lot::Mutex;
use std::ops::Deref;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// A clock driven by its own thread.
///
/// Callbacks run on the driver thread, one at a time. Scheduling calls go
/// through the [`ClockHandle`] this dereferences to and may come from any
/// thread.
pub struct Clock {
    handle: ClockHandle,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    pub fn new() -> Self {
        Self::with_time_source(None, Arc::new(SystemTimeSource))
    }

    pub fn with_name(name: impl Into<String>) -> Self {
        Self::with_time_source(Some(name.into()), Arc::new(SystemTimeSource))
    }

    pub fn with_time_source(name: Option<String>, time: Arc<dyn TimeSource>) -> Self {
        Self {
            handle: ClockHandle::new(name, time),
            thread: Mutex::new(None),
        }
    }

    /// Build a stopped clock from configuration.
    pub fn from_config(config: &ClockConfig) -> Result<Self> {
        config.validate()?;
        let clock = Self::with_time_source(config.name.clone(), Arc::new(SystemTimeSource));
        config.apply(&clock.handle)?;
        Ok(clock)
    }

    /// A cloneable handle to this clock.
    pub fn handle(&self) -> ClockHandle {
        self.handle.clone()
    }

    /// Start the clock and its driver thread.
    ///
    /// Commands queued while stopped are bound to time before this returns.
    pub fn start(&self, options: StartOptions) -> Result<()> {
        let mut slot = self.thread.lock();
        if self.handle.is_running() {
            return Err(ClockError::AlreadyRunning);
        }
        // A previous driver that stopped on its own may still be unwinding.
        if let Some(previous) = slot.take() {
            if previous.thread().id() != thread::current().id() && previous.join().is_err() {
                log::warn!("[{}] Previous driver thread panicked", self.shared().label);
            }
        }
        let shared = Arc::clone(self.shared());
        let now = shared.now();
        shared.core.lock().start(&options, now)?;
        let generation = shared.next_generation();
        let spawned = thread::Builder::new()
            .name(format!("cadence-{}", shared.label))
            .spawn(move || run(shared, generation));
        match spawned {
            Ok(join) => {
                *slot = Some(join);
                Ok(())
            }
            Err(e) => {
                self.handle.halt();
                Err(ClockError::Io(e))
            }
        }
    }

    /// Stop the clock and wait for the driver thread to exit.
    ///
    /// Returns whether the clock was running, or the error that stopped it.
    /// From inside a callback, prefer [`ClockHandle::halt`]: the driver
    /// thread cannot join itself and is left to wind down on its own.
    pub fn stop(&self) -> Result<bool> {
        let was_running = self.handle.halt();
        let driver = self.thread.lock().take();
        if let Some(driver) = driver {
            if driver.thread().id() != thread::current().id() && driver.join().is_err() {
                return Err(ClockError::DriverPanicked);
            }
        }
        match self.shared().take_fatal() {
            Some(error) => Err(error),
            None => Ok(was_running),
        }
    }

    fn shared(&self) -> &Arc<Shared> {
        &self.handle.shared
    }
}

impl Deref for Clock {
    type Target = ClockHandle;

    fn deref(&self) -> &ClockHandle {
        &self.handle
    }
}

impl Drop for Clock {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::warn!("[{}] Clock dropped after failure: {}", self.shared().label, e);
        }
    }
}

fn run(shared: Arc<Shared>, generation: u64) {
    log::debug!("[{}] Driver thread started", shared.label);
    loop {
        if !shared.is_current(generation) {
            break;
        }
        let mut core = shared.core.lock();
        let poll = core.poll(shared.now());
        match poll {
            Poll::Stopped => break,
            Poll::Sleep(timeout) => {
                shared.wakeup.wait_for(&mut core, timeout);
            }
            Poll::Perform(moment) => {
                drop(core);
                if let Err(e) = perform_cycle(&shared, moment) {
                    shared.fail(e);
                    break;
                }
            }
        }
    }
    log::debug!("[{}] Driver thread exiting", shared.label);
}
