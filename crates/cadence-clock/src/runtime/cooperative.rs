//! Driver running as a task on a tokio runtime.

use super::{perform_cycle_async, StartOptions};
use crate::config::ClockConfig;
use crate::error::{ClockError, Result};
use crate::handle::{ClockHandle, Shared, SystemTimeSource, TimeSource};
use crate::scheduler::Poll;
use parking_lot::Mutex;
use std::ops::Deref;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// A clock driven by a tokio task.
///
/// Async callbacks are awaited on the driver task; blocking callbacks run
/// inline on it and should return quickly.
pub struct AsyncClock {
    handle: ClockHandle,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Default for AsyncClock {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncClock {
    pub fn new() -> Self {
        Self::with_time_source(None, Arc::new(SystemTimeSource))
    }

    pub fn with_name(name: impl Into<String>) -> Self {
        Self::with_time_source(Some(name.into()), Arc::new(SystemTimeSource))
    }

    pub fn with_time_source(name: Option<String>, time: Arc<dyn TimeSource>) -> Self {
        Self {
            handle: ClockHandle::new(name, time),
            task: Mutex::new(None),
        }
    }

    /// Build a stopped clock from configuration.
    pub fn from_config(config: &ClockConfig) -> Result<Self> {
        config.validate()?;
        let clock = Self::with_time_source(config.name.clone(), Arc::new(SystemTimeSource));
        config.apply(&clock.handle)?;
        Ok(clock)
    }

    pub fn handle(&self) -> ClockHandle {
        self.handle.clone()
    }

    /// Start the clock and spawn its driver on the current runtime.
    pub async fn start(&self, options: StartOptions) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ClockError::NoRuntime(e.to_string()))?;
        if self.handle.is_running() {
            return Err(ClockError::AlreadyRunning);
        }
        let previous = self.task.lock().take();
        if let Some(previous) = previous {
            if let Err(e) = previous.await {
                log::warn!("[{}] Previous driver task failed: {}", self.shared().label, e);
            }
        }
        let shared = Arc::clone(self.shared());
        let now = shared.now();
        shared.core.lock().start(&options, now)?;
        let generation = shared.next_generation();
        let task = runtime.spawn(run(shared, generation));
        *self.task.lock() = Some(task);
        Ok(())
    }

    /// Stop the clock and wait for the driver task to finish.
    ///
    /// Must not be awaited from inside one of this clock's callbacks; use
    /// [`ClockHandle::halt`] there.
    pub async fn stop(&self) -> Result<bool> {
        let was_running = self.handle.halt();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                if e.is_panic() {
                    return Err(ClockError::DriverPanicked);
                }
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

impl Deref for AsyncClock {
    type Target = ClockHandle;

    fn deref(&self) -> &ClockHandle {
        &self.handle
    }
}

impl Drop for AsyncClock {
    fn drop(&mut self) {
        // The task sees the stopped core on its next poll and exits.
        self.handle.halt();
    }
}

async fn run(shared: Arc<Shared>, generation: u64) {
    log::debug!("[{}] Driver task started", shared.label);
    loop {
        if !shared.is_current(generation) {
            break;
        }
        let now = shared.now();
        let poll = shared.core.lock().poll(now);
        match poll {
            Poll::Stopped => break,
            Poll::Sleep(timeout) => {
                let _ = tokio::time::timeout(timeout, shared.notify.notified()).await;
            }
            Poll::Perform(moment) => {
                if let Err(e) = perform_cycle_async(&shared, moment).await {
                    shared.fail(e);
                    break;
                }
            }
        }
    }
    log::debug!("[{}] Driver task exiting", shared.label);
}
