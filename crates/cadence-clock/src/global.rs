//! Process-wide default clock.
//!
//! Created on first use and kept until [`teardown_default_clock`] is called.
//! Code that wants isolation should own its own [`Clock`] instead.

use crate::error::Result;
use crate::runtime::Clock;
use parking_lot::Mutex;
use std::sync::Arc;

static DEFAULT_CLOCK: Mutex<Option<Arc<Clock>>> = Mutex::new(None);

/// Get the default clock, creating a stopped one if none exists.
pub fn default_clock() -> Arc<Clock> {
    let mut slot = DEFAULT_CLOCK.lock();
    Arc::clone(slot.get_or_insert_with(|| Arc::new(Clock::with_name("default"))))
}

/// Get the default clock if it has been created.
pub fn get_default_clock() -> Option<Arc<Clock>> {
    DEFAULT_CLOCK.lock().clone()
}

/// Stop and forget the default clock.
///
/// Returns whether a clock existed. Handles still held elsewhere keep the
/// stopped clock alive.
pub fn teardown_default_clock() -> Result<bool> {
    let clock = DEFAULT_CLOCK.lock().take();
    match clock {
        Some(clock) => {
            clock.stop()?;
            Ok(true)
        }
        None => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_clock_lifecycle() {
        let first = default_clock();
        let second = default_clock();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.name().as_deref(), Some("default"));
        assert!(get_default_clock().is_some());

        assert!(teardown_default_clock().unwrap());
        assert!(get_default_clock().is_none());
        assert!(!teardown_default_clock().unwrap());

        let third = default_clock();
        assert!(!Arc::ptr_eq(&first, &third));
        teardown_default_clock().unwrap();
    }
}
