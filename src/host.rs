//! External-collaborator seams
//!
//! The environment keeps its host dependencies behind small traits:
//! wall-clock time and synthesized stream content. The windowing host
//! consumes the character grid directly through [`crate::console::Console`]
//! accessors and feeds key events back in.

use std::cell::Cell;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock source
pub trait Clock {
    /// Milliseconds since an arbitrary epoch
    fn now_ms(&self) -> u64;
}

impl<T: Clock + ?Sized> Clock for Rc<T> {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }
}

/// System wall clock
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Hand-driven clock for deterministic tests
#[derive(Debug, Default)]
pub struct ManualClock {
    ms: Cell<u64>,
}

impl ManualClock {
    /// Creates a clock at time zero
    pub fn new() -> Self {
        ManualClock { ms: Cell::new(0) }
    }

    /// Moves time forward
    pub fn advance(&self, ms: u64) {
        self.ms.set(self.ms.get() + ms);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.ms.get()
    }
}

/// Produces the byte content of callback file nodes on demand
///
/// Callback nodes hold no data; a provider is consulted at open time.
/// The virtual machine is the usual provider, synthesizing `/proc`
/// listings from live state.
pub trait StreamProvider {
    /// Content for the callback node at `path`, or `None` when the
    /// path is not served
    fn stream_content(&self, path: &str) -> Option<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new();
        assert_eq!(clock.now_ms(), 0);
        clock.advance(250);
        assert_eq!(clock.now_ms(), 250);
    }

    #[test]
    fn test_rc_clock_shares_time() {
        let clock = Rc::new(ManualClock::new());
        let boxed: Box<dyn Clock> = Box::new(Rc::clone(&clock));
        clock.advance(42);
        assert_eq!(boxed.now_ms(), 42);
    }
}
