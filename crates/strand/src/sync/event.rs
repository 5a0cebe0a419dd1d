//! Fiber event

use super::{current_waiter, Waiter};
use crate::scheduler::Scheduler;

use parking_lot::Mutex;
use std::collections::VecDeque;

struct EventState {
    signalled: bool,
    waiters: VecDeque<Waiter>,
}

/// A settable event for fibers, in auto-reset or manual-reset flavor.
///
/// Auto-reset: `set` wakes exactly one waiter (or latches if none are
/// parked), and a successful `wait` consumes the signal. Manual-reset:
/// `set` wakes every waiter and the event stays signalled until `reset`.
pub struct FiberEvent {
    auto_reset: bool,
    state: Mutex<EventState>,
}

impl FiberEvent {
    /// Create an unsignalled event.
    pub fn new(auto_reset: bool) -> FiberEvent {
        FiberEvent {
            auto_reset,
            state: Mutex::new(EventState {
                signalled: false,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Wait until the event is signalled.
    pub fn wait(&self) {
        let waiter = current_waiter();
        {
            let mut state = self.state.lock();
            if state.signalled {
                if self.auto_reset {
                    state.signalled = false;
                }
                return;
            }
            state.waiters.push_back(waiter);
        }
        Scheduler::suspend();
    }

    /// Signal the event.
    pub fn set(&self) {
        let mut state = self.state.lock();

        if !self.auto_reset {
            state.signalled = true;
            for (scheduler, fiber) in state.waiters.drain(..) {
                scheduler.schedule(fiber);
            }
            return;
        }

        if let Some((scheduler, fiber)) = state.waiters.pop_front() {
            scheduler.schedule(fiber);
        } else {
            state.signalled = true;
        }
    }

    /// Clear the signal.
    pub fn reset(&self) {
        self.state.lock().signalled = false;
    }

    /// Whether the event is currently signalled.
    pub fn is_set(&self) -> bool {
        self.state.lock().signalled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_reset_latches() {
        let event = FiberEvent::new(false);
        assert!(!event.is_set());
        event.set();
        assert!(event.is_set());
        event.reset();
        assert!(!event.is_set());
    }

    #[test]
    fn test_auto_reset_latch_consumed_by_wait() {
        let event = FiberEvent::new(true);
        event.set();
        // No waiters were parked, so the signal latched; the next wait
        // consumes it without suspending.
        event.wait();
        assert!(!event.is_set());
    }
}
