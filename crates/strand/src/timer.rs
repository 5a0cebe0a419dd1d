//! Timer manager
//!
//! [`TimerManager`] keeps an ordered set of timers keyed on their absolute
//! deadline (microseconds on the process monotonic clock), with handle
//! identity breaking ties. Expiry moves due entries out of the set under
//! the lock and runs their callbacks outside it; recurring timers are
//! re-inserted one interval past the moment of expiry.
//!
//! The manager itself never blocks: a host (the I/O manager, or a plain
//! loop) asks [`TimerManager::next_timer`] how long it may sleep and calls
//! [`TimerManager::execute_timers`] when it wakes. A timer inserted ahead
//! of everything else fires the front-insert hook so the host can cut its
//! sleep short; the internal `tickled` flag coalesces those notifications
//! until the next `next_timer` consumes them.

use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Instant;

/// A shareable timer callback.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Backward clock jumps larger than this expire every armed timer rather
/// than risking indefinite delay. Small jitter is tolerated.
const CLOCK_ROLLOVER_THRESHOLD_US: u64 = 5_000_000;

/// A replacement clock source returning microseconds.
pub type ClockFn = Arc<dyn Fn() -> u64 + Send + Sync + 'static>;

static CLOCK_OVERRIDE: RwLock<Option<ClockFn>> = RwLock::new(None);
static CLOCK_EPOCH: OnceLock<Instant> = OnceLock::new();

fn next_timer_id() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Deadline first, then handle identity for equal deadlines.
type TimerKey = (u64, u64);

struct TimerState {
    /// Absolute deadline in microseconds.
    next: u64,
    /// Interval the deadline was computed from.
    us: u64,
    recurring: bool,
    /// None once fired (non-recurring) or cancelled.
    callback: Option<TimerCallback>,
}

/// A handle to a registered timer.
pub struct Timer {
    id: u64,
    manager: Weak<ManagerShared>,
    state: Mutex<TimerState>,
}

impl Timer {
    /// Disarm the timer without firing it. Returns true if it was still
    /// armed; repeated calls return false.
    pub fn cancel(&self) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        let mut timers = manager.state.lock();
        let mut state = self.state.lock();
        if state.callback.is_none() {
            return false;
        }
        log::debug!(target: "timer", "timer {} cancelled", self.id);
        state.callback = None;
        let removed = timers.timers.remove(&(state.next, self.id));
        debug_assert!(removed.is_some());
        true
    }

    /// Push the deadline out to now + interval. Returns false if the timer
    /// already fired or was cancelled.
    pub fn refresh(self: &Arc<Self>) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        let mut timers = manager.state.lock();
        let mut state = self.state.lock();
        if state.callback.is_none() {
            return false;
        }
        timers.timers.remove(&(state.next, self.id));
        state.next = TimerManager::now() + state.us;
        let key = (state.next, self.id);
        drop(state);
        timers.timers.insert(key, self.clone());
        log::debug!(target: "timer", "timer {} refreshed", self.id);
        true
    }

    /// Change the interval. With `from_now` the new period is anchored at
    /// the current time, otherwise at the start of the current period.
    /// Returns false if the timer already fired or was cancelled.
    pub fn reset(self: &Arc<Self>, us: u64, from_now: bool) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        let at_front;
        {
            let mut timers = manager.state.lock();
            let mut state = self.state.lock();
            if state.callback.is_none() {
                return false;
            }
            if us == state.us && !from_now {
                return true;
            }
            timers.timers.remove(&(state.next, self.id));
            let start = if from_now {
                TimerManager::now()
            } else {
                state.next - state.us
            };
            state.us = us;
            state.next = start + us;
            let key = (state.next, self.id);
            drop(state);
            timers.timers.insert(key, self.clone());
            at_front = timers.timers.keys().next() == Some(&key) && !timers.tickled;
            if at_front {
                timers.tickled = true;
            }
        }
        log::debug!(target: "timer", "timer {} reset to {}us", self.id, us);
        if at_front {
            manager.front_inserted();
        }
        true
    }
}

struct TimerSet {
    timers: BTreeMap<TimerKey, Arc<Timer>>,
    /// Set when the front-insert hook has fired and not yet been consumed
    /// by `next_timer`; suppresses redundant hook invocations.
    tickled: bool,
    previous_time: u64,
}

struct ManagerShared {
    state: Mutex<TimerSet>,
    front_hook: OnceLock<Box<dyn Fn() + Send + Sync>>,
}

impl ManagerShared {
    fn front_inserted(&self) {
        if let Some(hook) = self.front_hook.get() {
            hook();
        }
    }
}

/// Owner of an ordered set of cancellable, refreshable timers.
pub struct TimerManager {
    shared: Arc<ManagerShared>,
}

impl TimerManager {
    /// Create an empty manager.
    pub fn new() -> TimerManager {
        TimerManager {
            shared: Arc::new(ManagerShared {
                state: Mutex::new(TimerSet {
                    timers: BTreeMap::new(),
                    tickled: false,
                    previous_time: 0,
                }),
                front_hook: OnceLock::new(),
            }),
        }
    }

    /// Install the hook invoked when a timer lands ahead of all others.
    /// The I/O manager uses this to interrupt its kernel wait.
    pub fn set_front_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        assert!(
            self.shared.front_hook.set(Box::new(hook)).is_ok(),
            "timer front hook installed twice"
        );
    }

    /// Microseconds on the process monotonic clock (or the injected one).
    pub fn now() -> u64 {
        if let Some(clock) = CLOCK_OVERRIDE.read().clone() {
            return clock();
        }
        CLOCK_EPOCH.get_or_init(Instant::now).elapsed().as_micros() as u64
    }

    /// Install (or with `None`, remove) a process-wide clock override.
    /// Affects every manager; intended for tests.
    pub fn set_clock(clock: Option<ClockFn>) {
        *CLOCK_OVERRIDE.write() = clock;
    }

    /// Schedule `callback` to run `us` microseconds from now; with
    /// `recurring`, again every `us` after each expiry.
    pub fn register_timer(
        &self,
        us: u64,
        callback: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> Arc<Timer> {
        self.register_timer_callback(us, Arc::new(callback), recurring)
    }

    fn register_timer_callback(
        &self,
        us: u64,
        callback: TimerCallback,
        recurring: bool,
    ) -> Arc<Timer> {
        let timer = Arc::new(Timer {
            id: next_timer_id(),
            manager: Arc::downgrade(&self.shared),
            state: Mutex::new(TimerState {
                next: TimerManager::now() + us,
                us,
                recurring,
                callback: Some(callback),
            }),
        });
        let at_front;
        {
            let mut timers = self.shared.state.lock();
            let key = (timer.state.lock().next, timer.id);
            timers.timers.insert(key, timer.clone());
            at_front = timers.timers.keys().next() == Some(&key) && !timers.tickled;
            if at_front {
                timers.tickled = true;
            }
        }
        log::debug!(
            target: "timer",
            "timer {} registered ({}us, recurring: {}, front: {})",
            timer.id, us, recurring, at_front
        );
        if at_front {
            self.shared.front_inserted();
        }
        timer
    }

    /// [`TimerManager::register_timer`] with a `Duration` deadline.
    pub fn register_timer_after(
        &self,
        after: std::time::Duration,
        callback: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> Arc<Timer> {
        self.register_timer(after.as_micros() as u64, callback, recurring)
    }

    /// Like [`TimerManager::register_timer`], but the callback only runs if
    /// `condition` still upgrades to a live owner at expiry.
    pub fn register_condition_timer<T: ?Sized + Send + Sync + 'static>(
        &self,
        us: u64,
        callback: impl Fn() + Send + Sync + 'static,
        condition: Weak<T>,
        recurring: bool,
    ) -> Arc<Timer> {
        self.register_timer(
            us,
            move || match condition.upgrade() {
                Some(_live) => callback(),
                None => log::debug!(target: "timer", "condition gone, skipping timer callback"),
            },
            recurring,
        )
    }

    /// Microseconds until the earliest deadline: 0 if overdue, `None` if no
    /// timer is armed. Consumes the coalesced front-insert notification.
    pub fn next_timer(&self) -> Option<u64> {
        let mut timers = self.shared.state.lock();
        timers.tickled = false;
        let (deadline, _) = *timers.timers.keys().next()?;
        Some(deadline.saturating_sub(TimerManager::now()))
    }

    /// Whether any timer is armed.
    pub fn has_timers(&self) -> bool {
        !self.shared.state.lock().timers.is_empty()
    }

    /// Detach the callbacks of every expired timer, re-arming recurring
    /// ones. The caller runs the returned callbacks outside the lock.
    pub fn process_timers(&self) -> Vec<TimerCallback> {
        let now = TimerManager::now();
        let mut expired_callbacks = Vec::new();
        let mut timers = self.shared.state.lock();
        if timers.timers.is_empty() {
            timers.previous_time = now;
            return expired_callbacks;
        }
        let rollover = self.detect_clock_rollover(&mut timers, now);
        if !rollover && timers.timers.keys().next().is_some_and(|(next, _)| *next > now) {
            return expired_callbacks;
        }

        let expired: Vec<(TimerKey, Arc<Timer>)> = if rollover {
            std::mem::take(&mut timers.timers).into_iter().collect()
        } else {
            // Everything with deadline <= now; ties on the deadline all
            // count as expired.
            let remaining = timers.timers.split_off(&(now + 1, 0));
            std::mem::replace(&mut timers.timers, remaining).into_iter().collect()
        };

        expired_callbacks.reserve(expired.len());
        for (_, timer) in expired {
            let mut state = timer.state.lock();
            let callback = state.callback.clone().expect("armed timer without callback");
            expired_callbacks.push(callback);
            if state.recurring {
                log::debug!(target: "timer", "timer {} expired and re-armed", timer.id);
                state.next = now + state.us;
                let key = (state.next, timer.id);
                drop(state);
                timers.timers.insert(key, timer);
            } else {
                log::debug!(target: "timer", "timer {} expired", timer.id);
                state.callback = None;
            }
        }
        expired_callbacks
    }

    /// Run every expired timer callback (outside the manager lock).
    pub fn execute_timers(&self) {
        for callback in self.process_timers() {
            callback();
        }
    }

    fn detect_clock_rollover(&self, timers: &mut TimerSet, now: u64) -> bool {
        // now() does not wrap in practice; a backward jump means the clock
        // source changed under us. Expire everything rather than letting
        // timers drift into the distant future. The subtraction saturates
        // so jitter while previous_time is still under the threshold is
        // not misread as a rollover.
        let rollover = now < timers.previous_time
            && now < timers.previous_time.saturating_sub(CLOCK_ROLLOVER_THRESHOLD_US);
        if rollover {
            log::debug!(
                target: "timer",
                "clock rolled back from {} to {}, expiring all timers",
                timers.previous_time, now
            );
        }
        timers.previous_time = now;
        rollover
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}
