//! Thread-blocking and fiber-cooperative sleeps

use crate::fiber::Fiber;
use crate::scheduler::Scheduler;
use crate::timer::TimerManager;

use std::time::Duration;

/// Suspend the current fiber for `us` microseconds.
///
/// Registers a timer that reschedules the fiber and switches away; the
/// worker thread keeps running other fibers in the meantime. Pre: a
/// scheduler controls the current thread.
pub fn sleep(timers: &TimerManager, us: u64) {
    let scheduler = Scheduler::current().expect("cooperative sleep requires a scheduler");
    let fiber = Fiber::current();
    timers.register_timer(us, move || scheduler.schedule(fiber.clone()), false);
    Scheduler::suspend();
}

/// Block the calling OS thread for `us` microseconds.
pub fn sleep_us(us: u64) {
    std::thread::sleep(Duration::from_micros(us));
}
