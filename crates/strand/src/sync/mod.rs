//! Fiber-aware synchronization primitives
//!
//! These primitives never block an OS thread on contention. Instead the
//! slow path parks the current `(Scheduler, Fiber)` pair on a FIFO wait
//! list and switches away with [`Scheduler::suspend`]; the wake side pops a
//! waiter and schedules its fiber back onto the scheduler it came from.
//!
//! [`Semaphore`] is the exception: a plain thread-level semaphore used for
//! cross-thread signalling (the worker pool's idle fiber blocks on one).
//!
//! [`Scheduler::suspend`]: crate::scheduler::Scheduler::suspend

mod event;
mod mutex;
mod semaphore;

pub use event::FiberEvent;
pub use mutex::{FiberCondition, FiberMutex};
pub use semaphore::{FiberSemaphore, Semaphore};

use crate::fiber::Fiber;
use crate::scheduler::Scheduler;

use std::sync::Arc;

/// A parked waiter: the scheduler to resume on and the fiber to schedule.
pub(crate) type Waiter = (Scheduler, Arc<Fiber>);

/// Capture the current `(Scheduler, Fiber)` pair for parking.
pub(crate) fn current_waiter() -> Waiter {
    let scheduler = Scheduler::current().expect("fiber synchronization requires a scheduler");
    (scheduler, Fiber::current())
}
