//! General-purpose worker pool
//!
//! The plain scheduler front-end: its idle fiber blocks the worker thread
//! on a semaphore and yields back whenever the pool is tickled.

use super::{Scheduler, SchedulerHooks, SchedulerOptions, WeakScheduler, Work};
use crate::fiber::Fiber;
use crate::sync::Semaphore;

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::ThreadId;

struct PoolHooks {
    scheduler: WeakScheduler,
    idle_sema: Semaphore,
}

impl PoolHooks {
    fn scheduler(&self) -> Option<Scheduler> {
        self.scheduler.upgrade()
    }
}

impl SchedulerHooks for PoolHooks {
    fn idle(&self) {
        loop {
            match self.scheduler() {
                Some(scheduler) if !scheduler.queue_stopped() => {}
                _ => return,
            }
            self.idle_sema.wait();
            // An injected shutdown lands here as a panic at the yield
            // point; treat it as a request to finish idling.
            if panic::catch_unwind(AssertUnwindSafe(Fiber::yield_now)).is_err() {
                return;
            }
        }
    }

    fn tickle(&self) {
        log::trace!(target: "scheduler", "tickling worker pool");
        self.idle_sema.notify();
    }

    fn stopping(&self) -> bool {
        self.scheduler().map_or(true, |s| s.queue_stopped())
    }
}

/// A started scheduler with semaphore-idle workers.
///
/// Created started (like every scheduler front-end); dropped pools stop
/// themselves, which for hijacking pools drains remaining work on the
/// caller's thread.
pub struct WorkerPool {
    scheduler: Scheduler,
}

impl WorkerPool {
    /// Build and start a pool.
    pub fn new(options: SchedulerOptions) -> WorkerPool {
        let scheduler = Scheduler::new(options);
        let hooks = Arc::new(PoolHooks {
            scheduler: scheduler.downgrade(),
            idle_sema: Semaphore::new(0),
        });
        scheduler.install_hooks(hooks);
        scheduler.start();
        WorkerPool { scheduler }
    }

    /// The underlying scheduler handle.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// See [`Scheduler::schedule`].
    pub fn schedule(&self, work: impl Into<Work>) {
        self.scheduler.schedule(work);
    }

    /// See [`Scheduler::schedule_call`].
    pub fn schedule_call(&self, f: impl FnOnce() + Send + 'static) {
        self.scheduler.schedule_call(f);
    }

    /// See [`Scheduler::schedule_batch`].
    pub fn schedule_batch(&self, items: impl IntoIterator<Item = Work>) {
        self.scheduler.schedule_batch(items);
    }

    /// See [`Scheduler::schedule_on`].
    pub fn schedule_on(&self, work: impl Into<Work>, thread: ThreadId) {
        self.scheduler.schedule_on(work, thread);
    }

    /// See [`Scheduler::start`].
    pub fn start(&self) {
        self.scheduler.start();
    }

    /// See [`Scheduler::stop`].
    pub fn stop(&self) {
        self.scheduler.stop();
    }

    /// See [`Scheduler::dispatch`].
    pub fn dispatch(&self) {
        self.scheduler.dispatch();
    }

    /// See [`Scheduler::stopping`].
    pub fn stopping(&self) -> bool {
        self.scheduler.stopping()
    }

    /// See [`Scheduler::thread_count`].
    pub fn thread_count(&self) -> usize {
        self.scheduler.thread_count()
    }

    /// See [`Scheduler::set_thread_count`].
    pub fn set_thread_count(&self, count: usize) {
        self.scheduler.set_thread_count(count);
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        WorkerPool::new(SchedulerOptions::default())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.scheduler.stop();
        self.scheduler.uninstall_from_thread();
    }
}
