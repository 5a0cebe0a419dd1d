//! Fiber and thread semaphores

use super::{current_waiter, Waiter};
use crate::scheduler::Scheduler;

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

struct SemaphoreState {
    concurrency: usize,
    waiters: VecDeque<Waiter>,
}

/// A counting semaphore for fibers.
///
/// `wait` takes a unit of concurrency or parks the fiber; `notify` wakes
/// the head waiter (FIFO) or, with none parked, returns the unit.
pub struct FiberSemaphore {
    state: Mutex<SemaphoreState>,
}

impl FiberSemaphore {
    /// Create a semaphore with `initial_concurrency` available units.
    pub fn new(initial_concurrency: usize) -> FiberSemaphore {
        FiberSemaphore {
            state: Mutex::new(SemaphoreState {
                concurrency: initial_concurrency,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Take a unit, parking the current fiber if none is available.
    pub fn wait(&self) {
        let waiter = current_waiter();
        {
            let mut state = self.state.lock();
            if state.concurrency > 0 {
                state.concurrency -= 1;
                return;
            }
            state.waiters.push_back(waiter);
        }
        Scheduler::suspend();
    }

    /// Return a unit, waking the head waiter if one is parked.
    pub fn notify(&self) {
        let mut state = self.state.lock();
        if let Some((scheduler, fiber)) = state.waiters.pop_front() {
            scheduler.schedule(fiber);
        } else {
            state.concurrency += 1;
        }
    }

    /// Units currently available.
    pub fn available(&self) -> usize {
        self.state.lock().concurrency
    }

    /// Number of fibers parked on the semaphore.
    pub fn waiting_count(&self) -> usize {
        self.state.lock().waiters.len()
    }
}

/// A thread-level counting semaphore for cross-thread signalling.
///
/// Unlike [`FiberSemaphore`] this blocks the calling OS thread; the worker
/// pool's idle fiber waits on one so a sleeping worker consumes no CPU.
pub struct Semaphore {
    count: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    /// Create a semaphore with `count` initial units.
    pub fn new(count: usize) -> Semaphore {
        Semaphore {
            count: Mutex::new(count),
            available: Condvar::new(),
        }
    }

    /// Block the calling thread until a unit is available, then take it.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.available.wait(&mut count);
        }
        *count -= 1;
    }

    /// Release a unit, waking one blocked thread.
    pub fn notify(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.available.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_thread_semaphore_counts() {
        let sema = Semaphore::new(2);
        sema.wait();
        sema.wait();
        sema.notify();
        sema.wait();
    }

    #[test]
    fn test_thread_semaphore_wakes_blocked_thread() {
        let sema = Arc::new(Semaphore::new(0));
        let s = sema.clone();
        let handle = thread::spawn(move || {
            s.wait();
            true
        });
        thread::sleep(Duration::from_millis(20));
        sema.notify();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_fiber_semaphore_fast_path() {
        let sema = FiberSemaphore::new(2);
        assert_eq!(sema.available(), 2);
        sema.notify();
        assert_eq!(sema.available(), 3);
        assert_eq!(sema.waiting_count(), 0);
    }
}
