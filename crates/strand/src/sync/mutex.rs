//! Fiber mutex and condition variable

use super::{current_waiter, Waiter};
use crate::fiber::Fiber;
use crate::scheduler::Scheduler;

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

struct MutexState {
    owner: Option<Arc<Fiber>>,
    waiters: VecDeque<Waiter>,
}

/// A mutual-exclusion lock for fibers.
///
/// On contention the locking fiber yields to its scheduler instead of
/// blocking the thread, and grants are handed to waiters in FIFO order:
/// `unlock` transfers ownership directly to the head waiter before
/// scheduling it, so the lock cannot be stolen out from under it.
///
/// Not reentrant; locking a mutex the current fiber already owns panics.
pub struct FiberMutex {
    state: Mutex<MutexState>,
}

impl FiberMutex {
    /// Create an unlocked mutex.
    pub fn new() -> FiberMutex {
        FiberMutex {
            state: Mutex::new(MutexState {
                owner: None,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Acquire the mutex, parking the current fiber if it is held.
    pub fn lock(&self) {
        let (scheduler, fiber) = current_waiter();
        {
            let mut state = self.state.lock();
            assert!(
                !state.owner.as_ref().is_some_and(|o| Arc::ptr_eq(o, &fiber)),
                "fiber mutex locked recursively"
            );
            if state.owner.is_none() {
                state.owner = Some(fiber);
                return;
            }
            state.waiters.push_back((scheduler, fiber));
        }
        Scheduler::suspend();
    }

    /// Release the mutex. Pre: the current fiber owns it.
    pub fn unlock(&self) {
        let mut state = self.state.lock();
        self.unlock_held(&mut state);
    }

    /// Release the mutex only if other fibers are waiting on it; returns
    /// whether it was released. Lets a holder yield fairly to contenders
    /// without churning the lock when there are none.
    pub fn unlock_if_not_unique(&self) -> bool {
        let mut state = self.state.lock();
        assert!(
            state.owner.as_ref().is_some_and(|o| Arc::ptr_eq(o, &Fiber::current())),
            "unlock by a fiber that does not own the mutex"
        );
        if !state.waiters.is_empty() {
            self.unlock_held(&mut state);
            true
        } else {
            false
        }
    }

    /// Whether the mutex is currently held.
    pub fn is_locked(&self) -> bool {
        self.state.lock().owner.is_some()
    }

    /// Number of fibers parked on the mutex.
    pub fn waiting_count(&self) -> usize {
        self.state.lock().waiters.len()
    }

    fn unlock_held(&self, state: &mut MutexState) {
        assert!(
            state.owner.as_ref().is_some_and(|o| Arc::ptr_eq(o, &Fiber::current())),
            "unlock by a fiber that does not own the mutex"
        );
        state.owner = None;
        if let Some((scheduler, fiber)) = state.waiters.pop_front() {
            state.owner = Some(fiber.clone());
            scheduler.schedule(fiber);
        }
    }
}

impl Default for FiberMutex {
    fn default() -> Self {
        Self::new()
    }
}

/// A condition variable bound to a [`FiberMutex`].
///
/// `wait` atomically parks the current fiber and releases the mutex;
/// `signal`/`broadcast` either hand mutex ownership straight to a waiter
/// (when free) or move the waiter onto the mutex's queue (when held), so a
/// woken fiber always resumes holding the mutex.
pub struct FiberCondition {
    mutex: Arc<FiberMutex>,
    waiters: Mutex<VecDeque<Waiter>>,
}

impl FiberCondition {
    /// Create a condition variable using `mutex` as its predicate lock.
    pub fn new(mutex: Arc<FiberMutex>) -> FiberCondition {
        FiberCondition {
            mutex,
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    /// The mutex this condition is bound to.
    pub fn mutex(&self) -> &Arc<FiberMutex> {
        &self.mutex
    }

    /// Park the current fiber and release the mutex in one step. Pre: the
    /// current fiber owns the mutex. On return it owns the mutex again.
    pub fn wait(&self) {
        let waiter = current_waiter();
        {
            let mut waiters = self.waiters.lock();
            let mut state = self.mutex.state.lock();
            waiters.push_back(waiter);
            self.mutex.unlock_held(&mut state);
        }
        Scheduler::suspend();
    }

    /// Wake the head waiter, if any.
    pub fn signal(&self) {
        let next = {
            let mut waiters = self.waiters.lock();
            match waiters.pop_front() {
                Some(next) => next,
                None => return,
            }
        };
        let mut state = self.mutex.state.lock();
        debug_assert!(
            !state.owner.as_ref().is_some_and(|o| Arc::ptr_eq(o, &next.1)),
            "signalled fiber already owns the mutex"
        );
        if state.owner.is_none() {
            state.owner = Some(next.1.clone());
            next.0.schedule(next.1);
        } else {
            state.waiters.push_back(next);
        }
    }

    /// Wake every waiter.
    pub fn broadcast(&self) {
        let mut waiters = self.waiters.lock();
        if waiters.is_empty() {
            return;
        }
        let mut state = self.mutex.state.lock();
        for next in waiters.drain(..) {
            if state.owner.is_none() {
                state.owner = Some(next.1.clone());
                next.0.schedule(next.1);
            } else {
                state.waiters.push_back(next);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Contention paths need a running scheduler; those live in the
    // integration tests.

    #[test]
    fn test_mutex_starts_unlocked() {
        let mutex = FiberMutex::new();
        assert!(!mutex.is_locked());
        assert_eq!(mutex.waiting_count(), 0);
    }

    #[test]
    fn test_condition_signal_without_waiters_is_noop() {
        let mutex = Arc::new(FiberMutex::new());
        let condition = FiberCondition::new(mutex.clone());
        condition.signal();
        condition.broadcast();
        assert!(!mutex.is_locked());
    }
}
