//! Fan-out / fan-in helpers
//!
//! Run a batch of closures as fibers on the current scheduler and suspend
//! the caller until every one has finished. Concurrency comes from the
//! scheduler's worker threads and from the closures yielding at their own
//! suspension points. Without a scheduler (or with a single closure) the
//! batch degenerates to sequential execution on the caller.

use crate::fiber::{Fiber, FiberState, PanicPayload};
use crate::scheduler::Scheduler;
use crate::sync::FiberSemaphore;

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Default worker-fiber count for [`parallel_foreach`].
const DEFAULT_FOREACH_PARALLELISM: usize = 4;

struct DoState {
    completed: AtomicUsize,
    total: usize,
    /// One failure slot per closure; the first (in batch order) is
    /// re-raised to the caller after all have run.
    panics: Mutex<Vec<Option<PanicPayload>>>,
    scheduler: Scheduler,
    caller: Arc<Fiber>,
    cap: Option<FiberSemaphore>,
}

fn parallel_do_body(dg: impl FnOnce(), index: usize, state: &DoState) {
    if let Some(cap) = &state.cap {
        cap.wait();
    }
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(dg)) {
        state.panics.lock()[index] = Some(payload);
    }
    if let Some(cap) = &state.cap {
        cap.notify();
    }
    if state.completed.fetch_add(1, Ordering::AcqRel) + 1 == state.total {
        state.scheduler.schedule(state.caller.clone());
    }
}

fn surface_first_panic(state: &DoState) {
    let mut panics = state.panics.lock();
    for slot in panics.iter_mut() {
        if let Some(payload) = slot.take() {
            panic::resume_unwind(payload);
        }
    }
}

/// Execute `dgs` in parallel on the current scheduler.
///
/// With `parallelism`, at most that many closures run concurrently
/// (enforced by a fiber semaphore). The caller suspends after scheduling
/// the batch and resumes when the last closure completes; the first
/// captured panic is then re-raised. Runs sequentially when no scheduler
/// controls the thread or there is at most one closure.
pub fn parallel_do<I>(dgs: I, parallelism: Option<usize>)
where
    I: IntoIterator,
    I::Item: FnOnce() + Send + 'static,
{
    let dgs: Vec<I::Item> = dgs.into_iter().collect();
    let scheduler = Scheduler::current();
    let Some(scheduler) = scheduler.filter(|_| dgs.len() > 1) else {
        for dg in dgs {
            dg();
        }
        return;
    };
    assert!(parallelism != Some(0));

    let state = Arc::new(DoState {
        completed: AtomicUsize::new(0),
        total: dgs.len(),
        panics: Mutex::new((0..dgs.len()).map(|_| None).collect()),
        scheduler: scheduler.clone(),
        caller: Fiber::current(),
        cap: parallelism.map(FiberSemaphore::new),
    });

    for (index, dg) in dgs.into_iter().enumerate() {
        let state = state.clone();
        scheduler.schedule(Fiber::new(move || parallel_do_body(dg, index, &state)));
    }
    Scheduler::suspend();
    surface_first_panic(&state);
}

/// [`parallel_do`] reusing caller-provided fibers (one per closure),
/// avoiding per-batch stack allocation.
///
/// Pre: `fibers.len() >= dgs.len()` and every used fiber is resettable
/// (Init/Term/Except). Waits for every fiber to leave Exec before
/// returning so the caller may immediately reset them again.
pub fn parallel_do_with<I>(dgs: I, fibers: &[Arc<Fiber>], parallelism: Option<usize>)
where
    I: IntoIterator,
    I::Item: FnOnce() + Send + 'static,
{
    let dgs: Vec<I::Item> = dgs.into_iter().collect();
    assert!(fibers.len() >= dgs.len());
    let scheduler = Scheduler::current();
    let Some(scheduler) = scheduler.filter(|_| dgs.len() > 1) else {
        for dg in dgs {
            dg();
        }
        return;
    };
    assert!(parallelism != Some(0));

    let used = dgs.len();
    let state = Arc::new(DoState {
        completed: AtomicUsize::new(0),
        total: used,
        panics: Mutex::new((0..used).map(|_| None).collect()),
        scheduler: scheduler.clone(),
        caller: Fiber::current(),
        cap: parallelism.map(FiberSemaphore::new),
    });

    for (index, dg) in dgs.into_iter().enumerate() {
        let state = state.clone();
        fibers[index].reset(move || parallel_do_body(dg, index, &state));
        scheduler.schedule(fibers[index].clone());
    }
    Scheduler::suspend();

    // A fiber may have bumped the completion counter but not yet finished
    // its final switch on another thread; don't hand it back for reset
    // until it has.
    for fiber in &fibers[..used] {
        while fiber.state() == FiberState::Exec {
            Scheduler::yield_now();
        }
    }
    surface_first_panic(&state);
}

/// Apply `f` to every item with a pool of `parallelism` worker fibers
/// (default 4) pulling from a shared queue.
///
/// After the first panic, no further items are dispatched; the panic is
/// re-raised to the caller once the workers have drained. Runs
/// sequentially when `parallelism` is 1 or no scheduler controls the
/// thread.
pub fn parallel_foreach<T, I, F>(items: I, f: F, parallelism: Option<usize>)
where
    T: Send + 'static,
    I: IntoIterator<Item = T>,
    F: Fn(T) + Send + Sync + 'static,
{
    let parallelism = parallelism.unwrap_or(DEFAULT_FOREACH_PARALLELISM);
    assert!(parallelism >= 1);
    let scheduler = Scheduler::current();
    let Some(scheduler) = scheduler.filter(|_| parallelism > 1) else {
        log::debug!(target: "parallel", "running parallel_foreach sequentially");
        for item in items {
            f(item);
        }
        return;
    };

    log::debug!(target: "parallel", "running parallel_foreach with {} fibers", parallelism);
    let queue = Arc::new(Mutex::new(items.into_iter().collect::<VecDeque<T>>()));
    let failure: Arc<Mutex<Option<PanicPayload>>> = Arc::new(Mutex::new(None));
    let f = Arc::new(f);
    let remaining = Arc::new(AtomicUsize::new(parallelism));
    let caller = Fiber::current();

    for _ in 0..parallelism {
        let queue = queue.clone();
        let failure = failure.clone();
        let f = f.clone();
        let remaining = remaining.clone();
        let caller = caller.clone();
        let scheduler_for_wake = scheduler.clone();
        scheduler.schedule(Fiber::new(move || {
            loop {
                let item = if failure.lock().is_some() {
                    None
                } else {
                    queue.lock().pop_front()
                };
                let Some(item) = item else { break };
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| f(item))) {
                    *failure.lock() = Some(payload);
                    break;
                }
            }
            if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                scheduler_for_wake.schedule(caller);
            }
        }));
    }
    Scheduler::suspend();

    let payload = failure.lock().take();
    if let Some(payload) = payload {
        panic::resume_unwind(payload);
    }
}
