//! Cooperative fiber scheduler
//!
//! A [`Scheduler`] multiplexes fibers over OS threads (M:N). It can hijack
//! the thread it was created on, spawn worker threads of its own, or both.
//! A hijacking scheduler begins processing when [`Scheduler::dispatch`] or
//! [`Scheduler::suspend`] is reached and winds down when no work remains;
//! hybrid and spawned schedulers are stopped explicitly with
//! [`Scheduler::stop`].
//!
//! The scheduler itself owns only the run queue and worker threads. What a
//! worker does when the queue is empty (and how a sleeping worker is woken)
//! is supplied by a [`SchedulerHooks`] implementation: [`WorkerPool`] parks
//! on a semaphore, the I/O manager parks in the kernel readiness wait.

mod pool;

pub use pool::WorkerPool;

use crate::fiber::{Fiber, FiberState};

use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, JoinHandle, ThreadId};

/// Construction options for a scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Total worker count, including the caller's thread when `use_caller`
    /// is set. 0 means one worker per CPU core.
    pub threads: usize,
    /// Hijack the constructing thread as a worker.
    pub use_caller: bool,
    /// Maximum work items a worker claims per queue-lock round.
    pub batch_size: usize,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            threads: 1,
            use_caller: true,
            batch_size: 1,
        }
    }
}

/// Behavior supplied by the concrete scheduler front-end.
pub trait SchedulerHooks: Send + Sync {
    /// Body of the per-worker idle fiber. Runs when a worker finds no
    /// eligible work; must `Fiber::yield_now()` whenever new work may have
    /// arrived and return once the scheduler is stopping.
    fn idle(&self);

    /// Wake at least one idle worker to re-examine the run queue.
    fn tickle(&self);

    /// Whether the scheduler has fully stopped. Front-ends extend
    /// [`Scheduler::queue_stopped`] with their own conditions (pending
    /// timers, in-flight events).
    fn stopping(&self) -> bool;
}

/// A unit of schedulable work: a fiber to resume or a bare closure.
pub enum Work {
    /// Resume this fiber.
    Fiber(Arc<Fiber>),
    /// Run this closure inside a reusable worker-owned fiber.
    Call(Box<dyn FnOnce() + Send + 'static>),
}

impl Work {
    /// Wrap a closure as schedulable work.
    pub fn call(f: impl FnOnce() + Send + 'static) -> Work {
        Work::Call(Box::new(f))
    }
}

impl From<Arc<Fiber>> for Work {
    fn from(fiber: Arc<Fiber>) -> Work {
        Work::Fiber(fiber)
    }
}

struct Item {
    work: Work,
    /// When set, only the worker running on this thread may claim the item.
    thread: Option<ThreadId>,
}

struct Queue {
    items: VecDeque<Item>,
    threads: Vec<JoinHandle<()>>,
    /// Target number of spawned worker threads (excludes the hijacked one).
    thread_count: usize,
    active_threads: usize,
    stopping: bool,
    auto_stop: bool,
    /// On the hijacked thread: the fiber that entered the scheduler via
    /// `dispatch`/`suspend` and must regain control when work drains.
    calling_fiber: Option<Arc<Fiber>>,
}

struct Shared {
    queue: Mutex<Queue>,
    idle_threads: AtomicUsize,
    batch_size: usize,
    /// Identity of the hijacked thread, if `use_caller`.
    root_thread: Option<ThreadId>,
    /// The hijacked thread's run fiber; exists iff `use_caller`.
    root_fiber: OnceLock<Arc<Fiber>>,
    hooks: OnceLock<Arc<dyn SchedulerHooks>>,
}

thread_local! {
    static THREAD_SCHEDULER: RefCell<Option<Scheduler>> = const { RefCell::new(None) };
    /// The fiber that drives this thread's dispatch loop: the thread anchor
    /// on spawned workers, the root fiber on a hijacked thread.
    static THREAD_RUN_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
}

/// Handle to a scheduler. Clones share the same run queue and workers.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

/// Non-owning scheduler handle, for hooks that the scheduler itself keeps
/// alive (a strong handle there would cycle).
#[derive(Clone)]
pub(crate) struct WeakScheduler(Weak<Shared>);

impl WeakScheduler {
    pub(crate) fn upgrade(&self) -> Option<Scheduler> {
        self.0.upgrade().map(|shared| Scheduler { shared })
    }
}

impl Scheduler {
    /// Build the scheduler core. Front-ends install their hooks with
    /// [`Scheduler::install_hooks`] before calling [`Scheduler::start`].
    pub(crate) fn new(options: SchedulerOptions) -> Scheduler {
        let mut threads = if options.threads == 0 {
            num_cpus::get()
        } else {
            options.threads
        };
        assert!(threads >= 1, "a scheduler needs at least one worker");
        assert!(options.batch_size >= 1);

        let root_thread = if options.use_caller {
            assert!(
                Scheduler::current().is_none(),
                "thread already owns a scheduler"
            );
            threads -= 1;
            Some(thread::current().id())
        } else {
            None
        };

        let scheduler = Scheduler {
            shared: Arc::new(Shared {
                queue: Mutex::new(Queue {
                    items: VecDeque::new(),
                    threads: Vec::new(),
                    thread_count: threads,
                    active_threads: 0,
                    stopping: true,
                    auto_stop: false,
                    calling_fiber: None,
                }),
                idle_threads: AtomicUsize::new(0),
                batch_size: options.batch_size,
                root_thread,
                root_fiber: OnceLock::new(),
                hooks: OnceLock::new(),
            }),
        };

        if options.use_caller {
            // The root fiber runs this scheduler's dispatch loop on the
            // hijacked thread. It holds only a weak handle so a parked
            // scheduler can still be torn down.
            let weak = Arc::downgrade(&scheduler.shared);
            let root = Fiber::new(move || {
                if let Some(shared) = weak.upgrade() {
                    Scheduler { shared }.run();
                }
            });
            scheduler.shared.root_fiber.set(root.clone()).ok();
            THREAD_SCHEDULER.with(|s| *s.borrow_mut() = Some(scheduler.clone()));
            THREAD_RUN_FIBER.with(|f| *f.borrow_mut() = Some(root));
        }

        scheduler
    }

    /// Install the idle/tickle/stopping behavior. Must be called exactly
    /// once, before `start`.
    pub(crate) fn install_hooks(&self, hooks: Arc<dyn SchedulerHooks>) {
        assert!(
            self.shared.hooks.set(hooks).is_ok(),
            "scheduler hooks installed twice"
        );
    }

    fn hooks(&self) -> Option<Arc<dyn SchedulerHooks>> {
        self.shared.hooks.get().cloned()
    }

    /// A non-owning handle to this scheduler.
    pub(crate) fn downgrade(&self) -> WeakScheduler {
        WeakScheduler(Arc::downgrade(&self.shared))
    }

    /// The scheduler controlling the current thread, if any.
    pub fn current() -> Option<Scheduler> {
        THREAD_SCHEDULER.with(|s| s.borrow().clone())
    }

    /// Whether this scheduler controls the current thread.
    pub fn is_current(&self) -> bool {
        Scheduler::current().is_some_and(|s| Arc::ptr_eq(&s.shared, &self.shared))
    }

    /// Identity of the hijacked thread, if this scheduler has one.
    pub fn root_thread(&self) -> Option<ThreadId> {
        self.shared.root_thread
    }

    /// Total workers, including the hijacked thread.
    pub fn thread_count(&self) -> usize {
        self.shared.queue.lock().thread_count + usize::from(self.shared.root_fiber.get().is_some())
    }

    /// Grow or shrink the worker pool. Surplus spawned workers retire
    /// themselves by killing off their idle fiber.
    pub fn set_thread_count(&self, count: usize) {
        assert!(count >= 1);
        let spawned_target = count - usize::from(self.shared.root_fiber.get().is_some());
        let mut queue = self.shared.queue.lock();
        if spawned_target == queue.thread_count {
            return;
        }
        let growing = spawned_target > queue.thread_count;
        queue.thread_count = spawned_target;
        if growing {
            if !queue.stopping {
                while queue.threads.len() < spawned_target {
                    let index = queue.threads.len();
                    queue.threads.push(self.spawn_worker(index));
                }
            }
        } else {
            drop(queue);
            // Wake everyone; surplus workers notice and exit.
            for _ in 0..spawned_target + 1 {
                self.tickle();
            }
        }
    }

    fn spawn_worker(&self, index: usize) -> JoinHandle<()> {
        let scheduler = self.clone();
        thread::Builder::new()
            .name(format!("strand-worker-{}", index))
            .spawn(move || scheduler.run())
            .expect("failed to spawn worker thread")
    }

    /// Start the worker threads. A no-op if already started.
    pub fn start(&self) {
        let mut queue = self.shared.queue.lock();
        if !queue.stopping {
            return;
        }
        log::debug!(target: "scheduler", "starting {} worker threads", queue.thread_count);
        queue.stopping = false;
        assert!(queue.threads.is_empty());
        for i in 0..queue.thread_count {
            let handle = self.spawn_worker(i);
            queue.threads.push(handle);
        }
    }

    /// Whether any work is queued.
    pub fn has_work(&self) -> bool {
        !self.shared.queue.lock().items.is_empty()
    }

    /// Whether any worker is parked in its idle fiber.
    pub fn has_idle_threads(&self) -> bool {
        self.shared.idle_threads.load(Ordering::Acquire) != 0
    }

    /// The base stop condition: stop requested, queue drained, and no
    /// worker mid-batch. Front-ends AND in their own conditions via
    /// [`SchedulerHooks::stopping`].
    pub fn queue_stopped(&self) -> bool {
        let queue = self.shared.queue.lock();
        queue.stopping && queue.items.is_empty() && queue.active_threads == 0
    }

    /// The front-end stop condition (falls back to the base one).
    pub fn stopping(&self) -> bool {
        match self.hooks() {
            Some(hooks) => hooks.stopping(),
            None => self.queue_stopped(),
        }
    }

    fn tickle(&self) {
        if let Some(hooks) = self.hooks() {
            hooks.tickle();
        }
    }

    fn should_tickle(&self, became_nonempty: bool) -> bool {
        became_nonempty && !self.is_current()
    }

    /// Append work to the run queue (FIFO). Wakes an idle worker when the
    /// queue transitions from empty and the caller is not already one of
    /// this scheduler's threads.
    pub fn schedule(&self, work: impl Into<Work>) {
        self.schedule_work(work.into(), None);
    }

    /// Schedule a bare closure; it runs inside a reusable worker fiber.
    pub fn schedule_call(&self, f: impl FnOnce() + Send + 'static) {
        self.schedule_work(Work::call(f), None);
    }

    /// Schedule work pinned to a specific worker thread.
    pub fn schedule_on(&self, work: impl Into<Work>, thread: ThreadId) {
        self.schedule_work(work.into(), Some(thread));
    }

    fn schedule_work(&self, work: Work, thread: Option<ThreadId>) {
        let became_nonempty = {
            let mut queue = self.shared.queue.lock();
            let was_empty = queue.items.is_empty();
            queue.items.push_back(Item { work, thread });
            was_empty
        };
        if self.should_tickle(became_nonempty) {
            self.tickle();
        }
    }

    /// Schedule many items with a single wakeup.
    pub fn schedule_batch(&self, items: impl IntoIterator<Item = Work>) {
        let became_nonempty = {
            let mut queue = self.shared.queue.lock();
            let mut any_from_empty = false;
            for work in items {
                any_from_empty |= queue.items.is_empty();
                queue.items.push_back(Item { work, thread: None });
            }
            any_from_empty
        };
        if self.should_tickle(became_nonempty) {
            self.tickle();
        }
    }

    /// Re-queue the current fiber and let other work run. The scheduler
    /// resumes this fiber in FIFO turn.
    pub fn yield_now() {
        let scheduler = Scheduler::current().expect("no scheduler on this thread");
        scheduler.schedule(Fiber::current());
        Scheduler::suspend();
    }

    /// Switch away from the current fiber without re-queueing it. The fiber
    /// stays parked until something else schedules it.
    pub fn suspend() {
        let scheduler = Scheduler::current().expect("no scheduler on this thread");
        let run_fiber =
            THREAD_RUN_FIBER.with(|f| f.borrow().clone()).expect("thread has no run fiber");
        if scheduler.shared.root_thread == Some(thread::current().id())
            && matches!(run_fiber.state(), FiberState::Init | FiberState::Term)
        {
            // Entering (or re-entering) the hijacked thread's dispatch
            // loop: remember who to hand control back to when it drains.
            scheduler.shared.queue.lock().calling_fiber = Some(Fiber::current());
            scheduler.suspend_current(true);
        } else {
            scheduler.suspend_current(false);
        }
    }

    /// Re-schedule the current fiber onto this scheduler (optionally pinned
    /// to `thread`) and switch away; on resume it runs there.
    pub fn switch_to(&self, thread: Option<ThreadId>) {
        assert!(
            Scheduler::current().is_some(),
            "switch_to outside a scheduler"
        );
        if self.is_current() && thread.is_none_or(|t| t == thread::current().id()) {
            return;
        }
        log::debug!(target: "scheduler", "switching current fiber to {:?}", thread);
        self.schedule_work(Work::Fiber(Fiber::current()), thread);
        Scheduler::suspend();
    }

    /// Switch the thread's current fiber to the run fiber.
    ///
    /// If the hijacked thread's run fiber has already terminated (a prior
    /// `dispatch` drained it) it is re-armed with the dispatch loop first,
    /// so the scheduler can be entered again.
    fn suspend_current(&self, yield_to_caller_on_terminate: bool) {
        let run_fiber =
            THREAD_RUN_FIBER.with(|f| f.borrow().clone()).expect("thread has no run fiber");
        debug_assert!(self.is_current());
        if yield_to_caller_on_terminate {
            debug_assert_eq!(self.shared.root_thread, Some(thread::current().id()));
        }
        if run_fiber.state() != FiberState::Hodl {
            {
                let mut queue = self.shared.queue.lock();
                queue.stopping = queue.auto_stop || queue.stopping;
            }
            let weak = Arc::downgrade(&self.shared);
            run_fiber.reset(move || {
                if let Some(shared) = weak.upgrade() {
                    Scheduler { shared }.run();
                }
            });
        }
        run_fiber.yield_to(yield_to_caller_on_terminate);
    }

    /// For a pure-hijack scheduler: drain the queue on this thread and
    /// return once it is empty.
    pub fn dispatch(&self) {
        log::debug!(target: "scheduler", "dispatching");
        assert_eq!(
            self.shared.root_thread,
            Some(thread::current().id()),
            "dispatch must run on the hijacked thread"
        );
        {
            let mut queue = self.shared.queue.lock();
            assert_eq!(queue.thread_count, 0, "dispatch on a scheduler with spawned workers");
            queue.stopping = true;
            queue.auto_stop = true;
        }
        Scheduler::suspend();
        self.shared.queue.lock().auto_stop = false;
    }

    /// Stop the scheduler and wait for all work to finish.
    ///
    /// Safe to call repeatedly. Hijacking and hybrid schedulers must be
    /// stopped from within (on the hijacked thread); spawned-only
    /// schedulers from outside.
    pub fn stop(&self) {
        // Already-stopped fast path for pure hijack schedulers.
        if let Some(root_fiber) = self.shared.root_fiber.get() {
            let drained = {
                let queue = self.shared.queue.lock();
                queue.thread_count == 0
                    && matches!(root_fiber.state(), FiberState::Term | FiberState::Init)
            };
            if drained {
                log::debug!(target: "scheduler", "stopped");
                self.shared.queue.lock().stopping = true;
                // A front-end may still have timers or pending events to
                // drain in its idle loop, so we cannot always bail early.
                if self.stopping() {
                    return;
                }
            }
        }

        let mut exit_on_this_fiber = false;
        if self.shared.root_thread.is_some() {
            // A thread-hijacking scheduler must be stopped from within to
            // return control to the original thread.
            assert!(self.is_current(), "hijacking scheduler stopped from outside");
            let calling = self.shared.queue.lock().calling_fiber.clone();
            match calling {
                Some(calling) => {
                    if Arc::ptr_eq(&calling, &Fiber::current()) {
                        exit_on_this_fiber = true;
                        log::debug!(target: "scheduler", "switching to root thread to stop");
                        self.switch_to(self.shared.root_thread);
                    }
                }
                None => exit_on_this_fiber = true,
            }
        } else {
            // A spawned-threads-only scheduler cannot be stopped from
            // within itself: who would regain control?
            assert!(!self.is_current(), "spawned scheduler stopped from inside");
        }

        let thread_count = {
            let mut queue = self.shared.queue.lock();
            queue.stopping = true;
            queue.thread_count
        };
        for _ in 0..thread_count {
            self.tickle();
        }
        if self.shared.root_fiber.get().is_some() && (thread_count != 0 || !self.is_current()) {
            self.tickle();
        }

        // Drain the work on this thread through the run fiber.
        if exit_on_this_fiber {
            while !self.stopping() {
                log::debug!(target: "scheduler", "yielding to run fiber to stop");
                self.suspend_current(true);
            }
        }

        // Wait for the spawned workers.
        if exit_on_this_fiber || !self.is_current() {
            log::debug!(target: "scheduler", "joining worker threads");
            let handles = {
                let mut queue = self.shared.queue.lock();
                std::mem::take(&mut queue.threads)
            };
            for handle in handles {
                let _ = handle.join();
            }
        }
        log::debug!(target: "scheduler", "stopped");
    }

    /// Drop this thread's association with the scheduler, if any. Called by
    /// front-ends after a final `stop`.
    pub(crate) fn uninstall_from_thread(&self) {
        THREAD_SCHEDULER.with(|s| {
            let mut slot = s.borrow_mut();
            if slot.as_ref().is_some_and(|c| Arc::ptr_eq(&c.shared, &self.shared)) {
                *slot = None;
            }
        });
        if self.shared.root_thread == Some(thread::current().id()) {
            THREAD_RUN_FIBER.with(|f| {
                let mut slot = f.borrow_mut();
                let is_root = slot
                    .as_ref()
                    .zip(self.shared.root_fiber.get())
                    .is_some_and(|(a, b)| Arc::ptr_eq(a, b));
                if is_root {
                    *slot = None;
                }
            });
        }
    }

    /// The per-worker dispatch loop.
    fn run(&self) {
        THREAD_SCHEDULER.with(|s| *s.borrow_mut() = Some(self.clone()));
        let this_thread = thread::current().id();
        if self.shared.root_thread != Some(this_thread) {
            // Running on a spawned worker: the thread anchor is the run fiber.
            THREAD_RUN_FIBER.with(|f| *f.borrow_mut() = Some(Fiber::current()));
        }

        let hooks = self.hooks();
        let idle_fiber = {
            let hooks = hooks.clone();
            Fiber::new(move || {
                if let Some(hooks) = hooks {
                    hooks.idle();
                }
            })
        };
        log::debug!(target: "scheduler", "worker loop started on {:?}", this_thread);
        // Reusable fiber for bare closures.
        let mut call_fiber: Option<Arc<Fiber>> = None;
        let mut batch: Vec<Item> = Vec::with_capacity(self.shared.batch_size);
        let mut is_active = false;

        loop {
            debug_assert!(batch.is_empty());
            let mut dont_idle = false;
            let mut tickle_me = false;
            {
                let mut queue = self.shared.queue.lock();

                // Retire this worker if the pool shrank.
                if queue.threads.len() > queue.thread_count
                    && self.shared.root_thread != Some(this_thread)
                {
                    if is_active {
                        queue.active_threads -= 1;
                    }
                    // Kill off the idle fiber; its body treats the injected
                    // failure as a request to return.
                    let _ = panic::catch_unwind(AssertUnwindSafe(|| {
                        idle_fiber.inject(Box::new("too many threads"));
                    }));
                    if let Some(pos) = queue
                        .threads
                        .iter()
                        .position(|h| h.thread().id() == this_thread)
                    {
                        let handle = queue.threads.remove(pos);
                        let more_to_retire = queue.threads.len() > queue.thread_count;
                        drop(queue);
                        drop(handle);
                        if more_to_retire {
                            self.tickle();
                        }
                    }
                    log::debug!(target: "scheduler", "worker {:?} retired", this_thread);
                    return;
                }

                let total_threads =
                    queue.thread_count + usize::from(self.shared.root_fiber.get().is_some());
                let mut i = 0;
                while i < queue.items.len() {
                    // Once the batch is full, we only keep scanning to find
                    // out whether another worker needs a wakeup.
                    if (tickle_me || queue.active_threads == total_threads)
                        && batch.len() == self.shared.batch_size
                    {
                        break;
                    }
                    let item = &queue.items[i];
                    if let Some(pinned) = item.thread {
                        if pinned != this_thread {
                            // Someone else's work; make sure they hear about it.
                            tickle_me = true;
                            dont_idle = true;
                            i += 1;
                            continue;
                        }
                    }
                    if let Work::Fiber(fiber) = &item.work {
                        // Still winding down on another thread; it has to
                        // reach its switch point before we may resume it.
                        if fiber.state() == FiberState::Exec {
                            dont_idle = true;
                            i += 1;
                            continue;
                        }
                    }
                    if batch.len() == self.shared.batch_size {
                        tickle_me = true;
                        break;
                    }
                    batch.push(queue.items.remove(i).unwrap());
                    if !is_active {
                        queue.active_threads += 1;
                        is_active = true;
                    }
                }

                if batch.is_empty() && is_active {
                    queue.active_threads -= 1;
                    is_active = false;
                }
            }

            if tickle_me {
                self.tickle();
            }
            log::trace!(
                target: "scheduler",
                "claimed {} item(s) (batch limit {})",
                batch.len(),
                self.shared.batch_size
            );

            if batch.is_empty() {
                if dont_idle {
                    continue;
                }
                if idle_fiber.state() == FiberState::Term {
                    log::debug!(target: "scheduler", "idle fiber terminated, worker exiting");
                    if self.shared.root_thread == Some(this_thread) {
                        self.shared.queue.lock().calling_fiber = None;
                    }
                    // Unblock the next thread so it can wind down too.
                    if self.thread_count() > 1 {
                        self.tickle();
                    }
                    return;
                }
                self.shared.idle_threads.fetch_add(1, Ordering::AcqRel);
                idle_fiber.call();
                self.shared.idle_threads.fetch_sub(1, Ordering::AcqRel);
                continue;
            }

            while let Some(item) = batch.pop() {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| match item.work {
                    Work::Fiber(fiber) => {
                        if fiber.state() != FiberState::Term {
                            fiber.yield_to(true);
                        }
                    }
                    Work::Call(f) => {
                        let fiber = match call_fiber.take() {
                            Some(fiber) => {
                                fiber.reset(f);
                                fiber
                            }
                            None => Fiber::new(f),
                        };
                        fiber.yield_to(true);
                        if fiber.state() == FiberState::Term {
                            // Keep it for the next closure.
                            call_fiber = Some(fiber);
                        }
                    }
                }));
                if let Err(payload) = outcome {
                    // Put the rest of the batch back and let the failure
                    // take this worker down.
                    let mut queue = self.shared.queue.lock();
                    queue.items.extend(batch.drain(..));
                    if is_active {
                        queue.active_threads -= 1;
                    }
                    drop(queue);
                    panic::resume_unwind(payload);
                }
            }
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("addr", &Arc::as_ptr(&self.shared))
            .finish()
    }
}

/// Scope guard that returns the current fiber to the scheduler it started
/// on.
///
/// Captures [`Scheduler::current`] on construction (optionally switching
/// to a target scheduler first) and switches back on drop.
pub struct SchedulerSwitcher {
    caller: Option<Scheduler>,
}

impl SchedulerSwitcher {
    /// Capture the current scheduler; with `target`, also switch the
    /// current fiber onto it.
    pub fn new(target: Option<&Scheduler>) -> SchedulerSwitcher {
        let caller = Scheduler::current();
        if let Some(target) = target {
            target.switch_to(None);
        }
        SchedulerSwitcher { caller }
    }
}

impl Drop for SchedulerSwitcher {
    fn drop(&mut self) {
        if let Some(caller) = &self.caller {
            caller.switch_to(None);
        }
    }
}
