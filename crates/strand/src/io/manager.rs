//! I/O manager: scheduler + timers + readiness reactor
//!
//! [`IoManager`] fuses a scheduler core, a [`TimerManager`], and an
//! edge-triggered epoll reactor. Its idle fiber parks the worker in
//! `epoll_wait` with the next timer deadline as the timeout; kernel
//! readiness and expired timers both turn into scheduled fibers/closures.
//! A non-blocking self-pipe registered with the reactor lets any thread
//! interrupt the wait.
//!
//! Registrations are one-shot: when an event fires (or is cancelled) it is
//! deregistered and its parked fiber or closure is scheduled exactly once.

use super::poller::{Poller, TicklePipe};
use crate::error::{Error, Result};
use crate::fiber::Fiber;
use crate::scheduler::{Scheduler, SchedulerHooks, SchedulerOptions, WeakScheduler, Work};
use crate::timer::{Timer, TimerManager};

use parking_lot::Mutex;
use std::io;
use std::os::fd::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

const EPOLLIN: u32 = libc::EPOLLIN as u32;
const EPOLLOUT: u32 = libc::EPOLLOUT as u32;
const EPOLLRDHUP: u32 = libc::EPOLLRDHUP as u32;
const EPOLLERR: u32 = libc::EPOLLERR as u32;
const EPOLLHUP: u32 = libc::EPOLLHUP as u32;
const EPOLLET: u32 = libc::EPOLLET as u32;

/// Readiness condition a fiber can wait for on a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoEvent {
    /// The descriptor is readable.
    Read,
    /// The descriptor is writable.
    Write,
    /// The peer hung up its write side (delivered distinctly from `Read`).
    Close,
}

impl IoEvent {
    fn mask(self) -> u32 {
        match self {
            IoEvent::Read => EPOLLIN,
            IoEvent::Write => EPOLLOUT,
            IoEvent::Close => EPOLLRDHUP,
        }
    }
}

/// The parked continuation for one (fd, event) registration.
#[derive(Default)]
struct EventContext {
    scheduler: Option<Scheduler>,
    work: Option<Work>,
}

struct AsyncStateInner {
    /// Mask of currently registered events for this fd.
    registered: u32,
    read: EventContext,
    write: EventContext,
    close: EventContext,
}

impl AsyncStateInner {
    fn context_mut(&mut self, event: IoEvent) -> &mut EventContext {
        match event {
            IoEvent::Read => &mut self.read,
            IoEvent::Write => &mut self.write,
            IoEvent::Close => &mut self.close,
        }
    }
}

/// Per-fd registration slot.
struct AsyncState {
    fd: RawFd,
    inner: Mutex<AsyncStateInner>,
}

impl AsyncState {
    fn new(fd: RawFd) -> AsyncState {
        AsyncState {
            fd,
            inner: Mutex::new(AsyncStateInner {
                registered: 0,
                read: EventContext::default(),
                write: EventContext::default(),
                close: EventContext::default(),
            }),
        }
    }
}

struct IoCore {
    scheduler: WeakScheduler,
    timers: TimerManager,
    poller: Poller,
    tickle_pipe: TicklePipe,
    pending_event_count: AtomicUsize,
    /// Sparse per-fd table, indexed by fd.
    states: Mutex<Vec<Option<Arc<AsyncState>>>>,
}

impl IoCore {
    /// The slot for `fd`, creating it on first use.
    fn state_for(&self, fd: RawFd) -> Arc<AsyncState> {
        let mut states = self.states.lock();
        let index = fd as usize;
        if states.len() <= index {
            let grown = (index + 1).max(states.len() * 3 / 2);
            states.resize_with(grown, || None);
        }
        states[index]
            .get_or_insert_with(|| Arc::new(AsyncState::new(fd)))
            .clone()
    }

    /// The slot for `fd`, if one exists.
    fn existing_state_for(&self, fd: RawFd) -> Option<Arc<AsyncState>> {
        self.states.lock().get(fd as usize)?.clone()
    }

    /// Deregister `event` and schedule its parked continuation. Pre: the
    /// state lock is held and the event is registered.
    fn trigger_event(&self, inner: &mut AsyncStateInner, event: IoEvent) -> bool {
        if inner.registered & event.mask() == 0 {
            return false;
        }
        inner.registered &= !event.mask();
        self.pending_event_count.fetch_sub(1, Ordering::AcqRel);
        let context = inner.context_mut(event);
        let scheduler = context.scheduler.take();
        let work = context.work.take();
        if let (Some(scheduler), Some(work)) = (scheduler, work) {
            scheduler.schedule(work);
        }
        true
    }

    fn next_timeout_if_stopping(&self) -> (bool, Option<u64>) {
        let next_timeout = self.timers.next_timer();
        let stopped = next_timeout.is_none()
            && self.scheduler.upgrade().map_or(true, |s| s.queue_stopped())
            && self.pending_event_count.load(Ordering::Acquire) == 0;
        (stopped, next_timeout)
    }
}

impl SchedulerHooks for IoCore {
    fn idle(&self) {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; 64];
        loop {
            let (stopped, mut next_timeout) = self.next_timeout_if_stopping();
            if stopped {
                return;
            }

            let count = loop {
                let timeout_ms = match next_timeout {
                    Some(us) => (us / 1000 + 1).min(i32::MAX as u64) as i32,
                    None => -1,
                };
                match self.poller.wait(&mut events, timeout_ms) {
                    Ok(count) => break count,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                        next_timeout = self.timers.next_timer();
                    }
                    Err(err) => panic!("epoll_wait failed: {}", err),
                }
            };
            log::trace!(target: "io", "reactor woke with {} event(s)", count);

            let expired = self.timers.process_timers();
            if !expired.is_empty() {
                if let Some(scheduler) = self.scheduler.upgrade() {
                    scheduler.schedule_batch(
                        expired.into_iter().map(|callback| Work::call(move || callback())),
                    );
                }
            }

            // A failed re-registration is remembered and re-raised only
            // after every event of this wake has been delivered.
            let mut deferred_error: Option<io::Error> = None;
            for event in &events[..count] {
                let fd = event.u64 as RawFd;
                if fd == self.tickle_pipe.read_fd() {
                    log::trace!(target: "io", "received tickle");
                    self.tickle_pipe.drain();
                    continue;
                }

                let Some(state) = self.existing_state_for(fd) else {
                    continue;
                };
                let mut inner = state.inner.lock();

                let mut observed = event.events;
                // Error or hang-up wakes both directions so the waiter can
                // observe the failure from its retry.
                if observed & (EPOLLERR | EPOLLHUP) != 0 {
                    observed |= EPOLLIN | EPOLLOUT;
                }
                let incoming = observed & (EPOLLIN | EPOLLOUT | EPOLLRDHUP);

                // Possibly already delivered by a concurrent cancel; the
                // kernel side is then already up to date too.
                if inner.registered & incoming == 0 {
                    continue;
                }

                let remaining = inner.registered & !incoming;
                let update = if remaining != 0 {
                    self.poller.modify(state.fd, EPOLLET | remaining)
                } else {
                    self.poller.delete(state.fd)
                };
                if let Err(err) = update {
                    deferred_error = Some(err);
                }

                let mut triggered = false;
                if incoming & EPOLLIN != 0 {
                    triggered |= self.trigger_event(&mut inner, IoEvent::Read);
                }
                if incoming & EPOLLOUT != 0 {
                    triggered |= self.trigger_event(&mut inner, IoEvent::Write);
                }
                if incoming & EPOLLRDHUP != 0 {
                    triggered |= self.trigger_event(&mut inner, IoEvent::Close);
                }
                debug_assert!(triggered);
            }

            if let Some(err) = deferred_error {
                panic!("epoll registration update failed: {}", err);
            }

            // Let the scheduler run what we just made runnable; an injected
            // shutdown lands here as a panic.
            if panic::catch_unwind(AssertUnwindSafe(Fiber::yield_now)).is_err() {
                return;
            }
        }
    }

    fn tickle(&self) {
        let Some(scheduler) = self.scheduler.upgrade() else {
            return;
        };
        if !scheduler.has_idle_threads() {
            log::trace!(target: "io", "no idle threads, skipping tickle");
            return;
        }
        self.tickle_pipe.tickle();
    }

    fn stopping(&self) -> bool {
        self.next_timeout_if_stopping().0
    }
}

/// Scheduler front-end that multiplexes fiber wakeups with fd readiness
/// and timers.
pub struct IoManager {
    scheduler: Scheduler,
    core: Arc<IoCore>,
}

impl IoManager {
    /// Build and start an I/O manager with default scheduler options.
    pub fn new() -> Result<IoManager> {
        IoManager::with_options(SchedulerOptions::default())
    }

    /// Build and start an I/O manager.
    pub fn with_options(options: SchedulerOptions) -> Result<IoManager> {
        IoManager::with_auto_start(options, true)
    }

    /// Build an I/O manager, optionally leaving the workers unstarted so a
    /// wrapping layer can finish its own setup first.
    pub fn with_auto_start(options: SchedulerOptions, auto_start: bool) -> Result<IoManager> {
        // Open the reactor before touching the thread's scheduler slot so a
        // failure leaves no half-installed scheduler behind.
        let poller = Poller::new()?;
        let tickle_pipe = TicklePipe::new()?;
        poller.add(tickle_pipe.read_fd(), EPOLLIN | EPOLLET)?;
        let scheduler = Scheduler::new(options);

        let core = Arc::new(IoCore {
            scheduler: scheduler.downgrade(),
            timers: TimerManager::new(),
            poller,
            tickle_pipe,
            pending_event_count: AtomicUsize::new(0),
            states: Mutex::new(Vec::new()),
        });
        let weak: Weak<IoCore> = Arc::downgrade(&core);
        core.timers.set_front_hook(move || {
            if let Some(core) = weak.upgrade() {
                core.tickle();
            }
        });
        scheduler.install_hooks(core.clone());

        let manager = IoManager { scheduler, core };
        if auto_start {
            manager.scheduler.start();
        }
        Ok(manager)
    }

    /// The underlying scheduler handle.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// The timer manager driving this reactor's wait timeout.
    pub fn timers(&self) -> &TimerManager {
        &self.core.timers
    }

    /// Registrations not yet fired or cancelled.
    pub fn pending_event_count(&self) -> usize {
        self.core.pending_event_count.load(Ordering::Acquire)
    }

    /// Park the current fiber until `event` is ready on `fd`. The fiber is
    /// scheduled back (exactly once) when the kernel reports readiness.
    ///
    /// Pre: no prior registration for this (fd, event). The caller yields
    /// with [`Scheduler::suspend`] after registering.
    pub fn register_event(&self, fd: RawFd, event: IoEvent) -> Result<()> {
        self.register(fd, event, None)
    }

    /// Like [`IoManager::register_event`], but schedules `f` instead of
    /// resuming the current fiber.
    pub fn register_event_call(
        &self,
        fd: RawFd,
        event: IoEvent,
        f: impl FnOnce() + Send + 'static,
    ) -> Result<()> {
        self.register(fd, event, Some(Work::call(f)))
    }

    fn register(&self, fd: RawFd, event: IoEvent, work: Option<Work>) -> Result<()> {
        assert!(fd >= 0);
        let scheduler = Scheduler::current().expect("register_event requires a scheduler");
        let state = self.core.state_for(fd);
        let mut inner = state.inner.lock();

        assert!(
            inner.registered & event.mask() == 0,
            "event {:?} already registered for fd {}",
            event,
            fd
        );
        let mask = EPOLLET | inner.registered | event.mask();
        let update = if inner.registered != 0 {
            self.core.poller.modify(fd, mask)
        } else {
            self.core.poller.add(fd, mask)
        };
        update.map_err(Error::Io)?;

        self.core.pending_event_count.fetch_add(1, Ordering::AcqRel);
        inner.registered |= event.mask();
        let context = inner.context_mut(event);
        debug_assert!(context.scheduler.is_none() && context.work.is_none());
        context.scheduler = Some(scheduler);
        context.work = Some(work.unwrap_or_else(|| Work::Fiber(Fiber::current())));
        Ok(())
    }

    /// Remove a registration without firing it. Returns false if nothing
    /// was registered for (fd, event).
    ///
    /// The displaced fiber/closure is released on a worker fiber rather
    /// than here: its drop may schedule further work, which must not
    /// happen inside the reactor loop.
    pub fn unregister_event(&self, fd: RawFd, event: IoEvent) -> Result<bool> {
        assert!(fd >= 0);
        let Some(state) = self.core.existing_state_for(fd) else {
            return Ok(false);
        };
        let mut inner = state.inner.lock();
        if inner.registered & event.mask() == 0 {
            return Ok(false);
        }

        let remaining = inner.registered & !event.mask();
        let update = if remaining != 0 {
            self.core.poller.modify(fd, EPOLLET | remaining)
        } else {
            self.core.poller.delete(fd)
        };
        update.map_err(Error::Io)?;

        self.core.pending_event_count.fetch_sub(1, Ordering::AcqRel);
        inner.registered = remaining;
        let context = inner.context_mut(event);
        let scheduler = context.scheduler.take();
        let displaced = context.work.take();
        if let Some(scheduler) = scheduler {
            // Serialize with any concurrent re-registration before
            // dropping the old continuation.
            let state = state.clone();
            scheduler.schedule_call(move || {
                drop(state.inner.lock());
                drop(displaced);
            });
        }
        Ok(true)
    }

    /// Fire a registration now, as if the kernel had reported readiness.
    /// The parked fiber/closure is scheduled on its original scheduler;
    /// the waiter observes the wakeup as a cancellation.
    pub fn cancel_event(&self, fd: RawFd, event: IoEvent) -> Result<bool> {
        assert!(fd >= 0);
        let Some(state) = self.core.existing_state_for(fd) else {
            return Ok(false);
        };
        let mut inner = state.inner.lock();
        if inner.registered & event.mask() == 0 {
            return Ok(false);
        }

        let remaining = inner.registered & !event.mask();
        let update = if remaining != 0 {
            self.core.poller.modify(fd, EPOLLET | remaining)
        } else {
            self.core.poller.delete(fd)
        };
        update.map_err(Error::Io)?;

        self.core.trigger_event(&mut inner, event);
        Ok(true)
    }

    /// See [`TimerManager::register_timer`].
    pub fn register_timer(
        &self,
        us: u64,
        callback: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> Arc<Timer> {
        self.core.timers.register_timer(us, callback, recurring)
    }

    /// See [`Scheduler::schedule`].
    pub fn schedule(&self, work: impl Into<Work>) {
        self.scheduler.schedule(work);
    }

    /// See [`Scheduler::schedule_call`].
    pub fn schedule_call(&self, f: impl FnOnce() + Send + 'static) {
        self.scheduler.schedule_call(f);
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
}

impl Drop for IoManager {
    fn drop(&mut self) {
        self.scheduler.stop();
        self.scheduler.uninstall_from_thread();
    }
}
