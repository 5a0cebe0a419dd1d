//! Stackful fibers
//!
//! A [`Fiber`] is a user-space coroutine with its own stack. Control moves
//! between fibers only at explicit switch points: [`Fiber::call`],
//! [`Fiber::yield_to`], and [`Fiber::yield_now`]. Exactly one fiber per OS
//! thread is executing at any instant; the first time a thread asks
//! [`Fiber::current`] it is given a stackless anchor fiber that borrows the
//! thread's own stack, so every thread has somewhere to switch back to.
//!
//! A panic escaping a fiber's entry function is captured on the fiber
//! (state [`FiberState::Except`]) and re-raised in whichever fiber resumes
//! it next, mirroring how a panicking thread propagates through `join`.

mod context;
pub mod fls;

use context::{Context, Stack, DEFAULT_STACK_SIZE};

use std::any::Any;
use std::cell::RefCell;
use std::cell::UnsafeCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

/// Execution state of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Armed but never run (or recycled by [`Fiber::reset`]).
    Init,
    /// Suspended at a switch point, waiting to be resumed.
    Hodl,
    /// Currently running on some thread.
    Exec,
    /// Terminated by a panic escaping the entry function.
    Except,
    /// Terminated normally.
    Term,
}

impl FiberState {
    fn from_u8(v: u8) -> FiberState {
        match v {
            0 => FiberState::Init,
            1 => FiberState::Hodl,
            2 => FiberState::Exec,
            3 => FiberState::Except,
            _ => FiberState::Term,
        }
    }
}

/// A captured failure from a fiber entry function.
pub type PanicPayload = Box<dyn Any + Send + 'static>;

type EntryBox = Box<dyn FnOnce() + Send + 'static>;

/// The resume-owned interior of a fiber.
///
/// Only the thread that currently holds the right to run or resume the
/// fiber may touch this; see the safety note on [`Fiber`].
struct FiberInner {
    entry: Option<EntryBox>,
    stack: Option<Stack>,
    ctx: Context,
    /// The fiber that `call`ed us, parked below us on the native stack.
    outer: Option<Arc<Fiber>>,
    /// One-shot handshake slot: who just switched to us, and what state
    /// they should be moved into now that their context is safely saved.
    yielder: Option<Arc<Fiber>>,
    yielder_next_state: FiberState,
    /// Root of a `yield_to` chain to resume when this fiber terminates.
    terminate_outer: Weak<Fiber>,
    /// Captured panic to re-raise, either from the entry function or
    /// planted by [`Fiber::inject`].
    panic: Option<PanicPayload>,
    /// Fiber-local storage slots, indexed by [`fls`] keys.
    fls: Vec<fls::Slot>,
}

/// A stackful coroutine.
///
/// Handles are `Arc`-shared; the scheduler, wait lists, and the creator may
/// all hold one. The fiber's interior is only ever accessed by the single
/// thread that currently owns its execution, which is what makes the
/// `Send + Sync` below sound.
pub struct Fiber {
    state: AtomicU8,
    inner: UnsafeCell<FiberInner>,
}

// SAFETY: `inner` is only accessed by the thread that is running the fiber
// or holds the exclusive right to resume it (a fiber that is not Exec has
// exactly one resumer at a time). `state` is atomic.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

thread_local! {
    /// The fiber currently executing on this thread.
    static CURRENT: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    /// Keep-alive for the thread's anchor fiber.
    static THREAD_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
}

impl Fiber {
    /// Create a fiber with the default stack size. State is [`FiberState::Init`].
    pub fn new(f: impl FnOnce() + Send + 'static) -> Arc<Fiber> {
        Fiber::with_stack_size(DEFAULT_STACK_SIZE, f)
    }

    /// Create a fiber with an explicit stack size (in bytes of virtual
    /// address space; physical pages are committed lazily).
    pub fn with_stack_size(stack_size: usize, f: impl FnOnce() + Send + 'static) -> Arc<Fiber> {
        let stack = Stack::new(stack_size);
        let fiber = Arc::new(Fiber {
            state: AtomicU8::new(FiberState::Init as u8),
            inner: UnsafeCell::new(FiberInner {
                entry: Some(Box::new(f)),
                stack: Some(stack),
                ctx: Context::default(),
                outer: None,
                yielder: None,
                yielder_next_state: FiberState::Hodl,
                terminate_outer: Weak::new(),
                panic: None,
                fls: Vec::new(),
            }),
        });
        // SAFETY: sole owner; nothing else can observe the fiber yet.
        unsafe {
            let inner = &mut *fiber.inner.get();
            let top = inner.stack.as_ref().unwrap().top();
            inner.ctx.init(top, fiber_entry, Arc::as_ptr(&fiber) as usize);
        }
        fiber
    }

    /// The fiber currently executing on this thread.
    ///
    /// The first call on a thread installs a stackless anchor fiber that
    /// represents the thread itself (state [`FiberState::Exec`], no entry
    /// function). It is torn down when the thread exits.
    pub fn current() -> Arc<Fiber> {
        if let Some(f) = CURRENT.with(|c| c.borrow().clone()) {
            return f;
        }
        let anchor = Arc::new(Fiber {
            state: AtomicU8::new(FiberState::Exec as u8),
            inner: UnsafeCell::new(FiberInner {
                entry: None,
                stack: None,
                ctx: Context::default(),
                outer: None,
                yielder: None,
                yielder_next_state: FiberState::Hodl,
                terminate_outer: Weak::new(),
                panic: None,
                fls: Vec::new(),
            }),
        });
        THREAD_FIBER.with(|t| *t.borrow_mut() = Some(anchor.clone()));
        set_current(&anchor);
        anchor
    }

    /// Current state.
    pub fn state(&self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Recycle a terminated (or never-run) fiber with a new entry function,
    /// reusing its stack. State returns to [`FiberState::Init`].
    pub fn reset(self: &Arc<Self>, f: impl FnOnce() + Send + 'static) {
        let state = self.state();
        assert!(
            matches!(state, FiberState::Init | FiberState::Term | FiberState::Except),
            "reset on a fiber that is {:?}",
            state
        );
        // SAFETY: a fiber in Init/Term/Except has no live continuation and
        // we hold the resume right.
        unsafe {
            let inner = &mut *self.inner.get();
            let stack = inner.stack.as_ref().expect("thread anchor fibers cannot be reset");
            inner.panic = None;
            inner.entry = Some(Box::new(f));
            inner.terminate_outer = Weak::new();
            let top = stack.top();
            inner.ctx.init(top, fiber_entry, Arc::as_ptr(self) as usize);
        }
        self.set_state(FiberState::Init);
    }

    /// Run this fiber as a child of the current fiber.
    ///
    /// The caller stays parked on the native stack until this fiber yields
    /// or terminates. A panic captured from the fiber is re-raised here.
    ///
    /// Pre: state is Init or Hodl.
    pub fn call(self: &Arc<Self>) {
        let cur = Fiber::current();
        assert!(!Arc::ptr_eq(&cur, self), "a fiber cannot call itself");
        // SAFETY: we hold the resume right on `self` (checked by the state
        // assertion) and `cur` is our own execution. No borrow of either
        // interior is held across the switch.
        unsafe {
            {
                let inner = &mut *self.inner.get();
                debug_assert!(inner.outer.is_none());
                let state = self.state();
                assert!(
                    matches!(state, FiberState::Init | FiberState::Hodl),
                    "call on a fiber that is {:?}",
                    state
                );
                inner.outer = Some(cur.clone());
                let resuming_with_panic = inner.panic.is_some();
                self.set_state(if resuming_with_panic {
                    FiberState::Except
                } else {
                    FiberState::Exec
                });
            }
            set_current(self);
            switch(Arc::as_ptr(&cur), Arc::as_ptr(self));
            // The child yielded or terminated; we are current again.
            set_current(&cur);
            (*self.inner.get()).outer = None;
            let taken = {
                let cur_inner = &mut *cur.inner.get();
                cur_inner.yielder.take().map(|y| (y, cur_inner.yielder_next_state))
            };
            if let Some((yielder, next_state)) = taken {
                debug_assert!(Arc::ptr_eq(&yielder, self));
                yielder.set_state(next_state);
                if next_state == FiberState::Except {
                    if let Some(payload) = (*yielder.inner.get()).panic.take() {
                        panic::resume_unwind(payload);
                    }
                }
            }
            debug_assert_eq!(cur.state(), FiberState::Exec);
        }
    }

    /// Plant `payload` on this fiber and resume it; instead of returning
    /// from its suspension point, the fiber panics with `payload`.
    pub fn inject(self: &Arc<Self>, payload: PanicPayload) {
        // SAFETY: same resume right as `call`, which we invoke immediately.
        unsafe {
            (*self.inner.get()).panic = Some(payload);
        }
        self.call();
    }

    /// Replace the current fiber with this one on the same thread.
    ///
    /// Unlike [`Fiber::call`] the current fiber does not stay on the native
    /// stack: it moves to [`FiberState::Hodl`] and will only run again when
    /// something switches back to it. If `yield_to_caller_on_terminate` is
    /// set, the current fiber is recorded as the resume target for when
    /// this fiber (or the chain it heads) terminates.
    ///
    /// Returns the fiber that eventually yielded back here, which is not
    /// necessarily the one switched to.
    pub fn yield_to(self: &Arc<Self>, yield_to_caller_on_terminate: bool) -> Option<Arc<Fiber>> {
        self.yield_to_inner(yield_to_caller_on_terminate, FiberState::Hodl)
    }

    fn yield_to_inner(
        self: &Arc<Self>,
        yield_to_caller_on_terminate: bool,
        target_state: FiberState,
    ) -> Option<Arc<Fiber>> {
        let state = self.state();
        assert!(
            matches!(state, FiberState::Init | FiberState::Hodl),
            "yield_to on a fiber that is {:?}",
            state
        );
        let cur = Fiber::current();
        // SAFETY: resume right on `self`; `cur` is our own execution. The
        // raw pointer to `cur` stays valid while we are parked because the
        // resumer reaches us through a strong handle.
        unsafe {
            if yield_to_caller_on_terminate {
                let mut root = self.clone();
                loop {
                    let next = (*root.inner.get()).outer.clone();
                    match next {
                        Some(outer) => root = outer,
                        None => break,
                    }
                }
                (*root.inner.get()).terminate_outer = Arc::downgrade(&cur);
            }
            self.set_state(FiberState::Exec);
            {
                let inner = &mut *self.inner.get();
                inner.yielder = Some(cur.clone());
                inner.yielder_next_state = target_state;
            }
            set_current(self);
            let cur_ptr = Arc::as_ptr(&cur);
            // Relinquish our own reference before parking; whoever resumes
            // us holds one.
            drop(cur);
            switch(cur_ptr, Arc::as_ptr(self));
            // Resumed: the resumer already made us current again.
            debug_assert!(target_state != FiberState::Term, "terminated fiber resumed");
            let cur = &*cur_ptr;
            let taken = {
                let cur_inner = &mut *cur.inner.get();
                cur_inner.yielder.take().map(|y| (y, cur_inner.yielder_next_state))
            };
            if let Some((yielder, next_state)) = taken {
                yielder.set_state(next_state);
                if let Some(payload) = (*yielder.inner.get()).panic.take() {
                    panic::resume_unwind(payload);
                }
                return Some(yielder);
            }
            if cur.state() == FiberState::Except {
                if let Some(payload) = (*cur.inner.get()).panic.take() {
                    panic::resume_unwind(payload);
                }
            }
            debug_assert_eq!(cur.state(), FiberState::Exec);
            None
        }
    }

    /// Suspend the current fiber back to its caller.
    ///
    /// Pre: the current fiber was entered with [`Fiber::call`] (it has a
    /// caller parked beneath it).
    pub fn yield_now() {
        let cur = Fiber::current();
        assert_eq!(cur.state(), FiberState::Exec);
        // SAFETY: we are the current execution; `outer` is parked in its
        // own `call` frame and stays alive across the switch.
        unsafe {
            let outer = (*cur.inner.get())
                .outer
                .clone()
                .expect("yield_now on a fiber with no caller");
            {
                let outer_inner = &mut *outer.inner.get();
                outer_inner.yielder = Some(cur.clone());
                outer_inner.yielder_next_state = FiberState::Hodl;
            }
            let cur_ptr = Arc::as_ptr(&cur);
            let outer_ptr = Arc::as_ptr(&outer);
            drop(outer);
            drop(cur);
            switch(cur_ptr, outer_ptr);
            // Resumed via call() or yield_to().
            let cur = &*cur_ptr;
            let taken = {
                let cur_inner = &mut *cur.inner.get();
                cur_inner.yielder.take().map(|y| (y, cur_inner.yielder_next_state))
            };
            if let Some((yielder, next_state)) = taken {
                yielder.set_state(next_state);
            }
            if cur.state() == FiberState::Except {
                if let Some(payload) = (*cur.inner.get()).panic.take() {
                    panic::resume_unwind(payload);
                }
            }
            debug_assert_eq!(cur.state(), FiberState::Exec);
        }
    }

    /// Terminal transfer out of a finished fiber. Never returns.
    fn exit(cur: Arc<Fiber>, target_state: FiberState) -> ! {
        // SAFETY: we are the dying fiber's execution; the successor is
        // reached through strong handles held by its own parked frame. No
        // borrow of any interior is held across the final switch.
        unsafe {
            let cur_ptr = Arc::as_ptr(&cur);
            let (terminate_root, outer) = {
                let inner = &mut *cur.inner.get();
                let root = if inner.outer.is_none() {
                    inner.terminate_outer.upgrade()
                } else {
                    None
                };
                if root.is_some() {
                    inner.terminate_outer = Weak::new();
                }
                (root, inner.outer.clone())
            };
            if let Some(root) = terminate_root {
                // Head of a yield_to chain: hand control to the recorded
                // root with the full handshake.
                drop(cur);
                root.yield_to_inner(false, target_state);
                unreachable!("terminated fiber resumed");
            } else {
                // Plain call(): switch straight back to the caller, which
                // applies our terminal state from its yielder slot.
                let outer = outer.expect("terminated fiber has no resumer");
                {
                    let outer_inner = &mut *outer.inner.get();
                    outer_inner.yielder = Some(cur.clone());
                    outer_inner.yielder_next_state = target_state;
                }
                drop(cur);
                let outer_ptr = Arc::as_ptr(&outer);
                drop(outer);
                switch(cur_ptr, outer_ptr);
                unreachable!("terminated fiber resumed");
            }
        }
    }

    pub(crate) fn fls_slots(&self) -> *mut Vec<fls::Slot> {
        // SAFETY of use: slots are only touched through the currently
        // executing fiber (see fls module).
        unsafe { &mut (*self.inner.get()).fls }
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        let state = self.state();
        if self.inner.get_mut().stack.is_none() {
            // Thread anchor: dropped by thread-local teardown while the
            // thread is still conceptually running on it.
            debug_assert_eq!(state, FiberState::Exec);
        } else {
            assert!(
                matches!(state, FiberState::Init | FiberState::Term | FiberState::Except),
                "fiber dropped while {:?}",
                state
            );
        }
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("state", &self.state())
            .field("addr", &(self as *const Fiber))
            .finish()
    }
}

fn set_current(fiber: &Arc<Fiber>) {
    CURRENT.with(|c| *c.borrow_mut() = Some(fiber.clone()));
}

/// Raw context switch between two fibers.
///
/// # Safety
///
/// `from` must be the currently executing fiber on this thread and `to`
/// must be resumable (its context filled by `Context::init` or a prior
/// switch). Both must stay alive until control returns.
unsafe fn switch(from: *const Fiber, to: *const Fiber) {
    let from_ctx = std::ptr::addr_of_mut!((*(*from).inner.get()).ctx);
    let to_ctx = std::ptr::addr_of!((*(*to).inner.get()).ctx);
    context::context_switch(from_ctx, to_ctx);
}

/// First-entry point for every fiber, reached through the arch trampoline.
extern "C" fn fiber_entry(fiber: usize) -> ! {
    let cur = Fiber::current();
    debug_assert_eq!(Arc::as_ptr(&cur) as usize, fiber);
    // SAFETY: we are the fiber's execution.
    unsafe {
        let inner = &mut *cur.inner.get();
        if let Some(yielder) = inner.yielder.take() {
            yielder.set_state(inner.yielder_next_state);
        }
    }
    let mut next_state = FiberState::Term;
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        // SAFETY: as above.
        unsafe {
            if cur.state() == FiberState::Except {
                // Failure injected before first entry.
                if let Some(payload) = (*cur.inner.get()).panic.take() {
                    panic::resume_unwind(payload);
                }
            }
            debug_assert_eq!(cur.state(), FiberState::Exec);
            let entry = (*cur.inner.get()).entry.take().expect("fiber entry missing");
            entry();
        }
    }));
    if let Err(payload) = result {
        // SAFETY: as above.
        unsafe {
            (*cur.inner.get()).panic = Some(payload);
        }
        next_state = FiberState::Except;
    }
    Fiber::exit(cur, next_state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_current_is_anchor() {
        let f = Fiber::current();
        assert_eq!(f.state(), FiberState::Exec);
        assert!(Arc::ptr_eq(&f, &Fiber::current()));
    }

    #[test]
    fn test_call_runs_to_term() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let fiber = Fiber::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fiber.state(), FiberState::Init);
        fiber.call();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_call_yield_resume() {
        let steps = Arc::new(AtomicUsize::new(0));
        let s = steps.clone();
        let fiber = Fiber::new(move || {
            s.fetch_add(1, Ordering::SeqCst);
            Fiber::yield_now();
            s.fetch_add(1, Ordering::SeqCst);
        });
        fiber.call();
        assert_eq!(fiber.state(), FiberState::Hodl);
        assert_eq!(steps.load(Ordering::SeqCst), 1);
        fiber.call();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(steps.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_nested_call() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        let inner = Fiber::new(move || o2.lock().push("inner"));
        let inner2 = inner.clone();
        let outer = Fiber::new(move || {
            o1.lock().push("outer-pre");
            inner2.call();
            o1.lock().push("outer-post");
        });
        outer.call();
        assert_eq!(*order.lock(), vec!["outer-pre", "inner", "outer-post"]);
        assert_eq!(inner.state(), FiberState::Term);
        assert_eq!(outer.state(), FiberState::Term);
    }

    #[test]
    fn test_reset_reuses_fiber() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let fiber = Fiber::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        fiber.call();
        assert_eq!(fiber.state(), FiberState::Term);
        let h = hits.clone();
        fiber.reset(move || {
            h.fetch_add(10, Ordering::SeqCst);
        });
        assert_eq!(fiber.state(), FiberState::Init);
        fiber.call();
        assert_eq!(hits.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_panic_propagates_to_caller() {
        let fiber = Fiber::new(|| panic!("boom"));
        let result = panic::catch_unwind(AssertUnwindSafe(|| fiber.call()));
        let payload = result.expect_err("panic should propagate");
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"boom"));
        assert_eq!(fiber.state(), FiberState::Except);
    }

    #[test]
    fn test_panic_after_yield_propagates() {
        let fiber = Fiber::new(|| {
            Fiber::yield_now();
            panic!("later");
        });
        fiber.call();
        assert_eq!(fiber.state(), FiberState::Hodl);
        let result = panic::catch_unwind(AssertUnwindSafe(|| fiber.call()));
        assert!(result.is_err());
        assert_eq!(fiber.state(), FiberState::Except);
    }

    #[test]
    fn test_reset_after_except() {
        let fiber = Fiber::new(|| panic!("boom"));
        let _ = panic::catch_unwind(AssertUnwindSafe(|| fiber.call()));
        assert_eq!(fiber.state(), FiberState::Except);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        fiber.reset(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        fiber.call();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_inject_delivers_payload() {
        let observed = Arc::new(AtomicUsize::new(0));
        let o = observed.clone();
        let fiber = Fiber::new(move || {
            let caught = panic::catch_unwind(|| Fiber::yield_now());
            if caught.is_err() {
                o.fetch_add(1, Ordering::SeqCst);
            }
        });
        fiber.call();
        assert_eq!(fiber.state(), FiberState::Hodl);
        fiber.inject(Box::new("cancelled"));
        assert_eq!(observed.load(Ordering::SeqCst), 1);
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_yield_to_switches_between_fibers() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let o1 = order.clone();
        let fiber = Fiber::new(move || {
            o1.lock().push(1);
            Fiber::yield_now();
            o1.lock().push(3);
        });
        fiber.call();
        order.lock().push(2);
        fiber.call();
        order.lock().push(4);
        assert_eq!(*order.lock(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_yield_to_caller_on_terminate() {
        // The anchor yields to a fresh fiber; on its termination control
        // must come straight back here rather than to a caller chain.
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let fiber = Fiber::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        let yielder = fiber.yield_to(true);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(fiber.state(), FiberState::Term);
        assert!(yielder.is_some());
        assert!(Arc::ptr_eq(&yielder.unwrap(), &fiber));
    }
}
