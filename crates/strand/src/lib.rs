//! strand: a cooperative M:N fiber runtime
//!
//! This crate provides:
//! - Stackful fibers with explicit switch points ([`Fiber`])
//! - A multi-thread cooperative scheduler with caller-thread hijacking
//!   ([`Scheduler`], [`WorkerPool`])
//! - Cancellable, refreshable, recurring timers on the monotonic clock
//!   ([`TimerManager`])
//! - An epoll-backed I/O manager translating fd readiness into fiber
//!   wakeups ([`IoManager`])
//! - Fiber-aware synchronization primitives ([`FiberMutex`],
//!   [`FiberSemaphore`], [`FiberCondition`], [`FiberEvent`])
//! - Fan-out helpers ([`parallel_do`], [`parallel_foreach`])
//! - A segmented zero-copy I/O buffer ([`Buffer`])
//!
//! [`IoManager`]: io::IoManager

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod buffer;
pub mod error;
pub mod fiber;
pub mod io;
pub mod parallel;
pub mod scheduler;
pub mod sleep;
pub mod sync;
pub mod timer;

pub use buffer::Buffer;
pub use error::{Error, Result};
pub use fiber::fls::FiberLocal;
pub use fiber::{Fiber, FiberState};
#[cfg(target_os = "linux")]
pub use io::{IoEvent, IoManager};
pub use io::{pipe_stream, CloseMode, PipeStream};
pub use parallel::{parallel_do, parallel_do_with, parallel_foreach};
pub use scheduler::{Scheduler, SchedulerOptions, SchedulerSwitcher, Work, WorkerPool};
pub use sleep::{sleep, sleep_us};
pub use sync::{FiberCondition, FiberEvent, FiberMutex, FiberSemaphore, Semaphore};
pub use timer::{Timer, TimerManager};
