//! I/O manager and in-memory pipes
//!
//! The readiness side (epoll) is Linux-only; the pipe pair is portable
//! but lives here with the rest of the stream plumbing.

#[cfg(target_os = "linux")]
mod manager;
mod pipe;
#[cfg(target_os = "linux")]
mod poller;

#[cfg(target_os = "linux")]
pub use manager::{IoEvent, IoManager};
pub use pipe::{pipe_stream, CloseMode, PipeStream};
