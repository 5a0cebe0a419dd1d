//! In-memory fiber pipe
//!
//! [`pipe_stream`] builds two connected endpoints backed by a pair of
//! bounded [`Buffer`]s. A full pipe parks the writing fiber and an empty
//! one parks the reader; the peer's progress (or its close/drop) wakes
//! them through their schedulers. Half-close follows unix semantics:
//! reading a write-closed empty pipe returns 0, writing to a read-closed
//! pipe is a broken pipe.

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::sync::{current_waiter, Waiter};
use crate::scheduler::Scheduler;

use parking_lot::Mutex;
use std::sync::Arc;

/// Which directions of an endpoint to shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Stop reading; the peer's writes fail with a broken pipe.
    Read,
    /// Stop writing; the peer reads EOF once drained.
    Write,
    /// Both directions.
    Both,
}

impl CloseMode {
    fn read(self) -> bool {
        matches!(self, CloseMode::Read | CloseMode::Both)
    }

    fn write(self) -> bool {
        matches!(self, CloseMode::Write | CloseMode::Both)
    }
}

type RemoteCloseFn = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Side {
    /// Data written by the peer, waiting to be read by this side.
    read_buffer: Buffer,
    closed_read: bool,
    closed_write: bool,
    cancelled_read: bool,
    cancelled_write: bool,
    /// Endpoint handle dropped.
    dropped: bool,
    /// Whether this side's buffer was fully drained when it dropped (the
    /// peer's flush wants to know).
    drained_at_drop: bool,
    /// This side's fiber, parked until data arrives in `read_buffer`.
    pending_reader: Option<Waiter>,
    /// The peer's fiber, parked until space frees up in `read_buffer`.
    pending_writer: Option<Waiter>,
    /// Invoked when the peer closes its write side or drops.
    on_remote_close: Option<RemoteCloseFn>,
}

fn wake(waiter: &mut Option<Waiter>) {
    if let Some((scheduler, fiber)) = waiter.take() {
        scheduler.schedule(fiber);
    }
}

struct PipeShared {
    sides: Mutex<[Side; 2]>,
    buffer_size: usize,
}

/// One endpoint of an in-memory pipe.
pub struct PipeStream {
    shared: Arc<PipeShared>,
    index: usize,
}

/// Create a connected pair of pipe endpoints, each able to buffer up to
/// `buffer_size` unread bytes written by its peer.
pub fn pipe_stream(buffer_size: usize) -> (PipeStream, PipeStream) {
    assert!(buffer_size > 0);
    let shared = Arc::new(PipeShared {
        sides: Mutex::new([Side::default(), Side::default()]),
        buffer_size,
    });
    (
        PipeStream {
            shared: shared.clone(),
            index: 0,
        },
        PipeStream { shared, index: 1 },
    )
}

impl PipeStream {
    fn peer(&self) -> usize {
        1 - self.index
    }

    /// Read up to `len` bytes into `out` (zero-copy), parking the current
    /// fiber while the pipe is empty. Returns 0 at EOF (peer write-closed
    /// and drained).
    pub fn read(&self, out: &mut Buffer, len: usize) -> Result<usize> {
        assert!(len != 0);
        loop {
            {
                let mut sides = self.shared.sides.lock();
                let me = &sides[self.index];
                if me.closed_read {
                    return Err(Error::BrokenPipe);
                }
                let peer_dropped = sides[self.peer()].dropped;
                let peer_write_closed = sides[self.peer()].closed_write;
                if peer_dropped && !peer_write_closed {
                    return Err(Error::BrokenPipe);
                }

                let available = sides[self.index].read_buffer.read_available();
                if available > 0 {
                    let todo = len.min(available);
                    let me = &mut sides[self.index];
                    out.copy_in(&me.read_buffer, Some(todo), 0);
                    me.read_buffer.consume(todo);
                    wake(&mut me.pending_writer);
                    log::trace!(target: "pipe", "read({}): {}", len, todo);
                    return Ok(todo);
                }

                if peer_write_closed {
                    log::trace!(target: "pipe", "read({}): eof", len);
                    return Ok(0);
                }
                if sides[self.index].cancelled_read {
                    return Err(Error::Cancelled);
                }

                // Park until the peer writes or closes.
                let me = &mut sides[self.index];
                debug_assert!(me.pending_reader.is_none());
                me.pending_reader = Some(current_waiter());
            }
            Scheduler::suspend();
        }
    }

    /// Read into a plain byte slice.
    pub fn read_bytes(&self, out: &mut [u8]) -> Result<usize> {
        let mut staging = Buffer::new();
        let n = self.read(&mut staging, out.len())?;
        staging.copy_out(&mut out[..n], 0);
        Ok(n)
    }

    /// Write up to `len` bytes from `data` (zero-copy), parking the
    /// current fiber while the peer's buffer is full.
    pub fn write(&self, data: &Buffer, len: usize) -> Result<usize> {
        assert!(len != 0);
        loop {
            {
                let mut sides = self.shared.sides.lock();
                if sides[self.index].closed_write {
                    return Err(Error::BrokenPipe);
                }
                if sides[self.peer()].dropped || sides[self.peer()].closed_read {
                    return Err(Error::BrokenPipe);
                }

                let buffered = sides[self.peer()].read_buffer.read_available();
                let todo = (self.shared.buffer_size - buffered).min(len);
                if todo != 0 {
                    let peer = &mut sides[self.peer()];
                    peer.read_buffer.copy_in(data, Some(todo), 0);
                    wake(&mut peer.pending_reader);
                    log::trace!(target: "pipe", "write({}): {}", len, todo);
                    return Ok(todo);
                }

                if sides[self.index].cancelled_write {
                    return Err(Error::Cancelled);
                }

                // Park until the peer reads or closes.
                let peer = &mut sides[self.peer()];
                debug_assert!(peer.pending_writer.is_none());
                peer.pending_writer = Some(current_waiter());
            }
            Scheduler::suspend();
        }
    }

    /// Write a plain byte slice.
    pub fn write_bytes(&self, data: &[u8]) -> Result<usize> {
        let mut staging = Buffer::new();
        staging.copy_in_bytes(data);
        self.write(&staging, data.len())
    }

    /// Park the current fiber until the peer has read everything this
    /// endpoint wrote.
    pub fn flush(&self) -> Result<()> {
        loop {
            {
                let mut sides = self.shared.sides.lock();
                if sides[self.index].cancelled_write {
                    return Err(Error::Cancelled);
                }
                if sides[self.peer()].dropped {
                    // Did they read everything before going away?
                    if sides[self.peer()].drained_at_drop {
                        return Ok(());
                    }
                    return Err(Error::BrokenPipe);
                }
                if sides[self.peer()].read_buffer.read_available() == 0 {
                    return Ok(());
                }
                if sides[self.peer()].closed_read {
                    return Err(Error::BrokenPipe);
                }

                let peer = &mut sides[self.peer()];
                debug_assert!(peer.pending_writer.is_none());
                peer.pending_writer = Some(current_waiter());
            }
            Scheduler::suspend();
        }
    }

    /// Shut down one or both directions of this endpoint.
    pub fn close(&self, mode: CloseMode) {
        let (remote_close, reader, writer);
        {
            let mut sides = self.shared.sides.lock();
            let close_write_first_time = !sides[self.index].closed_write && mode.write();
            sides[self.index].closed_read |= mode.read();
            sides[self.index].closed_write |= mode.write();
            remote_close = if close_write_first_time {
                sides[self.peer()].on_remote_close.clone()
            } else {
                None
            };
            // The peer's reader sees EOF now; the peer's writer sees a
            // broken pipe.
            reader = if sides[self.index].closed_write {
                sides[self.peer()].pending_reader.take()
            } else {
                None
            };
            writer = if sides[self.index].closed_read {
                sides[self.index].pending_writer.take()
            } else {
                None
            };
        }
        if let Some(callback) = remote_close {
            callback();
        }
        if let Some((scheduler, fiber)) = reader {
            scheduler.schedule(fiber);
        }
        if let Some((scheduler, fiber)) = writer {
            scheduler.schedule(fiber);
        }
    }

    /// Make the next (or current, once resumed) read fail with
    /// [`Error::Cancelled`].
    pub fn cancel_read(&self) {
        let waiter;
        {
            let mut sides = self.shared.sides.lock();
            sides[self.index].cancelled_read = true;
            waiter = sides[self.index].pending_reader.take();
        }
        if let Some((scheduler, fiber)) = waiter {
            log::trace!(target: "pipe", "cancelling read");
            scheduler.schedule(fiber);
        }
    }

    /// Make the next (or current, once resumed) write fail with
    /// [`Error::Cancelled`].
    pub fn cancel_write(&self) {
        let waiter;
        {
            let mut sides = self.shared.sides.lock();
            sides[self.index].cancelled_write = true;
            waiter = sides[self.peer()].pending_writer.take();
        }
        if let Some((scheduler, fiber)) = waiter {
            log::trace!(target: "pipe", "cancelling write");
            scheduler.schedule(fiber);
        }
    }

    /// Install the callback fired when the peer closes its write side or
    /// drops its endpoint.
    pub fn on_remote_close(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.shared.sides.lock()[self.index].on_remote_close = Some(Arc::new(callback));
    }
}

impl Drop for PipeStream {
    fn drop(&mut self) {
        let (remote_close, reader, writer);
        {
            let mut sides = self.shared.sides.lock();
            let me = &mut sides[self.index];
            me.dropped = true;
            me.drained_at_drop = me.read_buffer.read_available() == 0;
            remote_close = sides[self.peer()].on_remote_close.take();
            // Wake anyone parked on us; they observe the drop.
            reader = sides[self.peer()].pending_reader.take();
            writer = sides[self.index].pending_writer.take();
        }
        if let Some(callback) = remote_close {
            callback();
        }
        if let Some((scheduler, fiber)) = reader {
            scheduler.schedule(fiber);
        }
        if let Some((scheduler, fiber)) = writer {
            scheduler.schedule(fiber);
        }
    }
}
