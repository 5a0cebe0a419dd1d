//! In-memory pipe tests: blocking, half-close, cancellation.

use strand::{pipe_stream, CloseMode, Error, SchedulerOptions, WorkerPool};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

fn hijack_pool() -> WorkerPool {
    WorkerPool::new(SchedulerOptions::default())
}

#[test]
fn test_pipe_write_then_read() {
    let pool = hijack_pool();
    let (reader, writer) = pipe_stream(64);
    let results = Arc::new(parking_lot::Mutex::new(Vec::new()));

    {
        let results = results.clone();
        pool.schedule_call(move || {
            let mut buf = [0u8; 10];
            let n = reader.read_bytes(&mut buf).unwrap();
            results.lock().push((n, buf[0]));
            // Writer has closed by now: EOF.
            let n = reader.read_bytes(&mut buf).unwrap();
            results.lock().push((n, 0));
        });
    }
    pool.schedule_call(move || {
        assert_eq!(writer.write_bytes(b"a").unwrap(), 1);
        writer.close(CloseMode::Write);
    });
    pool.dispatch();
    assert_eq!(*results.lock(), vec![(1, b'a'), (0, 0)]);
}

#[test]
fn test_pipe_write_blocks_until_read() {
    let pool = hijack_pool();
    let (reader, writer) = pipe_stream(4);
    let progress = Arc::new(parking_lot::Mutex::new(Vec::new()));

    {
        let progress = progress.clone();
        pool.schedule_call(move || {
            // Fills the pipe exactly.
            assert_eq!(writer.write_bytes(b"wxyz").unwrap(), 4);
            progress.lock().push("first write");
            // Full: parks until the reader drains.
            assert_eq!(writer.write_bytes(b"ab").unwrap(), 2);
            progress.lock().push("second write");
        });
    }
    {
        let progress = progress.clone();
        pool.schedule_call(move || {
            let mut buf = [0u8; 4];
            assert_eq!(reader.read_bytes(&mut buf).unwrap(), 4);
            assert_eq!(&buf, b"wxyz");
            progress.lock().push("read");
            let mut buf = [0u8; 4];
            assert_eq!(reader.read_bytes(&mut buf).unwrap(), 2);
            assert_eq!(&buf[..2], b"ab");
        });
    }
    pool.dispatch();
    assert_eq!(*progress.lock(), vec!["first write", "read", "second write"]);
}

#[test]
fn test_pipe_broken_pipe_on_read_closed_peer() {
    let pool = hijack_pool();
    let (reader, writer) = pipe_stream(16);
    let observed = Arc::new(AtomicBool::new(false));

    reader.close(CloseMode::Read);
    {
        let observed = observed.clone();
        pool.schedule_call(move || {
            match writer.write_bytes(b"data") {
                Err(Error::BrokenPipe) => observed.store(true, Ordering::SeqCst),
                other => panic!("expected broken pipe, got {:?}", other),
            }
        });
    }
    pool.dispatch();
    assert!(observed.load(Ordering::SeqCst));
}

#[test]
fn test_pipe_dropped_peer_breaks_writes() {
    let pool = hijack_pool();
    let (reader, writer) = pipe_stream(16);
    drop(reader);
    let observed = Arc::new(AtomicBool::new(false));
    {
        let observed = observed.clone();
        pool.schedule_call(move || {
            assert!(matches!(writer.write_bytes(b"x"), Err(Error::BrokenPipe)));
            observed.store(true, Ordering::SeqCst);
        });
    }
    pool.dispatch();
    assert!(observed.load(Ordering::SeqCst));
}

#[test]
fn test_pipe_cancel_read() {
    let pool = hijack_pool();
    let (reader, writer) = pipe_stream(16);
    let reader = Arc::new(reader);
    let outcome = Arc::new(parking_lot::Mutex::new(None));

    {
        let reader = reader.clone();
        let outcome = outcome.clone();
        pool.schedule_call(move || {
            let mut buf = [0u8; 4];
            *outcome.lock() = Some(reader.read_bytes(&mut buf).map(|_| ()));
        });
    }
    {
        let reader = reader.clone();
        pool.schedule_call(move || reader.cancel_read());
    }
    pool.dispatch();
    assert!(matches!(*outcome.lock(), Some(Err(Error::Cancelled))));
    drop(writer);
}

#[test]
fn test_pipe_cancel_write() {
    let pool = hijack_pool();
    let (reader, writer) = pipe_stream(2);
    let writer = Arc::new(writer);
    let outcome = Arc::new(parking_lot::Mutex::new(None));

    {
        let writer = writer.clone();
        let outcome = outcome.clone();
        pool.schedule_call(move || {
            // Fill the pipe, then park on the next write.
            assert_eq!(writer.write_bytes(b"xx").unwrap(), 2);
            *outcome.lock() = Some(writer.write_bytes(b"yy").map(|_| ()));
        });
    }
    {
        let writer = writer.clone();
        pool.schedule_call(move || writer.cancel_write());
    }
    pool.dispatch();
    assert!(matches!(*outcome.lock(), Some(Err(Error::Cancelled))));
    drop(reader);
}

#[test]
fn test_on_remote_close_fires_on_peer_close() {
    let pool = hijack_pool();
    let (reader, writer) = pipe_stream(16);
    let notified = Arc::new(AtomicUsize::new(0));
    {
        let notified = notified.clone();
        reader.on_remote_close(move || {
            notified.fetch_add(1, Ordering::SeqCst);
        });
    }
    pool.schedule_call(move || {
        writer.close(CloseMode::Write);
    });
    pool.dispatch();
    assert_eq!(notified.load(Ordering::SeqCst), 1);
    drop(reader);
}

#[test]
fn test_on_remote_close_fires_on_peer_drop() {
    let pool = hijack_pool();
    let (reader, writer) = pipe_stream(16);
    let notified = Arc::new(AtomicUsize::new(0));
    {
        let notified = notified.clone();
        reader.on_remote_close(move || {
            notified.fetch_add(1, Ordering::SeqCst);
        });
    }
    drop(writer);
    assert_eq!(notified.load(Ordering::SeqCst), 1);
    pool.stop();
    drop(reader);
}

#[test]
fn test_pipe_flush_waits_for_drain() {
    let pool = hijack_pool();
    let (reader, writer) = pipe_stream(16);
    let progress = Arc::new(parking_lot::Mutex::new(Vec::new()));

    {
        let progress = progress.clone();
        pool.schedule_call(move || {
            writer.write_bytes(b"payload").unwrap();
            writer.flush().unwrap();
            progress.lock().push("flushed");
        });
    }
    {
        let progress = progress.clone();
        pool.schedule_call(move || {
            let mut buf = [0u8; 16];
            let n = reader.read_bytes(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"payload");
            progress.lock().push("read");
        });
    }
    pool.dispatch();
    assert_eq!(*progress.lock(), vec!["read", "flushed"]);
}
