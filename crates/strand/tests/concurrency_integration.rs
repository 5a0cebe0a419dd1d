//! Cross-component tests for fibers, the scheduler, and the fiber-aware
//! synchronization primitives.

use strand::{
    parallel_do, parallel_foreach, FiberCondition, FiberEvent, FiberMutex, Scheduler,
    SchedulerOptions, WorkerPool,
};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

fn hijack_pool() -> WorkerPool {
    WorkerPool::new(SchedulerOptions::default())
}

#[test]
fn test_mutex_grants_are_fifo() {
    let pool = hijack_pool();
    let mutex = Arc::new(FiberMutex::new());
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

    for i in 1..=3 {
        let mutex = mutex.clone();
        let order = order.clone();
        pool.schedule_call(move || {
            mutex.lock();
            // Let the other contenders reach the lock while we hold it.
            Scheduler::yield_now();
            order.lock().push(i);
            mutex.unlock();
        });
    }
    pool.dispatch();
    assert_eq!(*order.lock(), vec![1, 2, 3]);
    assert!(!mutex.is_locked());
}

#[test]
fn test_mutex_fifo_with_worker_threads() {
    // The grant order must hold regardless of how many threads race.
    let pool = WorkerPool::new(SchedulerOptions {
        threads: 3,
        use_caller: false,
        ..Default::default()
    });
    let mutex = Arc::new(FiberMutex::new());
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let gate = Arc::new(FiberEvent::new(false));
    let (tx, rx) = mpsc::channel();

    {
        // First fiber takes the lock and holds it until released.
        let mutex = mutex.clone();
        let order = order.clone();
        let gate = gate.clone();
        let tx = tx.clone();
        pool.schedule_call(move || {
            mutex.lock();
            tx.send(()).unwrap();
            gate.wait();
            order.lock().push(0);
            mutex.unlock();
        });
    }
    // Wait until the lock is held, then park the contenders one by one so
    // their arrival order is deterministic.
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let (done_tx, done_rx) = mpsc::channel();
    for i in 1..=3 {
        let mutex_for_fiber = mutex.clone();
        let order = order.clone();
        let done = done_tx.clone();
        pool.schedule_call(move || {
            mutex_for_fiber.lock();
            order.lock().push(i);
            mutex_for_fiber.unlock();
            done.send(i).unwrap();
        });
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while mutex.waiting_count() < i && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(mutex.waiting_count(), i);
    }
    gate.set();
    for _ in 1..=3 {
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }
    assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    pool.stop();
}

#[test]
fn test_unlock_if_not_unique() {
    let pool = hijack_pool();
    let mutex = Arc::new(FiberMutex::new());
    let released = Arc::new(AtomicUsize::new(0));

    {
        let mutex = mutex.clone();
        let released = released.clone();
        pool.schedule_call(move || {
            mutex.lock();
            // No contenders yet: the conditional unlock keeps the lock.
            assert!(!mutex.unlock_if_not_unique());
            Scheduler::yield_now();
            // The second fiber is parked now.
            assert_eq!(mutex.waiting_count(), 1);
            assert!(mutex.unlock_if_not_unique());
            released.fetch_add(1, Ordering::SeqCst);
        });
    }
    {
        let mutex = mutex.clone();
        let released = released.clone();
        pool.schedule_call(move || {
            mutex.lock();
            released.fetch_add(1, Ordering::SeqCst);
            mutex.unlock();
        });
    }
    pool.dispatch();
    assert_eq!(released.load(Ordering::SeqCst), 2);
}

#[test]
fn test_condition_signal_wakes_in_order() {
    let pool = hijack_pool();
    let mutex = Arc::new(FiberMutex::new());
    let condition = Arc::new(FiberCondition::new(mutex.clone()));
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

    for i in 1..=2 {
        let mutex = mutex.clone();
        let condition = condition.clone();
        let order = order.clone();
        pool.schedule_call(move || {
            mutex.lock();
            condition.wait();
            order.lock().push(i);
            mutex.unlock();
        });
    }
    {
        let condition = condition.clone();
        let order = order.clone();
        pool.schedule_call(move || {
            order.lock().push(0);
            condition.signal();
            condition.signal();
        });
    }
    pool.dispatch();
    assert_eq!(*order.lock(), vec![0, 1, 2]);
}

#[test]
fn test_condition_broadcast_wakes_everyone() {
    let pool = hijack_pool();
    let mutex = Arc::new(FiberMutex::new());
    let condition = Arc::new(FiberCondition::new(mutex.clone()));
    let woken = Arc::new(AtomicUsize::new(0));

    for _ in 0..4 {
        let mutex = mutex.clone();
        let condition = condition.clone();
        let woken = woken.clone();
        pool.schedule_call(move || {
            mutex.lock();
            condition.wait();
            woken.fetch_add(1, Ordering::SeqCst);
            mutex.unlock();
        });
    }
    {
        let condition = condition.clone();
        pool.schedule_call(move || condition.broadcast());
    }
    pool.dispatch();
    assert_eq!(woken.load(Ordering::SeqCst), 4);
}

#[test]
fn test_event_auto_reset_wakes_exactly_one() {
    let pool = hijack_pool();
    let event = Arc::new(FiberEvent::new(true));
    let woken = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        let event = event.clone();
        let woken = woken.clone();
        pool.schedule_call(move || {
            event.wait();
            woken.fetch_add(1, Ordering::SeqCst);
        });
    }
    {
        let event = event.clone();
        let woken = woken.clone();
        pool.schedule_call(move || {
            event.set();
            Scheduler::yield_now();
            // Exactly one waiter got through; release the other.
            assert_eq!(woken.load(Ordering::SeqCst), 1);
            event.set();
        });
    }
    pool.dispatch();
    assert_eq!(woken.load(Ordering::SeqCst), 2);
}

#[test]
fn test_event_manual_reset_stays_signalled() {
    let pool = hijack_pool();
    let event = Arc::new(FiberEvent::new(false));
    let woken = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let event = event.clone();
        let woken = woken.clone();
        pool.schedule_call(move || {
            event.wait();
            woken.fetch_add(1, Ordering::SeqCst);
        });
    }
    {
        let event = event.clone();
        pool.schedule_call(move || event.set());
    }
    pool.dispatch();
    assert_eq!(woken.load(Ordering::SeqCst), 3);
    // Still signalled: a late waiter passes straight through.
    assert!(event.is_set());
}

#[test]
fn test_parallel_do_across_threads() {
    let pool = WorkerPool::new(SchedulerOptions {
        threads: 3,
        use_caller: false,
        ..Default::default()
    });
    let (tx, rx) = mpsc::channel();
    pool.schedule_call(move || {
        let counter = Arc::new(AtomicUsize::new(0));
        let dgs: Vec<_> = (0..16)
            .map(|_| {
                let counter = counter.clone();
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Scheduler::yield_now();
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .collect();
        parallel_do(dgs, None);
        tx.send(counter.load(Ordering::SeqCst)).unwrap();
    });
    assert_eq!(rx.recv_timeout(Duration::from_secs(10)).unwrap(), 32);
    pool.stop();
}

#[test]
fn test_parallel_foreach_across_threads() {
    let pool = WorkerPool::new(SchedulerOptions {
        threads: 2,
        use_caller: false,
        ..Default::default()
    });
    let (tx, rx) = mpsc::channel();
    pool.schedule_call(move || {
        let sum = Arc::new(AtomicUsize::new(0));
        let s = sum.clone();
        parallel_foreach(
            1..=100usize,
            move |n| {
                s.fetch_add(n, Ordering::SeqCst);
            },
            Some(4),
        );
        tx.send(sum.load(Ordering::SeqCst)).unwrap();
    });
    assert_eq!(rx.recv_timeout(Duration::from_secs(10)).unwrap(), 5050);
    pool.stop();
}

#[test]
fn test_fiber_panic_takes_down_worker_not_queue() {
    // A panicking closure unwinds its worker; the remaining work must
    // still have been queued back and the pool must stop cleanly.
    let pool = hijack_pool();
    let ran = Arc::new(AtomicUsize::new(0));
    {
        let ran = ran.clone();
        pool.schedule_call(move || {
            ran.fetch_add(1, Ordering::SeqCst);
        });
    }
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        pool.schedule_call(|| panic!("scheduled failure"));
        pool.dispatch();
    }));
    assert!(result.is_err());
}
