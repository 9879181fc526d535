//! Condition-variable scenarios: producer/consumer echo through two
//! condvars, timeouts, thundering herds and shared-mode waits.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use srwlock::{monotonic_ns, monotonic_us, Condvar, SrwLock};

struct PingPong {
    forward: SrwLock<VecDeque<u64>>,
    forward_cv: Condvar,
    echo: SrwLock<Vec<u64>>,
    echo_cv: Condvar,
    done: AtomicBool,
}

impl PingPong {
    fn new() -> PingPong {
        PingPong {
            forward: SrwLock::new(VecDeque::new()),
            forward_cv: Condvar::new(),
            echo: SrwLock::new(Vec::new()),
            echo_cv: Condvar::new(),
            done: AtomicBool::new(false),
        }
    }

    fn consume(&self) {
        loop {
            let mut queue = self.forward.write();
            let done = &self.done;
            self.forward_cv
                .wait_while(&mut queue, |q| q.is_empty() && !done.load(Ordering::Relaxed));

            let stamp = match queue.pop_front() {
                Some(stamp) => stamp,
                None => return,
            };
            drop(queue);

            self.echo.write().push(stamp);
            self.echo_cv.notify_one();
        }
    }

    fn finish(&self) {
        let queue = self.forward.write();
        self.done.store(true, Ordering::Relaxed);
        drop(queue);
        self.forward_cv.notify_all();
    }
}

/// Timestamps handed to consumers one notify at a time come back intact
/// through a second condvar.
#[test]
fn ping_pong_round_trip() {
    const CONSUMERS: usize = 4;
    const MESSAGES: usize = 64;

    let shared = Arc::new(PingPong::new());
    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|_| {
            let shared = Arc::clone(&shared);
            thread::spawn(move || shared.consume())
        })
        .collect();

    let mut sent = Vec::with_capacity(MESSAGES);
    for i in 0..MESSAGES {
        let stamp = monotonic_ns() ^ (i as u64) << 48;
        sent.push(stamp);
        shared.forward.write().push_back(stamp);
        shared.forward_cv.notify_one();
    }

    let mut echoed = shared.echo.write();
    shared.echo_cv.wait_while(&mut echoed, |e| e.len() < MESSAGES);
    let mut echoed = echoed.clone();
    echoed.sort_unstable();
    sent.sort_unstable();
    assert_eq!(echoed, sent);

    shared.finish();
    for consumer in consumers {
        consumer.join().unwrap();
    }
}

/// All timestamps published before one `notify_all` reach the herd with no
/// loss or duplication.
#[test]
fn notify_all_thundering_herd() {
    const CONSUMERS: usize = 4;

    let shared = Arc::new(PingPong::new());
    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|_| {
            let shared = Arc::clone(&shared);
            thread::spawn(move || shared.consume())
        })
        .collect();

    // Give the herd a moment to park.
    thread::sleep(Duration::from_millis(100));

    let mut sent = Vec::with_capacity(CONSUMERS);
    {
        let mut queue = shared.forward.write();
        for i in 0..CONSUMERS {
            let stamp = monotonic_ns() ^ (i as u64) << 48;
            sent.push(stamp);
            queue.push_back(stamp);
        }
    }
    shared.forward_cv.notify_all();

    let mut echoed = shared.echo.write();
    shared.echo_cv.wait_while(&mut echoed, |e| e.len() < CONSUMERS);
    let mut echoed = echoed.clone();
    echoed.sort_unstable();
    sent.sort_unstable();
    assert_eq!(echoed, sent);

    shared.finish();
    for consumer in consumers {
        consumer.join().unwrap();
    }
}

/// An unnotified timed wait reports the timeout, and not too early.
#[test]
fn wait_for_times_out() {
    let lock = SrwLock::new(());
    let condvar = Condvar::new();

    let mut guard = lock.write();
    let begin = monotonic_us();
    let timed_out = condvar.wait_for(&mut guard, Duration::from_micros(500_000));
    let elapsed = monotonic_us() - begin;

    assert!(timed_out);
    assert!(elapsed >= 400_000, "timed out after only {}us", elapsed);
}

/// A notified timed wait reports success and re-acquires the lock.
#[test]
fn wait_for_sees_notification() {
    let shared = Arc::new((SrwLock::new(false), Condvar::new()));

    let notifier = {
        let shared = Arc::clone(&shared);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            *shared.0.write() = true;
            shared.1.notify_one();
        })
    };

    let mut ready = shared.0.write();
    let mut timed_out = false;
    while !*ready && !timed_out {
        timed_out = shared.1.wait_for(&mut ready, Duration::from_secs(10));
    }
    assert!(!timed_out);
    assert!(*ready);
    drop(ready);

    notifier.join().unwrap();
}

/// The predicate wrapper absorbs stolen wakeups: it holds on return.
#[test]
fn wait_while_holds_predicate_on_return() {
    const WAITERS: usize = 3;

    let shared = Arc::new((SrwLock::new(0u32), Condvar::new()));
    let waiters: Vec<_> = (0..WAITERS)
        .map(|_| {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                let mut value = shared.0.write();
                shared.1.wait_while(&mut value, |v| *v == 0);
                assert_ne!(*value, 0);
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(50));
    *shared.0.write() = 7;
    shared.1.notify_all();

    for waiter in waiters {
        waiter.join().unwrap();
    }
}

/// Shared-mode waiters release the read lock while parked and re-acquire it
/// on wakeup.
#[test]
fn shared_waiters_wake_together() {
    const READERS: usize = 3;

    let shared = Arc::new((SrwLock::new(false), Condvar::new()));
    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                let mut ready = shared.0.read();
                shared.1.wait_while_shared(&mut ready, |ready| !*ready);
                assert!(*ready);
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(50));
    // The write lock is only available while every reader is parked.
    *shared.0.write() = true;
    shared.1.notify_all();

    for reader in readers {
        reader.join().unwrap();
    }
}

/// Notifying with nobody waiting must not bank a phantom wakeup.
#[test]
fn notify_without_waiters_is_inert() {
    let lock = SrwLock::new(());
    let condvar = Condvar::new();

    condvar.notify_one();
    condvar.notify_all();

    let mut guard = lock.write();
    assert!(condvar.wait_for(&mut guard, Duration::from_millis(100)));
}

/// A second back-to-back `notify_all` adds nothing to the wake set.
#[test]
fn notify_all_is_idempotent() {
    const WAITERS: usize = 4;

    let shared = Arc::new((SrwLock::new(false), Condvar::new()));
    let waiters: Vec<_> = (0..WAITERS)
        .map(|_| {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                let mut released = shared.0.write();
                shared.1.wait_while(&mut released, |r| !*r);
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(100));
    *shared.0.write() = true;
    shared.1.notify_all();
    shared.1.notify_all();

    for waiter in waiters {
        waiter.join().unwrap();
    }

    // Both calls drained the queue; a fresh wait sees nothing pending.
    let mut guard = shared.0.write();
    *guard = false;
    assert!(shared.1.wait_for(&mut guard, Duration::from_millis(100)));
}
