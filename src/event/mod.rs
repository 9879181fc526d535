//! Per-waiter parking.
//!
//! Every queued waiter embeds one `WaitEvent` in its stack node. The contract
//! is edge-triggered rendezvous: a `wake` issued after the waiter has
//! published its node but before it reaches `wait` must not be lost, and
//! `wake` unblocks exactly one pending or about-to-pend `wait`.
//!
//! `wait` may return spuriously; callers re-check their node flags and
//! re-enter. A timed `wait` reports whether it gave up, and only the timeout
//! is treated as giving up.

#[cfg(all(
    any(target_os = "linux", target_os = "android"),
    not(feature = "fallback")
))]
#[path = "futex.rs"]
mod sys;

#[cfg(windows)]
#[path = "windows.rs"]
mod sys;

#[cfg(all(
    unix,
    any(
        not(any(target_os = "linux", target_os = "android")),
        feature = "fallback"
    )
))]
#[path = "posix.rs"]
mod sys;

pub(crate) use self::sys::WaitEvent;

#[cfg(test)]
mod test {
    use super::WaitEvent;
    use core::sync::atomic::{AtomicBool, Ordering};
    use core::time::Duration;
    use std::thread;

    #[test]
    fn timed_wait_expires() {
        let event = WaitEvent::new();
        assert!(event.wait(Some(Duration::from_millis(50))));
    }

    #[test]
    fn wake_is_not_lost() {
        // The event and the flag live in a leaked box so the waking thread
        // can reach them the same way a real waker reaches a queued node:
        // through a published raw pointer.
        struct Shared {
            event: WaitEvent,
            woken: AtomicBool,
        }
        let shared: &'static Shared = Box::leak(Box::new(Shared {
            event: WaitEvent::new(),
            woken: AtomicBool::new(false),
        }));
        let ptr = shared as *const Shared as usize;

        let waker = thread::spawn(move || {
            let shared = unsafe { &*(ptr as *const Shared) };
            shared.woken.store(true, Ordering::Release);
            shared.event.wake();
        });

        // Like the queue protocol, wait at least once: a committed waker
        // delivers exactly one wake for the wait to pair with.
        loop {
            shared.event.wait(None);
            if shared.woken.load(Ordering::Acquire) {
                break;
            }
        }
        waker.join().unwrap();
    }
}
