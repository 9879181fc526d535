//! Portable wait event backed by a pthread mutex and condition variable, for
//! unixes without a usable futex and for the `fallback` feature.
//!
//! The pthread objects are statically initialized in place and never move:
//! the owning node lives in the waiting call's stack frame for the whole wait.

use core::cell::UnsafeCell;
use core::time::Duration;

pub(crate) struct WaitEvent {
    mutex: UnsafeCell<libc::pthread_mutex_t>,
    condvar: UnsafeCell<libc::pthread_cond_t>,
    signaled: UnsafeCell<bool>,
}

impl WaitEvent {
    pub(crate) const fn new() -> WaitEvent {
        WaitEvent {
            mutex: UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER),
            condvar: UnsafeCell::new(libc::PTHREAD_COND_INITIALIZER),
            signaled: UnsafeCell::new(false),
        }
    }

    /// Block until `wake` or until `timeout` expires. Returns whether the
    /// wait timed out.
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> bool {
        unsafe {
            let r = libc::pthread_mutex_lock(self.mutex.get());
            debug_assert_eq!(r, 0);

            match timeout {
                None => {
                    while !*self.signaled.get() {
                        let r = libc::pthread_cond_wait(self.condvar.get(), self.mutex.get());
                        debug_assert_eq!(r, 0);
                    }
                }
                Some(timeout) => {
                    let deadline = realtime_deadline(timeout);
                    while !*self.signaled.get() {
                        let r = libc::pthread_cond_timedwait(
                            self.condvar.get(),
                            self.mutex.get(),
                            &deadline,
                        );
                        if r == libc::ETIMEDOUT {
                            break;
                        }
                        debug_assert_eq!(r, 0);
                    }
                }
            }

            let timed_out = !*self.signaled.get();
            *self.signaled.get() = false;

            let r = libc::pthread_mutex_unlock(self.mutex.get());
            debug_assert_eq!(r, 0);
            timed_out
        }
    }

    /// Unblock one pending or about-to-pend waiter on this event. The signal
    /// flag is written under the mutex, so a wake racing the waiter's park is
    /// observed on the waiter's next check instead of being lost.
    pub(crate) fn wake(&self) {
        unsafe {
            let r = libc::pthread_mutex_lock(self.mutex.get());
            debug_assert_eq!(r, 0);
            *self.signaled.get() = true;
            let r = libc::pthread_cond_signal(self.condvar.get());
            debug_assert_eq!(r, 0);
            let r = libc::pthread_mutex_unlock(self.mutex.get());
            debug_assert_eq!(r, 0);
        }
    }
}

// `pthread_cond_timedwait` takes an absolute CLOCK_REALTIME deadline.
fn realtime_deadline(timeout: Duration) -> libc::timespec {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let r = unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) };
    debug_assert_eq!(r, 0);

    let secs = timeout.as_secs().min(libc::time_t::max_value() as u64) as libc::time_t;
    now.tv_sec = now.tv_sec.saturating_add(secs);
    now.tv_nsec += timeout.subsec_nanos() as _;
    if now.tv_nsec >= 1_000_000_000 {
        now.tv_nsec -= 1_000_000_000;
        now.tv_sec = now.tv_sec.saturating_add(1);
    }
    now
}
