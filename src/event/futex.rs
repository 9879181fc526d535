//! Futex-backed wait event for Linux and Android.
//!
//! The event is a 32-bit signal word: 0 while unsignaled, 1 once `wake` has
//! fired. Waiters sleep with `FUTEX_WAIT_PRIVATE` while the word is 0 and
//! consume the signal on the way out, so a wake that lands between the
//! caller's enqueue and its sleep is found on the next check instead of being
//! lost.

use core::ptr;
use core::sync::atomic::{AtomicI32, Ordering};
use core::time::Duration;

use crate::clock;

pub(crate) struct WaitEvent {
    signal: AtomicI32,
}

impl WaitEvent {
    pub(crate) const fn new() -> WaitEvent {
        WaitEvent {
            signal: AtomicI32::new(0),
        }
    }

    /// Block until `wake` or until `timeout` expires. Returns whether the
    /// wait timed out. May return early without either; callers re-check
    /// their node flags and re-enter.
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| {
            clock::monotonic_ns().saturating_add(t.as_nanos().min(u64::MAX as u128) as u64)
        });

        loop {
            if self.consume() {
                return false;
            }
            let remaining = match deadline {
                None => None,
                Some(deadline) => {
                    let now = clock::monotonic_ns();
                    if now >= deadline {
                        return !self.consume();
                    }
                    Some(Duration::from_nanos(deadline - now))
                }
            };
            self.futex_wait(remaining);
        }
    }

    /// Unblock one pending or about-to-pend waiter on this event.
    pub(crate) fn wake(&self) {
        self.signal.store(1, Ordering::Release);
        self.futex_wake();
    }

    fn consume(&self) -> bool {
        self.signal.swap(0, Ordering::Acquire) != 0
    }

    fn futex_wait(&self, timeout: Option<Duration>) {
        let ts = convert_timeout(timeout);
        let ts_ptr = ts
            .as_ref()
            .map(|ts_ref| ts_ref as *const libc::timespec)
            .unwrap_or(ptr::null());
        let r = unsafe {
            libc::syscall(
                libc::SYS_futex,
                &self.signal as *const AtomicI32 as *mut i32,
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                0,
                ts_ptr,
                ptr::null_mut::<libc::c_void>(),
                0,
            )
        };
        debug_assert!(
            r == 0
                || matches!(
                    errno(),
                    libc::EAGAIN | libc::EINTR | libc::ETIMEDOUT
                ),
            "unexpected errno of futex_wait syscall: {}",
            errno()
        );
    }

    fn futex_wake(&self) {
        let r = unsafe {
            libc::syscall(
                libc::SYS_futex,
                &self.signal as *const AtomicI32 as *mut i32,
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                1,
                ptr::null::<libc::timespec>(),
                ptr::null_mut::<libc::c_void>(),
                0,
            )
        };
        debug_assert!(r >= 0, "unexpected return value of futex_wake syscall: {}", r);
    }
}

#[cfg(target_os = "linux")]
fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

#[cfg(target_os = "android")]
fn errno() -> i32 {
    unsafe { *libc::__errno() }
}

// x32 Linux uses a non-standard type for tv_nsec in timespec.
// See https://sourceware.org/bugzilla/show_bug.cgi?id=16437
#[cfg(all(target_arch = "x86_64", target_pointer_width = "32"))]
#[allow(non_camel_case_types)]
type tv_nsec_t = i64;
#[cfg(not(all(target_arch = "x86_64", target_pointer_width = "32")))]
#[allow(non_camel_case_types)]
type tv_nsec_t = libc::c_long;

fn convert_timeout(timeout: Option<Duration>) -> Option<libc::timespec> {
    match timeout {
        Some(duration) => {
            if duration.as_secs() > libc::time_t::max_value() as u64 {
                return None;
            }
            Some(libc::timespec {
                tv_sec: duration.as_secs() as libc::time_t,
                tv_nsec: duration.subsec_nanos() as tv_nsec_t,
            })
        }
        None => None,
    }
}
