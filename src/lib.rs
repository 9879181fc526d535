//! Slim reader-writer lock and condition variable.
//!
//! Both primitives keep their entire state in a single machine word. The low
//! four bits are flags; the remaining bits hold either a shared-holder count
//! or a pointer to the tail of an intrusive wait queue threaded through
//! waiters' stack frames. Contended threads spin briefly with randomized
//! back-off, then park on the cheapest thing the platform offers: a private
//! futex on Linux, `WaitOnAddress` or NT keyed events on Windows, a pthread
//! mutex and condvar elsewhere.
//!
//! The condition variable interoperates with the lock at the word level: a
//! notified waiter whose lock is still held is moved onto the lock's own
//! wait queue instead of being woken into contention.
//!
//! ```
//! use srwlock::{Condvar, SrwLock};
//!
//! let lock = SrwLock::new(0u32);
//! let condvar = Condvar::new();
//!
//! let mut value = lock.write();
//! *value += 1;
//! condvar.notify_one();
//! drop(value);
//!
//! assert_eq!(*lock.read(), 1);
//! ```

pub use lock_api;

mod atomic;
mod backoff;
mod clock;
mod condvar;
mod event;
mod internals;
mod recursive;
mod srwlock;

pub use crate::clock::{monotonic_ms, monotonic_ns, monotonic_us};
pub use crate::condvar::Condvar;
pub use crate::recursive::SrwRecLock;
pub use crate::srwlock::{RawSrwLock, SrwLock, SrwLockReadGuard, SrwLockWriteGuard};
