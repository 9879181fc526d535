//! Recursive exclusive lock.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use lock_api::RawRwLock as _;

use crate::srwlock::RawSrwLock;

const NO_OWNER: usize = 0;

/// The address of a thread-local is unique among live threads and never
/// null, which is all the owner check needs.
fn current_thread_id() -> usize {
    thread_local! {
        static ID: u8 = 0;
    }
    ID.with(|id| id as *const u8 as usize)
}

/// Exclusive lock that its owning thread may re-acquire.
///
/// Each `lock`/`try_lock` by the owner must be balanced by one `unlock`; the
/// inner lock is released when the depth returns to zero.
pub struct SrwRecLock {
    lock: RawSrwLock,
    owner: AtomicUsize,
    depth: AtomicU32,
}

impl SrwRecLock {
    pub const fn new() -> SrwRecLock {
        SrwRecLock {
            lock: RawSrwLock::new(),
            owner: AtomicUsize::new(NO_OWNER),
            depth: AtomicU32::new(0),
        }
    }

    pub fn lock(&self) {
        let thread_id = current_thread_id();

        if self.owner.load(Ordering::Relaxed) != thread_id {
            self.lock.lock_exclusive();
        }

        if self.depth.fetch_add(1, Ordering::Relaxed) == 0 {
            self.owner.store(thread_id, Ordering::Relaxed);
        }
    }

    pub fn try_lock(&self) -> bool {
        let thread_id = current_thread_id();

        let acquired = if self.owner.load(Ordering::Relaxed) != thread_id {
            self.lock.try_lock_exclusive()
        } else {
            true
        };

        if acquired && self.depth.fetch_add(1, Ordering::Relaxed) == 0 {
            self.owner.store(thread_id, Ordering::Relaxed);
        }

        acquired
    }

    /// # Panics
    ///
    /// Panics if the calling thread does not hold the lock.
    pub fn unlock(&self) {
        assert!(
            self.owner.load(Ordering::Relaxed) == current_thread_id()
                && self.depth.load(Ordering::Relaxed) >= 1,
            "unlocking a recursive lock not held by this thread"
        );

        if self.depth.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.owner.store(NO_OWNER, Ordering::Relaxed);
            unsafe { self.lock.unlock_exclusive() };
        }
    }
}

impl Default for SrwRecLock {
    fn default() -> SrwRecLock {
        SrwRecLock::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reenters_and_balances() {
        let lock = SrwRecLock::new();
        lock.lock();
        assert!(lock.try_lock());
        lock.lock();
        lock.unlock();
        lock.unlock();
        lock.unlock();

        // Fully released: a fresh acquisition starts at depth one again.
        assert!(lock.try_lock());
        lock.unlock();
    }

    #[test]
    #[should_panic(expected = "not held by this thread")]
    fn unlock_unheld_panics() {
        let lock = SrwRecLock::new();
        lock.unlock();
    }

    #[test]
    fn thread_ids_differ() {
        let here = current_thread_id();
        let there = std::thread::spawn(current_thread_id).join().unwrap();
        assert_ne!(here, NO_OWNER);
        assert_ne!(here, there);
    }
}
