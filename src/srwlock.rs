//! The slim reader-writer lock.
//!
//! All state lives in one `AtomicUsize`. Uncontended paths are a single
//! compare-exchange; contended paths queue a stack node, spin briefly and
//! park. The raw operations work on the bare word so the condition variable
//! can drive a lock it only knows by address.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::atomic::AtomicBits;
use crate::backoff::{self, Backoff};
use crate::internals::{
    queue_stack_node, wake_up_lock, Status, WaitNode, BIT_LOCKED, BIT_SPINNING, FLAG_LOCKED,
    FLAG_SPINNING, FLAG_WAKING, SHARED_UNIT,
};

/// Acquire the `LOCKED` bit. Succeeds iff it was clear, even while a draining
/// queue is still linked: barging between a release and its wake pass is
/// allowed, and the pass re-arms itself when it finds the word locked.
pub(crate) fn try_lock_exclusive(state: &AtomicUsize) -> bool {
    !state.fetch_bit_set(BIT_LOCKED)
}

/// Queue up behind `last`, spin, then park until woken. Returns false if the
/// enqueue compare-exchange lost.
fn try_waiting(state: &AtomicUsize, node: &WaitNode, last: Status, exclusive: bool) -> bool {
    let flags = if exclusive {
        FLAG_SPINNING | FLAG_LOCKED
    } else {
        FLAG_SPINNING
    };
    node.flags.store(flags, Ordering::Relaxed);

    let node_ptr = node as *const WaitNode as *mut WaitNode;
    unsafe {
        if !queue_stack_node(state, node_ptr, last, exclusive) {
            return false;
        }
    }

    backoff::spin_wait(node);

    // Clearing our own SPINNING bit wins the race to park; losing it means a
    // waker already owns this node and is about to set WAKING.
    if node.flags.fetch_bit_clear(BIT_SPINNING) {
        node.park_until_waking();
    }
    true
}

pub(crate) fn lock_exclusive(state: &AtomicUsize) {
    if try_lock_exclusive(state) {
        return;
    }

    let mut backoff = Backoff::new();
    let node = WaitNode::new(0);
    let mut last = Status(state.load(Ordering::Relaxed));

    loop {
        if last.locked() {
            if try_waiting(state, &node, last, true) {
                last = Status(state.load(Ordering::Relaxed));
                continue;
            }
        } else if try_lock_exclusive(state) {
            return;
        }

        backoff.spin();
        last = Status(state.load(Ordering::Relaxed));
    }
}

pub(crate) fn unlock_exclusive(state: &AtomicUsize) {
    let mut last =
        match state.compare_exchange(FLAG_LOCKED, 0, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return,
            Err(curr) => Status(curr),
        };

    loop {
        debug_assert!(last.locked());
        let mut new = Status(last.0 & !FLAG_LOCKED);

        // The releaser that finds a queue nobody is waking claims the pass.
        let is_wake = last.spinning() && !last.waking();
        if is_wake {
            new.0 |= FLAG_WAKING;
        }

        match state.compare_exchange(last.0, new.0, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => {
                if is_wake {
                    unsafe { wake_up_lock(state, new, false) };
                }
                return;
            }
            Err(curr) => last = Status(curr),
        }
    }
}

/// One shared-acquire attempt against the observed `last`.
fn try_lock_shared_at(state: &AtomicUsize, last: Status) -> bool {
    let mut new = last.0 | FLAG_LOCKED;
    // Without a queue the count lives in the word; with one, a lone barger
    // is represented by the LOCKED bit alone.
    if !last.spinning() {
        new += SHARED_UNIT;
    }

    state
        .compare_exchange(last.0, new, Ordering::AcqRel, Ordering::Relaxed)
        .is_ok()
}

/// Shared acquisition is blocked by an exclusive holder and by any queue.
fn shared_blocked(last: Status) -> bool {
    last.locked() && (last.spinning() || last.shared_count() == 0)
}

pub(crate) fn try_lock_shared(state: &AtomicUsize) -> bool {
    let mut last = match state.compare_exchange(
        0,
        SHARED_UNIT | FLAG_LOCKED,
        Ordering::AcqRel,
        Ordering::Relaxed,
    ) {
        Ok(_) => return true,
        Err(curr) => Status(curr),
    };

    let mut backoff = Backoff::new();
    loop {
        if shared_blocked(last) {
            return false;
        }
        if try_lock_shared_at(state, last) {
            return true;
        }

        backoff.spin();
        last = Status(state.load(Ordering::Relaxed));
    }
}

pub(crate) fn lock_shared(state: &AtomicUsize) {
    let mut last = match state.compare_exchange(
        0,
        SHARED_UNIT | FLAG_LOCKED,
        Ordering::AcqRel,
        Ordering::Relaxed,
    ) {
        Ok(_) => return,
        Err(curr) => Status(curr),
    };

    let mut backoff = Backoff::new();
    let node = WaitNode::new(0);

    loop {
        if shared_blocked(last) {
            if try_waiting(state, &node, last, false) {
                last = Status(state.load(Ordering::Relaxed));
                continue;
            }
        } else if try_lock_shared_at(state, last) {
            return;
        }

        backoff.spin();
        last = Status(state.load(Ordering::Relaxed));
    }
}

pub(crate) fn unlock_shared(state: &AtomicUsize) {
    let mut last = match state.compare_exchange(
        SHARED_UNIT | FLAG_LOCKED,
        0,
        Ordering::AcqRel,
        Ordering::Relaxed,
    ) {
        Ok(_) => return,
        Err(curr) => Status(curr),
    };

    debug_assert!(last.locked());

    // No queue: the count is still in the word.
    while !last.spinning() {
        let new = if last.shared_count() > 1 {
            last.0 - SHARED_UNIT
        } else {
            0
        };
        match state.compare_exchange(last.0, new, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return,
            Err(curr) => last = Status(curr),
        }
    }

    if last.multi_shared() {
        // The count migrated into the notify node when the first exclusive
        // waiter queued up. Find it and take this holder off the books.
        unsafe {
            let mut curr = last.wait_node();
            let notify = loop {
                let notify = (*curr).notify.load(Ordering::Acquire);
                if !notify.is_null() {
                    break notify;
                }
                curr = (*curr).back.load(Ordering::Acquire);
            };

            let prior = (*notify).shared_count.fetch_sub(1, Ordering::AcqRel);
            debug_assert!(prior != 0);
            debug_assert!(
                prior < crate::internals::SHARED_COUNT_NONE,
                "shared release reached a sentinel count"
            );
            debug_assert!((*notify).flags.load(Ordering::Relaxed) & FLAG_LOCKED != 0);

            if prior > 1 {
                // Other shared holders remain; the last one out wakes.
                return;
            }
        }
    }

    loop {
        let mut new = Status(last.without_multi_shared_locked());

        let is_wake = last.spinning() && !last.waking();
        if is_wake {
            new.0 |= FLAG_WAKING;
        }

        match state.compare_exchange(last.0, new.0, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => {
                if is_wake {
                    unsafe { wake_up_lock(state, new, false) };
                }
                return;
            }
            Err(curr) => last = Status(curr),
        }
    }
}

/// Slim reader-writer lock over a single word of state.
///
/// Waiters chain on-stack nodes through the word instead of allocating, spin
/// briefly under contention and then park on the platform wait primitive.
/// Woken waiters generally proceed before new arrivals can starve them
/// indefinitely, but strict FIFO order is not guaranteed.
pub struct RawSrwLock {
    state: AtomicUsize,
}

impl RawSrwLock {
    pub const fn new() -> RawSrwLock {
        RawSrwLock {
            state: AtomicUsize::new(0),
        }
    }

    /// Pointer to the state word, for consumers that interoperate at the
    /// word level. The condition variable stores it in queued nodes to
    /// re-queue notified waiters directly onto the lock.
    pub fn native_handle(&self) -> *mut usize {
        &self.state as *const AtomicUsize as *mut usize
    }

    pub(crate) fn state_word(&self) -> &AtomicUsize {
        &self.state
    }
}

impl Default for RawSrwLock {
    fn default() -> RawSrwLock {
        RawSrwLock::new()
    }
}

// Safety: unsafe trait; the word-state protocol above provides the exclusion
// and synchronizes-with guarantees the trait contract asks for.
unsafe impl lock_api::RawRwLock for RawSrwLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = RawSrwLock {
        state: AtomicUsize::new(0),
    };

    type GuardMarker = lock_api::GuardSend;

    fn lock_exclusive(&self) {
        lock_exclusive(&self.state);
    }

    fn try_lock_exclusive(&self) -> bool {
        try_lock_exclusive(&self.state)
    }

    unsafe fn unlock_exclusive(&self) {
        unlock_exclusive(&self.state);
    }

    fn lock_shared(&self) {
        lock_shared(&self.state);
    }

    fn try_lock_shared(&self) -> bool {
        try_lock_shared(&self.state)
    }

    unsafe fn unlock_shared(&self) {
        unlock_shared(&self.state);
    }

    fn is_locked(&self) -> bool {
        Status(self.state.load(Ordering::Relaxed)).locked()
    }
}

/// A reader-writer lock guarding a `T`.
pub type SrwLock<T> = lock_api::RwLock<RawSrwLock, T>;

/// Shared-access RAII guard for [`SrwLock`].
pub type SrwLockReadGuard<'a, T> = lock_api::RwLockReadGuard<'a, RawSrwLock, T>;

/// Exclusive-access RAII guard for [`SrwLock`].
pub type SrwLockWriteGuard<'a, T> = lock_api::RwLockWriteGuard<'a, RawSrwLock, T>;

#[cfg(test)]
mod test {
    use super::*;
    use lock_api::RawRwLock as _;

    #[test]
    fn uncontended_exclusive() {
        let lock = RawSrwLock::new();
        assert!(lock.try_lock_exclusive());
        assert!(!lock.try_lock_exclusive());
        assert!(!lock.try_lock_shared());
        assert!(lock.is_locked());
        unsafe { lock.unlock_exclusive() };
        assert!(!lock.is_locked());
        assert!(lock.try_lock_exclusive());
        unsafe { lock.unlock_exclusive() };
    }

    #[test]
    fn shared_fast_path_encoding() {
        let lock = RawSrwLock::new();
        assert!(lock.try_lock_shared());
        assert_eq!(
            lock.state.load(Ordering::Relaxed),
            SHARED_UNIT | FLAG_LOCKED
        );
        assert!(lock.try_lock_shared());
        assert_eq!(Status(lock.state.load(Ordering::Relaxed)).shared_count(), 2);
        unsafe { lock.unlock_shared() };
        unsafe { lock.unlock_shared() };
        assert_eq!(lock.state.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn guarded_data() {
        let lock = SrwLock::new(5u32);
        {
            let read = lock.read();
            assert_eq!(*read, 5);
            let read2 = lock.read();
            assert_eq!(*read2, 5);
        }
        {
            let mut write = lock.write();
            *write += 1;
        }
        assert_eq!(*lock.read(), 6);
    }
}
