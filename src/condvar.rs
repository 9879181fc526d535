//! Condition variable for the slim reader-writer lock.
//!
//! The condvar is a second state word carrying its own intrusive wait queue,
//! in the same tagged-pointer layout as the lock. `wait` atomically releases
//! the lock and enqueues; `notify_*` either wakes waiters directly or, when
//! the queue is mid-mutation, banks a small counter of pending notifications
//! for the thread that currently holds the queue to honor.
//!
//! The one behavioral detail worth knowing: a notified waiter whose lock is
//! still contended is re-queued straight onto the lock's wait queue instead
//! of being woken, sidestepping the classic wake-then-block-on-the-lock
//! round trip.

use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};
use core::time::Duration;

use crate::atomic::AtomicBits;
use crate::backoff::{self, Backoff};
use crate::internals::{
    find_notify_node, queue_stack_node, update_notify_node, Status, WaitNode, BIT_SPINNING,
    BIT_WAKING, FLAG_ALL, FLAG_LOCKED, FLAG_MULTI_SHARED, FLAG_SPINNING, FLAG_WAKING,
};
use crate::srwlock::{self, SrwLockReadGuard, SrwLockWriteGuard};

/// Condition variable usable with [`SrwLock`](crate::SrwLock) guards, in
/// either exclusive or shared mode.
pub struct Condvar {
    state: AtomicUsize,
}

impl Condvar {
    pub const fn new() -> Condvar {
        Condvar {
            state: AtomicUsize::new(0),
        }
    }

    /// Release the write guard, park until notified, re-acquire.
    pub fn wait<T: ?Sized>(&self, guard: &mut SrwLockWriteGuard<'_, T>) {
        unsafe { wait(&self.state, write_guard_state(guard), None, false) };
    }

    /// Release the read guard, park until notified, re-acquire.
    pub fn wait_shared<T: ?Sized>(&self, guard: &mut SrwLockReadGuard<'_, T>) {
        unsafe { wait(&self.state, read_guard_state(guard), None, true) };
    }

    /// Like [`wait`](Condvar::wait) with a timeout. Returns whether the wait
    /// timed out; the lock is re-acquired either way.
    pub fn wait_for<T: ?Sized>(
        &self,
        guard: &mut SrwLockWriteGuard<'_, T>,
        timeout: Duration,
    ) -> bool {
        unsafe { wait(&self.state, write_guard_state(guard), Some(timeout), false) }
    }

    /// Like [`wait_shared`](Condvar::wait_shared) with a timeout.
    pub fn wait_for_shared<T: ?Sized>(
        &self,
        guard: &mut SrwLockReadGuard<'_, T>,
        timeout: Duration,
    ) -> bool {
        unsafe { wait(&self.state, read_guard_state(guard), Some(timeout), true) }
    }

    /// Wait until `condition` returns false. The condition is re-checked
    /// under the lock after every wakeup, so it holds false on return.
    pub fn wait_while<T: ?Sized, F>(&self, guard: &mut SrwLockWriteGuard<'_, T>, mut condition: F)
    where
        F: FnMut(&mut T) -> bool,
    {
        while condition(&mut **guard) {
            self.wait(guard);
        }
    }

    /// Shared-mode [`wait_while`](Condvar::wait_while).
    pub fn wait_while_shared<T: ?Sized, F>(
        &self,
        guard: &mut SrwLockReadGuard<'_, T>,
        mut condition: F,
    ) where
        F: FnMut(&T) -> bool,
    {
        while condition(&**guard) {
            self.wait_shared(guard);
        }
    }

    /// Unblock one waiter. If the queue is currently owned by another
    /// notifier or optimizer, bank a credit for it to honor instead.
    pub fn notify_one(&self) {
        let mut last = Status(self.state.load(Ordering::Relaxed));

        while last.0 != 0 {
            if last.multi_shared() {
                if last.is_counter_full() {
                    // Wake-everyone is already pending; one more is moot.
                    return;
                }
                match self.state.compare_exchange(
                    last.0,
                    last.0 + 1,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return,
                    Err(curr) => last = Status(curr),
                }
            } else {
                let new = Status(last.0 | FLAG_MULTI_SHARED);
                match self.state.compare_exchange(
                    last.0,
                    new.0,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        unsafe { do_wake(&self.state, new, 1) };
                        return;
                    }
                    Err(curr) => last = Status(curr),
                }
            }
        }
    }

    /// Unblock all current waiters. Waits that begin during this call are
    /// not guaranteed to be woken.
    pub fn notify_all(&self) {
        let mut last = Status(self.state.load(Ordering::Relaxed));

        while last.0 != 0 && !last.is_counter_full() {
            if last.multi_shared() {
                // Someone owns the queue; leave them the wake-all intent.
                match self.state.compare_exchange(
                    last.0,
                    last.with_full_counter(),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return,
                    Err(curr) => last = Status(curr),
                }
            } else {
                match self
                    .state
                    .compare_exchange(last.0, 0, Ordering::AcqRel, Ordering::Relaxed)
                {
                    Ok(_) => {
                        unsafe { wake_all_from(last.wait_node()) };
                        return;
                    }
                    Err(curr) => last = Status(curr),
                }
            }
        }
    }
}

impl Default for Condvar {
    fn default() -> Condvar {
        Condvar::new()
    }
}

fn write_guard_state<'a, T: ?Sized>(guard: &'a SrwLockWriteGuard<'a, T>) -> &'a AtomicUsize {
    unsafe { SrwLockWriteGuard::rwlock(guard).raw().state_word() }
}

fn read_guard_state<'a, T: ?Sized>(guard: &'a SrwLockReadGuard<'a, T>) -> &'a AtomicUsize {
    unsafe { SrwLockReadGuard::rwlock(guard).raw().state_word() }
}

/// Walk the whole (detached) queue tail-to-head, handing every node over.
unsafe fn wake_all_from(tail: *mut WaitNode) {
    let mut node = tail;
    while !node.is_null() {
        let back = (*node).back.load(Ordering::Acquire);

        (*node).flags.fetch_bit_set(BIT_WAKING);
        if !(*node).flags.fetch_bit_clear(BIT_SPINNING) {
            (*node).event.wake();
        }

        node = back;
    }
}

/// Re-queue a notified waiter straight onto its lock's wait queue, if the
/// lock is held and the waiter would only block on it anyway. Returns false
/// when the waiter should be woken to take the lock itself.
unsafe fn queue_node_to_lock(node: *mut WaitNode, lock: &AtomicUsize) -> bool {
    let mut last = Status(lock.load(Ordering::Relaxed));
    let mut backoff = Backoff::new();

    while last.locked()
        && ((*node).flags.load(Ordering::Relaxed) & FLAG_LOCKED != 0
            || last.spinning()
            || last.wait_node().is_null())
    {
        if queue_stack_node(lock, node, last, true) {
            return true;
        }

        backoff.spin();
        last = Status(lock.load(Ordering::Relaxed));
    }

    false
}

/// Deliver `add_counter` plus any banked notifications. The caller must have
/// set `MULTI_SHARED` (the queue reservation) in `last`.
unsafe fn do_wake(state: &AtomicUsize, mut last: Status, add_counter: usize) {
    // Victims come off the head end of the queue and are chained through
    // their `back` fields, oldest first.
    let mut victims: *mut WaitNode = ptr::null_mut();
    let mut victims_tail: *mut WaitNode = ptr::null_mut();
    let mut counter = 0;

    loop {
        let wait_node = last.wait_node();

        if last.is_counter_full() {
            // Wake-all intent: take the entire queue in one exchange.
            let taken = Status(state.swap(0, Ordering::AcqRel));
            let chain = taken.wait_node();
            if victims.is_null() {
                victims = chain;
            } else {
                (*victims_tail).back.store(chain, Ordering::Release);
            }
            break;
        }

        let total = add_counter + last.counter();
        let mut notify = find_notify_node(wait_node);

        while total > counter {
            let next = (*notify).next.load(Ordering::Acquire);
            if next.is_null() {
                break;
            }

            counter += 1;
            // Unhook `notify` from the head and append it to the victims.
            if victims.is_null() {
                victims = notify;
            } else {
                (*victims_tail).back.store(notify, Ordering::Release);
            }
            (*notify).back.store(ptr::null_mut(), Ordering::Release);
            victims_tail = notify;

            (*wait_node).notify.store(next, Ordering::Release);
            notify = next;
            (*next).back.store(ptr::null_mut(), Ordering::Release);
        }

        if total <= counter {
            // Delivered everything asked for; release the reservation and
            // the counter in one move.
            match state.compare_exchange(
                last.0,
                wait_node as usize,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(curr) => last = Status(curr),
            }
        } else {
            // Queue exhausted with requests left over: take the final node
            // too and empty the word.
            match state.compare_exchange(last.0, 0, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => {
                    if victims.is_null() {
                        victims = notify;
                    } else {
                        (*victims_tail).back.store(notify, Ordering::Release);
                    }
                    (*notify).back.store(ptr::null_mut(), Ordering::Release);
                    break;
                }
                Err(curr) => last = Status(curr),
            }
        }
    }

    while !victims.is_null() {
        let back = (*victims).back.load(Ordering::Acquire);

        if !(*victims).flags.fetch_bit_clear(BIT_SPINNING) {
            // Already parked. Prefer moving the waiter onto its lock's queue
            // over waking it into immediate contention.
            let last_lock = (*victims).last_lock;
            if last_lock.is_null() || !queue_node_to_lock(victims, &*last_lock) {
                (*victims).flags.fetch_bit_set(BIT_WAKING);
                (*victims).event.wake();
            }
        }
        // A victim still in its pre-park spin sees its SPINNING bit vanish
        // and completes the handshake itself.

        victims = back;
    }
}

/// Repair forward links after this waiter's enqueue extended the queue, then
/// release the reservation — honoring any notifications banked meanwhile.
unsafe fn optimize_wait_list(state: &AtomicUsize, mut last: Status) {
    loop {
        let wait_node = last.wait_node();
        update_notify_node(wait_node);

        match state.compare_exchange(
            last.0,
            wait_node as usize,
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(_) => return,
            Err(curr) => {
                last = Status(curr);
                if last.counter() != 0 {
                    do_wake(state, last, 0);
                    return;
                }
            }
        }
    }
}

/// Try to excise `node` (a ghost: timed out or never properly woken) from the
/// queue. Returns true if this thread reclaimed the node — the caller may
/// treat the wait as timed out. Returns false if a notifier got there first;
/// the caller must park until the handoff completes.
unsafe fn wake_single(state: &AtomicUsize, node: *mut WaitNode) -> bool {
    let mut last = Status(state.load(Ordering::Relaxed));
    let mut new;

    // Reserve the queue, unless a wake-all is in flight (it will find us) or
    // another notifier owns it (convert our removal into wake-all intent so
    // nothing is lost, and wait to be woken).
    loop {
        if last.0 == 0 || last.is_counter_full() {
            return false;
        }

        if last.multi_shared() {
            match state.compare_exchange(
                last.0,
                last.with_full_counter(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return false,
                Err(curr) => last = Status(curr),
            }
        } else {
            new = Status(last.0 | FLAG_MULTI_SHARED);
            match state.compare_exchange(last.0, new.0, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => break,
                Err(curr) => last = Status(curr),
            }
        }
    }

    last = new;

    let mut curr = new.wait_node();
    let mut last_wait = curr;
    // Tail-side neighbor of `curr` in the repaired forward chain.
    let mut seen: *mut WaitNode = ptr::null_mut();
    let mut excised = false;

    if !curr.is_null() {
        while !curr.is_null() {
            let back = (*curr).back.load(Ordering::Acquire);

            if curr != node {
                (*curr).next.store(seen, Ordering::Release);
                seen = curr;
                curr = back;
                continue;
            }

            if !seen.is_null() {
                // Interior node: splice it out of both link directions.
                (*curr).flags.fetch_bit_set(BIT_WAKING);
                excised = true;

                (*seen).back.store(back, Ordering::Release);
                if !back.is_null() {
                    (*back).next.store(seen, Ordering::Release);
                }

                curr = back;
                continue;
            }

            // `node` is the tail: swing the word over to the rest of the
            // queue, keeping the reservation and counter bits.
            new = Status(back as usize);
            if new.0 != 0 {
                new = new.replace_flag_part(last.0);
            }
            match state.compare_exchange(last.0, new.0, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => {
                    (*curr).flags.fetch_bit_set(BIT_WAKING);
                    excised = true;

                    last = new;
                    if back.is_null() {
                        // Took the whole word with us; nothing left to do.
                        return true;
                    }
                }
                Err(curr_status) => {
                    last = Status(curr_status);
                    new = last;
                }
            }

            // Restart the walk from the (possibly new) tail.
            curr = last.wait_node();
            last_wait = curr;
            seen = ptr::null_mut();
        }

        if !last_wait.is_null() {
            (*last_wait).notify.store(seen, Ordering::Release);
        }
        if !excised {
            // Already harvested by a notifier. Re-arm SPINNING and race it
            // for the node: whoever flips the bit owns the outcome.
            (*node).flags.fetch_bit_set(BIT_SPINNING);
        }
    } else {
        (*node).flags.fetch_bit_set(BIT_SPINNING);
    }

    do_wake(state, new, 0);

    if !excised {
        // Clearing the bit first means the notifier saw us "spinning" and
        // stood down: the node is ours and the wait timed out. Losing means
        // a wake is on its way.
        excised = !(*node).flags.fetch_bit_clear(BIT_SPINNING);
    }

    excised
}

/// Atomically release the lock and enqueue on the condvar; park; re-acquire.
unsafe fn wait(
    cv: &AtomicUsize,
    lock: &AtomicUsize,
    timeout: Option<Duration>,
    shared: bool,
) -> bool {
    let node = WaitNode::with_lock(
        if shared {
            FLAG_SPINNING
        } else {
            FLAG_SPINNING | FLAG_LOCKED
        },
        lock,
    );
    let node_ptr = &node as *const WaitNode as *mut WaitNode;

    let mut last = Status(cv.load(Ordering::Relaxed));
    let mut new;
    loop {
        new = Status(node_ptr as usize | (last.0 & FLAG_ALL));
        let back = last.wait_node();
        node.back.store(back, Ordering::Relaxed);
        if !back.is_null() {
            node.notify.store(ptr::null_mut(), Ordering::Relaxed);
            new.0 |= FLAG_MULTI_SHARED;
        } else {
            node.notify.store(node_ptr, Ordering::Relaxed);
        }

        match cv.compare_exchange(last.0, new.0, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => break,
            Err(curr) => last = Status(curr),
        }
    }

    if shared {
        srwlock::unlock_shared(lock);
    } else {
        srwlock::unlock_exclusive(lock);
    }

    // Growing the queue onto an unreserved word makes this thread the
    // reservation holder; repair the links it owes and release it.
    if last.multi_shared() != new.multi_shared() {
        optimize_wait_list(cv, new);
    }

    backoff::spin_wait(&node);

    let mut timed_out = false;
    if node.flags.fetch_bit_clear(BIT_SPINNING) {
        timed_out = node.event.wait(timeout);
    } else {
        // A notifier beat us to the bit; complete the handshake for it.
        node.flags.fetch_bit_set(BIT_WAKING);
    }

    if timed_out || node.flags.load(Ordering::Acquire) & FLAG_WAKING == 0 {
        // Ghost waiter: timed out, or woken without a completed handoff.
        if !wake_single(cv, node_ptr) {
            node.park_until_waking();
            timed_out = false;
        }
    }

    if shared {
        srwlock::lock_shared(lock);
    } else {
        srwlock::lock_exclusive(lock);
    }

    timed_out
}
