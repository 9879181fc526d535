//! Shared internals of the lock and the condition variable: the state word,
//! the intrusive stack-node wait queue and its lazily repaired forward links,
//! and the wake pass.
//!
//! State word layout (bit 0 = least significant):
//!
//! | bits | meaning |
//! |------|---------|
//! | 0 | `LOCKED` — some holder exists, exclusive or shared |
//! | 1 | `SPINNING` — a wait queue exists; waiters may still be spinning |
//! | 2 | `WAKING` — one thread owns the wake/list-optimization pass |
//! | 3 | `MULTI_SHARED` — >1 shared holders, or the count migrated into a node |
//! | 4.. | tail node pointer when `SPINNING`, else the shared-holder count |
//!
//! The queue is a doubly-linked LIFO whose tail is the word itself. Inserters
//! only set `back`; `next` links are repaired by whichever thread later walks
//! tail-to-head. The list is therefore always consistent backwards and
//! eventually consistent forwards.
//!
//! On a condition-variable word the same low bits are reinterpreted:
//! `MULTI_SHARED` is the notifier/head-mutator reservation and bits 0..2
//! count pending notifications, all three set meaning "wake everyone".

use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};

use static_assertions::const_assert;

use crate::atomic::AtomicBits;
use crate::event::WaitEvent;

pub(crate) const BIT_LOCKED: u32 = 0;
pub(crate) const BIT_SPINNING: u32 = 1;
pub(crate) const BIT_WAKING: u32 = 2;

pub(crate) const FLAG_LOCKED: usize = 1 << BIT_LOCKED;
pub(crate) const FLAG_SPINNING: usize = 1 << BIT_SPINNING;
pub(crate) const FLAG_WAKING: usize = 1 << BIT_WAKING;
pub(crate) const FLAG_MULTI_SHARED: usize = 1 << 3;
pub(crate) const FLAG_ALL: usize = FLAG_MULTI_SHARED | FLAG_WAKING | FLAG_SPINNING | FLAG_LOCKED;

/// One shared holder, counted in the word itself (only while no queue exists).
pub(crate) const SHARED_UNIT: usize = 1 << 4;

/// `shared_count` of a node chained behind an existing queue; the count lives
/// elsewhere and this node must never account for it.
pub(crate) const SHARED_COUNT_FOREIGN: u32 = u32::MAX;
/// `shared_count` of a first queued waiter that observed no active shared
/// holders. Never a real count: the release path must not decrement it.
pub(crate) const SHARED_COUNT_NONE: u32 = u32::MAX - 1;

/// Snapshot of a lock or condvar state word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct Status(pub(crate) usize);

impl Status {
    pub(crate) fn locked(self) -> bool {
        self.0 & FLAG_LOCKED != 0
    }

    pub(crate) fn spinning(self) -> bool {
        self.0 & FLAG_SPINNING != 0
    }

    pub(crate) fn waking(self) -> bool {
        self.0 & FLAG_WAKING != 0
    }

    pub(crate) fn multi_shared(self) -> bool {
        self.0 & FLAG_MULTI_SHARED != 0
    }

    /// Shared-holder count; meaningful only while `spinning` is clear.
    pub(crate) fn shared_count(self) -> usize {
        self.0 >> 4
    }

    /// Tail of the wait queue; meaningful only while `spinning` is set.
    pub(crate) fn wait_node(self) -> *mut WaitNode {
        (self.0 & !FLAG_ALL) as *mut WaitNode
    }

    pub(crate) fn without_multi_shared_locked(self) -> usize {
        self.0 & !(FLAG_MULTI_SHARED | FLAG_LOCKED)
    }

    /// Pending-notification credits of a condvar word.
    pub(crate) fn counter(self) -> usize {
        self.0 & (FLAG_WAKING | FLAG_SPINNING | FLAG_LOCKED)
    }

    /// A full counter is the distinguished "wake everyone" intent.
    pub(crate) fn is_counter_full(self) -> bool {
        self.counter() == (FLAG_WAKING | FLAG_SPINNING | FLAG_LOCKED)
    }

    pub(crate) fn with_full_counter(self) -> usize {
        self.0 | FLAG_WAKING | FLAG_SPINNING | FLAG_LOCKED
    }

    /// Keep the pointer part, take the flag part of `flags`.
    pub(crate) fn replace_flag_part(self, flags: usize) -> Status {
        Status((self.0 & !FLAG_ALL) | (flags & FLAG_ALL))
    }
}

/// One queued waiter, allocated in the waiting call's stack frame.
///
/// The node's address is published through the state word, after which other
/// threads read and write its fields. All cross-thread fields are atomics;
/// ownership returns to the waiter only through the `SPINNING`/`WAKING`
/// handshake, so the frame may not be left before `flags` shows `WAKING`.
#[repr(align(16))]
pub(crate) struct WaitNode {
    pub(crate) event: WaitEvent,
    /// Toward the head (older waiter). Correct from the moment of insertion.
    pub(crate) back: AtomicPtr<WaitNode>,
    /// Toward the tail (newer waiter). Repaired lazily by forward walkers.
    pub(crate) next: AtomicPtr<WaitNode>,
    /// Cached wake target; authoritative only on the queue tail.
    pub(crate) notify: AtomicPtr<WaitNode>,
    /// Shared holders this node accounts for, or a `SHARED_COUNT_*` sentinel.
    pub(crate) shared_count: AtomicU32,
    /// `FLAG_LOCKED` (wants exclusive), `FLAG_SPINNING`, `FLAG_WAKING`.
    pub(crate) flags: AtomicUsize,
    /// Condvar waiters: the lock word to re-queue onto after notification.
    pub(crate) last_lock: *const AtomicUsize,
}

// The low four bits of a published node pointer double as flags.
const_assert!(core::mem::align_of::<WaitNode>() > FLAG_ALL);

impl WaitNode {
    pub(crate) fn new(flags: usize) -> WaitNode {
        WaitNode::with_lock(flags, ptr::null())
    }

    pub(crate) fn with_lock(flags: usize, last_lock: *const AtomicUsize) -> WaitNode {
        WaitNode {
            event: WaitEvent::new(),
            back: AtomicPtr::new(ptr::null_mut()),
            next: AtomicPtr::new(ptr::null_mut()),
            notify: AtomicPtr::new(ptr::null_mut()),
            shared_count: AtomicU32::new(0),
            flags: AtomicUsize::new(flags),
            last_lock,
        }
    }

    /// Park until a waker hands ownership back by setting `WAKING`. Always
    /// waits at least once: a waker that has committed to this node delivers
    /// exactly one wake, and it must find a wait to pair with.
    pub(crate) fn park_until_waking(&self) {
        loop {
            self.event.wait(None);
            if self.flags.load(Ordering::Acquire) & FLAG_WAKING != 0 {
                return;
            }
        }
    }
}

/// Walk backward from `node` until a cached notify target turns up. Repairs
/// `next` links along the way. The walk relies on the queue invariant that
/// the head-most segment always carries a non-null `notify`.
pub(crate) unsafe fn find_notify_node(node: *mut WaitNode) -> *mut WaitNode {
    let mut notify = (*node).notify.load(Ordering::Acquire);
    if !notify.is_null() {
        return notify;
    }

    let mut curr = node;
    loop {
        let last = curr;
        curr = (*curr).back.load(Ordering::Acquire);
        (*curr).next.store(last, Ordering::Release);
        notify = (*curr).notify.load(Ordering::Acquire);
        if !notify.is_null() {
            return notify;
        }
    }
}

/// Like [`find_notify_node`], and caches the result on `node` (the tail).
pub(crate) unsafe fn update_notify_node(node: *mut WaitNode) -> *mut WaitNode {
    let notify = find_notify_node(node);
    (*node).notify.store(notify, Ordering::Release);
    notify
}

/// Drop `WAKING` from a still-locked word. On failure `last` is refreshed.
fn try_clear_waking(state: &AtomicUsize, last: &mut Status) -> bool {
    let new = Status(last.0 - FLAG_WAKING);
    debug_assert!(!new.waking());
    debug_assert!(new.locked());

    match state.compare_exchange(last.0, new.0, Ordering::AcqRel, Ordering::Relaxed) {
        Ok(_) => true,
        Err(curr) => {
            *last = Status(curr);
            false
        }
    }
}

/// The wake pass. Selects the notify set, transfers the word out of the
/// queue-draining state, and hands each selected node to its waiter.
///
/// The caller must own the `WAKING` bit of `state`. With `force` the pass
/// does not bail out while the word is locked, and leaves the word in the
/// single-shared-holder state instead of unlocked.
pub(crate) unsafe fn wake_up_lock(state: &AtomicUsize, mut last: Status, force: bool) {
    let mut notify;
    loop {
        debug_assert!(!last.multi_shared());

        if !force {
            // A locked word means a later release will redo the wake; try to
            // put the WAKING bit back down and leave.
            while last.locked() {
                debug_assert!(last.spinning());
                if try_clear_waking(state, &mut last) {
                    return;
                }
            }
        }

        let wait_node = last.wait_node();
        notify = update_notify_node(wait_node);

        if (*notify).flags.load(Ordering::Acquire) & FLAG_LOCKED != 0 {
            if force {
                state.fetch_and(!FLAG_WAKING, Ordering::AcqRel);
                return;
            }

            let next = (*notify).next.load(Ordering::Acquire);
            if !next.is_null() {
                // An exclusive waiter with a successor: promote the successor
                // to notify target and wake only this one.
                (*wait_node).notify.store(next, Ordering::Release);
                (*notify).next.store(ptr::null_mut(), Ordering::Release);

                debug_assert!(wait_node != notify);
                debug_assert!(Status(state.load(Ordering::Relaxed)).spinning());

                state.fetch_and(!FLAG_WAKING, Ordering::AcqRel);
                break;
            }
        }

        let new = if force { FLAG_LOCKED | SHARED_UNIT } else { 0 };
        match state.compare_exchange(last.0, new, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => break,
            Err(curr) => last = Status(curr),
        }
    }

    // Hand every selected node to its waiter, oldest first. The successor
    // link is read before the handshake: the moment WAKING is set and
    // SPINNING is dropped, the waiter may return and free its frame.
    loop {
        let next = (*notify).next.load(Ordering::Acquire);

        (*notify).flags.fetch_bit_set(BIT_WAKING);
        if !(*notify).flags.fetch_bit_clear(BIT_SPINNING) {
            // No longer in its pre-park spin; it is parked or about to be.
            (*notify).event.wake();
        }

        if next.is_null() {
            return;
        }
        notify = next;
    }
}

/// Repair the queue's forward links while the lock is held, then drop the
/// `WAKING` bit — or run the wake pass if the lock fell free mid-walk.
pub(crate) unsafe fn optimize_lock_list(state: &AtomicUsize, mut last: Status) {
    while last.locked() {
        update_notify_node(last.wait_node());
        if try_clear_waking(state, &mut last) {
            return;
        }
    }
    wake_up_lock(state, last, false);
}

/// Publish `node` as the new tail of the wait queue behind `last`. Returns
/// false if the word moved and the compare-exchange lost.
pub(crate) unsafe fn queue_stack_node(
    state: &AtomicUsize,
    node: *mut WaitNode,
    last: Status,
    exclusive: bool,
) -> bool {
    let mut optimize = false;
    (*node).next.store(ptr::null_mut(), Ordering::Relaxed);

    let new;
    if last.spinning() {
        // Chain onto the existing queue. WAKING is set eagerly so concurrent
        // releasers know a wake pass is already owed.
        (*node).shared_count.store(SHARED_COUNT_FOREIGN, Ordering::Relaxed);
        (*node).notify.store(ptr::null_mut(), Ordering::Relaxed);
        (*node).back.store(last.wait_node(), Ordering::Relaxed);
        new = node as usize
            | (last.0 & FLAG_MULTI_SHARED)
            | FLAG_WAKING
            | FLAG_SPINNING
            | FLAG_LOCKED;

        // Unless some other thread already owns the wake pass, this thread
        // must repair the forward links it just grew by one.
        if !last.waking() {
            optimize = true;
        }
    } else {
        // First waiter: it is its own notify target.
        (*node).notify.store(node, Ordering::Relaxed);
        let mut value = node as usize | FLAG_SPINNING | FLAG_LOCKED;

        if exclusive {
            // The shared-holder count moves out of the word and into this
            // node, where the shared release path can find it.
            let count = last.shared_count() as u32;
            if count > 1 {
                value |= FLAG_MULTI_SHARED;
                (*node).shared_count.store(count, Ordering::Relaxed);
            } else if count == 0 {
                (*node).shared_count.store(SHARED_COUNT_NONE, Ordering::Relaxed);
            } else {
                (*node).shared_count.store(count, Ordering::Relaxed);
            }
        } else {
            (*node).shared_count.store(SHARED_COUNT_NONE, Ordering::Relaxed);
        }
        new = value;
    }

    debug_assert!(Status(new).spinning());
    debug_assert!(Status(new).locked());
    debug_assert!(last.locked());

    match state.compare_exchange(last.0, new, Ordering::AcqRel, Ordering::Relaxed) {
        Ok(_) => {
            if optimize {
                optimize_lock_list(state, Status(new));
            }
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_bit_discipline() {
        let status = Status(FLAG_LOCKED | FLAG_SPINNING);
        assert!(status.locked());
        assert!(status.spinning());
        assert!(!status.waking());
        assert!(!status.multi_shared());

        let shared = Status(FLAG_LOCKED | 3 * SHARED_UNIT);
        assert_eq!(shared.shared_count(), 3);
        assert_eq!(shared.without_multi_shared_locked(), 3 * SHARED_UNIT);
    }

    #[test]
    fn pointer_bits_round_trip() {
        let node = WaitNode::new(FLAG_SPINNING);
        let ptr = &node as *const WaitNode as *mut WaitNode;
        assert_eq!(ptr as usize & FLAG_ALL, 0, "node is under-aligned");

        let status = Status(ptr as usize | FLAG_WAKING | FLAG_SPINNING | FLAG_LOCKED);
        assert_eq!(status.wait_node(), ptr);
        assert!(status.waking());
    }

    #[test]
    fn condvar_counter_encoding() {
        let node = WaitNode::new(0);
        let ptr = &node as *const WaitNode as usize;

        let mut status = Status(ptr | FLAG_MULTI_SHARED);
        assert_eq!(status.counter(), 0);
        status = Status(status.0 + 1);
        status = Status(status.0 + 1);
        assert_eq!(status.counter(), 2);
        assert!(!status.is_counter_full());

        let full = Status(status.with_full_counter());
        assert!(full.is_counter_full());
        assert_eq!(full.wait_node() as usize, ptr);
    }

    #[test]
    fn backward_walk_repairs_forward_links() {
        // Build head <- a <- b by hand, the way inserters leave it: only the
        // back links are in place.
        let head = WaitNode::new(FLAG_SPINNING | FLAG_LOCKED);
        let a = WaitNode::new(FLAG_SPINNING);
        let b = WaitNode::new(FLAG_SPINNING);
        let head_ptr = &head as *const WaitNode as *mut WaitNode;
        let a_ptr = &a as *const WaitNode as *mut WaitNode;
        let b_ptr = &b as *const WaitNode as *mut WaitNode;

        head.notify.store(head_ptr, Ordering::Relaxed);
        a.back.store(head_ptr, Ordering::Relaxed);
        b.back.store(a_ptr, Ordering::Relaxed);

        let notify = unsafe { update_notify_node(b_ptr) };
        assert_eq!(notify, head_ptr);
        assert_eq!(b.notify.load(Ordering::Relaxed), head_ptr);
        assert_eq!(head.next.load(Ordering::Relaxed), a_ptr);
        assert_eq!(a.next.load(Ordering::Relaxed), b_ptr);
    }
}
