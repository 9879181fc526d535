//! Contention back-off and the bounded pre-park spin.
//!
//! Both exist to keep contended threads off the state word's cache line:
//! losers of a compare-exchange pause for a randomized, exponentially growing
//! number of spins before re-reading, and freshly queued waiters spin a short
//! while before parking in case the holder releases immediately.
//!
//! The pause budget is expressed in cycles and divided by the measured cost
//! of one pause instruction. Skylake and later stretched `pause` from ~10 to
//! ~140 cycles, so a fixed iteration count would back off 14x too long there.

use core::sync::atomic::{AtomicU32, Ordering};
use std::sync::Once;

use crate::internals::{WaitNode, FLAG_SPINNING};

static CYCLES_PER_YIELD: AtomicU32 = AtomicU32::new(10);
static PROCESSOR_THREADS: AtomicU32 = AtomicU32::new(1);
static CALIBRATE: Once = Once::new();

const BACKOFF_INITIAL: u32 = 64;
const BACKOFF_GROWTH_CAP: u32 = 0x1FFF;
const SPIN_BUDGET_CYCLES: u32 = 10_500;

fn calibrate() {
    CALIBRATE.call_once(|| {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        let cycles = cycles_per_yield();
        PROCESSOR_THREADS.store(threads, Ordering::Relaxed);
        CYCLES_PER_YIELD.store(cycles, Ordering::Relaxed);
        log::debug!(
            "spin calibration: {} hardware threads, ~{} cycles per pause",
            threads,
            cycles
        );
    });
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
fn cycles_per_yield() -> u32 {
    #[cfg(target_arch = "x86")]
    use core::arch::x86::__cpuid;
    #[cfg(target_arch = "x86_64")]
    use core::arch::x86_64::__cpuid;

    // Leaf 0 EAX is the highest supported standard leaf; 0x16 marks the
    // Skylake generation that changed the cost of `pause`.
    let info = unsafe { __cpuid(0) };
    if info.eax == 0x16 {
        140
    } else {
        10
    }
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
fn cycles_per_yield() -> u32 {
    10
}

/// Randomized exponential back-off, one per contended call frame.
pub(crate) struct Backoff {
    count: u32,
}

impl Backoff {
    pub(crate) const fn new() -> Backoff {
        Backoff { count: 0 }
    }

    /// Pause for a randomized number of spins that doubles on every call.
    pub(crate) fn spin(&mut self) {
        if self.count == 0 {
            calibrate();
            // A single hardware thread can never observe another core
            // release the lock while it spins.
            if PROCESSOR_THREADS.load(Ordering::Relaxed) == 1 {
                return;
            }
            self.count = BACKOFF_INITIAL;
        } else if self.count < BACKOFF_GROWTH_CAP {
            self.count *= 2;
        }

        let spins = ((self.count - 1) & fastrand::u32(..)) + self.count;
        let iterations = spins * 10 / CYCLES_PER_YIELD.load(Ordering::Relaxed);
        for _ in 0..iterations {
            core::hint::spin_loop();
        }
    }
}

/// Spin until the wake budget runs out or a waker clears the node's
/// `SPINNING` bit, whichever comes first.
pub(crate) fn spin_wait(node: &WaitNode) {
    calibrate();
    if PROCESSOR_THREADS.load(Ordering::Relaxed) == 1 {
        return;
    }

    let mut remaining = SPIN_BUDGET_CYCLES / CYCLES_PER_YIELD.load(Ordering::Relaxed);
    while remaining != 0 && node.flags.load(Ordering::Relaxed) & FLAG_SPINNING != 0 {
        core::hint::spin_loop();
        remaining -= 1;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn backoff_grows_and_saturates() {
        let mut backoff = Backoff::new();
        backoff.spin();
        let first = backoff.count;
        assert!(first == 0 || first == BACKOFF_INITIAL);
        for _ in 0..32 {
            backoff.spin();
        }
        assert!(backoff.count <= BACKOFF_GROWTH_CAP * 2);
        let settled = backoff.count;
        backoff.spin();
        assert_eq!(backoff.count, settled);
    }

    #[test]
    fn calibration_is_sane() {
        calibrate();
        assert!(PROCESSOR_THREADS.load(Ordering::Relaxed) >= 1);
        let cycles = CYCLES_PER_YIELD.load(Ordering::Relaxed);
        assert!(cycles == 10 || cycles == 140);
    }
}
