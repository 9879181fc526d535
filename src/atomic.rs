//! Single-bit read-modify-write helpers on the atomic words the lock state
//! and the per-node flags live in. All of these are acquire-release; plain
//! loads elsewhere stay relaxed because every consumer re-validates through a
//! compare-exchange.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

pub(crate) trait AtomicBits {
    /// Atomically set `bit`, returning whether it was set before.
    fn fetch_bit_set(&self, bit: u32) -> bool;

    /// Atomically clear `bit`, returning whether it was set before.
    fn fetch_bit_clear(&self, bit: u32) -> bool;
}

macro_rules! atomic_bits {
    ($atomic:ty, $int:ty) => {
        impl AtomicBits for $atomic {
            fn fetch_bit_set(&self, bit: u32) -> bool {
                let mask = (1 as $int) << bit;
                self.fetch_or(mask, Ordering::AcqRel) & mask != 0
            }

            fn fetch_bit_clear(&self, bit: u32) -> bool {
                let mask = (1 as $int) << bit;
                self.fetch_and(!mask, Ordering::AcqRel) & mask != 0
            }
        }
    };
}

atomic_bits!(AtomicU32, u32);
atomic_bits!(AtomicUsize, usize);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn set_and_clear_report_prior_state() {
        let word = AtomicUsize::new(0);
        assert!(!word.fetch_bit_set(0));
        assert!(word.fetch_bit_set(0));
        assert!(!word.fetch_bit_set(3));
        assert_eq!(word.load(Ordering::Relaxed), 0b1001);

        assert!(word.fetch_bit_clear(0));
        assert!(!word.fetch_bit_clear(0));
        assert_eq!(word.load(Ordering::Relaxed), 0b1000);

        let flags = AtomicU32::new(0b110);
        assert!(flags.fetch_bit_clear(1));
        assert!(!flags.fetch_bit_clear(0));
        assert_eq!(flags.load(Ordering::Relaxed), 0b100);
    }
}
