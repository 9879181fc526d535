//! Monotonic clock with nanosecond resolution, used for timed waits and by
//! the test harness. The epoch is fixed but unspecified; only differences are
//! meaningful.

/// Nanoseconds since an unspecified, fixed epoch. Never decreases.
pub fn monotonic_ns() -> u64 {
    imp::monotonic_ns()
}

/// Microseconds since an unspecified, fixed epoch.
pub fn monotonic_us() -> u64 {
    monotonic_ns() / 1_000
}

/// Milliseconds since an unspecified, fixed epoch.
pub fn monotonic_ms() -> u64 {
    monotonic_us() / 1_000
}

#[cfg(windows)]
mod imp {
    use core::mem;
    use core::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Once;

    use winapi::um::profileapi::{QueryPerformanceCounter, QueryPerformanceFrequency};

    static FREQUENCY: AtomicU64 = AtomicU64::new(0);
    static INIT: Once = Once::new();

    pub(super) fn monotonic_ns() -> u64 {
        INIT.call_once(|| unsafe {
            let mut li = mem::zeroed();
            QueryPerformanceFrequency(&mut li);
            FREQUENCY.store(*li.QuadPart() as u64, Ordering::Relaxed);
        });
        let freq = FREQUENCY.load(Ordering::Relaxed);

        let mut li = unsafe { mem::zeroed() };
        unsafe { QueryPerformanceCounter(&mut li) };
        let ticks = unsafe { *li.QuadPart() } as u64;

        // Split the conversion so ticks * 1e9 cannot overflow 64 bits.
        (ticks / freq) * 1_000_000_000 + (ticks % freq) * 1_000_000_000 / freq
    }
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
mod imp {
    use core::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Once;

    static NUMER: AtomicU32 = AtomicU32::new(0);
    static DENOM: AtomicU32 = AtomicU32::new(0);
    static INIT: Once = Once::new();

    pub(super) fn monotonic_ns() -> u64 {
        INIT.call_once(|| unsafe {
            let mut info = libc::mach_timebase_info { numer: 0, denom: 0 };
            libc::mach_timebase_info(&mut info);
            NUMER.store(info.numer, Ordering::Relaxed);
            DENOM.store(info.denom, Ordering::Relaxed);
        });
        let now = unsafe { libc::mach_absolute_time() };
        now * NUMER.load(Ordering::Relaxed) as u64 / DENOM.load(Ordering::Relaxed) as u64
    }
}

#[cfg(all(unix, not(any(target_os = "macos", target_os = "ios"))))]
mod imp {
    pub(super) fn monotonic_ns() -> u64 {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        let r = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        debug_assert_eq!(r, 0);
        ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
    }
}
