//! Wait event for Windows.
//!
//! `WaitOnAddress` / `WakeByAddressSingle` give a futex-like interface, but
//! only since Windows 8; they also live in an api-set dll rather than where
//! MSDN claims. On older systems we fall back to the undocumented NT Keyed
//! Events API, using the event's address as the key. Keyed events are a
//! rendezvous: `NtReleaseKeyedEvent` blocks until a thread waits on the same
//! key, which is exactly the delivery guarantee the queue protocol needs —
//! every waiter that has been committed to by a waker parks (again) until the
//! handoff flag is set, so a release never waits forever.
//!
//! Both APIs are resolved dynamically once, on first use.
#![allow(non_snake_case)]

use core::cell::Cell;
use core::mem;
use core::ptr;
use core::sync::atomic::Ordering::{Acquire, Release};
use core::sync::atomic::{AtomicU32, AtomicUsize};
use core::time::Duration;

use winapi::shared::basetsd::SIZE_T;
use winapi::shared::minwindef::{BOOL, DWORD, ULONG};
use winapi::shared::ntdef::{FALSE, NTSTATUS};
use winapi::shared::ntstatus::{STATUS_SUCCESS, STATUS_TIMEOUT};
use winapi::um::libloaderapi::{GetModuleHandleA, GetProcAddress};
use winapi::um::winbase::INFINITE;
use winapi::um::winnt::{ACCESS_MASK, BOOLEAN, EVENT_ALL_ACCESS, HANDLE, LPCSTR, PHANDLE, PVOID};

use crate::clock;

pub(crate) struct WaitEvent {
    signal: AtomicU32,
}

impl WaitEvent {
    pub(crate) const fn new() -> WaitEvent {
        WaitEvent {
            signal: AtomicU32::new(0),
        }
    }

    /// Block until `wake` or until `timeout` expires. Returns whether the
    /// wait timed out.
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> bool {
        match BACKEND.get() {
            Backend::Wait(f) => self.wait_on_address(f, timeout),
            Backend::Keyed(f) => self.wait_keyed(f, timeout),
            Backend::None => unreachable!(),
        }
    }

    /// Unblock one pending or about-to-pend waiter on this event.
    pub(crate) fn wake(&self) {
        match BACKEND.get() {
            Backend::Wait(f) => {
                self.signal.store(1, Release);
                (f.WakeByAddressSingle)(&self.signal as *const AtomicU32 as PVOID);
            }
            Backend::Keyed(f) => {
                let key = self as *const WaitEvent as PVOID;
                (f.NtReleaseKeyedEvent)(f.handle, key, FALSE, ptr::null_mut());
            }
        }
    }

    fn consume(&self) -> bool {
        self.signal.swap(0, Acquire) != 0
    }

    fn wait_on_address(&self, f: WaitAddress, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| {
            clock::monotonic_ns().saturating_add(t.as_nanos().min(u64::MAX as u128) as u64)
        });
        loop {
            if self.consume() {
                return false;
            }
            let ms = match deadline {
                None => INFINITE,
                Some(deadline) => {
                    let now = clock::monotonic_ns();
                    if now >= deadline {
                        return !self.consume();
                    }
                    // Round up so a sub-millisecond remainder still sleeps.
                    let ms = (deadline - now + 999_999) / 1_000_000;
                    ms.min(u64::from(INFINITE - 1)) as DWORD
                }
            };
            let unsignaled: u32 = 0;
            (f.WaitOnAddress)(
                &self.signal as *const AtomicU32 as PVOID,
                &unsignaled as *const u32 as PVOID,
                mem::size_of::<u32>() as SIZE_T,
                ms,
            );
        }
    }

    fn wait_keyed(&self, f: KeyedEvent, timeout: Option<Duration>) -> bool {
        let key = self as *const WaitEvent as PVOID;
        let mut nt_timeout = convert_timeout_100ns(timeout);
        let timeout_ptr = nt_timeout
            .as_mut()
            .map(|t_ref| t_ref as PLARGE_INTEGER)
            .unwrap_or(ptr::null_mut());
        let r = (f.NtWaitForKeyedEvent)(f.handle, key, FALSE, timeout_ptr);
        debug_assert!(r == STATUS_SUCCESS || r == STATUS_TIMEOUT);
        r == STATUS_TIMEOUT && nt_timeout.is_some()
    }
}

// NT uses a timeout in units of 100ns, where positive values are absolute and
// negative values are relative.
fn convert_timeout_100ns(timeout: Option<Duration>) -> Option<LARGE_INTEGER> {
    match timeout {
        Some(duration) => {
            if duration.as_secs() > i64::max_value() as u64 {
                return None;
            }
            // Checked operations that return `None` on overflow.
            // Round nanosecond values up to 100 ns.
            (duration.as_secs() as i64)
                .checked_mul(-10_000_000)
                .and_then(|x| x.checked_sub((duration.subsec_nanos() as i64 + 99) / 100))
        }
        None => None,
    }
}

// Backend states
const READY: usize = 0;
const INITIALIZING: usize = 1;
const EMPTY: usize = 2;

struct BackendStatic {
    status: AtomicUsize,
    backend: Cell<Backend>,
}
static BACKEND: BackendStatic = BackendStatic::new();

impl BackendStatic {
    const fn new() -> Self {
        BackendStatic {
            status: AtomicUsize::new(EMPTY),
            backend: Cell::new(Backend::None),
        }
    }

    fn get(&self) -> Backend {
        if self.status.load(Acquire) == READY {
            return self.backend.get();
        }
        self.init()
    }

    #[inline(never)]
    fn init(&self) -> Backend {
        let mut status =
            match self
                .status
                .compare_exchange(EMPTY, INITIALIZING, Acquire, Acquire)
            {
                Ok(_) => EMPTY,
                Err(s) => s,
            };
        if status == EMPTY {
            let backend = if let Some(res) = probe_wait_address() {
                log::debug!("parking backend: WaitOnAddress");
                Backend::Wait(res)
            } else if let Some(res) = probe_keyed_event() {
                log::debug!("parking backend: NT keyed events");
                Backend::Keyed(res)
            } else {
                panic!(
                    "failed to load both NT Keyed Events (WinXP+) and \
                     WaitOnAddress/WakeByAddress (Win8+)"
                );
            };
            self.backend.set(backend);
            self.status.store(READY, Release);
            return backend;
        }
        while status != READY {
            // The one place where we can't do better than a spin loop is
            // while another thread is loading the parking functions.
            core::hint::spin_loop();
            status = self.status.load(Acquire);
        }
        self.backend.get()
    }
}

unsafe impl Sync for BackendStatic {}

#[derive(Clone, Copy)]
enum Backend {
    None,
    Wait(WaitAddress),
    Keyed(KeyedEvent),
}

// LARGE_INTEGER in WinAPI is a struct instead of an integer, and not
// ergonomic to use.
#[allow(non_camel_case_types)]
type LARGE_INTEGER = i64;
#[allow(non_camel_case_types)]
type PLARGE_INTEGER = *mut LARGE_INTEGER;

#[derive(Clone, Copy)]
struct WaitAddress {
    WaitOnAddress: extern "system" fn(
        Address: PVOID,
        CompareAddress: PVOID,
        AddressSize: SIZE_T,
        dwMilliseconds: DWORD,
    ) -> BOOL,
    WakeByAddressSingle: extern "system" fn(Address: PVOID),
}

#[derive(Clone, Copy)]
struct KeyedEvent {
    handle: HANDLE, // The global keyed event handle.
    NtReleaseKeyedEvent: extern "system" fn(
        EventHandle: HANDLE,
        Key: PVOID,
        Alertable: BOOLEAN,
        Timeout: PLARGE_INTEGER,
    ) -> NTSTATUS,
    NtWaitForKeyedEvent: extern "system" fn(
        EventHandle: HANDLE,
        Key: PVOID,
        Alertable: BOOLEAN,
        Timeout: PLARGE_INTEGER,
    ) -> NTSTATUS,
}

#[cfg(not(feature = "fallback"))]
fn probe_wait_address() -> Option<WaitAddress> {
    unsafe {
        // MSDN claims that WaitOnAddress and WakeByAddressSingle are located
        // in kernel32.dll, but they aren't...
        let synch_dll = GetModuleHandleA(b"api-ms-win-core-synch-l1-2-0.dll\0".as_ptr() as LPCSTR);
        if synch_dll.is_null() {
            return None;
        }

        let WaitOnAddress = GetProcAddress(synch_dll, b"WaitOnAddress\0".as_ptr() as LPCSTR);
        if WaitOnAddress.is_null() {
            return None;
        }
        let WakeByAddressSingle =
            GetProcAddress(synch_dll, b"WakeByAddressSingle\0".as_ptr() as LPCSTR);
        if WakeByAddressSingle.is_null() {
            return None;
        }

        Some(WaitAddress {
            WaitOnAddress: mem::transmute(WaitOnAddress),
            WakeByAddressSingle: mem::transmute(WakeByAddressSingle),
        })
    }
}

#[cfg(feature = "fallback")]
fn probe_wait_address() -> Option<WaitAddress> {
    None
}

fn probe_keyed_event() -> Option<KeyedEvent> {
    unsafe {
        let ntdll = GetModuleHandleA(b"ntdll.dll\0".as_ptr() as LPCSTR);
        if ntdll.is_null() {
            return None;
        }

        let NtCreateKeyedEvent = GetProcAddress(ntdll, b"NtCreateKeyedEvent\0".as_ptr() as LPCSTR);
        if NtCreateKeyedEvent.is_null() {
            return None;
        }
        let NtWaitForKeyedEvent =
            GetProcAddress(ntdll, b"NtWaitForKeyedEvent\0".as_ptr() as LPCSTR);
        if NtWaitForKeyedEvent.is_null() {
            return None;
        }
        let NtReleaseKeyedEvent =
            GetProcAddress(ntdll, b"NtReleaseKeyedEvent\0".as_ptr() as LPCSTR);
        if NtReleaseKeyedEvent.is_null() {
            return None;
        }

        let NtCreateKeyedEvent: extern "system" fn(
            KeyedEventHandle: PHANDLE,
            DesiredAccess: ACCESS_MASK,
            ObjectAttributes: PVOID,
            Flags: ULONG,
        ) -> NTSTATUS = mem::transmute(NtCreateKeyedEvent);
        let mut handle: HANDLE = ptr::null_mut();
        let status = NtCreateKeyedEvent(&mut handle, EVENT_ALL_ACCESS, ptr::null_mut(), 0);
        if status != STATUS_SUCCESS {
            return None;
        }

        Some(KeyedEvent {
            handle,
            NtReleaseKeyedEvent: mem::transmute(NtReleaseKeyedEvent),
            NtWaitForKeyedEvent: mem::transmute(NtWaitForKeyedEvent),
        })
    }
}
