//! Keeps our `SIGSEGV` handler installed.
//!
//! The target library brings a crash reporter that registers its own
//! `SIGSEGV` handler after ours, which would swallow every redirectable
//! fault. libc's `sigaction` is replaced with [`guarded_sigaction`], which
//! only lets a `SIGSEGV` registration through while [`register_legitimately`]
//! has granted permission.

use crate::bootstrap::await_original;
use core::ffi::c_int;
use log::warn;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub type SigactionFn =
    unsafe extern "C" fn(c_int, *const libc::sigaction, *mut libc::sigaction) -> c_int;

/// Set for the span of one of our own `sigaction(SIGSEGV, ..)` calls.
static ALLOW_REGISTRATION: AtomicBool = AtomicBool::new(false);

/// Refused `SIGSEGV` registrations, and how many of those were logged.
/// The refusal path may run inside another component's signal handler, so
/// it only counts; [`report_vetoes`] logs from ordinary context.
static VETOED: AtomicUsize = AtomicUsize::new(0);
static REPORTED: AtomicUsize = AtomicUsize::new(0);

/// Trampoline to the unpatched libc `sigaction`; 0 until the hook is in.
static ORIGINAL_SIGACTION: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn set_original(original: usize) {
    ORIGINAL_SIGACTION.store(original, Ordering::Release);
}

pub fn is_installed() -> bool {
    ORIGINAL_SIGACTION.load(Ordering::Acquire) != 0
}

pub fn permission_granted() -> bool {
    ALLOW_REGISTRATION.load(Ordering::Acquire)
}

unsafe fn call_original(
    signum: c_int,
    act: *const libc::sigaction,
    oldact: *mut libc::sigaction,
) -> c_int {
    let original: SigactionFn = core::mem::transmute(await_original(&ORIGINAL_SIGACTION));
    original(signum, act, oldact)
}

/// Replacement for libc `sigaction`.
///
/// # Safety
/// Same contract as `sigaction(2)`.
pub unsafe extern "C" fn guarded_sigaction(
    signum: c_int,
    act: *const libc::sigaction,
    oldact: *mut libc::sigaction,
) -> c_int {
    if signum != libc::SIGSEGV || act.is_null() {
        return call_original(signum, act, oldact);
    }
    if ALLOW_REGISTRATION.swap(false, Ordering::AcqRel) {
        return call_original(signum, act, oldact);
    }

    VETOED.fetch_add(1, Ordering::Relaxed);
    if !oldact.is_null() {
        // Report what is really installed, as if the call had been a query.
        call_original(signum, core::ptr::null(), oldact);
    }
    0
}

pub fn vetoed() -> usize {
    VETOED.load(Ordering::Relaxed)
}

/// Log refusals that happened since the last report. Returns how many were
/// new. Not async-signal-safe.
pub fn report_vetoes() -> usize {
    let total = VETOED.load(Ordering::Relaxed);
    let previous = REPORTED.swap(total, Ordering::Relaxed);
    let new = total.saturating_sub(previous);
    if new > 0 {
        warn!("something attempted to overwrite our handler ({} times since last report)", new);
    }
    new
}

/// Our own `sigaction` call, allowed past the guard.
///
/// Works whether or not the guard is installed; the permission never
/// outlives the call.
///
/// # Safety
/// Same contract as `sigaction(2)`. Async-signal-safe.
pub unsafe fn register_legitimately(
    signum: c_int,
    act: *const libc::sigaction,
    oldact: *mut libc::sigaction,
) -> c_int {
    ALLOW_REGISTRATION.store(true, Ordering::Release);
    let rc = libc::sigaction(signum, act, oldact);
    ALLOW_REGISTRATION.store(false, Ordering::Release);
    rc
}

/// Put `SIG_DFL` back for `signum`. Async-signal-safe.
pub fn restore_default(signum: c_int) {
    unsafe {
        let mut action: libc::sigaction = core::mem::zeroed();
        action.sa_sigaction = libc::SIG_DFL;
        register_legitimately(signum, &action, core::ptr::null_mut());
    }
}
