//! `SIGSEGV` handling: turn a jump through a corrupted table slot back into
//! a call of the pristine function.
//!
//! The register glue in [`segv_handler`] only extracts `rip`/`rdi` and writes
//! the result back. Deciding where to resume is [`Engine::resolve`], which
//! never touches signal state and is exercised directly by the tests.
//!
//! Nothing reachable from the handler allocates, locks or logs.

use crate::engine::Engine;
use crate::guard;
use crate::jni;
use core::ffi::{c_int, c_void};
use std::sync::atomic::{AtomicPtr, Ordering};

/// Register state the resolution needs. `arg0` is `rdi`, the handle a JNI
/// table member receives as its first argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultContext {
    pub pc: usize,
    pub arg0: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Resume at `target`. `cached` is set when the memo answered.
    Redirect { target: usize, cached: bool },
    /// Not ours; hand the signal to whoever had it before.
    Delegate,
}

/// The `SIGSEGV` disposition in effect before ours, in the calling
/// convention it expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviousHandler {
    /// `SA_SIGINFO` handler: `(signum, info, context)`.
    Info(usize),
    /// Plain handler: `(signum)`.
    Simple(usize),
    Default,
    Ignore,
}

type InfoHandlerFn = extern "C" fn(c_int, *mut libc::siginfo_t, *mut c_void);
type SimpleHandlerFn = extern "C" fn(c_int);

impl PreviousHandler {
    pub fn from_raw(action: &libc::sigaction) -> Self {
        let handler = action.sa_sigaction;
        if handler == libc::SIG_DFL || handler == segv_handler as usize {
            // Chaining to ourselves would loop forever.
            PreviousHandler::Default
        } else if handler == libc::SIG_IGN {
            PreviousHandler::Ignore
        } else if action.sa_flags & libc::SA_SIGINFO != 0 {
            PreviousHandler::Info(handler)
        } else {
            PreviousHandler::Simple(handler)
        }
    }

    /// Pass the signal on.
    ///
    /// `Default` and `Ignore` put `SIG_DFL` back and return, so the faulting
    /// instruction runs again and the kernel terminates the process with the
    /// original signal. The kernel does the same for a synchronous fault whose
    /// signal is ignored.
    ///
    /// # Safety
    /// Must be called from a `SIGSEGV` handler with the kernel-provided
    /// `info` and `context`.
    pub unsafe fn forward(&self, signum: c_int, info: *mut libc::siginfo_t, context: *mut c_void) {
        match *self {
            PreviousHandler::Info(handler) => {
                let handler: InfoHandlerFn = core::mem::transmute(handler);
                handler(signum, info, context);
            }
            PreviousHandler::Simple(handler) => {
                let handler: SimpleHandlerFn = core::mem::transmute(handler);
                handler(signum);
            }
            PreviousHandler::Default | PreviousHandler::Ignore => guard::restore_default(signum),
        }
    }
}

/// Index of the first of `len` slots at `table` holding `pc`.
///
/// # Safety
/// `table` must be readable for `len` words.
#[inline]
pub unsafe fn find_slot(table: *const usize, len: usize, pc: usize) -> Option<usize> {
    (0..len).find(|&i| core::ptr::read_volatile(table.add(i)) == pc)
}

impl Engine {
    /// Where execution should continue after a fault at `fault.pc`.
    ///
    /// # Safety
    /// Every handle in the registry must still be live, since the current
    /// table of the classified handle is read.
    pub unsafe fn resolve(&self, fault: &FaultContext) -> Disposition {
        if let Some(target) = self.cache().lookup(fault.pc) {
            return Disposition::Redirect { target, cached: true };
        }

        let Some(kind) = self.registry().classify(fault.arg0) else {
            return Disposition::Delegate;
        };
        // Handles are observed after their table is captured, but another
        // thread may still be mid-capture.
        let Some(pristine) = self.snapshots().get(kind) else {
            return Disposition::Delegate;
        };
        let live = jni::live_table(fault.arg0);
        if live.is_null() {
            return Disposition::Delegate;
        }
        let Some(index) = find_slot(live, kind.table_len(), fault.pc) else {
            return Disposition::Delegate;
        };

        let target = pristine[index];
        self.cache().insert(fault.pc, target);
        Disposition::Redirect { target, cached: false }
    }

    /// # Safety
    /// Same contract as [`PreviousHandler::forward`].
    pub unsafe fn on_fault(
        &self,
        signum: c_int,
        info: *mut libc::siginfo_t,
        context: *mut c_void,
    ) {
        if let Some(fault) = ucontext::read(context) {
            if let Disposition::Redirect { target, .. } = self.resolve(&fault) {
                ucontext::set_pc(context, target);
                return;
            }
        }
        delegate(self, signum, info, context);
    }
}

unsafe fn delegate(engine: &Engine, signum: c_int, info: *mut libc::siginfo_t, context: *mut c_void) {
    engine
        .previous_handler()
        .copied()
        .unwrap_or(PreviousHandler::Default)
        .forward(signum, info, context);
}

/// Engine the installed handler dispatches to.
static ACTIVE: AtomicPtr<Engine> = AtomicPtr::new(core::ptr::null_mut());

pub extern "C" fn segv_handler(signum: c_int, info: *mut libc::siginfo_t, context: *mut c_void) {
    let engine = ACTIVE.load(Ordering::Acquire);
    unsafe {
        match engine.as_ref() {
            Some(engine) => engine.on_fault(signum, info, context),
            None => guard::restore_default(signum),
        }
    }
}

/// Register [`segv_handler`] for `SIGSEGV` with `SA_SIGINFO` and every signal
/// blocked while it runs, remembering whatever was installed before.
#[cfg(all(target_arch = "x86_64", any(target_os = "linux", target_os = "android")))]
pub fn install_handler(engine: &'static Engine) -> anyhow::Result<()> {
    use anyhow::Context;

    unsafe {
        let mut current: libc::sigaction = core::mem::zeroed();
        if libc::sigaction(libc::SIGSEGV, core::ptr::null(), &mut current) != 0 {
            return Err(std::io::Error::last_os_error()).context("querying SIGSEGV disposition");
        }
        let previous = PreviousHandler::from_raw(&current);
        if engine.record_previous(previous) {
            log::debug!("previous SIGSEGV handler: {:?}", previous);
        }

        ACTIVE.store(engine as *const Engine as *mut Engine, Ordering::Release);

        let mut action: libc::sigaction = core::mem::zeroed();
        action.sa_sigaction = segv_handler as usize;
        action.sa_flags = libc::SA_SIGINFO;
        libc::sigfillset(&mut action.sa_mask);
        if guard::register_legitimately(libc::SIGSEGV, &action, core::ptr::null_mut()) != 0 {
            return Err(std::io::Error::last_os_error()).context("registering SIGSEGV handler");
        }
    }
    Ok(())
}

#[cfg(not(all(target_arch = "x86_64", any(target_os = "linux", target_os = "android"))))]
pub fn install_handler(_engine: &'static Engine) -> anyhow::Result<()> {
    anyhow::bail!("fault redirection needs the x86_64 SysV register layout")
}

#[cfg(all(target_arch = "x86_64", any(target_os = "linux", target_os = "android")))]
mod ucontext {
    use super::FaultContext;
    use core::ffi::c_void;

    // Offsets into mcontext_t::gregs, from <sys/ucontext.h>.
    const REG_RDI: usize = 8;
    const REG_RIP: usize = 16;

    pub(super) unsafe fn read(context: *mut c_void) -> Option<FaultContext> {
        let uc = (context as *const libc::ucontext_t).as_ref()?;
        Some(FaultContext {
            pc: uc.uc_mcontext.gregs[REG_RIP] as usize,
            arg0: uc.uc_mcontext.gregs[REG_RDI] as usize,
        })
    }

    pub(super) unsafe fn set_pc(context: *mut c_void, pc: usize) {
        let uc = &mut *(context as *mut libc::ucontext_t);
        uc.uc_mcontext.gregs[REG_RIP] = pc as i64;
    }
}

#[cfg(not(all(target_arch = "x86_64", any(target_os = "linux", target_os = "android"))))]
mod ucontext {
    use super::FaultContext;
    use core::ffi::c_void;

    pub(super) unsafe fn read(_context: *mut c_void) -> Option<FaultContext> {
        None
    }

    pub(super) unsafe fn set_pc(_context: *mut c_void, _pc: usize) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::jni::HandleKind;

    /// A handle plus the live table it points at.
    struct FakeHandle {
        table: Vec<usize>,
        handle: Box<[usize; 1]>,
    }

    impl FakeHandle {
        fn new(table: Vec<usize>) -> Self {
            let handle = Box::new([table.as_ptr() as usize]);
            Self { table, handle }
        }

        fn pristine(kind: HandleKind, seed: usize) -> Self {
            Self::new((0..kind.table_len()).map(|i| seed + i * 0x10).collect())
        }

        fn addr(&self) -> usize {
            self.handle.as_ptr() as usize
        }
    }

    fn engine_with(kind: HandleKind, handles: &[&FakeHandle]) -> Engine {
        let engine = Engine::new(&Config::default());
        for h in handles {
            unsafe { engine.observe_handle(kind, h.addr()) };
        }
        engine
    }

    #[test]
    fn every_corrupted_slot_resolves_to_its_snapshot() {
        for kind in HandleKind::ALL {
            let mut env = FakeHandle::pristine(kind, 0x7000_0000);
            let engine = engine_with(kind, &[&env]);
            let pristine = engine.snapshots().get(kind).unwrap().to_vec();

            for (slot, bad) in env.table.iter_mut().enumerate() {
                *bad = 0xdead_0000 + slot * 8;
            }
            for slot in 0..kind.table_len() {
                let fault = FaultContext {
                    pc: 0xdead_0000 + slot * 8,
                    arg0: env.addr(),
                };
                assert_eq!(
                    unsafe { engine.resolve(&fault) },
                    Disposition::Redirect {
                        target: pristine[slot],
                        cached: false
                    },
                    "{kind} slot {slot}"
                );
            }
        }
    }

    #[test]
    fn repeat_fault_is_answered_from_cache() {
        let mut env = FakeHandle::pristine(HandleKind::JniEnv, 0x1000);
        let engine = engine_with(HandleKind::JniEnv, &[&env]);
        env.table[17] = 0xbad0;
        let fault = FaultContext { pc: 0xbad0, arg0: env.addr() };

        let first = unsafe { engine.resolve(&fault) };
        assert_eq!(first, Disposition::Redirect { target: 0x1000 + 17 * 0x10, cached: false });

        // A rescan would now miss; only the cache can answer.
        env.table[17] = 0x1111;
        let second = unsafe { engine.resolve(&fault) };
        assert_eq!(second, Disposition::Redirect { target: 0x1000 + 17 * 0x10, cached: true });
        assert_eq!(engine.cache().len(), 1);
    }

    #[test]
    fn only_the_faulting_handle_is_consulted() {
        let mut a = FakeHandle::pristine(HandleKind::JniEnv, 0x1000);
        let mut b = FakeHandle::pristine(HandleKind::JniEnv, 0x1000);
        let engine = engine_with(HandleKind::JniEnv, &[&a, &b]);

        a.table[3] = 0x4242;
        // B holds the same bogus value at another slot.
        b.table[7] = 0x4242;

        let fault = FaultContext { pc: 0x4242, arg0: a.addr() };
        assert_eq!(
            unsafe { engine.resolve(&fault) },
            Disposition::Redirect { target: 0x1000 + 3 * 0x10, cached: false }
        );
    }

    #[test]
    fn unknown_handle_delegates_and_is_not_cached() {
        let mut env = FakeHandle::pristine(HandleKind::JniEnv, 0x1000);
        let engine = engine_with(HandleKind::JniEnv, &[&env]);
        env.table[5] = 0x5555;
        let stranger = FakeHandle::new(env.table.clone());

        let fault = FaultContext { pc: 0x5555, arg0: stranger.addr() };
        assert_eq!(unsafe { engine.resolve(&fault) }, Disposition::Delegate);
        assert_eq!(engine.cache().lookup(0x5555), None);
        assert!(engine.cache().is_empty());
    }

    #[test]
    fn unmatched_pc_delegates() {
        let env = FakeHandle::pristine(HandleKind::JavaVm, 0x1000);
        let engine = engine_with(HandleKind::JavaVm, &[&env]);
        let fault = FaultContext { pc: 0x9999_9999, arg0: env.addr() };
        assert_eq!(unsafe { engine.resolve(&fault) }, Disposition::Delegate);
    }

    #[test]
    fn handle_without_snapshot_delegates() {
        let env = FakeHandle::pristine(HandleKind::JniEnv, 0x1000);
        let engine = Engine::new(&Config::default());
        engine.registry().observe(HandleKind::JniEnv, env.addr());

        let fault = FaultContext { pc: env.table[4], arg0: env.addr() };
        assert_eq!(unsafe { engine.resolve(&fault) }, Disposition::Delegate);
    }

    #[test]
    fn null_live_table_delegates() {
        let env = FakeHandle::pristine(HandleKind::JniEnv, 0x1000);
        let engine = engine_with(HandleKind::JniEnv, &[&env]);
        let orphan = [0usize; 1];
        engine.registry().observe(HandleKind::JniEnv, orphan.as_ptr() as usize);

        let fault = FaultContext { pc: 0x1000, arg0: orphan.as_ptr() as usize };
        assert_eq!(unsafe { engine.resolve(&fault) }, Disposition::Delegate);
    }

    #[test]
    fn all_zero_snapshot_resolves_slot_zero_to_zero() {
        let mut env = FakeHandle::new(vec![0; HandleKind::JavaVm.table_len()]);
        let engine = engine_with(HandleKind::JavaVm, &[&env]);
        assert_eq!(engine.snapshots().slot(HandleKind::JavaVm, 0), Some(0));

        // Untouched zero table: a fault at pc 0 matches slot 0 first.
        let at_zero = FaultContext { pc: 0, arg0: env.addr() };
        assert_eq!(
            unsafe { engine.resolve(&at_zero) },
            Disposition::Redirect { target: 0, cached: false }
        );

        env.table[0] = 0xabc0;
        let corrupted = FaultContext { pc: 0xabc0, arg0: env.addr() };
        assert_eq!(
            unsafe { engine.resolve(&corrupted) },
            Disposition::Redirect { target: 0, cached: false }
        );
    }

    #[test]
    fn aliased_slots_resolve_to_the_first_match() {
        let mut env = FakeHandle::pristine(HandleKind::JniEnv, 0x1000);
        let engine = engine_with(HandleKind::JniEnv, &[&env]);
        env.table[9] = 0x7777;
        env.table[40] = 0x7777;

        let fault = FaultContext { pc: 0x7777, arg0: env.addr() };
        assert_eq!(
            unsafe { engine.resolve(&fault) },
            Disposition::Redirect { target: 0x1000 + 9 * 0x10, cached: false }
        );
    }

    #[test]
    fn find_slot_is_bounded() {
        let table = [1usize, 2, 3, 4];
        assert_eq!(unsafe { find_slot(table.as_ptr(), 4, 3) }, Some(2));
        assert_eq!(unsafe { find_slot(table.as_ptr(), 2, 3) }, None);
    }

    #[test]
    fn previous_handler_classification() {
        extern "C" fn info_handler(_: c_int, _: *mut libc::siginfo_t, _: *mut c_void) {}
        extern "C" fn simple_handler(_: c_int) {}

        let mut action: libc::sigaction = unsafe { core::mem::zeroed() };
        action.sa_sigaction = libc::SIG_DFL;
        assert_eq!(PreviousHandler::from_raw(&action), PreviousHandler::Default);

        action.sa_sigaction = libc::SIG_IGN;
        assert_eq!(PreviousHandler::from_raw(&action), PreviousHandler::Ignore);

        action.sa_sigaction = simple_handler as usize;
        assert_eq!(
            PreviousHandler::from_raw(&action),
            PreviousHandler::Simple(simple_handler as usize)
        );

        action.sa_sigaction = info_handler as usize;
        action.sa_flags = libc::SA_SIGINFO;
        assert_eq!(
            PreviousHandler::from_raw(&action),
            PreviousHandler::Info(info_handler as usize)
        );

        action.sa_sigaction = segv_handler as usize;
        assert_eq!(PreviousHandler::from_raw(&action), PreviousHandler::Default);
    }

    #[test]
    fn forward_calls_info_handler_with_all_arguments() {
        use std::sync::atomic::AtomicUsize;
        static SEEN: AtomicUsize = AtomicUsize::new(0);
        extern "C" fn info_handler(signum: c_int, info: *mut libc::siginfo_t, context: *mut c_void) {
            SEEN.store(signum as usize + info as usize + context as usize, Ordering::SeqCst);
        }

        let previous = PreviousHandler::Info(info_handler as usize);
        unsafe {
            previous.forward(
                libc::SIGSEGV,
                0x100 as *mut libc::siginfo_t,
                0x2000 as *mut c_void,
            )
        };
        assert_eq!(SEEN.load(Ordering::SeqCst), libc::SIGSEGV as usize + 0x2100);
    }

    #[cfg(all(target_arch = "x86_64", target_os = "linux"))]
    #[test]
    fn unclassified_fault_is_handed_to_the_previous_handler() {
        use std::sync::atomic::AtomicUsize;
        static INFO_CALLS: AtomicUsize = AtomicUsize::new(0);
        static SIMPLE_CALLS: AtomicUsize = AtomicUsize::new(0);
        extern "C" fn info_handler(_: c_int, _: *mut libc::siginfo_t, _: *mut c_void) {
            INFO_CALLS.fetch_add(1, Ordering::SeqCst);
        }
        extern "C" fn simple_handler(_: c_int) {
            SIMPLE_CALLS.fetch_add(1, Ordering::SeqCst);
        }

        let cases = [
            (PreviousHandler::Info(info_handler as usize), &INFO_CALLS),
            (PreviousHandler::Simple(simple_handler as usize), &SIMPLE_CALLS),
        ];
        for (previous, calls) in cases {
            let env = FakeHandle::pristine(HandleKind::JniEnv, 0x1000);
            let engine = engine_with(HandleKind::JniEnv, &[&env]);
            assert!(engine.record_previous(previous));
            let stranger = FakeHandle::new(env.table.clone());

            let mut uc: libc::ucontext_t = unsafe { core::mem::zeroed() };
            uc.uc_mcontext.gregs[16] = 0x5555;
            uc.uc_mcontext.gregs[8] = stranger.addr() as i64;
            let mut info: libc::siginfo_t = unsafe { core::mem::zeroed() };

            let before = calls.load(Ordering::SeqCst);
            unsafe {
                engine.on_fault(
                    libc::SIGSEGV,
                    &mut info,
                    &mut uc as *mut libc::ucontext_t as *mut c_void,
                )
            };

            assert_eq!(calls.load(Ordering::SeqCst), before + 1, "{previous:?}");
            assert_eq!(uc.uc_mcontext.gregs[16], 0x5555);
            assert!(engine.cache().is_empty());
        }
    }
}
