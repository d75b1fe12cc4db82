//! Arming the engine when the target library is loaded.
//!
//! Arming hooks the translation layer's `ToGuestJavaVM`/`ToGuestJNIEnv`
//! (every handle the guest receives passes through them), guards libc
//! `sigaction`, and installs the fault handler. Each step is independent:
//! a failure is logged and the rest still run.

use crate::config::Config;
use crate::engine::Engine;
use crate::fault;
use crate::guard;
use crate::jni::HandleKind;
use anyhow::{Context, Result};
use core::ffi::c_void;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Once, OnceLock};

/// Symbol lookup and inline replacement, as needed by arming.
pub trait Interceptor: Send + Sync {
    /// Address of `symbol` in the loaded module named `module`.
    fn resolve(&self, module: &str, symbol: &str) -> Result<usize>;

    /// Redirect `target` to `replacement`; returns a callable original.
    fn intercept(&self, target: usize, replacement: usize) -> Result<usize>;
}

/// [`Interceptor`] backed by `ndkfix-intercept`.
pub struct InlineInterceptor;

impl Interceptor for InlineInterceptor {
    fn resolve(&self, module: &str, symbol: &str) -> Result<usize> {
        match ndkfix_intercept::module::find_export_by_name(module, symbol) {
            Ok(address) => Ok(address),
            Err(scoped) => {
                debug!("{} not found in {} ({}), trying global scope", symbol, module, scoped);
                ndkfix_intercept::module::find_global_export_by_name(symbol)
                    .with_context(|| format!("resolving {} in {}", symbol, module))
            }
        }
    }

    fn intercept(&self, target: usize, replacement: usize) -> Result<usize> {
        let original = ndkfix_intercept::Interceptor::obtain()
            .replace(target as *mut c_void, replacement as *const c_void)
            .with_context(|| format!("replacing {:#x}", target))?;
        Ok(original as usize)
    }
}

/// Wait until an `original` cell is filled.
///
/// A replacement can run on another thread between the patch landing and
/// the interceptor handing back the trampoline.
pub(crate) fn await_original(cell: &AtomicUsize) -> usize {
    loop {
        let original = cell.load(Ordering::Acquire);
        if original != 0 {
            return original;
        }
        std::hint::spin_loop();
    }
}

type ToGuestFn = unsafe extern "C" fn(*mut c_void) -> *mut c_void;

static ORIGINAL_TO_GUEST_JAVA_VM: AtomicUsize = AtomicUsize::new(0);
static ORIGINAL_TO_GUEST_JNI_ENV: AtomicUsize = AtomicUsize::new(0);

unsafe fn to_guest(kind: HandleKind, original: &AtomicUsize, handle: *mut c_void) -> *mut c_void {
    if let Some(engine) = Engine::get() {
        engine.observe_handle(kind, handle as usize);
    }
    let original: ToGuestFn = core::mem::transmute(await_original(original));
    original(handle)
}

unsafe extern "C" fn to_guest_java_vm(vm: *mut c_void) -> *mut c_void {
    to_guest(HandleKind::JavaVm, &ORIGINAL_TO_GUEST_JAVA_VM, vm)
}

unsafe extern "C" fn to_guest_jni_env(env: *mut c_void) -> *mut c_void {
    to_guest(HandleKind::JniEnv, &ORIGINAL_TO_GUEST_JNI_ENV, env)
}

pub struct Bootstrap<I: Interceptor> {
    config: Config,
    interceptor: I,
    armed: Once,
}

impl<I: Interceptor> Bootstrap<I> {
    pub fn new(config: Config, interceptor: I) -> Self {
        Self {
            config,
            interceptor,
            armed: Once::new(),
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_completed()
    }

    /// Inspect a library the bridge is about to load. Returns `true` for the
    /// one call that armed the engine.
    pub fn on_library_load(&self, path: &str) -> bool {
        if !self.config.matches_target(path) {
            return false;
        }
        let mut armed_now = false;
        self.armed.call_once(|| {
            info!("detected {}", self.config.target_library);
            self.arm();
            armed_now = true;
        });
        armed_now
    }

    fn arm(&self) {
        let engine = Engine::install(self.config.clone());

        self.hook_conversions();
        match self.hook_sigaction() {
            Ok(()) => info!("set sigaction hook"),
            Err(e) => warn!("sigaction guard not installed: {:#}", e),
        }

        info!("setting sigsegv signal");
        if let Err(e) = fault::install_handler(engine) {
            warn!("SIGSEGV handler not installed: {:#}", e);
        }
    }

    /// Hook both handle conversions; each one is attempted on its own.
    fn hook_conversions(&self) {
        let hooks: [(&str, usize, &AtomicUsize); 2] = [
            (
                self.config.to_guest_java_vm_symbol.as_str(),
                to_guest_java_vm as usize,
                &ORIGINAL_TO_GUEST_JAVA_VM,
            ),
            (
                self.config.to_guest_jni_env_symbol.as_str(),
                to_guest_jni_env as usize,
                &ORIGINAL_TO_GUEST_JNI_ENV,
            ),
        ];
        for (symbol, replacement, original) in hooks {
            if let Err(e) = self.hook_conversion(symbol, replacement, original) {
                warn!("{} not hooked: {:#}", symbol, e);
            }
        }
    }

    fn hook_conversion(&self, symbol: &str, replacement: usize, original: &AtomicUsize) -> Result<()> {
        let target = self
            .interceptor
            .resolve(&self.config.translation_library, symbol)?;
        let trampoline = self
            .interceptor
            .intercept(target, replacement)
            .with_context(|| format!("hooking {}", symbol))?;
        original.store(trampoline, Ordering::Release);
        debug!("hooked {} at {:#x}", symbol, target);
        Ok(())
    }

    fn hook_sigaction(&self) -> Result<()> {
        let target = self
            .interceptor
            .resolve(&self.config.libc_module, &self.config.sigaction_symbol)?;
        let original = self
            .interceptor
            .intercept(target, guard::guarded_sigaction as usize)
            .context("hooking sigaction")?;
        guard::set_original(original);
        Ok(())
    }
}

/// The process bootstrap, backed by the inline interceptor.
pub fn global() -> &'static Bootstrap<InlineInterceptor> {
    static BOOTSTRAP: OnceLock<Bootstrap<InlineInterceptor>> = OnceLock::new();
    BOOTSTRAP.get_or_init(|| Bootstrap::new(Config::default(), InlineInterceptor))
}
