//! ndkfix-intercept: inline function replacement and ELF symbol lookup for ndk-fix.
//!
//! Only x86_64 Linux/Android targets can actually patch code. Other targets
//! build, but every patching entry point returns [`HookError::Unsupported`].

pub mod arch;
pub mod code;
pub mod interceptor;
pub mod module;
pub mod types;

pub use interceptor::Interceptor;
pub use types::{HookError, ModuleInfo};

/// Process-global lock for tests that modify executable code.
///
/// Patching the same page from two test threads at once can leave a
/// half-written jump behind, so every test that patches must hold this.
#[cfg(test)]
pub(crate) fn lock_hook_tests() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(())).lock().unwrap_or_else(|e| e.into_inner())
}
