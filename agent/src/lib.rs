//! ndk-fix - keeps JNI calls working after the guest corrupts its tables.
//!
//! This library is built as a cdylib and named as the process's native
//! bridge in place of `libndk_translation.so`. It forwards the real bridge
//! (see [`bridge`]) and, once the target library is loaded, redirects calls
//! through overwritten `JavaVM`/`JNIEnv` function tables back to the
//! functions that were there originally (see [`fault`]).

pub mod bootstrap;
pub mod bridge;
pub mod cache;
pub mod config;
pub mod engine;
pub mod fault;
pub mod guard;
pub mod jni;
pub mod logging;
pub mod registry;
pub mod snapshot;

pub use config::Config;
pub use engine::Engine;
pub use fault::{Disposition, FaultContext, PreviousHandler};
pub use jni::HandleKind;

use log::{info, warn};
use std::sync::OnceLock;

/// Library entry point, run from the constructor below.
///
/// Returns 0 when the bridge was mirrored, -1 when the translation layer
/// could not be loaded (the default record stays exported).
#[unsafe(no_mangle)]
pub extern "C" fn ndk_fix_init() -> i32 {
    static STATUS: OnceLock<i32> = OnceLock::new();

    *STATUS.get_or_init(|| {
        logging::init();
        info!("setup called");

        match bridge::setup(&Config::default()) {
            Ok(()) => 0,
            Err(e) => {
                warn!("native bridge not mirrored: {:#}", e);
                -1
            }
        }
    })
}

/// Constructor for automatic initialization on library load.
#[cfg(all(any(target_os = "linux", target_os = "android"), not(test)))]
#[unsafe(link_section = ".init_array")]
#[used]
static INIT: extern "C" fn() = {
    extern "C" fn init() {
        ndk_fix_init();
    }
    init
};

/// Process-global lock for tests that touch signal dispositions, the
/// `sigaction` guard or the exported bridge record.
#[cfg(test)]
pub(crate) fn lock_global_state() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(())).lock().unwrap_or_else(|e| e.into_inner())
}
