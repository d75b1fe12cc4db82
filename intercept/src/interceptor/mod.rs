use crate::types::HookError;
use core::ffi::c_void;
use std::collections::HashMap;
use std::sync::Mutex;

#[cfg(all(target_arch = "x86_64", any(target_os = "linux", target_os = "android")))]
mod replace_x86_64;

struct ReplacementEntry {
    function: usize,
    patched_at: usize,
    original_bytes: [u8; 32],
    patch_size: usize,
    trampoline: usize,
}

/// Inline function replacement.
///
/// `replace()` overwrites the target's prologue with a jump to the
/// replacement and hands back a trampoline that runs the displaced prologue
/// before continuing in the original body. Trampoline pages are never freed,
/// so an `original` pointer stays callable after `revert()`.
pub struct Interceptor {
    replace_map: Mutex<HashMap<usize, ReplacementEntry>>,
}

impl Interceptor {
    pub fn obtain() -> &'static Interceptor {
        static INSTANCE: std::sync::OnceLock<Interceptor> = std::sync::OnceLock::new();
        INSTANCE.get_or_init(|| Interceptor {
            replace_map: Mutex::new(HashMap::new()),
        })
    }

    /// Redirect `function_address` to `replacement`, returning a pointer that
    /// behaves like the unpatched function.
    pub fn replace(
        &self,
        function_address: *mut c_void,
        replacement: *const c_void,
    ) -> Result<*const c_void, HookError> {
        #[cfg(all(target_arch = "x86_64", any(target_os = "linux", target_os = "android")))]
        {
            replace_x86_64::replace(self, function_address, replacement)
        }
        #[cfg(not(all(target_arch = "x86_64", any(target_os = "linux", target_os = "android"))))]
        {
            let _ = (function_address, replacement);
            Err(HookError::Unsupported)
        }
    }

    pub fn revert(&self, function_address: *mut c_void) -> Result<(), HookError> {
        #[cfg(all(target_arch = "x86_64", any(target_os = "linux", target_os = "android")))]
        {
            replace_x86_64::revert(self, function_address)
        }
        #[cfg(not(all(target_arch = "x86_64", any(target_os = "linux", target_os = "android"))))]
        {
            let _ = function_address;
            Err(HookError::Unsupported)
        }
    }

    pub fn is_replaced(&self, function_address: *const c_void) -> bool {
        self.replace_map
            .lock()
            .map(|m| m.contains_key(&(function_address as usize)))
            .unwrap_or(false)
    }
}
