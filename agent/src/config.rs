//! Fixed parameters of the fix.
//!
//! Nothing here is read from the environment: once the target library is
//! seen, behaviour is unconditional. Log verbosity is the only knob, and it
//! belongs to the logger (see [`crate::logging`]).

/// Logcat tag and log prefix.
pub const LOG_TAG: &str = "libndk-fix";

/// Handles tracked per kind. A process has one `JavaVM` and one `JNIEnv` per
/// attached thread, so this bounds attached threads seen by the guest.
pub const DEFAULT_HANDLE_CAPACITY: usize = 64;

/// Distinct faulting call sites remembered by the redirection cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Substring of the library path whose load arms the engine.
    pub target_library: String,
    /// The translation layer that owns `NativeBridgeItf` and the handle conversions.
    pub translation_library: String,
    pub to_guest_java_vm_symbol: String,
    pub to_guest_jni_env_symbol: String,
    pub libc_module: String,
    pub sigaction_symbol: String,
    pub handle_capacity: usize,
    pub cache_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target_library: "libroblox.so".to_string(),
            translation_library: "libndk_translation.so".to_string(),
            to_guest_java_vm_symbol: "_ZN15ndk_translation13ToGuestJavaVMEPv".to_string(),
            to_guest_jni_env_symbol: "_ZN15ndk_translation13ToGuestJNIEnvEPv".to_string(),
            libc_module: "libc.so".to_string(),
            sigaction_symbol: "sigaction".to_string(),
            handle_capacity: DEFAULT_HANDLE_CAPACITY,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

impl Config {
    /// Whether loading `path` should arm the engine.
    pub fn matches_target(&self, path: &str) -> bool {
        !self.target_library.is_empty() && path.contains(self.target_library.as_str())
    }
}
