//! Geometry of the two JNI function tables.
//!
//! Both `JavaVM` and `JNIEnv` point at a struct whose first word is the
//! table pointer (`functions`). Table sizes follow Android's `jni.h`.

use std::fmt;

/// `JNIInvokeInterface`: 3 reserved words + 5 functions.
pub const JAVA_VM_TABLE_LEN: usize = 8;

/// `JNINativeInterface`: 4 reserved words + 229 functions (JNI 1.6).
pub const JNI_ENV_TABLE_LEN: usize = 233;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    JavaVm,
    JniEnv,
}

impl HandleKind {
    /// Classification order used by the fault path.
    pub const ALL: [HandleKind; 2] = [HandleKind::JavaVm, HandleKind::JniEnv];

    pub const fn table_len(self) -> usize {
        match self {
            HandleKind::JavaVm => JAVA_VM_TABLE_LEN,
            HandleKind::JniEnv => JNI_ENV_TABLE_LEN,
        }
    }

    pub(crate) const fn index(self) -> usize {
        match self {
            HandleKind::JavaVm => 0,
            HandleKind::JniEnv => 1,
        }
    }
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleKind::JavaVm => f.write_str("jvm"),
            HandleKind::JniEnv => f.write_str("jenv"),
        }
    }
}

/// Current table pointer of a handle.
///
/// # Safety
/// `handle` must point to a live `JavaVM` or `JNIEnv`.
#[inline]
pub unsafe fn live_table(handle: usize) -> *const usize {
    core::ptr::read(handle as *const *const usize)
}
