//! Stand-in for the translation layer's native bridge interface.
//!
//! Android's native bridge loader looks up `NativeBridgeItf` in whichever
//! library `ro.dalvik.vm.native.bridge` names. We export our own copy of the
//! translation layer's record with only `loadLibraryExt` swapped, so every
//! guest library load passes through [`crate::bootstrap`] first.

use crate::bootstrap;
use crate::guard;
use crate::config::Config;
use anyhow::{bail, Result};
use core::cell::UnsafeCell;
use core::ffi::{c_char, c_int, c_void, CStr};
use log::info;
use std::ffi::CString;
use std::sync::atomic::{AtomicPtr, Ordering};

pub type LoadLibraryExtFn =
    unsafe extern "C" fn(path: *const c_char, flag: c_int, ns: *mut c_void) -> *mut c_void;

/// The part of `android::NativeBridgeCallbacks` we touch; everything else
/// is carried over byte for byte.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct NativeBridgeCallbacks {
    pub version: u32,
    _opaque_head: [u8; 104],
    pub load_library_ext: Option<LoadLibraryExtFn>,
    _opaque_tail: [u8; 28],
}

impl NativeBridgeCallbacks {
    pub const INITIAL_VERSION: u32 = 6;

    const fn initial() -> Self {
        Self {
            version: Self::INITIAL_VERSION,
            _opaque_head: [0; 104],
            load_library_ext: None,
            _opaque_tail: [0; 28],
        }
    }
}

#[repr(transparent)]
pub struct ExportedBridge(UnsafeCell<NativeBridgeCallbacks>);

// Written once from the library constructor, before the loader reads it.
unsafe impl Sync for ExportedBridge {}

impl ExportedBridge {
    pub fn get(&self) -> NativeBridgeCallbacks {
        unsafe { *self.0.get() }
    }
}

#[unsafe(no_mangle)]
#[allow(non_upper_case_globals)]
pub static NativeBridgeItf: ExportedBridge =
    ExportedBridge(UnsafeCell::new(NativeBridgeCallbacks::initial()));

/// The translation layer's own record.
static ORIGINAL_BRIDGE: AtomicPtr<NativeBridgeCallbacks> = AtomicPtr::new(core::ptr::null_mut());

fn dl_error() -> String {
    let message = unsafe { libc::dlerror() };
    if message.is_null() {
        String::from("unknown error")
    } else {
        unsafe { CStr::from_ptr(message) }.to_string_lossy().into_owned()
    }
}

/// Load the translation layer and mirror its bridge interface.
pub fn setup(config: &Config) -> Result<()> {
    let library = CString::new(config.translation_library.as_str())?;
    let handle = unsafe { libc::dlopen(library.as_ptr(), libc::RTLD_LAZY) };
    if handle.is_null() {
        bail!("dlopen {}: {}", config.translation_library, dl_error());
    }
    let original = unsafe { libc::dlsym(handle, c"NativeBridgeItf".as_ptr()) };
    if original.is_null() {
        bail!("NativeBridgeItf not found in {}: {}", config.translation_library, dl_error());
    }

    unsafe { mirror(original as *const NativeBridgeCallbacks) };
    info!("loaded {} and set functions", config.translation_library);
    Ok(())
}

/// # Safety
/// `original` must point to a live `NativeBridgeCallbacks` that outlives the
/// process's use of the bridge.
unsafe fn mirror(original: *const NativeBridgeCallbacks) {
    ORIGINAL_BRIDGE.store(original as *mut NativeBridgeCallbacks, Ordering::Release);
    let ours = NativeBridgeItf.0.get();
    core::ptr::copy_nonoverlapping(original, ours, 1);
    (*ours).load_library_ext = Some(load_library_ext);
}

unsafe extern "C" fn load_library_ext(
    path: *const c_char,
    flag: c_int,
    ns: *mut c_void,
) -> *mut c_void {
    guard::report_vetoes();
    if !path.is_null() {
        let name = CStr::from_ptr(path).to_string_lossy();
        bootstrap::global().on_library_load(&name);
    }

    let forward = ORIGINAL_BRIDGE
        .load(Ordering::Acquire)
        .as_ref()
        .and_then(|original| original.load_library_ext);
    match forward {
        Some(forward) => forward(path, flag, ns),
        None => core::ptr::null_mut(),
    }
}
