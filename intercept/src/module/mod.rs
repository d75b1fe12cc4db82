#[cfg(not(any(target_os = "linux", target_os = "android")))]
use crate::types::{HookError, ModuleInfo};

#[cfg(any(target_os = "linux", target_os = "android"))]
mod linux;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use linux::*;

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn enumerate_modules() -> Vec<ModuleInfo> {
    Vec::new()
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn find_module_by_name(_name: &str) -> Option<ModuleInfo> {
    None
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn find_global_export_by_name(symbol: &str) -> Result<usize, HookError> {
    Err(HookError::SymbolNotFound(symbol.to_string()))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn find_export_by_name(_module_name: &str, _symbol: &str) -> Result<usize, HookError> {
    Err(HookError::Unsupported)
}
