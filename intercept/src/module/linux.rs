use crate::types::{HookError, ModuleInfo};
use core::ffi::c_void;
use std::ffi::{CStr, CString};

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Enumerate all loaded shared objects via `dl_iterate_phdr`.
pub fn enumerate_modules() -> Vec<ModuleInfo> {
    unsafe extern "C" fn callback(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut c_void,
    ) -> libc::c_int {
        let modules = &mut *(data as *mut Vec<ModuleInfo>);
        let info = &*info;

        let path = if info.dlpi_name.is_null() || *info.dlpi_name == 0 {
            std::fs::read_link("/proc/self/exe")
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default()
        } else {
            CStr::from_ptr(info.dlpi_name).to_string_lossy().into_owned()
        };

        let phdrs = if info.dlpi_phdr.is_null() {
            &[][..]
        } else {
            core::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize)
        };
        let loads = phdrs.iter().filter(|p| p.p_type == libc::PT_LOAD && p.p_memsz > 0);
        let min = loads.clone().map(|p| p.p_vaddr).min().unwrap_or(0);
        let max = loads.map(|p| p.p_vaddr + p.p_memsz).max().unwrap_or(0);

        let load_bias = info.dlpi_addr as usize;
        modules.push(ModuleInfo {
            name: if path.is_empty() {
                String::from("[unknown]")
            } else {
                basename(&path).to_string()
            },
            path,
            base_address: load_bias + min as usize,
            load_bias,
            size: max.saturating_sub(min) as usize,
        });

        0
    }

    let mut modules: Vec<ModuleInfo> = Vec::new();
    unsafe {
        libc::dl_iterate_phdr(Some(callback), &mut modules as *mut Vec<ModuleInfo> as *mut c_void);
    }
    modules
}

pub fn find_module_by_name(name: &str) -> Option<ModuleInfo> {
    enumerate_modules()
        .into_iter()
        .find(|m| m.name == name || m.path.ends_with(name))
}

/// Resolve a symbol across all loaded modules with `dlsym(RTLD_DEFAULT, ...)`.
pub fn find_global_export_by_name(symbol: &str) -> Result<usize, HookError> {
    let cstr = CString::new(symbol).map_err(|_| HookError::SymbolNotFound(symbol.to_string()))?;
    let p = unsafe { libc::dlsym(libc::RTLD_DEFAULT, cstr.as_ptr()) };
    if p.is_null() {
        Err(HookError::SymbolNotFound(symbol.to_string()))
    } else {
        Ok(p as usize)
    }
}

/// Resolve a symbol inside one loaded module.
///
/// Dynamic exports are tried first (`dlopen(RTLD_NOLOAD)` + `dlsym`); internal
/// C++ symbols that the module does not export are then looked up in the
/// `.symtab` of the file on disk and rebased by the module's load bias.
pub fn find_export_by_name(module_name: &str, symbol: &str) -> Result<usize, HookError> {
    let module =
        find_module_by_name(module_name).ok_or_else(|| HookError::ModuleNotFound(module_name.to_string()))?;
    let sym_cstr = CString::new(symbol).map_err(|_| HookError::SymbolNotFound(symbol.to_string()))?;

    for path in [&module.path, &module.name] {
        if path.is_empty() {
            continue;
        }
        let Ok(path_cstr) = CString::new(path.as_str()) else {
            continue;
        };
        unsafe {
            let handle = libc::dlopen(path_cstr.as_ptr(), libc::RTLD_NOLOAD | libc::RTLD_NOW);
            if handle.is_null() {
                continue;
            }
            let p = libc::dlsym(handle, sym_cstr.as_ptr());
            libc::dlclose(handle);
            if !p.is_null() {
                return Ok(p as usize);
            }
        }
    }

    let data = std::fs::read(&module.path).map_err(|_| HookError::SymbolNotFound(symbol.to_string()))?;
    symtab_value(&data, symbol)
        .map(|value| module.load_bias + value as usize)
        .ok_or_else(|| HookError::SymbolNotFound(symbol.to_string()))
}

/// Link-time value of a defined `.symtab` symbol named `name`.
fn symtab_value(data: &[u8], name: &str) -> Option<u64> {
    use object::{Object, ObjectSymbol};

    let file = object::File::parse(data).ok()?;
    file.symbols()
        .filter(|sym| sym.is_definition())
        .find(|sym| sym.name().is_ok_and(|n| n == name))
        .map(|sym| sym.address())
}
