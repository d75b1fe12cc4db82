use crate::types::HookError;

/// Patch code at `addr` for `size` bytes.
///
/// The covering pages are made RWX for the duration of `apply` so code that
/// shares the page (including the caller) keeps executing, then restored to RX.
/// x86_64 keeps its instruction cache coherent, so no flush follows.
///
/// # Safety
/// `addr` must point to `size` bytes of mapped code. `apply` must write within that range.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub unsafe fn patch_code(addr: *mut u8, size: usize, apply: impl FnOnce(*mut u8)) -> Result<(), HookError> {
    if size == 0 {
        return Ok(());
    }

    let page_sz = libc::sysconf(libc::_SC_PAGESIZE) as usize;
    let page_start = (addr as usize) & !(page_sz - 1);
    let page_end = ((addr as usize) + size + page_sz - 1) & !(page_sz - 1);
    let map_size = page_end - page_start;

    if libc::mprotect(
        page_start as *mut libc::c_void,
        map_size,
        libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
    ) != 0
    {
        return Err(HookError::ProtectionFailed);
    }

    apply(addr);

    if libc::mprotect(
        page_start as *mut libc::c_void,
        map_size,
        libc::PROT_READ | libc::PROT_EXEC,
    ) != 0
    {
        log::warn!("could not restore RX on {:#x}+{:#x}", page_start, map_size);
    }
    Ok(())
}

/// # Safety
/// See the Linux variant.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub unsafe fn patch_code(_addr: *mut u8, _size: usize, _apply: impl FnOnce(*mut u8)) -> Result<(), HookError> {
    Err(HookError::Unsupported)
}

#[cfg(all(test, target_arch = "x86_64", any(target_os = "linux", target_os = "android")))]
mod tests {
    use super::*;
    use crate::code::allocator::CodeAllocator;

    #[test]
    fn patcher_can_modify_executable_page() {
        let _g = crate::lock_hook_tests();
        let mut alloc = CodeAllocator::default();
        let slice = alloc.alloc_any().expect("alloc");

        unsafe {
            // mov eax, 1; ret
            let code = [0xB8, 0x01, 0x00, 0x00, 0x00, 0xC3];
            core::ptr::copy_nonoverlapping(code.as_ptr(), slice.data, code.len());
            alloc.make_executable(&slice).expect("rx");

            let f: extern "C" fn() -> u32 = core::mem::transmute(slice.data);
            assert_eq!(f(), 1);

            patch_code(slice.data.add(1), 1, |p| p.write(0x07)).expect("patch");
            assert_eq!(f(), 7);
        }
    }

    #[test]
    fn zero_length_patch_is_noop() {
        let mut byte = 0u8;
        unsafe {
            patch_code(&mut byte, 0, |p| p.write(1)).expect("noop");
        }
        assert_eq!(byte, 0);
    }
}
