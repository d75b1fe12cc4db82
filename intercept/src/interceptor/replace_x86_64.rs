use super::{Interceptor, ReplacementEntry};
use crate::arch::x86_64::relocator::{is_endbr64, X86_64Relocator};
use crate::arch::x86_64::writer::{X86_64Writer, FAR_JMP_SIZE, NEAR_JMP_SIZE};
use crate::code::allocator::CodeAllocator;
use crate::code::patcher::patch_code;
use crate::types::HookError;
use core::ffi::c_void;

/// Maximum relative distance for a near JMP rel32 (±2GB).
const NEAR_RANGE: usize = 0x7FFF_FFFF;

fn read_32(addr: *const u8) -> [u8; 32] {
    unsafe { core::ptr::read_unaligned(addr as *const [u8; 32]) }
}

pub(super) fn replace(
    interceptor: &Interceptor,
    function_address: *mut c_void,
    replacement: *const c_void,
) -> Result<*const c_void, HookError> {
    let key = function_address as usize;
    let mut map = interceptor
        .replace_map
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    if map.contains_key(&key) {
        return Err(HookError::AlreadyReplaced);
    }

    // CET landing pad stays in place; the redirect goes right after it.
    let mut patch_addr = function_address as *mut u8;
    if is_endbr64(patch_addr) {
        patch_addr = unsafe { patch_addr.add(4) };
    }
    let patch_pc = patch_addr as u64;

    let mut alloc = CodeAllocator::default();
    let slice = alloc
        .alloc_near(patch_addr, NEAR_RANGE)
        .or_else(|_| alloc.alloc_any())?;
    let tramp_pc = slice.data as u64;

    let page_is_near = X86_64Writer::near_reachable(patch_pc, tramp_pc);
    let repl_is_near = X86_64Writer::near_reachable(patch_pc, replacement as u64);
    let redirect_size = if repl_is_near || page_is_near {
        NEAR_JMP_SIZE
    } else {
        FAR_JMP_SIZE
    };

    let prologue = unsafe { X86_64Relocator::new(patch_addr, patch_pc).relocate(redirect_size, tramp_pc)? };

    // Trampoline: relocated prologue, jump back past it, then (when the
    // replacement is out of rel32 range) a relay the redirect can reach.
    let redirect_target;
    unsafe {
        let mut w = X86_64Writer::new(slice.data, slice.size, tramp_pc);
        w.put_bytes(&prologue.code);
        w.put_jmp_address(patch_pc + prologue.consumed as u64);

        if repl_is_near {
            redirect_target = replacement as u64;
        } else if page_is_near {
            redirect_target = w.pc();
            w.put_jmp_far(replacement as u64);
        } else {
            redirect_target = replacement as u64;
        }

        alloc.make_executable(&slice)?;
    }

    let mut stub = [0u8; 32];
    unsafe {
        let mut w = X86_64Writer::new(stub.as_mut_ptr(), stub.len(), patch_pc);
        if redirect_size == NEAR_JMP_SIZE {
            w.put_jmp_near(redirect_target);
        } else {
            w.put_jmp_far(redirect_target);
        }
        let written = w.offset();
        if written < prologue.consumed {
            w.put_nop_n(prologue.consumed - written);
        }
    }

    let original_bytes = read_32(patch_addr);
    let patch_size = prologue.consumed;
    unsafe {
        patch_code(patch_addr, patch_size, |p| {
            core::ptr::copy_nonoverlapping(stub.as_ptr(), p, patch_size);
        })?;
    }

    log::debug!(
        "replaced {:#x} -> {:p} ({} bytes, trampoline {:#x})",
        key,
        replacement,
        patch_size,
        tramp_pc
    );

    map.insert(
        key,
        ReplacementEntry {
            function: key,
            patched_at: patch_addr as usize,
            original_bytes,
            patch_size,
            trampoline: tramp_pc as usize,
        },
    );

    Ok(tramp_pc as *const c_void)
}

pub(super) fn revert(interceptor: &Interceptor, function_address: *mut c_void) -> Result<(), HookError> {
    let mut map = interceptor
        .replace_map
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    let Some(entry) = map.remove(&(function_address as usize)) else {
        return Ok(());
    };

    let restore = entry.patch_size.min(entry.original_bytes.len());
    unsafe {
        patch_code(entry.patched_at as *mut u8, restore, |p| {
            core::ptr::copy_nonoverlapping(entry.original_bytes.as_ptr(), p, restore);
        })?;
    }
    log::debug!("reverted {:#x}", entry.function);
    Ok(())
}
