//! Prologue relocation for x86_64 trampolines.
//!
//! Whole instructions are copied from the start of the target until at least
//! `min_bytes` are covered, re-encoded at the trampoline address so that
//! RIP-relative operands and near branches still reach their original targets.

use crate::types::HookError;
use iced_x86::{Decoder, DecoderOptions, Encoder, Instruction, Mnemonic};

/// Longest prologue window ever decoded: a 16-byte far jump plus one maximal
/// 15-byte instruction straddling its end.
const MAX_WINDOW: usize = 32;

/// Result of relocating a prologue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocatedPrologue {
    /// Bytes of the original function covered by the relocated instructions.
    pub consumed: usize,
    /// Re-encoded instructions, valid when placed at the output pc.
    pub code: Vec<u8>,
}

/// `endbr64` (F3 0F 1E FA).
pub fn is_endbr64(p: *const u8) -> bool {
    let bytes = unsafe { core::ptr::read_unaligned(p as *const [u8; 4]) };
    bytes == [0xF3, 0x0F, 0x1E, 0xFA]
}

fn ends_flow(insn: &Instruction) -> bool {
    matches!(
        insn.mnemonic(),
        Mnemonic::Ret | Mnemonic::Retf | Mnemonic::Jmp | Mnemonic::Int3 | Mnemonic::Ud2 | Mnemonic::Hlt
    )
}

pub struct X86_64Relocator {
    input: *const u8,
    input_pc: u64,
}

impl X86_64Relocator {
    pub fn new(input: *const u8, input_pc: u64) -> Self {
        Self { input, input_pc }
    }

    /// Relocate whole instructions covering at least `min_bytes` so they run
    /// correctly at `output_pc`.
    ///
    /// # Safety
    /// `input` must be readable for 32 bytes.
    pub unsafe fn relocate(&self, min_bytes: usize, output_pc: u64) -> Result<RelocatedPrologue, HookError> {
        let window = core::ptr::read_unaligned(self.input as *const [u8; MAX_WINDOW]);
        let mut decoder = Decoder::with_ip(64, &window, self.input_pc, DecoderOptions::NONE);
        let mut encoder = Encoder::new(64);
        let mut consumed = 0usize;
        let mut code = Vec::with_capacity(MAX_WINDOW * 2);

        while consumed < min_bytes {
            if !decoder.can_decode() {
                return Err(HookError::RelocationFailed);
            }
            let insn = decoder.decode();
            if insn.is_invalid() {
                return Err(HookError::RelocationFailed);
            }
            // A return or unconditional jump is only acceptable as the last
            // relocated instruction; the bytes after it belong to someone else.
            if ends_flow(&insn) && consumed + insn.len() < min_bytes {
                return Err(HookError::RelocationFailed);
            }

            let out_ip = output_pc + code.len() as u64;
            encoder
                .encode(&insn, out_ip)
                .map_err(|_| HookError::RelocationFailed)?;
            code.extend_from_slice(&encoder.take_buffer());
            consumed += insn.len();
        }

        Ok(RelocatedPrologue { consumed, code })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn padded(bytes: &[u8]) -> [u8; MAX_WINDOW] {
        let mut buf = [0x90u8; MAX_WINDOW];
        buf[..bytes.len()].copy_from_slice(bytes);
        buf
    }

    #[test]
    fn detects_endbr64() {
        assert!(is_endbr64(padded(&[0xF3, 0x0F, 0x1E, 0xFA]).as_ptr()));
        assert!(!is_endbr64(padded(&[0x55, 0x48, 0x89, 0xE5]).as_ptr()));
    }

    #[test]
    fn covers_whole_instructions() {
        // push rbp; mov rbp, rsp; sub rsp, 0x20
        let code = padded(&[0x55, 0x48, 0x89, 0xE5, 0x48, 0x83, 0xEC, 0x20]);
        let r = unsafe { X86_64Relocator::new(code.as_ptr(), 0x1000).relocate(5, 0x9000) }.unwrap();
        assert_eq!(r.consumed, 8);
        assert_eq!(r.code, &code[..8]);
    }

    #[test]
    fn rip_relative_operand_keeps_its_target() {
        // lea rax, [rip+0x100] at 0x1000 addresses 0x1107.
        let code = padded(&[0x48, 0x8D, 0x05, 0x00, 0x01, 0x00, 0x00]);
        let r = unsafe { X86_64Relocator::new(code.as_ptr(), 0x1000).relocate(5, 0x2000_0000) }.unwrap();
        assert_eq!(r.consumed, 7);

        let mut decoder = Decoder::with_ip(64, &r.code, 0x2000_0000, DecoderOptions::NONE);
        let insn = decoder.decode();
        assert_eq!(insn.mnemonic(), Mnemonic::Lea);
        assert_eq!(insn.memory_displacement64(), 0x1107);
    }

    #[test]
    fn early_return_is_rejected() {
        // ret; followed by unrelated bytes
        let code = padded(&[0xC3]);
        let r = unsafe { X86_64Relocator::new(code.as_ptr(), 0x1000).relocate(5, 0x9000) };
        assert_eq!(r, Err(HookError::RelocationFailed));
    }

    #[test]
    fn unreachable_short_branch_is_rejected() {
        // jmp short +0x10
        let code = padded(&[0xEB, 0x10]);
        let r = unsafe { X86_64Relocator::new(code.as_ptr(), 0x1000).relocate(2, 0x7fff_0000_0000) };
        assert_eq!(r, Err(HookError::RelocationFailed));
    }
}
