/// Emits the handful of x86_64 jump forms the interceptor needs into a raw buffer.
#[derive(Debug)]
pub struct X86_64Writer {
    base: *mut u8,
    code: *mut u8,
    pc: u64,
    size: usize,
}

/// `jmp rel32`.
pub const NEAR_JMP_SIZE: usize = 5;

/// `jmp [rip+2]; ud2; .quad target`.
pub const FAR_JMP_SIZE: usize = 16;

impl X86_64Writer {
    /// # Safety
    /// `buffer` must be writable for `size` bytes for the writer's lifetime.
    pub unsafe fn new(buffer: *mut u8, size: usize, pc: u64) -> Self {
        Self {
            base: buffer,
            code: buffer,
            pc,
            size,
        }
    }

    pub fn pc(&self) -> u64 {
        self.pc
    }

    pub fn offset(&self) -> usize {
        (self.code as usize).saturating_sub(self.base as usize)
    }

    pub fn remaining(&self) -> usize {
        self.size.saturating_sub(self.offset())
    }

    unsafe fn emit(&mut self, byte: u8) {
        debug_assert!(self.remaining() >= 1);
        self.code.write(byte);
        self.code = self.code.add(1);
        self.pc = self.pc.wrapping_add(1);
    }

    unsafe fn emit_u32_le(&mut self, val: u32) {
        for b in val.to_le_bytes() {
            self.emit(b);
        }
    }

    unsafe fn emit_u64_le(&mut self, val: u64) {
        for b in val.to_le_bytes() {
            self.emit(b);
        }
    }

    /// Whether a 5-byte `jmp rel32` emitted at `from` can reach `target`.
    pub fn near_reachable(from: u64, target: u64) -> bool {
        let rel = (target as i64).wrapping_sub(from as i64 + NEAR_JMP_SIZE as i64);
        rel >= i32::MIN as i64 && rel <= i32::MAX as i64
    }

    /// `jmp rel32` (E9 cd).
    pub unsafe fn put_jmp_near(&mut self, target: u64) {
        let rel = (target as i64).wrapping_sub(self.pc as i64 + NEAR_JMP_SIZE as i64);
        self.emit(0xE9);
        self.emit_u32_le(rel as i32 as u32);
    }

    /// Absolute jump through an inline literal: FF 25 02 00 00 00, 0F 0B, imm64.
    pub unsafe fn put_jmp_far(&mut self, target: u64) {
        self.emit(0xFF);
        self.emit(0x25);
        self.emit_u32_le(0x02);
        // ud2 between the jump and its literal.
        self.emit(0x0F);
        self.emit(0x0B);
        self.emit_u64_le(target);
    }

    /// Near jump when rel32 reaches, far jump otherwise.
    pub unsafe fn put_jmp_address(&mut self, target: u64) {
        if Self::near_reachable(self.pc, target) {
            self.put_jmp_near(target);
        } else {
            self.put_jmp_far(target);
        }
    }

    pub unsafe fn put_bytes(&mut self, bytes: &[u8]) {
        debug_assert!(self.remaining() >= bytes.len());
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), self.code, bytes.len());
        self.code = self.code.add(bytes.len());
        self.pc = self.pc.wrapping_add(bytes.len() as u64);
    }

    /// Pads with single-byte `nop`s. Only ever used for the tail of a
    /// redirect stub, which is never executed.
    pub unsafe fn put_nop_n(&mut self, n: usize) {
        for _ in 0..n {
            self.emit(0x90);
        }
    }
}
