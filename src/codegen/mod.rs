use std::ffi::c_char;

use anyhow::{Result, bail};

use crate::ast::{BinaryOperator, UnaryOperator};

pub mod aarch64;
pub mod x86_64;

pub use aarch64::AArch64CodeGen;
pub use x86_64::X86_64CodeGen;

/// Branch target: the bind site once known, plus the byte offsets of every
/// forward branch emitted with a placeholder displacement.
#[derive(Debug, Default)]
pub struct Label {
    bound: bool,
    offset: usize,
    fixups: Vec<usize>,
}

impl Label {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

/// Instruction encoder shared by both back-ends.
///
/// Calling convention between the emitted primitives: every expression
/// leaves its value in the result register; `emit_push`/`emit_pop` spill and
/// reload the left operand of a binary operator into the secondary register,
/// so an operator always computes `secondary OP result` into the result
/// register. The prologue stashes the incoming argument-array pointer in a
/// callee-saved register for `emit_load_arg`.
pub trait CodeGen {
    fn emit_prologue(&mut self, local_count: usize);
    fn emit_epilogue(&mut self);

    fn emit_load_immediate(&mut self, value: i64);
    fn emit_load_bool(&mut self, value: bool);

    fn emit_load_local(&mut self, slot: usize);
    fn emit_store_local(&mut self, slot: usize);
    fn emit_load_arg(&mut self, index: usize);

    fn emit_push(&mut self);
    fn emit_pop(&mut self);

    fn emit_binary(&mut self, op: BinaryOperator);
    fn emit_unary(&mut self, op: UnaryOperator);

    fn create_label(&mut self) -> Label {
        Label::new()
    }
    fn bind_label(&mut self, label: &mut Label);
    fn emit_jump(&mut self, label: &mut Label);
    fn emit_jump_if_false(&mut self, label: &mut Label);
    fn emit_jump_if_true(&mut self, label: &mut Label);

    /// Move the result register into the ABI argument register `index`.
    fn emit_set_call_arg(&mut self, index: usize);
    /// Indirect call through a scratch register loaded with `addr`.
    fn emit_call_runtime(&mut self, addr: usize);
    /// Load the absolute address of an interned NUL-terminated string.
    fn emit_load_string_ptr(&mut self, ptr: *const c_char);

    fn finish(self: Box<Self>) -> Result<Vec<u8>>;
}

/// Select the encoder for the machine we are running on.
pub fn host_codegen() -> Result<Box<dyn CodeGen>> {
    #[cfg(target_arch = "x86_64")]
    return Ok(Box::new(X86_64CodeGen::new()));
    #[cfg(target_arch = "aarch64")]
    return Ok(Box::new(AArch64CodeGen::new()));
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    bail!("Native code generation is not supported on this architecture")
}

/// Little-endian byte buffer with bookkeeping for forward-branch
/// placeholders. `finish` refuses to hand out code while any placeholder is
/// still unpatched.
pub(crate) struct CodeBuffer {
    bytes: Vec<u8>,
    pending_fixups: usize,
}

impl CodeBuffer {
    pub(crate) fn new() -> Self {
        Self {
            bytes: Vec::new(),
            pending_fixups: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.bytes.len()
    }

    pub(crate) fn emit8(&mut self, byte: u8) {
        self.bytes.push(byte);
    }

    pub(crate) fn emit32(&mut self, value: u32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn emit64(&mut self, value: u64) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 32-bit placeholder to be patched later; returns its offset.
    pub(crate) fn placeholder32(&mut self, value: u32) -> usize {
        let offset = self.bytes.len();
        self.emit32(value);
        self.pending_fixups += 1;
        offset
    }

    pub(crate) fn patch32(&mut self, offset: usize, value: u32) {
        self.bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        self.pending_fixups -= 1;
    }

    pub(crate) fn read32(&self, offset: usize) -> u32 {
        let mut word = [0u8; 4];
        word.copy_from_slice(&self.bytes[offset..offset + 4]);
        u32::from_le_bytes(word)
    }

    pub(crate) fn finish(self) -> Result<Vec<u8>> {
        if self.pending_fixups != 0 {
            bail!(
                "{} forward branch(es) still reference an unbound label",
                self.pending_fixups
            );
        }
        Ok(self.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_emits_little_endian() {
        let mut buf = CodeBuffer::new();
        buf.emit8(0x55);
        buf.emit32(0x11223344);
        buf.emit64(0x8877665544332211);
        let bytes = buf.finish().expect("finish failed");
        assert_eq!(bytes[0], 0x55);
        assert_eq!(&bytes[1..5], &[0x44, 0x33, 0x22, 0x11]);
        assert_eq!(
            &bytes[5..],
            &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]
        );
    }

    #[test]
    fn finish_rejects_unpatched_placeholder() {
        let mut buf = CodeBuffer::new();
        buf.placeholder32(0);
        let err = buf.finish().expect_err("expected unbound label error");
        assert!(err.to_string().contains("unbound label"));
    }

    #[test]
    fn patched_placeholder_finishes_clean() {
        let mut buf = CodeBuffer::new();
        let offset = buf.placeholder32(0);
        buf.patch32(offset, 0xDEADBEEF);
        let bytes = buf.finish().expect("finish failed");
        assert_eq!(bytes, 0xDEADBEEFu32.to_le_bytes());
    }
}
