//! AAPCS64 encoder.
//!
//! Result register: X0. Secondary register: X9. The argument-array pointer
//! arrives in X0 and is stashed in X19 (callee-saved). Frame layout from X29
//! (equal to SP for the whole body): `[x29]`/`[x29+8]` saved FP/LR,
//! `[x29+16]` saved X19, local slot i at `[x29 + 32 + 8*i]`. Frames small
//! enough for the 7-bit pair-offset use pre/post-indexed `stp`/`ldp`;
//! larger frames bracket plain `stp`/`ldp` with explicit SP adjustment.

use std::ffi::c_char;

use anyhow::Result;

use super::{CodeBuffer, CodeGen, Label};
use crate::ast::{BinaryOperator, UnaryOperator};

const X0: u8 = 0;
const X9: u8 = 9;
const X10: u8 = 10;
const X19: u8 = 19;
const X29: u8 = 29;
const X30: u8 = 30;
const SP: u8 = 31;
const XZR: u8 = 31;

/// Largest pre/post-indexed stp/ldp displacement (signed 7-bit, scaled by 8).
const MAX_PAIR_FRAME: u32 = 504;

/// Condition codes as encoded in the `cond` field.
#[derive(Debug, Clone, Copy)]
enum Cond {
    Eq = 0b0000,
    Ne = 0b0001,
    Ge = 0b1010,
    Lt = 0b1011,
    Gt = 0b1100,
    Le = 0b1101,
}

impl Cond {
    fn invert(self) -> u32 {
        self as u32 ^ 1
    }
}

fn add_reg(rd: u8, rn: u8, rm: u8) -> u32 {
    0x8B00_0000 | (rm as u32) << 16 | (rn as u32) << 5 | rd as u32
}

fn sub_reg(rd: u8, rn: u8, rm: u8) -> u32 {
    0xCB00_0000 | (rm as u32) << 16 | (rn as u32) << 5 | rd as u32
}

fn and_reg(rd: u8, rn: u8, rm: u8) -> u32 {
    0x8A00_0000 | (rm as u32) << 16 | (rn as u32) << 5 | rd as u32
}

fn orr_reg(rd: u8, rn: u8, rm: u8) -> u32 {
    0xAA00_0000 | (rm as u32) << 16 | (rn as u32) << 5 | rd as u32
}

/// mul is madd with xzr addend.
fn mul_reg(rd: u8, rn: u8, rm: u8) -> u32 {
    0x9B00_0000 | (rm as u32) << 16 | (XZR as u32) << 10 | (rn as u32) << 5 | rd as u32
}

fn sdiv(rd: u8, rn: u8, rm: u8) -> u32 {
    0x9AC0_0C00 | (rm as u32) << 16 | (rn as u32) << 5 | rd as u32
}

fn msub(rd: u8, rn: u8, rm: u8, ra: u8) -> u32 {
    0x9B00_8000 | (rm as u32) << 16 | (ra as u32) << 10 | (rn as u32) << 5 | rd as u32
}

/// cmp rn, rm (subs xzr, rn, rm)
fn cmp_reg(rn: u8, rm: u8) -> u32 {
    0xEB00_0000 | (rm as u32) << 16 | (rn as u32) << 5 | XZR as u32
}

/// cmp rn, #imm12 (subs xzr, rn, #imm12)
fn cmp_imm(rn: u8, imm12: u32) -> u32 {
    0xF100_0000 | imm12 << 10 | (rn as u32) << 5 | XZR as u32
}

/// cset rd, cond (csinc rd, xzr, xzr, inverted cond)
fn cset(rd: u8, cond: Cond) -> u32 {
    0x9A80_0400 | (XZR as u32) << 16 | cond.invert() << 12 | (XZR as u32) << 5 | rd as u32
}

/// mov rd, rm (orr rd, xzr, rm)
fn mov_reg(rd: u8, rm: u8) -> u32 {
    orr_reg(rd, XZR, rm)
}

/// ldr rt, [rn, #offset] with the scaled unsigned 12-bit form.
fn ldr_imm(rt: u8, rn: u8, offset: u32) -> u32 {
    0xF940_0000 | (offset / 8) << 10 | (rn as u32) << 5 | rt as u32
}

fn str_imm(rt: u8, rn: u8, offset: u32) -> u32 {
    0xF900_0000 | (offset / 8) << 10 | (rn as u32) << 5 | rt as u32
}

pub struct AArch64CodeGen {
    buf: CodeBuffer,
    frame_size: u32,
}

impl AArch64CodeGen {
    pub fn new() -> Self {
        Self {
            buf: CodeBuffer::new(),
            frame_size: 0,
        }
    }

    fn emit(&mut self, insn: u32) {
        self.buf.emit32(insn);
    }

    fn local_offset(slot: usize) -> u32 {
        32 + 8 * slot as u32
    }

    /// movz/movk chain; always rewrites the full register.
    fn emit_mov_imm64(&mut self, reg: u8, imm: u64) {
        self.emit(0xD280_0000 | ((imm & 0xFFFF) as u32) << 5 | reg as u32);
        if imm > 0xFFFF {
            self.emit(0xF2A0_0000 | (((imm >> 16) & 0xFFFF) as u32) << 5 | reg as u32);
        }
        if imm > 0xFFFF_FFFF {
            self.emit(0xF2C0_0000 | (((imm >> 32) & 0xFFFF) as u32) << 5 | reg as u32);
        }
        if imm > 0xFFFF_FFFF_FFFF {
            self.emit(0xF2E0_0000 | (((imm >> 48) & 0xFFFF) as u32) << 5 | reg as u32);
        }
    }

    fn emit_compare(&mut self, cond: Cond) {
        self.emit(cmp_reg(X9, X0));
        self.emit(cset(X0, cond));
    }

    /// Normalize x9 and x0 to 0/1, then combine.
    fn emit_logical(&mut self, combine: fn(u8, u8, u8) -> u32) {
        self.emit(cmp_imm(X9, 0));
        self.emit(cset(X10, Cond::Ne));
        self.emit(cmp_imm(X0, 0));
        self.emit(cset(X0, Cond::Ne));
        self.emit(combine(X0, X10, X0));
    }

    fn branch_displacement(&self, label: &Label) -> i64 {
        (label.offset as i64 - self.buf.len() as i64) >> 2
    }

    fn emit_branch(&mut self, insn: u32, label: &mut Label, bound_rel_mask: u32, shift: u32) {
        if label.bound {
            let rel = self.branch_displacement(label);
            self.emit(insn | ((rel as u32) & bound_rel_mask) << shift);
        } else {
            let offset = self.buf.placeholder32(insn);
            label.fixups.push(offset);
        }
    }
}

impl Default for AArch64CodeGen {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeGen for AArch64CodeGen {
    fn emit_prologue(&mut self, local_count: usize) {
        self.frame_size = (32 + 8 * local_count as u32 + 15) & !15;

        if self.frame_size <= MAX_PAIR_FRAME {
            // stp x29, x30, [sp, #-frame]!
            let imm7 = ((-(self.frame_size as i32) >> 3) as u32) & 0x7F;
            self.emit(
                0xA980_0000 | imm7 << 15 | (X30 as u32) << 10 | (SP as u32) << 5 | X29 as u32,
            );
        } else {
            // sub sp, sp, #frame; stp x29, x30, [sp]
            self.emit(0xD100_0000 | self.frame_size << 10 | (SP as u32) << 5 | SP as u32);
            self.emit(0xA900_0000 | (X30 as u32) << 10 | (SP as u32) << 5 | X29 as u32);
        }

        // mov x29, sp (add x29, sp, #0)
        self.emit(0x9100_0000 | (SP as u32) << 5 | X29 as u32);
        // str x19, [sp, #16]
        self.emit(str_imm(X19, SP, 16));
        // mov x19, x0 — keep the argument array reachable
        self.emit(mov_reg(X19, X0));

        // str xzr, [x29, #offset] for every local slot
        for slot in 0..local_count {
            self.emit(str_imm(XZR, X29, Self::local_offset(slot)));
        }
    }

    fn emit_epilogue(&mut self) {
        // ldr x19, [sp, #16]
        self.emit(ldr_imm(X19, SP, 16));

        if self.frame_size <= MAX_PAIR_FRAME {
            // ldp x29, x30, [sp], #frame
            let imm7 = (self.frame_size >> 3) & 0x7F;
            self.emit(
                0xA8C0_0000 | imm7 << 15 | (X30 as u32) << 10 | (SP as u32) << 5 | X29 as u32,
            );
        } else {
            // ldp x29, x30, [sp]; add sp, sp, #frame
            self.emit(0xA940_0000 | (X30 as u32) << 10 | (SP as u32) << 5 | X29 as u32);
            self.emit(0x9100_0000 | self.frame_size << 10 | (SP as u32) << 5 | SP as u32);
        }

        // ret
        self.emit(0xD65F_03C0);
    }

    fn emit_load_immediate(&mut self, value: i64) {
        if (0..=0xFFFF).contains(&value) {
            self.emit(0xD280_0000 | (value as u32) << 5 | X0 as u32);
        } else if (-0x10000..0).contains(&value) {
            // movn x0, #!value
            self.emit(0x9280_0000 | ((!value as u64 & 0xFFFF) as u32) << 5 | X0 as u32);
        } else {
            self.emit_mov_imm64(X0, value as u64);
        }
    }

    fn emit_load_bool(&mut self, value: bool) {
        self.emit(0xD280_0000 | (value as u32) << 5 | X0 as u32);
    }

    fn emit_load_local(&mut self, slot: usize) {
        self.emit(ldr_imm(X0, X29, Self::local_offset(slot)));
    }

    fn emit_store_local(&mut self, slot: usize) {
        self.emit(str_imm(X0, X29, Self::local_offset(slot)));
    }

    fn emit_load_arg(&mut self, index: usize) {
        self.emit(ldr_imm(X0, X19, 8 * index as u32));
    }

    fn emit_push(&mut self) {
        // str x0, [sp, #-16]! — keep SP 16-byte aligned
        self.emit(0xF81F_0FE0);
    }

    fn emit_pop(&mut self) {
        // ldr x9, [sp], #16
        self.emit(0xF841_0FE9);
    }

    fn emit_binary(&mut self, op: BinaryOperator) {
        match op {
            BinaryOperator::Add => self.emit(add_reg(X0, X9, X0)),
            BinaryOperator::Sub => self.emit(sub_reg(X0, X9, X0)),
            BinaryOperator::Mul => self.emit(mul_reg(X0, X9, X0)),
            BinaryOperator::Div => self.emit(sdiv(X0, X9, X0)),
            BinaryOperator::Mod => {
                // sdiv x10, x9, x0; msub x0, x10, x0, x9
                self.emit(sdiv(X10, X9, X0));
                self.emit(msub(X0, X10, X0, X9));
            }
            BinaryOperator::Eq => self.emit_compare(Cond::Eq),
            BinaryOperator::Ne => self.emit_compare(Cond::Ne),
            BinaryOperator::Lt => self.emit_compare(Cond::Lt),
            BinaryOperator::Le => self.emit_compare(Cond::Le),
            BinaryOperator::Gt => self.emit_compare(Cond::Gt),
            BinaryOperator::Ge => self.emit_compare(Cond::Ge),
            BinaryOperator::And => self.emit_logical(and_reg),
            BinaryOperator::Or => self.emit_logical(orr_reg),
        }
    }

    fn emit_unary(&mut self, op: UnaryOperator) {
        match op {
            UnaryOperator::Not => {
                self.emit(cmp_imm(X0, 0));
                self.emit(cset(X0, Cond::Eq));
            }
            UnaryOperator::Neg => self.emit(sub_reg(X0, XZR, X0)),
        }
    }

    fn bind_label(&mut self, label: &mut Label) {
        label.offset = self.buf.len();
        label.bound = true;

        for fixup in label.fixups.drain(..) {
            let rel = ((label.offset as i64 - fixup as i64) >> 2) as u32;
            let insn = self.buf.read32(fixup);
            let patched = if insn & 0xFC00_0000 == 0x1400_0000 {
                // b
                insn & 0xFC00_0000 | rel & 0x03FF_FFFF
            } else {
                // cbz / cbnz
                insn & 0xFF00_001F | (rel & 0x7FFFF) << 5
            };
            self.buf.patch32(fixup, patched);
        }
    }

    fn emit_jump(&mut self, label: &mut Label) {
        self.emit_branch(0x1400_0000, label, 0x03FF_FFFF, 0);
    }

    fn emit_jump_if_false(&mut self, label: &mut Label) {
        // cbz x0, label
        self.emit_branch(0xB400_0000 | X0 as u32, label, 0x7FFFF, 5);
    }

    fn emit_jump_if_true(&mut self, label: &mut Label) {
        // cbnz x0, label
        self.emit_branch(0xB500_0000 | X0 as u32, label, 0x7FFFF, 5);
    }

    fn emit_set_call_arg(&mut self, index: usize) {
        if index == 0 || index >= 8 {
            return;
        }
        self.emit(mov_reg(index as u8, X0));
    }

    fn emit_call_runtime(&mut self, addr: usize) {
        self.emit_mov_imm64(X10, addr as u64);
        // blr x10
        self.emit(0xD63F_0000 | (X10 as u32) << 5);
    }

    fn emit_load_string_ptr(&mut self, ptr: *const c_char) {
        self.emit_mov_imm64(X0, ptr as u64);
    }

    fn finish(self: Box<Self>) -> Result<Vec<u8>> {
        self.buf.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(codegen: AArch64CodeGen) -> Vec<u32> {
        let bytes = Box::new(codegen).finish().expect("finish failed");
        bytes
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes(chunk.try_into().expect("4-byte chunk")))
            .collect()
    }

    #[test]
    fn compare_emits_documented_condition_codes() {
        let cases = [
            (BinaryOperator::Eq, 0x9A9F_17E0),
            (BinaryOperator::Ne, 0x9A9F_07E0),
            (BinaryOperator::Lt, 0x9A9F_A7E0),
            (BinaryOperator::Le, 0x9A9F_C7E0),
            (BinaryOperator::Gt, 0x9A9F_D7E0),
            (BinaryOperator::Ge, 0x9A9F_B7E0),
        ];
        for (op, expected_cset) in cases {
            let mut codegen = AArch64CodeGen::new();
            codegen.emit_binary(op);
            let words = words(codegen);
            assert_eq!(words[0], 0xEB00_013F, "cmp x9, x0 for {op:?}");
            assert_eq!(words[1], expected_cset, "cset for {op:?}");
        }
    }

    #[test]
    fn arithmetic_encodings_match_reference() {
        let mut codegen = AArch64CodeGen::new();
        codegen.emit_binary(BinaryOperator::Add);
        codegen.emit_binary(BinaryOperator::Sub);
        codegen.emit_binary(BinaryOperator::Mul);
        codegen.emit_binary(BinaryOperator::Div);
        assert_eq!(
            words(codegen),
            vec![0x8B00_0120, 0xCB00_0120, 0x9B00_7D20, 0x9AC0_0D20]
        );
    }

    #[test]
    fn modulo_uses_msub_with_dividend_addend() {
        let mut codegen = AArch64CodeGen::new();
        codegen.emit_binary(BinaryOperator::Mod);
        // sdiv x10, x9, x0; msub x0, x10, x0, x9
        assert_eq!(words(codegen), vec![0x9AC0_0D2A, 0x9B00_A540]);
    }

    #[test]
    fn push_pop_preserve_alignment() {
        let mut codegen = AArch64CodeGen::new();
        codegen.emit_push();
        codegen.emit_pop();
        assert_eq!(words(codegen), vec![0xF81F_0FE0, 0xF841_0FE9]);
    }

    #[test]
    fn small_prologue_uses_indexed_store_pair() {
        let mut codegen = AArch64CodeGen::new();
        codegen.emit_prologue(1); // frame = 48
        let words = words(codegen);
        // stp x29, x30, [sp, #-48]!
        assert_eq!(words[0], 0xA9BD_7BFD);
        // mov x29, sp
        assert_eq!(words[1], 0x9100_03FD);
        // str x19, [sp, #16]
        assert_eq!(words[2], 0xF900_0BF3);
        // mov x19, x0
        assert_eq!(words[3], 0xAA00_03F3);
        // str xzr, [x29, #32]
        assert_eq!(words[4], 0xF900_13BF);
        assert_eq!(words.len(), 5);
    }

    #[test]
    fn small_epilogue_reverses_prologue() {
        let mut codegen = AArch64CodeGen::new();
        codegen.emit_prologue(1);
        let prologue_len = 5;
        codegen.emit_epilogue();
        let words = words(codegen);
        // ldr x19, [sp, #16]; ldp x29, x30, [sp], #48; ret
        assert_eq!(
            &words[prologue_len..],
            &[0xF940_0BF3, 0xA8C3_7BFD, 0xD65F_03C0]
        );
    }

    #[test]
    fn large_frame_brackets_with_explicit_sp_adjustment() {
        let mut codegen = AArch64CodeGen::new();
        codegen.emit_prologue(100); // frame = 832
        codegen.emit_epilogue();
        let words = words(codegen);
        // sub sp, sp, #832; stp x29, x30, [sp]
        assert_eq!(words[0], 0xD10D_03FF);
        assert_eq!(words[1], 0xA900_7BFD);
        // tail: ldr x19; ldp x29, x30, [sp]; add sp, sp, #832; ret
        let tail = &words[words.len() - 4..];
        assert_eq!(tail, &[0xF940_0BF3, 0xA940_7BFD, 0x910D_03FF, 0xD65F_03C0]);
    }

    #[test]
    fn load_immediate_handles_signed_ranges() {
        let mut codegen = AArch64CodeGen::new();
        codegen.emit_load_immediate(7); // movz x0, #7
        codegen.emit_load_immediate(-1); // movn x0, #0
        codegen.emit_load_immediate(-2); // movn x0, #1
        let words = words(codegen);
        assert_eq!(words, vec![0xD280_00E0, 0x9280_0000, 0x9280_0020]);
    }

    #[test]
    fn forward_conditional_branch_is_patched_on_bind() {
        let mut codegen = AArch64CodeGen::new();
        let mut label = codegen.create_label();
        codegen.emit_jump_if_false(&mut label); // offset 0
        codegen.emit_load_immediate(1); // offset 4
        codegen.bind_label(&mut label); // offset 8 -> rel 2
        let words = words(codegen);
        assert_eq!(words[0], 0xB400_0000 | 2 << 5);
    }

    #[test]
    fn backward_jump_encodes_negative_displacement() {
        let mut codegen = AArch64CodeGen::new();
        let mut label = codegen.create_label();
        codegen.bind_label(&mut label);
        codegen.emit_load_immediate(1); // offset 0
        codegen.emit_jump(&mut label); // offset 4 -> rel -1
        let words = words(codegen);
        assert_eq!(words[1], 0x1400_0000 | 0x03FF_FFFF);
    }

    #[test]
    fn unbound_referenced_label_fails_finish() {
        let mut codegen = AArch64CodeGen::new();
        let mut label = codegen.create_label();
        codegen.emit_jump(&mut label);
        let err = Box::new(codegen).finish().expect_err("expected finish failure");
        assert!(err.to_string().contains("unbound label"));
    }
}
