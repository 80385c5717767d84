//! System V AMD64 encoder.
//!
//! Result register: RAX. Secondary register: RBX (callee-saved). The
//! argument-array pointer arrives in RDI and is stashed in R12. Frame layout
//! from RBP: `[rbp]` saved RBP, `[rbp-8]` saved RBX, `[rbp-16]` saved R12,
//! local slot i at `[rbp - (16 + 8*(i+1))]`.

use std::ffi::c_char;

use anyhow::Result;

use super::{CodeBuffer, CodeGen, Label};
use crate::ast::{BinaryOperator, UnaryOperator};

const RAX: u8 = 0;
const RCX: u8 = 1;
const RDX: u8 = 2;
const RSI: u8 = 6;
const RDI: u8 = 7;
const R8: u8 = 8;
const R9: u8 = 9;
const R11: u8 = 11;

const REX_W: u8 = 0x48; // 64-bit operand size
const REX_R: u8 = 0x44; // extends the ModRM reg field
const REX_B: u8 = 0x41; // extends the ModRM r/m or opcode register field

const ARG_REGISTERS: [u8; 6] = [RDI, RSI, RDX, RCX, R8, R9];

pub struct X86_64CodeGen {
    buf: CodeBuffer,
    /// Net `emit_push` count. Expressions never branch, so this is exact at
    /// every emit site; an odd depth means RSP is off 16-byte alignment.
    push_depth: usize,
}

impl X86_64CodeGen {
    pub fn new() -> Self {
        Self {
            buf: CodeBuffer::new(),
            push_depth: 0,
        }
    }

    fn local_offset(slot: usize) -> i32 {
        -(16 + 8 * (slot as i32 + 1))
    }

    /// mov reg, imm — xor for zero, 32-bit mov when the value zero-extends,
    /// movabs otherwise.
    fn emit_mov_reg_imm64(&mut self, reg: u8, imm: u64) {
        if imm == 0 {
            if reg < 8 {
                self.buf.emit8(0x31);
                self.buf.emit8(0xC0 | (reg << 3) | reg);
            } else {
                self.buf.emit8(0x45);
                self.buf.emit8(0x31);
                self.buf.emit8(0xC0 | ((reg - 8) << 3) | (reg - 8));
            }
        } else if imm <= 0xFFFF_FFFF {
            if reg < 8 {
                self.buf.emit8(0xB8 + reg);
            } else {
                self.buf.emit8(REX_B);
                self.buf.emit8(0xB8 + (reg - 8));
            }
            self.buf.emit32(imm as u32);
        } else {
            if reg < 8 {
                self.buf.emit8(REX_W);
                self.buf.emit8(0xB8 + reg);
            } else {
                self.buf.emit8(REX_W | REX_B);
                self.buf.emit8(0xB8 + (reg - 8));
            }
            self.buf.emit64(imm);
        }
    }

    /// mov reg, [rbp + offset]
    fn emit_mov_from_frame(&mut self, reg: u8, offset: i32) {
        let mut rex = REX_W;
        if reg >= 8 {
            rex |= REX_R;
        }
        self.buf.emit8(rex);
        self.buf.emit8(0x8B);
        self.emit_frame_modrm(reg, offset);
    }

    /// mov [rbp + offset], reg
    fn emit_mov_to_frame(&mut self, offset: i32, reg: u8) {
        let mut rex = REX_W;
        if reg >= 8 {
            rex |= REX_R;
        }
        self.buf.emit8(rex);
        self.buf.emit8(0x89);
        self.emit_frame_modrm(reg, offset);
    }

    fn emit_frame_modrm(&mut self, reg: u8, offset: i32) {
        if (-128..=127).contains(&offset) {
            self.buf.emit8(0x45 | ((reg & 7) << 3)); // [rbp + disp8]
            self.buf.emit8(offset as i8 as u8);
        } else {
            self.buf.emit8(0x85 | ((reg & 7) << 3)); // [rbp + disp32]
            self.buf.emit32(offset as u32);
        }
    }

    /// cmp rbx, rax; set<cc> al; movzx rax, al
    fn emit_compare(&mut self, setcc: u8) {
        self.buf.emit8(REX_W);
        self.buf.emit8(0x39);
        self.buf.emit8(0xC3);
        self.buf.emit8(0x0F);
        self.buf.emit8(setcc);
        self.buf.emit8(0xC0);
        self.emit_movzx_rax_al();
    }

    fn emit_movzx_rax_al(&mut self) {
        self.buf.emit8(REX_W);
        self.buf.emit8(0x0F);
        self.buf.emit8(0xB6);
        self.buf.emit8(0xC0);
    }

    /// test rax, rax
    fn emit_test_rax(&mut self) {
        self.buf.emit8(REX_W);
        self.buf.emit8(0x85);
        self.buf.emit8(0xC0);
    }

    /// Normalize rbx and rax to 0/1 and combine with the byte opcode
    /// (`and al, cl` / `or al, cl`).
    fn emit_logical(&mut self, combine_opcode: u8) {
        // test rbx, rbx; setne cl
        self.buf.emit8(REX_W);
        self.buf.emit8(0x85);
        self.buf.emit8(0xDB);
        self.buf.emit8(0x0F);
        self.buf.emit8(0x95);
        self.buf.emit8(0xC1);
        // test rax, rax; setne al
        self.emit_test_rax();
        self.buf.emit8(0x0F);
        self.buf.emit8(0x95);
        self.buf.emit8(0xC0);
        self.buf.emit8(combine_opcode);
        self.buf.emit8(0xC8);
        self.emit_movzx_rax_al();
    }

    /// mov rcx, rax; mov rax, rbx; cqo; idiv rcx — quotient in rax,
    /// remainder in rdx.
    fn emit_divide(&mut self) {
        self.buf.emit8(REX_W);
        self.buf.emit8(0x89);
        self.buf.emit8(0xC1);
        self.buf.emit8(REX_W);
        self.buf.emit8(0x89);
        self.buf.emit8(0xD8);
        self.buf.emit8(REX_W);
        self.buf.emit8(0x99);
        self.buf.emit8(REX_W);
        self.buf.emit8(0xF7);
        self.buf.emit8(0xF9);
    }

    fn emit_branch_target(&mut self, label: &mut Label) {
        if label.bound {
            let rel = label.offset as i64 - (self.buf.len() as i64 + 4);
            self.buf.emit32(rel as i32 as u32);
        } else {
            let offset = self.buf.placeholder32(0);
            label.fixups.push(offset);
        }
    }
}

impl Default for X86_64CodeGen {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeGen for X86_64CodeGen {
    fn emit_prologue(&mut self, local_count: usize) {
        // push rbp; mov rbp, rsp
        self.buf.emit8(0x55);
        self.buf.emit8(REX_W);
        self.buf.emit8(0x89);
        self.buf.emit8(0xE5);

        // push rbx; push r12
        self.buf.emit8(0x53);
        self.buf.emit8(REX_B);
        self.buf.emit8(0x54);

        // mov r12, rdi — keep the argument array reachable
        self.buf.emit8(REX_W | REX_B);
        self.buf.emit8(0x89);
        self.buf.emit8(0xFC);

        let frame_size = ((local_count as i32 * 8) + 15) & !15;
        if frame_size > 0 {
            if frame_size <= 127 {
                self.buf.emit8(REX_W);
                self.buf.emit8(0x83);
                self.buf.emit8(0xEC);
                self.buf.emit8(frame_size as u8);
            } else {
                self.buf.emit8(REX_W);
                self.buf.emit8(0x81);
                self.buf.emit8(0xEC);
                self.buf.emit32(frame_size as u32);
            }
        }

        // mov qword [rbp + offset], 0 for every local slot
        for slot in 0..local_count {
            self.buf.emit8(REX_W);
            self.buf.emit8(0xC7);
            let offset = Self::local_offset(slot);
            if (-128..=127).contains(&offset) {
                self.buf.emit8(0x45);
                self.buf.emit8(offset as i8 as u8);
            } else {
                self.buf.emit8(0x85);
                self.buf.emit32(offset as u32);
            }
            self.buf.emit32(0);
        }
    }

    fn emit_epilogue(&mut self) {
        // lea rsp, [rbp-16]; pop r12; pop rbx; pop rbp; ret
        self.buf.emit8(REX_W);
        self.buf.emit8(0x8D);
        self.buf.emit8(0x65);
        self.buf.emit8(0xF0);
        self.buf.emit8(REX_B);
        self.buf.emit8(0x5C);
        self.buf.emit8(0x5B);
        self.buf.emit8(0x5D);
        self.buf.emit8(0xC3);
    }

    fn emit_load_immediate(&mut self, value: i64) {
        self.emit_mov_reg_imm64(RAX, value as u64);
    }

    fn emit_load_bool(&mut self, value: bool) {
        self.emit_mov_reg_imm64(RAX, value as u64);
    }

    fn emit_load_local(&mut self, slot: usize) {
        self.emit_mov_from_frame(RAX, Self::local_offset(slot));
    }

    fn emit_store_local(&mut self, slot: usize) {
        self.emit_mov_to_frame(Self::local_offset(slot), RAX);
    }

    fn emit_load_arg(&mut self, index: usize) {
        // mov rax, [r12 + index*8]
        self.buf.emit8(REX_W | REX_B);
        self.buf.emit8(0x8B);
        self.buf.emit8(0x44);
        self.buf.emit8(0x24);
        self.buf.emit8((index * 8) as u8);
    }

    fn emit_push(&mut self) {
        self.buf.emit8(0x50); // push rax
        self.push_depth += 1;
    }

    fn emit_pop(&mut self) {
        self.buf.emit8(0x5B); // pop rbx
        self.push_depth -= 1;
    }

    fn emit_binary(&mut self, op: BinaryOperator) {
        match op {
            BinaryOperator::Add => {
                // add rax, rbx
                self.buf.emit8(REX_W);
                self.buf.emit8(0x01);
                self.buf.emit8(0xD8);
            }
            BinaryOperator::Sub => {
                // sub rbx, rax; mov rax, rbx — left minus right
                self.buf.emit8(REX_W);
                self.buf.emit8(0x29);
                self.buf.emit8(0xC3);
                self.buf.emit8(REX_W);
                self.buf.emit8(0x89);
                self.buf.emit8(0xD8);
            }
            BinaryOperator::Mul => {
                // imul rax, rbx
                self.buf.emit8(REX_W);
                self.buf.emit8(0x0F);
                self.buf.emit8(0xAF);
                self.buf.emit8(0xC3);
            }
            BinaryOperator::Div => self.emit_divide(),
            BinaryOperator::Mod => {
                self.emit_divide();
                // mov rax, rdx
                self.buf.emit8(REX_W);
                self.buf.emit8(0x89);
                self.buf.emit8(0xD0);
            }
            BinaryOperator::Eq => self.emit_compare(0x94),
            BinaryOperator::Ne => self.emit_compare(0x95),
            BinaryOperator::Lt => self.emit_compare(0x9C),
            BinaryOperator::Le => self.emit_compare(0x9E),
            BinaryOperator::Gt => self.emit_compare(0x9F),
            BinaryOperator::Ge => self.emit_compare(0x9D),
            BinaryOperator::And => self.emit_logical(0x20),
            BinaryOperator::Or => self.emit_logical(0x08),
        }
    }

    fn emit_unary(&mut self, op: UnaryOperator) {
        match op {
            UnaryOperator::Not => {
                // test rax, rax; sete al; movzx rax, al
                self.emit_test_rax();
                self.buf.emit8(0x0F);
                self.buf.emit8(0x94);
                self.buf.emit8(0xC0);
                self.emit_movzx_rax_al();
            }
            UnaryOperator::Neg => {
                // neg rax
                self.buf.emit8(REX_W);
                self.buf.emit8(0xF7);
                self.buf.emit8(0xD8);
            }
        }
    }

    fn bind_label(&mut self, label: &mut Label) {
        label.offset = self.buf.len();
        label.bound = true;
        for fixup in label.fixups.drain(..) {
            let rel = label.offset as i64 - (fixup as i64 + 4);
            self.buf.patch32(fixup, rel as i32 as u32);
        }
    }

    fn emit_jump(&mut self, label: &mut Label) {
        self.buf.emit8(0xE9); // jmp rel32
        self.emit_branch_target(label);
    }

    fn emit_jump_if_false(&mut self, label: &mut Label) {
        self.emit_test_rax();
        self.buf.emit8(0x0F); // jz rel32
        self.buf.emit8(0x84);
        self.emit_branch_target(label);
    }

    fn emit_jump_if_true(&mut self, label: &mut Label) {
        self.emit_test_rax();
        self.buf.emit8(0x0F); // jnz rel32
        self.buf.emit8(0x85);
        self.emit_branch_target(label);
    }

    fn emit_set_call_arg(&mut self, index: usize) {
        let Some(&reg) = ARG_REGISTERS.get(index) else {
            return;
        };
        if reg < 8 {
            // mov reg, rax
            self.buf.emit8(REX_W);
            self.buf.emit8(0x89);
            self.buf.emit8(0xC0 | reg);
        } else {
            self.buf.emit8(REX_W | REX_B);
            self.buf.emit8(0x89);
            self.buf.emit8(0xC0 | (reg - 8));
        }
    }

    fn emit_call_runtime(&mut self, addr: usize) {
        // An odd number of outstanding pushes leaves RSP 8 bytes off the
        // 16-byte boundary the ABI requires at a call.
        let misaligned = self.push_depth % 2 != 0;
        if misaligned {
            // sub rsp, 8
            self.buf.emit8(REX_W);
            self.buf.emit8(0x83);
            self.buf.emit8(0xEC);
            self.buf.emit8(0x08);
        }

        // movabs r11, addr; call r11
        self.buf.emit8(REX_W | REX_B);
        self.buf.emit8(0xB8 + (R11 - 8));
        self.buf.emit64(addr as u64);
        self.buf.emit8(0x41);
        self.buf.emit8(0xFF);
        self.buf.emit8(0xD3);

        if misaligned {
            // add rsp, 8
            self.buf.emit8(REX_W);
            self.buf.emit8(0x83);
            self.buf.emit8(0xC4);
            self.buf.emit8(0x08);
        }
    }

    fn emit_load_string_ptr(&mut self, ptr: *const c_char) {
        self.emit_mov_reg_imm64(RAX, ptr as u64);
    }

    fn finish(self: Box<Self>) -> Result<Vec<u8>> {
        self.buf.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finish(codegen: X86_64CodeGen) -> Vec<u8> {
        Box::new(codegen).finish().expect("finish failed")
    }

    #[test]
    fn prologue_saves_frame_and_zeroes_locals() {
        let mut codegen = X86_64CodeGen::new();
        codegen.emit_prologue(1);
        let code = finish(codegen);
        let expected = [
            0x55, // push rbp
            0x48, 0x89, 0xE5, // mov rbp, rsp
            0x53, // push rbx
            0x41, 0x54, // push r12
            0x49, 0x89, 0xFC, // mov r12, rdi
            0x48, 0x83, 0xEC, 0x10, // sub rsp, 16
            0x48, 0xC7, 0x45, 0xE8, 0x00, 0x00, 0x00, 0x00, // mov qword [rbp-24], 0
        ];
        assert_eq!(code, expected);
    }

    #[test]
    fn epilogue_restores_saved_registers() {
        let mut codegen = X86_64CodeGen::new();
        codegen.emit_epilogue();
        assert_eq!(
            finish(codegen),
            [0x48, 0x8D, 0x65, 0xF0, 0x41, 0x5C, 0x5B, 0x5D, 0xC3]
        );
    }

    #[test]
    fn load_immediate_picks_shortest_encoding() {
        let mut codegen = X86_64CodeGen::new();
        codegen.emit_load_immediate(0);
        codegen.emit_load_immediate(7);
        codegen.emit_load_immediate(-1);
        let code = finish(codegen);
        assert_eq!(&code[..2], &[0x31, 0xC0]); // xor eax, eax
        assert_eq!(&code[2..7], &[0xB8, 0x07, 0x00, 0x00, 0x00]); // mov eax, 7
        assert_eq!(&code[7..9], &[0x48, 0xB8]); // movabs rax, -1
        assert_eq!(&code[9..17], &[0xFF; 8]);
    }

    #[test]
    fn sub_computes_left_minus_right() {
        let mut codegen = X86_64CodeGen::new();
        codegen.emit_binary(BinaryOperator::Sub);
        // sub rbx, rax; mov rax, rbx
        assert_eq!(finish(codegen), [0x48, 0x29, 0xC3, 0x48, 0x89, 0xD8]);
    }

    #[test]
    fn local_beyond_disp8_uses_disp32() {
        let mut codegen = X86_64CodeGen::new();
        codegen.emit_load_local(20); // offset -184
        let code = finish(codegen);
        assert_eq!(&code[..3], &[0x48, 0x8B, 0x85]);
        assert_eq!(&code[3..], &(-184i32).to_le_bytes());
    }

    #[test]
    fn forward_jump_is_patched_on_bind() {
        let mut codegen = X86_64CodeGen::new();
        let mut label = codegen.create_label();
        codegen.emit_jump(&mut label); // 5 bytes
        codegen.emit_load_immediate(7); // 5 bytes
        codegen.bind_label(&mut label);
        let code = finish(codegen);
        assert_eq!(code[0], 0xE9);
        assert_eq!(&code[1..5], &5i32.to_le_bytes()); // skip the mov
    }

    #[test]
    fn backward_jump_encodes_immediately() {
        let mut codegen = X86_64CodeGen::new();
        let mut label = codegen.create_label();
        codegen.bind_label(&mut label);
        codegen.emit_jump(&mut label);
        let code = finish(codegen);
        assert_eq!(code[0], 0xE9);
        assert_eq!(&code[1..5], &(-5i32).to_le_bytes());
    }

    #[test]
    fn unbound_referenced_label_fails_finish() {
        let mut codegen = X86_64CodeGen::new();
        let mut label = codegen.create_label();
        codegen.emit_jump_if_false(&mut label);
        let err = Box::new(codegen).finish().expect_err("expected finish failure");
        assert!(err.to_string().contains("unbound label"));
    }

    #[test]
    fn runtime_call_repads_stack_under_odd_push_depth() {
        let mut aligned = X86_64CodeGen::new();
        aligned.emit_call_runtime(0x1122334455667788);
        let aligned = finish(aligned);
        assert_eq!(&aligned[..2], &[0x49, 0xBB]); // movabs r11, addr
        assert_eq!(&aligned[10..], &[0x41, 0xFF, 0xD3]); // call r11

        let mut odd = X86_64CodeGen::new();
        odd.emit_push();
        odd.emit_call_runtime(0x1122334455667788);
        let odd = finish(odd);
        assert_eq!(&odd[1..5], &[0x48, 0x83, 0xEC, 0x08]); // sub rsp, 8
        assert_eq!(&odd[odd.len() - 4..], &[0x48, 0x83, 0xC4, 0x08]); // add rsp, 8
    }

    #[test]
    fn set_call_arg_targets_sysv_registers() {
        let mut codegen = X86_64CodeGen::new();
        codegen.emit_set_call_arg(0); // rdi
        codegen.emit_set_call_arg(4); // r8
        assert_eq!(finish(codegen), [0x48, 0x89, 0xC7, 0x49, 0x89, 0xC0]);
    }
}
