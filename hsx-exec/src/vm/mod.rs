//! MiniVM core.
//!
//! Executes exactly one instruction per call over the arena, using the
//! active task's register window. PC is post-incremented: by the time an
//! instruction's effect applies (including SVC and BRK), the window's PC
//! already addresses the following instruction, and branch displacements
//! are relative to that address.
//!
//! Flag convention: Z/N track every ALU result; C holds the carry out of
//! additions and the *not-borrow* of subtractions; V is signed overflow.
//! Shifts put the last bit shifted out in C. Loads, stores, moves, and
//! stack operations leave the PSW alone.

pub mod disasm;

use thiserror::Error;

use hsx_abi::f16;
use hsx_abi::isa::{self, MODE_IMM, MODE_REG, Opcode, PSW_C, PSW_N, PSW_V, PSW_Z};

use crate::arena::{Arena, ArenaError};
use crate::task::RegWindow;

/// Fatal VM faults. The owning task transitions to Faulted; the executive
/// never retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VmFault {
    #[error(transparent)]
    Memory(#[from] ArenaError),
    #[error("divide by zero at {pc:#x}")]
    DivideByZero { pc: u32 },
    #[error("unknown or malformed opcode {word:#06x} at {pc:#x}")]
    UnknownOpcode { pc: u32, word: u16 },
    #[error("stack overflow: sp would fall below {limit:#x}")]
    StackOverflow { sp: u32, limit: u32 },
    #[error("stack underflow: sp would rise above {base:#x}")]
    StackUnderflow { sp: u32, base: u32 },
}

/// Changed-state mask bits beyond R0..R15.
pub const CHANGED_PC: u32 = 1 << 16;
pub const CHANGED_SP: u32 = 1 << 17;
pub const CHANGED_PSW: u32 = 1 << 18;

/// A decoded instruction.
#[derive(Debug, Clone, Copy)]
pub struct Instr {
    pub op: Opcode,
    pub mode: u16,
    pub rd: u8,
    pub rs: u8,
    pub ext: Option<u16>,
    /// Encoded size in bytes (2, or 4 with an extension word).
    pub size: u32,
}

/// Where control goes after an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Next,
    Jump(u32),
    Svc { module: u8, function: u8 },
    Brk,
}

/// Result of executing one instruction.
#[derive(Debug, Clone, Copy)]
pub struct Executed {
    pub control: Control,
    /// Bitmask over R0..R15 plus [`CHANGED_PC`]/[`CHANGED_SP`]/[`CHANGED_PSW`].
    pub changed: u32,
}

/// Fetch and decode the instruction at `pc`.
pub fn decode(arena: &Arena, pc: u32) -> Result<Instr, VmFault> {
    let word = arena.read_u16(pc)?;
    let (opbits, mode, rd, rs) = isa::split(word);
    let op = Opcode::from_u8(opbits).ok_or(VmFault::UnknownOpcode { pc, word })?;
    // SVC carries its (module, function) pair in the extension word.
    if op == Opcode::Svc && mode != MODE_IMM {
        return Err(VmFault::UnknownOpcode { pc, word });
    }
    if mode != MODE_REG && mode != MODE_IMM {
        return Err(VmFault::UnknownOpcode { pc, word });
    }
    if mode == MODE_IMM {
        let ext = arena.read_u16(pc + 2)?;
        Ok(Instr {
            op,
            mode,
            rd,
            rs,
            ext: Some(ext),
            size: 4,
        })
    } else {
        Ok(Instr {
            op,
            mode,
            rd,
            rs,
            ext: None,
            size: 2,
        })
    }
}

struct Cpu<'a> {
    arena: &'a mut Arena,
    window: RegWindow,
    stack_base: u32,
    stack_limit: u32,
    changed: u32,
}

impl Cpu<'_> {
    fn reg(&self, idx: u8) -> u32 {
        self.window.reg(self.arena, idx)
    }

    fn set_reg(&mut self, idx: u8, value: u32) {
        self.window.set_reg(self.arena, idx, value);
        self.changed |= 1 << idx;
    }

    fn psw(&self) -> u32 {
        self.window.psw(self.arena)
    }

    fn set_psw(&mut self, value: u32) {
        if value != self.psw() {
            self.window.set_psw(self.arena, value);
            self.changed |= CHANGED_PSW;
        }
    }

    fn set_flags(&mut self, z: bool, n: bool, c: bool, v: bool) {
        let mut psw = 0;
        if z {
            psw |= PSW_Z;
        }
        if n {
            psw |= PSW_N;
        }
        if c {
            psw |= PSW_C;
        }
        if v {
            psw |= PSW_V;
        }
        self.set_psw(psw);
    }

    fn flags_zn(&mut self, result: u32) {
        self.set_flags(result == 0, result & 0x8000_0000 != 0, false, false);
    }

    fn flags_add(&mut self, a: u32, b: u32, result: u64) {
        let res = result as u32;
        let v = ((a ^ res) & (b ^ res)) & 0x8000_0000 != 0;
        self.set_flags(res == 0, res & 0x8000_0000 != 0, result > u32::MAX as u64, v);
    }

    fn flags_sub(&mut self, a: u32, b: u32, res: u32, borrow: bool) {
        let v = ((a ^ b) & (a ^ res)) & 0x8000_0000 != 0;
        self.set_flags(res == 0, res & 0x8000_0000 != 0, !borrow, v);
    }

    fn push(&mut self, value: u32) -> Result<(), VmFault> {
        let sp = self.window.sp(self.arena);
        let new_sp = sp.wrapping_sub(4);
        if new_sp < self.stack_limit || new_sp > sp {
            return Err(VmFault::StackOverflow {
                sp: new_sp,
                limit: self.stack_limit,
            });
        }
        self.arena.write_u32(new_sp, value)?;
        self.window.set_sp(self.arena, new_sp);
        self.changed |= CHANGED_SP;
        Ok(())
    }

    fn pop(&mut self) -> Result<u32, VmFault> {
        let sp = self.window.sp(self.arena);
        if sp + 4 > self.stack_base {
            return Err(VmFault::StackUnderflow {
                sp,
                base: self.stack_base,
            });
        }
        let value = self.arena.read_u32(sp)?;
        self.window.set_sp(self.arena, sp + 4);
        self.changed |= CHANGED_SP;
        Ok(value)
    }
}

/// Execute one decoded instruction. On success the window's PC has been
/// advanced (or retargeted); on fault nothing further should run on this
/// task.
pub fn execute(
    arena: &mut Arena,
    window: RegWindow,
    stack_base: u32,
    stack_limit: u32,
    instr: Instr,
    pc: u32,
) -> Result<Executed, VmFault> {
    let next_pc = pc + instr.size;
    let mut cpu = Cpu {
        arena,
        window,
        stack_base,
        stack_limit,
        changed: 0,
    };

    // Second operand: register or zero-extended immediate. Branch targets
    // sign-extend the displacement instead.
    let src = match instr.ext {
        Some(imm) => imm as u32,
        None => cpu.reg(instr.rs),
    };
    let branch_target = || -> u32 {
        match instr.ext {
            Some(imm) => next_pc.wrapping_add(imm as i16 as i32 as u32),
            None => src,
        }
    };

    let mut control = Control::Next;
    match instr.op {
        Opcode::Nop => {}
        Opcode::Mov => cpu.set_reg(instr.rd, src),
        Opcode::Movt => {
            let low = cpu.reg(instr.rd) & 0xFFFF;
            cpu.set_reg(instr.rd, (src << 16) | low);
        }

        Opcode::Ldb | Opcode::Ldh | Opcode::Ldw => {
            let base = cpu.reg(instr.rs);
            let addr = match instr.ext {
                Some(off) => base.wrapping_add(off as u32),
                None => base,
            };
            let value = match instr.op {
                Opcode::Ldb => cpu.arena.read_u8(addr)? as u32,
                Opcode::Ldh => cpu.arena.read_u16(addr)? as u32,
                _ => cpu.arena.read_u32(addr)?,
            };
            cpu.set_reg(instr.rd, value);
        }
        Opcode::Stb | Opcode::Sth | Opcode::Stw => {
            let base = cpu.reg(instr.rd);
            let addr = match instr.ext {
                Some(off) => base.wrapping_add(off as u32),
                None => base,
            };
            let value = cpu.reg(instr.rs);
            match instr.op {
                Opcode::Stb => cpu.arena.write_u8(addr, value as u8)?,
                Opcode::Sth => cpu.arena.write_u16(addr, value as u16)?,
                _ => cpu.arena.write_u32(addr, value)?,
            }
        }

        Opcode::Add | Opcode::Adc => {
            let a = cpu.reg(instr.rd);
            let carry = if instr.op == Opcode::Adc && cpu.psw() & PSW_C != 0 {
                1u64
            } else {
                0
            };
            let wide = a as u64 + src as u64 + carry;
            cpu.set_reg(instr.rd, wide as u32);
            cpu.flags_add(a, src, wide);
        }
        Opcode::Sub | Opcode::Sbc => {
            let a = cpu.reg(instr.rd);
            let borrow_in = if instr.op == Opcode::Sbc && cpu.psw() & PSW_C == 0 {
                1u32
            } else {
                0
            };
            let (r1, b1) = a.overflowing_sub(src);
            let (res, b2) = r1.overflowing_sub(borrow_in);
            cpu.set_reg(instr.rd, res);
            cpu.flags_sub(a, src, res, b1 || b2);
        }
        Opcode::And | Opcode::Or | Opcode::Xor => {
            let a = cpu.reg(instr.rd);
            let res = match instr.op {
                Opcode::And => a & src,
                Opcode::Or => a | src,
                _ => a ^ src,
            };
            cpu.set_reg(instr.rd, res);
            cpu.flags_zn(res);
        }
        Opcode::Lsl | Opcode::Lsr | Opcode::Asr => {
            let a = cpu.reg(instr.rd);
            let shift = src & 31;
            let (res, carry) = match instr.op {
                Opcode::Lsl => (
                    a.checked_shl(shift).unwrap_or(0),
                    shift != 0 && a >> (32 - shift) & 1 != 0,
                ),
                Opcode::Lsr => (
                    a.checked_shr(shift).unwrap_or(0),
                    shift != 0 && a >> (shift - 1) & 1 != 0,
                ),
                _ => (
                    ((a as i32) >> shift) as u32,
                    shift != 0 && a >> (shift - 1) & 1 != 0,
                ),
            };
            cpu.set_reg(instr.rd, res);
            cpu.set_flags(res == 0, res & 0x8000_0000 != 0, carry, false);
        }
        Opcode::Not => {
            let res = !src;
            cpu.set_reg(instr.rd, res);
            cpu.flags_zn(res);
        }
        Opcode::Mul => {
            let res = cpu.reg(instr.rd).wrapping_mul(src);
            cpu.set_reg(instr.rd, res);
            cpu.flags_zn(res);
        }
        Opcode::Div => {
            if src == 0 {
                return Err(VmFault::DivideByZero { pc });
            }
            let res = cpu.reg(instr.rd) / src;
            cpu.set_reg(instr.rd, res);
            cpu.flags_zn(res);
        }
        Opcode::Cmp => {
            let a = cpu.reg(instr.rd);
            let (res, borrow) = a.overflowing_sub(src);
            cpu.flags_sub(a, src, res, borrow);
        }

        Opcode::Br => control = Control::Jump(branch_target()),
        Opcode::Brz => {
            if cpu.psw() & PSW_Z != 0 {
                control = Control::Jump(branch_target());
            }
        }
        Opcode::Brnz => {
            if cpu.psw() & PSW_Z == 0 {
                control = Control::Jump(branch_target());
            }
        }
        Opcode::Call => {
            let target = branch_target();
            cpu.push(next_pc)?;
            control = Control::Jump(target);
        }
        Opcode::Ret => {
            let target = cpu.pop()?;
            control = Control::Jump(target);
        }
        Opcode::Push => {
            let value = cpu.reg(instr.rs);
            cpu.push(value)?;
        }
        Opcode::Pop => {
            let value = cpu.pop()?;
            cpu.set_reg(instr.rd, value);
        }

        Opcode::Fadd | Opcode::Fsub | Opcode::Fmul | Opcode::Fdiv => {
            let a = f16::to_f32(cpu.reg(instr.rd) as u16);
            let b = f16::to_f32(src as u16);
            let wide = match instr.op {
                Opcode::Fadd => a + b,
                Opcode::Fsub => a - b,
                Opcode::Fmul => a * b,
                _ => a / b,
            };
            let bits = f16::from_f32(wide);
            cpu.set_reg(instr.rd, bits as u32);
            cpu.set_flags(bits & 0x7FFF == 0, bits & 0x8000 != 0, false, false);
        }
        Opcode::Fpext => {
            let wide = f16::to_f32(cpu.reg(instr.rs) as u16);
            cpu.set_reg(instr.rd, wide.to_bits());
        }
        Opcode::Fptrunc => {
            let narrow = f16::from_f32(f32::from_bits(cpu.reg(instr.rs)));
            cpu.set_reg(instr.rd, narrow as u32);
        }

        Opcode::Svc => {
            let (module, function) = hsx_abi::svc_split(instr.ext.expect("SVC decodes with ext"));
            control = Control::Svc { module, function };
        }
        Opcode::Brk => control = Control::Brk,
    }

    // Commit PC: post-increment, or the branch target. SVC and BRK leave
    // the window addressing the following instruction.
    match control {
        Control::Jump(target) => {
            cpu.window.set_pc(cpu.arena, target);
            cpu.changed |= CHANGED_PC;
        }
        _ => cpu.window.set_pc(cpu.arena, next_pc),
    }

    Ok(Executed {
        control,
        changed: cpu.changed,
    })
}

/// Register names for a changed-state mask, for `trace_step` events.
pub fn changed_reg_names(changed: u32, jumped: bool) -> Vec<String> {
    let mut names = Vec::new();
    for i in 0..16 {
        if changed & (1 << i) != 0 {
            names.push(format!("R{i}"));
        }
    }
    if changed & CHANGED_SP != 0 {
        names.push("SP".into());
    }
    if changed & CHANGED_PSW != 0 {
        names.push("PSW".into());
    }
    if jumped {
        names.push("PC".into());
    }
    names
}
