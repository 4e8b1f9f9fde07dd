//! Instruction formatter for the `disasm.at` RPC.

use hsx_abi::isa::{MODE_IMM, Opcode};

use crate::arena::Arena;
use crate::vm::{self, Instr};

/// One formatted line.
#[derive(Debug, Clone)]
pub struct Line {
    pub addr: u32,
    pub word: u16,
    pub text: String,
    pub size: u32,
}

/// Disassemble one instruction; undecodable words render as `.word`.
pub fn line_at(arena: &Arena, addr: u32) -> Line {
    let word = arena.read_u16(addr).unwrap_or(0);
    match vm::decode(arena, addr) {
        Ok(instr) => Line {
            addr,
            word,
            text: format_instr(&instr, addr),
            size: instr.size,
        },
        Err(_) => Line {
            addr,
            word,
            text: format!(".word {word:#06x}"),
            size: 2,
        },
    }
}

/// Disassemble `count` consecutive instructions starting at `addr`.
pub fn lines_at(arena: &Arena, addr: u32, count: usize) -> Vec<Line> {
    let mut lines = Vec::with_capacity(count);
    let mut at = addr;
    for _ in 0..count {
        let line = line_at(arena, at);
        at += line.size;
        lines.push(line);
    }
    lines
}

fn format_instr(instr: &Instr, addr: u32) -> String {
    let m = instr.op.mnemonic();
    let rd = instr.rd;
    let rs = instr.rs;
    let next = addr + instr.size;
    match instr.op {
        Opcode::Nop | Opcode::Ret | Opcode::Brk => m.to_string(),
        Opcode::Svc => {
            let imm = instr.ext.unwrap_or(0);
            let (module, function) = hsx_abi::svc_split(imm);
            format!("{m} {module:#04x}:{function:#04x}")
        }
        Opcode::Br | Opcode::Brz | Opcode::Brnz | Opcode::Call => match instr.ext {
            Some(imm) => {
                let target = next.wrapping_add(imm as i16 as i32 as u32);
                format!("{m} {target:#x}")
            }
            None => format!("{m} R{rs}"),
        },
        Opcode::Ldb | Opcode::Ldh | Opcode::Ldw => match instr.ext {
            Some(off) => format!("{m} R{rd}, [R{rs}+{off:#x}]"),
            None => format!("{m} R{rd}, [R{rs}]"),
        },
        Opcode::Stb | Opcode::Sth | Opcode::Stw => match instr.ext {
            Some(off) => format!("{m} [R{rd}+{off:#x}], R{rs}"),
            None => format!("{m} [R{rd}], R{rs}"),
        },
        Opcode::Push => format!("{m} R{rs}"),
        Opcode::Pop => format!("{m} R{rd}"),
        _ => {
            if instr.mode == MODE_IMM {
                format!("{m} R{rd}, #{}", instr.ext.unwrap_or(0))
            } else {
                format!("{m} R{rd}, R{rs}")
            }
        }
    }
}
