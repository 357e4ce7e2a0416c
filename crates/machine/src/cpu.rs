//! RV64IM register file and instruction semantics.

use crate::error::{MachineError, Result};
use crate::machine::{Machine, SYSCALL_EBREAK};
use std::fmt;

pub const REG_ZERO: usize = 0;
pub const REG_RA: usize = 1;
pub const REG_SP: usize = 2;
pub const REG_FP: usize = 8;
pub const REG_ARG0: usize = 10;
pub const REG_ARG1: usize = 11;
pub const REG_ARG2: usize = 12;
pub const REG_ARG3: usize = 13;
pub const REG_ARG7: usize = 17;

const ABI_NAMES: [&str; 32] = [
    "zero", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "s0", "s1", "a0", "a1", "a2", "a3", "a4",
    "a5", "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11", "t3", "t4",
    "t5", "t6",
];

/// The integer register file and program counter.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Registers {
    x: [u64; 32],
    pub pc: u64,
}

impl Registers {
    #[inline]
    pub fn get(&self, reg: usize) -> u64 {
        self.x[reg]
    }

    /// Writes `reg`. Writes to `zero` are discarded.
    #[inline]
    pub fn set(&mut self, reg: usize, value: u64) {
        if reg != REG_ZERO {
            self.x[reg] = value;
        }
    }
}

impl fmt::Display for Registers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[pc\t{:08x}] ", self.pc)?;
        for (i, name) in ABI_NAMES.iter().enumerate().skip(1) {
            write!(f, "[{name}\t{:08x}] ", self.x[i])?;
            if i % 5 == 4 {
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

#[inline]
fn sext32(v: u32) -> u64 {
    v as i32 as i64 as u64
}

#[inline]
fn imm_i(insn: u32) -> u64 {
    ((insn as i32) >> 20) as i64 as u64
}

#[inline]
fn imm_s(insn: u32) -> u64 {
    ((((insn & 0xfe00_0000) as i32) >> 20) | ((insn >> 7) & 0x1f) as i32) as i64 as u64
}

#[inline]
fn imm_b(insn: u32) -> u64 {
    let imm = (((insn as i32) >> 31) << 12)
        | (((insn >> 25) & 0x3f) << 5) as i32
        | (((insn >> 8) & 0xf) << 1) as i32
        | (((insn >> 7) & 1) << 11) as i32;
    imm as i64 as u64
}

#[inline]
fn imm_j(insn: u32) -> u64 {
    let imm = (((insn as i32) >> 31) << 20)
        | (((insn >> 21) & 0x3ff) << 1) as i32
        | (((insn >> 20) & 1) << 11) as i32
        | (insn & 0x000f_f000) as i32;
    imm as i64 as u64
}

#[inline]
fn imm_u(insn: u32) -> u64 {
    (insn & 0xffff_f000) as i32 as i64 as u64
}

fn mul_ext(funct3: u32, a: u64, b: u64) -> u64 {
    let (sa, sb) = (a as i64, b as i64);
    match funct3 {
        0 => a.wrapping_mul(b),
        1 => ((i128::from(sa) * i128::from(sb)) >> 64) as u64,
        2 => ((i128::from(sa) * i128::from(b)) >> 64) as u64,
        3 => ((u128::from(a) * u128::from(b)) >> 64) as u64,
        4 if b == 0 => u64::MAX,
        4 => sa.wrapping_div(sb) as u64,
        5 if b == 0 => u64::MAX,
        5 => a / b,
        6 if b == 0 => a,
        6 => sa.wrapping_rem(sb) as u64,
        7 if b == 0 => a,
        _ => a % b,
    }
}

fn mul_ext_w(funct3: u32, a: u64, b: u64) -> Option<u64> {
    let (sa, sb) = (a as i32, b as i32);
    let (ua, ub) = (a as u32, b as u32);
    let v = match funct3 {
        0 => sa.wrapping_mul(sb) as u32,
        4 if sb == 0 => u32::MAX,
        4 => sa.wrapping_div(sb) as u32,
        5 if ub == 0 => u32::MAX,
        5 => ua / ub,
        6 if sb == 0 => ua,
        6 => sa.wrapping_rem(sb) as u32,
        7 if ub == 0 => ua,
        7 => ua % ub,
        _ => return None,
    };
    Some(sext32(v))
}

impl<U> Machine<U> {
    /// Executes a single instruction at the current program counter.
    pub(crate) fn execute(&mut self, insn: u32) -> Result<()> {
        let illegal = MachineError::IllegalInstruction { bits: insn };
        if insn & 3 != 3 {
            return Err(illegal);
        }

        let pc = self.cpu.pc;
        let mut next = pc.wrapping_add(4);
        let rd = ((insn >> 7) & 0x1f) as usize;
        let rs1 = ((insn >> 15) & 0x1f) as usize;
        let rs2 = ((insn >> 20) & 0x1f) as usize;
        let funct3 = (insn >> 12) & 7;
        let funct7 = insn >> 25;
        let a = self.cpu.get(rs1);
        let b = self.cpu.get(rs2);

        match insn & 0x7f {
            // LUI
            0x37 => self.cpu.set(rd, imm_u(insn)),
            // AUIPC
            0x17 => self.cpu.set(rd, pc.wrapping_add(imm_u(insn))),
            // JAL
            0x6f => {
                self.cpu.set(rd, next);
                next = pc.wrapping_add(imm_j(insn));
            }
            // JALR
            0x67 if funct3 == 0 => {
                let target = a.wrapping_add(imm_i(insn)) & !1;
                self.cpu.set(rd, next);
                next = target;
            }
            // BRANCH
            0x63 => {
                let taken = match funct3 {
                    0 => a == b,
                    1 => a != b,
                    4 => (a as i64) < (b as i64),
                    5 => (a as i64) >= (b as i64),
                    6 => a < b,
                    7 => a >= b,
                    _ => return Err(illegal),
                };
                if taken {
                    next = pc.wrapping_add(imm_b(insn));
                }
            }
            // LOAD
            0x03 => {
                let addr = a.wrapping_add(imm_i(insn));
                let mem = &mut self.memory;
                let value = match funct3 {
                    0 => mem.read_u8(addr)? as i8 as i64 as u64,
                    1 => mem.read_u16(addr)? as i16 as i64 as u64,
                    2 => sext32(mem.read_u32(addr)?),
                    3 => mem.read_u64(addr)?,
                    4 => u64::from(mem.read_u8(addr)?),
                    5 => u64::from(mem.read_u16(addr)?),
                    6 => u64::from(mem.read_u32(addr)?),
                    _ => return Err(illegal),
                };
                self.cpu.set(rd, value);
            }
            // STORE
            0x23 => {
                let addr = a.wrapping_add(imm_s(insn));
                let mem = &mut self.memory;
                match funct3 {
                    0 => mem.write_u8(addr, b as u8)?,
                    1 => mem.write_u16(addr, b as u16)?,
                    2 => mem.write_u32(addr, b as u32)?,
                    3 => mem.write_u64(addr, b)?,
                    _ => return Err(illegal),
                }
            }
            // OP-IMM
            0x13 => {
                let imm = imm_i(insn);
                let shamt = (insn >> 20) & 0x3f;
                let value = match funct3 {
                    0 => a.wrapping_add(imm),
                    1 if insn >> 26 == 0 => a << shamt,
                    2 => u64::from((a as i64) < (imm as i64)),
                    3 => u64::from(a < imm),
                    4 => a ^ imm,
                    5 if insn >> 26 == 0 => a >> shamt,
                    5 if insn >> 26 == 0x10 => ((a as i64) >> shamt) as u64,
                    6 => a | imm,
                    7 => a & imm,
                    _ => return Err(illegal),
                };
                self.cpu.set(rd, value);
            }
            // OP-IMM-32
            0x1b => {
                let shamt = (insn >> 20) & 0x1f;
                let value = match (funct3, funct7) {
                    (0, _) => sext32((a as u32).wrapping_add(imm_i(insn) as u32)),
                    (1, 0) => sext32((a as u32) << shamt),
                    (5, 0) => sext32((a as u32) >> shamt),
                    (5, 0x20) => ((a as i32) >> shamt) as i64 as u64,
                    _ => return Err(illegal),
                };
                self.cpu.set(rd, value);
            }
            // OP
            0x33 => {
                let value = match (funct7, funct3) {
                    (0x01, _) => mul_ext(funct3, a, b),
                    (0, 0) => a.wrapping_add(b),
                    (0x20, 0) => a.wrapping_sub(b),
                    (0, 1) => a << (b & 0x3f),
                    (0, 2) => u64::from((a as i64) < (b as i64)),
                    (0, 3) => u64::from(a < b),
                    (0, 4) => a ^ b,
                    (0, 5) => a >> (b & 0x3f),
                    (0x20, 5) => ((a as i64) >> (b & 0x3f)) as u64,
                    (0, 6) => a | b,
                    (0, 7) => a & b,
                    _ => return Err(illegal),
                };
                self.cpu.set(rd, value);
            }
            // OP-32
            0x3b => {
                let (wa, wb) = (a as u32, b as u32);
                let value = match (funct7, funct3) {
                    (0x01, _) => mul_ext_w(funct3, a, b).ok_or(illegal)?,
                    (0, 0) => sext32(wa.wrapping_add(wb)),
                    (0x20, 0) => sext32(wa.wrapping_sub(wb)),
                    (0, 1) => sext32(wa << (wb & 0x1f)),
                    (0, 5) => sext32(wa >> (wb & 0x1f)),
                    (0x20, 5) => ((wa as i32) >> (wb & 0x1f)) as i64 as u64,
                    _ => return Err(illegal),
                };
                self.cpu.set(rd, value);
            }
            // FENCE
            0x0f => {}
            // SYSTEM
            0x73 => {
                self.cpu.pc = next;
                return match insn {
                    0x0000_0073 => {
                        let number = self.cpu.get(REG_ARG7);
                        self.system_call(number)
                    }
                    0x0010_0073 => self.system_call(SYSCALL_EBREAK as u64),
                    _ => {
                        self.cpu.pc = pc;
                        Err(illegal)
                    }
                };
            }
            _ => return Err(illegal),
        }

        self.cpu.pc = next;
        Ok(())
    }
}
