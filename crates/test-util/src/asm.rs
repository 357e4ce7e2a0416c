//! A tiny RV64IM assembler for building test guests.

use std::collections::HashMap;

/// Address the assembled image is linked at.
pub const TEXT_BASE: u64 = 0x10000;

pub const ZERO: u32 = 0;
pub const RA: u32 = 1;
pub const SP: u32 = 2;
pub const FP: u32 = 8;
pub const T0: u32 = 5;
pub const T1: u32 = 6;
pub const T2: u32 = 7;
pub const A0: u32 = 10;
pub const A1: u32 = 11;
pub const A2: u32 = 12;
pub const A3: u32 = 13;
pub const A4: u32 = 14;
pub const A7: u32 = 17;
pub const T3: u32 = 28;

#[derive(Debug)]
enum Fixup {
    Branch { funct3: u32, rs1: u32, rs2: u32 },
    Jal { rd: u32 },
    PcRel { rd: u32 },
    Abs64,
}

/// Accumulates instructions and data, resolving label references when
/// [`Assembler::finish`] is called.
#[derive(Debug, Default)]
pub struct Assembler {
    code: Vec<u8>,
    labels: HashMap<String, u64>,
    order: Vec<String>,
    fixups: Vec<(usize, String, Fixup)>,
}

/// The output of the assembler: an image linked at [`TEXT_BASE`] and its
/// labels in definition order.
#[derive(Debug, Clone)]
pub struct Assembled {
    pub code: Vec<u8>,
    pub symbols: Vec<(String, u64, u64)>,
}

fn r_type(funct7: u32, rs2: u32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
    funct7 << 25 | rs2 << 20 | rs1 << 15 | funct3 << 12 | rd << 7 | opcode
}

fn i_type(imm: i32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
    ((imm as u32) & 0xfff) << 20 | rs1 << 15 | funct3 << 12 | rd << 7 | opcode
}

fn s_type(imm: i32, rs2: u32, rs1: u32, funct3: u32) -> u32 {
    let imm = imm as u32;
    ((imm >> 5) & 0x7f) << 25 | rs2 << 20 | rs1 << 15 | funct3 << 12 | (imm & 0x1f) << 7 | 0x23
}

fn b_type(imm: i32, rs2: u32, rs1: u32, funct3: u32) -> u32 {
    let imm = imm as u32;
    ((imm >> 12) & 1) << 31
        | ((imm >> 5) & 0x3f) << 25
        | rs2 << 20
        | rs1 << 15
        | funct3 << 12
        | ((imm >> 1) & 0xf) << 8
        | ((imm >> 11) & 1) << 7
        | 0x63
}

fn j_type(imm: i32, rd: u32) -> u32 {
    let imm = imm as u32;
    ((imm >> 20) & 1) << 31
        | ((imm >> 1) & 0x3ff) << 21
        | ((imm >> 11) & 1) << 20
        | ((imm >> 12) & 0xff) << 12
        | rd << 7
        | 0x6f
}

fn fits_i12(v: i64) -> bool {
    (-2048..2048).contains(&v)
}

impl Assembler {
    pub fn new() -> Assembler {
        Assembler::default()
    }

    /// Current address.
    pub fn here(&self) -> u64 {
        TEXT_BASE + self.code.len() as u64
    }

    /// Defines `name` at the current address.
    pub fn label(&mut self, name: &str) {
        let prev = self.labels.insert(name.to_string(), self.here());
        assert!(prev.is_none(), "label {name} defined twice");
        self.order.push(name.to_string());
    }

    pub fn word(&mut self, insn: u32) {
        self.code.extend_from_slice(&insn.to_le_bytes());
    }

    pub fn bytes(&mut self, data: &[u8]) {
        self.code.extend_from_slice(data);
    }

    pub fn dword(&mut self, v: u64) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    /// Emits the absolute address of `label` as a 64-bit word.
    pub fn dword_label(&mut self, label: &str) {
        self.fixups
            .push((self.code.len(), label.to_string(), Fixup::Abs64));
        self.dword(0);
    }

    pub fn zeros(&mut self, len: usize) {
        self.code.resize(self.code.len() + len, 0);
    }

    /// Pads with zeroes up to a multiple of `align` bytes.
    pub fn align(&mut self, align: usize) {
        while self.code.len() % align != 0 {
            self.code.push(0);
        }
    }

    pub fn add(&mut self, rd: u32, rs1: u32, rs2: u32) {
        self.word(r_type(0, rs2, rs1, 0, rd, 0x33));
    }

    pub fn sub(&mut self, rd: u32, rs1: u32, rs2: u32) {
        self.word(r_type(0x20, rs2, rs1, 0, rd, 0x33));
    }

    pub fn mul(&mut self, rd: u32, rs1: u32, rs2: u32) {
        self.word(r_type(1, rs2, rs1, 0, rd, 0x33));
    }

    pub fn addi(&mut self, rd: u32, rs1: u32, imm: i32) {
        assert!(fits_i12(imm.into()), "immediate {imm} out of range");
        self.word(i_type(imm, rs1, 0, rd, 0x13));
    }

    pub fn addiw(&mut self, rd: u32, rs1: u32, imm: i32) {
        assert!(fits_i12(imm.into()), "immediate {imm} out of range");
        self.word(i_type(imm, rs1, 0, rd, 0x1b));
    }

    pub fn mv(&mut self, rd: u32, rs: u32) {
        self.addi(rd, rs, 0);
    }

    pub fn lui(&mut self, rd: u32, imm20: u32) {
        self.word((imm20 << 12) | rd << 7 | 0x37);
    }

    /// Loads a constant that fits in 32 signed bits.
    pub fn li(&mut self, rd: u32, imm: i64) {
        if fits_i12(imm) {
            self.addi(rd, ZERO, imm as i32);
            return;
        }
        assert!(
            i32::try_from(imm).is_ok(),
            "li only supports 32-bit constants"
        );
        let lo = ((imm << 52) >> 52) as i32;
        let hi = ((imm - i64::from(lo)) >> 12) as u32 & 0xfffff;
        self.lui(rd, hi);
        if lo != 0 {
            self.addiw(rd, rd, lo);
        }
    }

    /// Loads the address of `label` pc-relatively.
    pub fn la(&mut self, rd: u32, label: &str) {
        self.fixups
            .push((self.code.len(), label.to_string(), Fixup::PcRel { rd }));
        self.word(0);
        self.word(0);
    }

    pub fn ld(&mut self, rd: u32, rs1: u32, offset: i32) {
        self.word(i_type(offset, rs1, 3, rd, 0x03));
    }

    pub fn lw(&mut self, rd: u32, rs1: u32, offset: i32) {
        self.word(i_type(offset, rs1, 2, rd, 0x03));
    }

    pub fn lbu(&mut self, rd: u32, rs1: u32, offset: i32) {
        self.word(i_type(offset, rs1, 4, rd, 0x03));
    }

    pub fn sd(&mut self, rs2: u32, rs1: u32, offset: i32) {
        self.word(s_type(offset, rs2, rs1, 3));
    }

    pub fn sw(&mut self, rs2: u32, rs1: u32, offset: i32) {
        self.word(s_type(offset, rs2, rs1, 2));
    }

    pub fn sb(&mut self, rs2: u32, rs1: u32, offset: i32) {
        self.word(s_type(offset, rs2, rs1, 0));
    }

    fn branch(&mut self, funct3: u32, rs1: u32, rs2: u32, label: &str) {
        self.fixups.push((
            self.code.len(),
            label.to_string(),
            Fixup::Branch { funct3, rs1, rs2 },
        ));
        self.word(0);
    }

    pub fn beq(&mut self, rs1: u32, rs2: u32, label: &str) {
        self.branch(0, rs1, rs2, label);
    }

    pub fn bne(&mut self, rs1: u32, rs2: u32, label: &str) {
        self.branch(1, rs1, rs2, label);
    }

    pub fn blt(&mut self, rs1: u32, rs2: u32, label: &str) {
        self.branch(4, rs1, rs2, label);
    }

    pub fn bge(&mut self, rs1: u32, rs2: u32, label: &str) {
        self.branch(5, rs1, rs2, label);
    }

    pub fn jal(&mut self, rd: u32, label: &str) {
        self.fixups
            .push((self.code.len(), label.to_string(), Fixup::Jal { rd }));
        self.word(0);
    }

    pub fn jalr(&mut self, rd: u32, rs1: u32, offset: i32) {
        self.word(i_type(offset, rs1, 0, rd, 0x67));
    }

    pub fn j(&mut self, label: &str) {
        self.jal(ZERO, label);
    }

    pub fn call(&mut self, label: &str) {
        self.jal(RA, label);
    }

    pub fn ret(&mut self) {
        self.jalr(ZERO, RA, 0);
    }

    pub fn ecall(&mut self) {
        self.word(0x0000_0073);
    }

    pub fn ebreak(&mut self) {
        self.word(0x0010_0073);
    }

    /// `li a7, number; ecall`
    pub fn syscall(&mut self, number: i64) {
        self.li(A7, number);
        self.ecall();
    }

    /// Address of a label defined so far.
    pub fn address_of(&self, label: &str) -> Option<u64> {
        self.labels.get(label).copied()
    }

    /// Resolves all label references. Panics on undefined labels.
    pub fn finish(mut self) -> Assembled {
        for (offset, label, fixup) in std::mem::take(&mut self.fixups) {
            let target = *self
                .labels
                .get(&label)
                .unwrap_or_else(|| panic!("undefined label {label}"));
            let pc = TEXT_BASE + offset as u64;
            let rel = target.wrapping_sub(pc) as i64;
            let patch = |code: &mut Vec<u8>, at: usize, insn: u32| {
                code[at..at + 4].copy_from_slice(&insn.to_le_bytes());
            };
            match fixup {
                Fixup::Branch { funct3, rs1, rs2 } => {
                    assert!((-4096..4096).contains(&rel), "branch to {label} out of range");
                    patch(&mut self.code, offset, b_type(rel as i32, rs2, rs1, funct3));
                }
                Fixup::Jal { rd } => {
                    assert!((-(1 << 20)..(1 << 20)).contains(&rel), "jump to {label} out of range");
                    patch(&mut self.code, offset, j_type(rel as i32, rd));
                }
                Fixup::PcRel { rd } => {
                    let lo = ((rel << 52) >> 52) as i32;
                    let hi = ((rel - i64::from(lo)) as u64 & 0xffff_f000) as u32;
                    patch(&mut self.code, offset, hi | rd << 7 | 0x17);
                    patch(&mut self.code, offset + 4, i_type(lo, rd, 0, rd, 0x13));
                }
                Fixup::Abs64 => {
                    self.code[offset..offset + 8].copy_from_slice(&target.to_le_bytes());
                }
            }
        }

        let end = self.here();
        let mut symbols: Vec<(String, u64, u64)> = self
            .order
            .iter()
            .map(|name| (name.clone(), self.labels[name], 0))
            .collect();
        let mut addrs: Vec<u64> = symbols.iter().map(|s| s.1).collect();
        addrs.push(end);
        addrs.sort_unstable();
        for sym in &mut symbols {
            let next = addrs.iter().find(|a| **a > sym.1).copied().unwrap_or(end);
            sym.2 = next - sym.1;
        }
        Assembled {
            code: self.code,
            symbols,
        }
    }
}
