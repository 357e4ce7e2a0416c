//! Writes assembled images out as minimal ELF64 RISC-V executables.

use crate::asm::{Assembled, Assembler, TEXT_BASE};

const EM_RISCV: u16 = 243;
const ET_EXEC: u16 = 2;
const PT_LOAD: u32 = 1;
const SHT_PROGBITS: u32 = 1;
const SHT_SYMTAB: u32 = 2;
const SHT_STRTAB: u32 = 3;
const STB_GLOBAL_FUNC: u8 = 0x12;

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;
const SHDR_SIZE: usize = 64;
const SYM_SIZE: usize = 24;
const TEXT_OFFSET: usize = 0x1000;

/// Builds an executable with a single read/write/execute `PT_LOAD` segment
/// holding the assembled image, plus a symbol table with one entry per
/// label.
pub struct ElfBuilder {
    image: Assembled,
    entry: Option<u64>,
    bss: u64,
    flags: u32,
    machine: u16,
    vaddr: u64,
}

struct Section {
    name: u32,
    kind: u32,
    flags: u64,
    addr: u64,
    offset: u64,
    size: u64,
    link: u32,
    info: u32,
    align: u64,
    entsize: u64,
}

impl ElfBuilder {
    pub fn new(asm: Assembler) -> ElfBuilder {
        ElfBuilder {
            image: asm.finish(),
            entry: None,
            bss: 0,
            flags: 7,
            machine: EM_RISCV,
            vaddr: TEXT_BASE,
        }
    }

    /// Overrides the entry point, which otherwise is `_start` (or the start
    /// of the image).
    pub fn entry(mut self, entry: u64) -> Self {
        self.entry = Some(entry);
        self
    }

    /// Extends the segment by `len` zero-initialized bytes.
    pub fn bss(mut self, len: u64) -> Self {
        self.bss = len;
        self
    }

    /// Overrides the segment's `p_flags`.
    pub fn segment_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    /// Overrides `e_machine`.
    pub fn machine(mut self, machine: u16) -> Self {
        self.machine = machine;
        self
    }

    /// Overrides the segment's `p_vaddr`. Symbols keep their addresses, so
    /// this only makes sense for malformed executables.
    pub fn segment_vaddr(mut self, vaddr: u64) -> Self {
        self.vaddr = vaddr;
        self
    }

    pub fn build(self) -> Vec<u8> {
        let code = &self.image.code;
        let entry = self.entry.unwrap_or_else(|| {
            self.image
                .symbols
                .iter()
                .find(|s| s.0 == "_start")
                .map_or(TEXT_BASE, |s| s.1)
        });

        let mut strtab = vec![0u8];
        let mut symtab = vec![0u8; SYM_SIZE];
        for (name, addr, size) in &self.image.symbols {
            let name_off = strtab.len() as u32;
            strtab.extend_from_slice(name.as_bytes());
            strtab.push(0);
            symtab.extend_from_slice(&name_off.to_le_bytes());
            symtab.push(STB_GLOBAL_FUNC);
            symtab.push(0);
            symtab.extend_from_slice(&1u16.to_le_bytes());
            symtab.extend_from_slice(&addr.to_le_bytes());
            symtab.extend_from_slice(&size.to_le_bytes());
        }
        let shstrtab = b"\0.text\0.symtab\0.strtab\0.shstrtab\0";

        let mut out = vec![0u8; TEXT_OFFSET];
        out.extend_from_slice(code);
        pad(&mut out, 8);
        let symtab_off = out.len();
        out.extend_from_slice(&symtab);
        let strtab_off = out.len();
        out.extend_from_slice(&strtab);
        let shstrtab_off = out.len();
        out.extend_from_slice(shstrtab);
        pad(&mut out, 8);
        let shoff = out.len();

        let sections = [
            Section {
                name: 0,
                kind: 0,
                flags: 0,
                addr: 0,
                offset: 0,
                size: 0,
                link: 0,
                info: 0,
                align: 0,
                entsize: 0,
            },
            Section {
                name: 1,
                kind: SHT_PROGBITS,
                flags: 7,
                addr: TEXT_BASE,
                offset: TEXT_OFFSET as u64,
                size: code.len() as u64,
                link: 0,
                info: 0,
                align: 4,
                entsize: 0,
            },
            Section {
                name: 7,
                kind: SHT_SYMTAB,
                flags: 0,
                addr: 0,
                offset: symtab_off as u64,
                size: symtab.len() as u64,
                link: 3,
                info: 1,
                align: 8,
                entsize: SYM_SIZE as u64,
            },
            Section {
                name: 15,
                kind: SHT_STRTAB,
                flags: 0,
                addr: 0,
                offset: strtab_off as u64,
                size: strtab.len() as u64,
                link: 0,
                info: 0,
                align: 1,
                entsize: 0,
            },
            Section {
                name: 23,
                kind: SHT_STRTAB,
                flags: 0,
                addr: 0,
                offset: shstrtab_off as u64,
                size: shstrtab.len() as u64,
                link: 0,
                info: 0,
                align: 1,
                entsize: 0,
            },
        ];
        for s in &sections {
            out.extend_from_slice(&s.name.to_le_bytes());
            out.extend_from_slice(&s.kind.to_le_bytes());
            out.extend_from_slice(&s.flags.to_le_bytes());
            out.extend_from_slice(&s.addr.to_le_bytes());
            out.extend_from_slice(&s.offset.to_le_bytes());
            out.extend_from_slice(&s.size.to_le_bytes());
            out.extend_from_slice(&s.link.to_le_bytes());
            out.extend_from_slice(&s.info.to_le_bytes());
            out.extend_from_slice(&s.align.to_le_bytes());
            out.extend_from_slice(&s.entsize.to_le_bytes());
        }

        let mut hdr = Vec::with_capacity(EHDR_SIZE + PHDR_SIZE);
        hdr.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
        hdr.extend_from_slice(&[0; 8]);
        hdr.extend_from_slice(&ET_EXEC.to_le_bytes());
        hdr.extend_from_slice(&self.machine.to_le_bytes());
        hdr.extend_from_slice(&1u32.to_le_bytes());
        hdr.extend_from_slice(&entry.to_le_bytes());
        hdr.extend_from_slice(&(EHDR_SIZE as u64).to_le_bytes());
        hdr.extend_from_slice(&(shoff as u64).to_le_bytes());
        hdr.extend_from_slice(&0u32.to_le_bytes());
        hdr.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
        hdr.extend_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        hdr.extend_from_slice(&1u16.to_le_bytes());
        hdr.extend_from_slice(&(SHDR_SIZE as u16).to_le_bytes());
        hdr.extend_from_slice(&(sections.len() as u16).to_le_bytes());
        hdr.extend_from_slice(&4u16.to_le_bytes());

        hdr.extend_from_slice(&PT_LOAD.to_le_bytes());
        hdr.extend_from_slice(&self.flags.to_le_bytes());
        hdr.extend_from_slice(&(TEXT_OFFSET as u64).to_le_bytes());
        hdr.extend_from_slice(&self.vaddr.to_le_bytes());
        hdr.extend_from_slice(&self.vaddr.to_le_bytes());
        hdr.extend_from_slice(&(code.len() as u64).to_le_bytes());
        hdr.extend_from_slice(&(code.len() as u64 + self.bss).to_le_bytes());
        hdr.extend_from_slice(&(TEXT_OFFSET as u64).to_le_bytes());
        assert_eq!(hdr.len(), EHDR_SIZE + PHDR_SIZE);

        out[..hdr.len()].copy_from_slice(&hdr);
        out
    }
}

fn pad(out: &mut Vec<u8>, align: usize) {
    while out.len() % align != 0 {
        out.push(0);
    }
}
