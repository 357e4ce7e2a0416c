//! Loading RISC-V ELF executables into guest memory.

use crate::error::{MachineError, Result};
use crate::memory::Memory;
use crate::page::{PAGE_SIZE, PageAttributes};
use crate::symbols::{Symbol, SymbolTable};
use object::elf::{PF_R, PF_W, PF_X};
use object::{Architecture, Object, ObjectSegment, ObjectSymbol, SegmentFlags, SymbolKind};

pub(crate) struct LoadedProgram {
    pub entry: u64,
    pub symbols: SymbolTable,
}

fn invalid(msg: impl std::fmt::Display) -> MachineError {
    MachineError::InvalidProgram(msg.to_string())
}

pub(crate) fn load(binary: &[u8], memory: &mut Memory, verbose: bool) -> Result<LoadedProgram> {
    let file = object::File::parse(binary).map_err(|e| invalid(format!("not an ELF file: {e}")))?;
    if file.architecture() != Architecture::Riscv64 {
        return Err(invalid(format!(
            "unsupported architecture {:?}, expected RISC-V 64",
            file.architecture()
        )));
    }
    if !file.is_little_endian() {
        return Err(invalid("big-endian executables are not supported"));
    }

    let mut end = 0;
    for segment in file.segments() {
        let data = segment.data().map_err(invalid)?;
        let attr = match segment.flags() {
            SegmentFlags::Elf { p_flags } => PageAttributes {
                read: p_flags & PF_R != 0,
                write: p_flags & PF_W != 0,
                exec: p_flags & PF_X != 0,
                ..PageAttributes::NONE
            },
            _ => PageAttributes::default(),
        };
        if verbose {
            log::debug!(
                "loading segment {:#x}..{:#x} ({} file bytes) {attr}",
                segment.address(),
                segment.address().wrapping_add(segment.size()),
                data.len()
            );
        }
        memory.load_segment(segment.address(), segment.size(), data, attr)?;
        end = end.max(segment.address() + segment.size());
    }
    if end == 0 {
        return Err(invalid("no loadable segments"));
    }

    let mmap = (end + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1);
    memory.set_mmap_address(mmap);
    memory.set_start_address(file.entry());

    let symbols = file
        .symbols()
        .filter(|sym| !sym.is_undefined())
        .filter(|sym| !matches!(sym.kind(), SymbolKind::Section | SymbolKind::File))
        .filter_map(|sym| {
            let name = sym.name().ok().filter(|name| !name.is_empty())?;
            Some(Symbol {
                name: name.to_string(),
                address: sym.address(),
                size: sym.size(),
            })
        })
        .collect::<Vec<_>>();
    log::trace!(
        "loaded program: entry {:#x}, {} symbols, heap starts at {mmap:#x}",
        file.entry(),
        symbols.len()
    );

    Ok(LoadedProgram {
        entry: file.entry(),
        symbols: SymbolTable::new(symbols),
    })
}
