//! Helpers for building RISC-V guest programs in tests.

pub mod asm;
pub mod elf;
pub mod programs;

pub use asm::{Assembled, Assembler, TEXT_BASE};
pub use elf::ElfBuilder;
