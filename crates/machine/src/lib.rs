//! A small RV64IM interpreter with paged, copy-on-write guest memory.
//!
//! This crate is the execution substrate for `forkvm`. A [`Machine`] loads a
//! RISC-V ELF executable into a sparse page table and runs it under an
//! instruction budget. Machines can be forked: a fork shares nothing with
//! its parent up front and pulls pages in through a [`PageFaultHandler`],
//! mapping the parent's pages copy-on-write.

mod arena;
mod call;
mod cpu;
mod elf;
mod error;
mod machine;
mod memory;
mod page;
mod symbols;
mod syscalls;

pub use crate::arena::Arena;
pub use crate::call::Arg;
pub use crate::cpu::{
    REG_ARG0, REG_ARG1, REG_ARG2, REG_ARG3, REG_ARG7, REG_FP, REG_RA, REG_SP, Registers,
};
pub use crate::error::{MachineError, Result};
pub use crate::machine::{
    Done, HOST_RETURN_ADDR, Machine, MachineOptions, SYSCALL_EBREAK, SYSCALLS_MAX,
    SyscallHandler, SyscallTable, UnhandledSyscall,
};
pub use crate::memory::{Memory, PageFaultHandler, STACK_RESERVE, VBuffer};
pub use crate::page::{
    PAGE_SHIFT, PAGE_SIZE, Page, PageAttributes, PageData, PageInit, page_number, page_offset,
};
pub use crate::symbols::{Callsite, Symbol, SymbolTable};
pub use crate::syscalls::STRING_MAX;
