//! Multi-tenant guest hosting built on cheap virtual machine forks.
//!
//! Each [`TenantInstance`] loads a RISC-V program once into a template
//! machine and runs its initialization. Every request then runs in a fresh
//! fork of that template: the fork starts in constant time, reads the
//! template's memory copy-on-write, and writes into pages loaned from a
//! per-thread [`page_pool`]. Dropping the fork discards all of its state.
//!
//! ```no_run
//! use forkvm::{TenantConfig, TenantInstance};
//!
//! let tenant = TenantInstance::new(TenantConfig::new("hello", "demo", "hello.elf"));
//! let entry = tenant.lookup("on_client_request");
//! let call = tenant.forkcall(entry, 64)?;
//! for buffer in call.buffers() {
//!     println!("{}", String::from_utf8_lossy(buffer));
//! }
//! # Ok::<(), forkvm::SandboxError>(())
//! ```

mod config;
mod error;
mod machine_instance;
pub mod page_pool;
mod script;
pub mod syscalls;
mod tenant_instance;

pub use crate::config::{
    DEFAULT_MAX_HEAP, DEFAULT_MAX_INSTRUCTIONS, DEFAULT_MAX_MEMORY, TenantConfig,
};
pub use crate::error::SandboxError;
pub use crate::machine_instance::{LOOKUP_WISHLIST, MachineInstance, SymbolEntry};
pub use crate::page_pool::LoanedPagePool;
pub use crate::script::{
    CallResult, FaultReport, GuestMachine, NATIVE_SYSCALLS_BASE, PREEMPT_MAX_INSTRUCTIONS, Script,
};
pub use crate::tenant_instance::{ForkCall, TenantInstance};

pub use forkvm_machine::{Arg, Callsite, MachineError, VBuffer};
