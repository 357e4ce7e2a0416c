//! Guest execution contexts.
//!
//! A [`Script`] owns exactly one [`Machine`]. Templates are built from a
//! program binary and run its initialization once; forks are derived from a
//! template in constant time and fault the template's pages in lazily.

use crate::config::TenantConfig;
use crate::machine_instance::MachineInstance;
use crate::page_pool;
use crate::syscalls;
use anyhow::{Context, Result};
use forkvm_machine::{
    Arg, Callsite, Done, Machine, MachineError, MachineOptions, Page, PageAttributes,
    PageFaultHandler, PageInit, REG_SP,
};
use std::fmt;
use std::sync::Arc;

/// Instruction budget for calls made with [`Script::preempt`].
pub const PREEMPT_MAX_INSTRUCTIONS: u64 = 50_000;

/// First system call number of the native heap and memory helpers.
pub const NATIVE_SYSCALLS_BASE: usize = 80;

const GUEST_ENV: [&str; 3] = ["LC_CTYPE=C", "LC_ALL=C", "USER=groot"];

/// The machine type every tenant program runs in. System calls reach the
/// tenant's configuration through the machine's user data.
pub type GuestMachine = Machine<Arc<TenantConfig>>;

/// How a guest call ended.
#[derive(Debug)]
pub enum CallResult {
    /// The guest returned (or halted) with this value in a0.
    Returned(i64),
    /// The instruction budget ran out.
    Timeout,
    /// The guest faulted.
    Fault(Box<FaultReport>),
}

impl CallResult {
    /// The guest's return value, if it returned.
    pub fn value(&self) -> Option<i64> {
        match self {
            CallResult::Returned(v) => Some(*v),
            CallResult::Timeout | CallResult::Fault(_) => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, CallResult::Timeout)
    }

    /// Details of the fault, if the guest faulted.
    pub fn fault(&self) -> Option<&FaultReport> {
        match self {
            CallResult::Fault(report) => Some(report),
            _ => None,
        }
    }
}

/// Diagnostics gathered when a guest faults.
#[derive(Debug, Clone)]
pub struct FaultReport {
    pub error: MachineError,
    /// Register dump at the time of the fault.
    pub registers: String,
    /// The function the host called into.
    pub callsite: Callsite,
    /// Innermost frame first.
    pub backtrace: Vec<String>,
    pub program_page: String,
    pub stack_page: String,
}

impl fmt::Display for FaultReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Script exception: {} (data: {:#x})",
            self.error,
            self.error.data()
        )?;
        writeln!(f, ">>> Machine registers:\n{}", self.registers)?;
        writeln!(f, "Program page: {}", self.program_page)?;
        writeln!(f, "Stack page: {}", self.stack_page)?;
        write!(f, "Function call: {}", self.callsite.name)?;
        for line in &self.backtrace {
            write!(f, "\n-> {line}")?;
        }
        Ok(())
    }
}

/// Supplies a fork's pages: reads map the template's page copy-on-write,
/// writes get a page loaned from the thread's pool.
struct ForkPager {
    parent: Arc<MachineInstance>,
}

impl PageFaultHandler for ForkPager {
    fn page_fault(&mut self, _pageno: u64, init: PageInit) -> Page {
        let attr = PageAttributes {
            is_cow: false,
            non_owning: true,
            ..PageAttributes::default()
        };
        Page::new(attr, page_pool::loan_page(init))
    }

    fn page_read_fault(&self, pageno: u64) -> Option<Page> {
        let page = self.parent.script().machine().memory.page(pageno)?;
        let mut attr = page.attr;
        attr.non_owning = true;
        attr.is_cow = true;
        Some(Page::new(attr, page.shared_data().clone()))
    }
}

pub struct Script {
    machine: GuestMachine,
    is_paused: bool,
    /// The program instance a fork was made from.
    instance: Option<Arc<MachineInstance>>,
}

impl Script {
    /// Loads `binary` into a new address space and runs its initialization.
    ///
    /// Fails if the binary cannot be loaded, or if initialization faults or
    /// runs out of instructions.
    pub fn new_template(binary: &[u8], config: Arc<TenantConfig>) -> Result<Script> {
        let options = MachineOptions {
            memory_max: config.max_memory,
            verbose_loader: true,
        };
        let machine = Machine::new(binary, &options, config.clone())
            .with_context(|| format!("failed to load program for '{}'", config.name))?;
        let mut script = Script {
            machine,
            is_paused: false,
            instance: None,
        };
        script
            .machine_setup()
            .with_context(|| format!("failed to set up machine for '{}'", config.name))?;
        script.machine_initialize()?;
        Ok(script)
    }

    /// Creates a fork of `instance`'s template.
    ///
    /// The fork starts with the template's registers and heap state and no
    /// pages of its own. It keeps `instance` alive for as long as it exists.
    pub fn new_fork(instance: Arc<MachineInstance>) -> Script {
        let parent = instance.script();
        let pager = ForkPager {
            parent: instance.clone(),
        };
        let machine = Machine::fork(parent.machine(), Box::new(pager), parent.config().clone());
        Script {
            machine,
            is_paused: false,
            instance: Some(instance),
        }
    }

    fn machine_setup(&mut self) -> Result<()> {
        let config = self.config().clone();
        let machine = &mut self.machine;
        machine.setup_linux(&[config.name.as_str()], &GUEST_ENV)?;
        machine.setup_linux_syscalls();
        let heap_base = machine.memory.mmap_allocate(config.max_heap)?;
        machine.setup_native_heap(NATIVE_SYSCALLS_BASE, heap_base, config.max_heap);
        machine.setup_native_memory(NATIVE_SYSCALLS_BASE + 5);
        syscalls::install(machine);
        Ok(())
    }

    fn machine_initialize(&mut self) -> Result<()> {
        let start = self.machine.memory.start_address();
        let max = self.max_instructions();
        match self.machine.simulate(max) {
            Ok(()) => {
                log::debug!(
                    "{}: initialized in {} instructions",
                    self.name(),
                    self.machine.instruction_counter()
                );
                Ok(())
            }
            Err(e) => {
                if e.is_timeout() {
                    self.handle_timeout(start);
                } else {
                    self.handle_exception(start, e.clone());
                }
                Err(e).with_context(|| format!("initialization of '{}' failed", self.name()))
            }
        }
    }

    /// Calls the guest function at `address` on a fresh stack.
    pub fn call(&mut self, address: u64, args: &[Arg<'_>]) -> CallResult {
        self.is_paused = false;
        let max = self.max_instructions();
        match self.machine.vmcall(address, max, args) {
            Ok(value) => CallResult::Returned(value),
            Err(e) => self.handle_error(address, e),
        }
    }

    /// Calls the guest function at `address` from within another call,
    /// below the current stack frame, with a budget of
    /// [`PREEMPT_MAX_INSTRUCTIONS`].
    ///
    /// The interrupted call's registers and counters are restored whatever
    /// the outcome. System call handlers get the same behavior from
    /// [`Machine::preempt`] with a budget of [`PREEMPT_MAX_INSTRUCTIONS`].
    pub fn preempt(&mut self, address: u64, args: &[Arg<'_>]) -> CallResult {
        match self.machine.preempt(PREEMPT_MAX_INSTRUCTIONS, address, args) {
            Ok(value) => CallResult::Returned(value),
            Err(e) => self.handle_error(address, e),
        }
    }

    /// Continues execution for at most `cycles` instructions.
    ///
    /// Running out of cycles leaves the script paused; see
    /// [`Script::is_paused`].
    pub fn resume(&mut self, cycles: u64) -> CallResult {
        match self.machine.simulate_cycles(cycles) {
            Ok(done) => {
                self.is_paused = done == Done::OutOfInstructions;
                CallResult::Returned(self.machine.return_value())
            }
            Err(e) => {
                self.is_paused = false;
                let pc = self.machine.cpu.pc;
                self.handle_error(pc, e)
            }
        }
    }

    fn handle_error(&mut self, address: u64, error: MachineError) -> CallResult {
        if error.is_timeout() {
            self.handle_timeout(address);
            CallResult::Timeout
        } else {
            CallResult::Fault(Box::new(self.handle_exception(address, error)))
        }
    }

    fn handle_timeout(&self, address: u64) {
        let callsite = self.callsite(address);
        let current = self.callsite(self.machine.cpu.pc);
        log::warn!(
            "{}: Script hit max instructions for: {} (executing {} + {:#x})",
            self.name(),
            callsite.name,
            current.name,
            current.offset
        );
    }

    fn handle_exception(&self, address: u64, error: MachineError) -> FaultReport {
        let machine = &self.machine;
        let report = FaultReport {
            registers: machine.cpu.to_string(),
            callsite: self.callsite(address),
            backtrace: self.backtrace(address),
            program_page: machine.memory.page_info(machine.cpu.pc),
            stack_page: machine.memory.page_info(machine.cpu.get(REG_SP)),
            error,
        };
        log::error!("{}: {report}", self.name());
        report
    }

    /// Describes the active guest frames, innermost first, ending with the
    /// function at `address` the host called into.
    pub fn backtrace(&self, address: u64) -> Vec<String> {
        let mut frames: Vec<String> = self
            .machine
            .backtrace()
            .into_iter()
            .enumerate()
            .map(|(i, pc)| {
                let cs = self.callsite(pc);
                format!("[{i}] {:#010x} + {:#05x}: {}", cs.address, cs.offset, cs.name)
            })
            .collect();
        let origin = self.callsite(address);
        frames.push(format!(
            "[-] {:#010x} + {:#05x}: {}",
            origin.address, origin.offset, origin.name
        ));
        frames
    }

    /// Allocates `len` bytes on the guest's native heap.
    pub fn guest_alloc(&mut self, len: u64) -> Option<u64> {
        self.machine.arena_mut()?.malloc(len)
    }

    /// Name of the symbol containing `address`.
    pub fn symbol_name(&self, address: u64) -> String {
        self.machine.lookup(address).name
    }

    /// Address of the symbol `name`, or zero.
    pub fn resolve_address(&self, name: &str) -> u64 {
        self.machine.address_of(name)
    }

    pub fn callsite(&self, address: u64) -> Callsite {
        self.machine.lookup(address)
    }

    pub fn config(&self) -> &Arc<TenantConfig> {
        self.machine.userdata()
    }

    pub fn name(&self) -> &str {
        &self.config().name
    }

    pub fn group(&self) -> &str {
        &self.config().group
    }

    pub fn max_instructions(&self) -> u64 {
        self.config().max_instructions
    }

    /// Whether the last [`Script::resume`] ran out of cycles before the
    /// guest halted.
    pub fn is_paused(&self) -> bool {
        self.is_paused
    }

    /// Whether this script was forked from a template.
    pub fn is_fork(&self) -> bool {
        self.instance.is_some()
    }

    /// The program instance this script was forked from.
    pub fn instance(&self) -> Option<&Arc<MachineInstance>> {
        self.instance.as_ref()
    }

    pub fn machine(&self) -> &GuestMachine {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut GuestMachine {
        &mut self.machine
    }
}

impl Drop for Script {
    fn drop(&mut self) {
        page_pool::return_pages(self.machine.memory.take_loaned_pages());
    }
}
