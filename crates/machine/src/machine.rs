use crate::arena::Arena;
use crate::call::Arg;
use crate::cpu::{REG_ARG0, REG_ARG7, REG_FP, REG_RA, REG_SP, Registers};
use crate::elf;
use crate::error::{MachineError, Result};
use crate::memory::{Memory, PageFaultHandler};
use crate::page::PAGE_SIZE;
use crate::symbols::{Callsite, SymbolTable};
use std::sync::Arc;

/// Return address installed for host-initiated calls. Reaching it ends the
/// call.
pub const HOST_RETURN_ADDR: u64 = 0xffff_ffff_ffff_f000;

/// Number of system call slots.
pub const SYSCALLS_MAX: usize = 512;

/// The slot `EBREAK` dispatches to.
pub const SYSCALL_EBREAK: usize = SYSCALLS_MAX - 1;

const ENOSYS: i64 = 38;
const BACKTRACE_MAX: usize = 16;

/// A system call implementation. Arguments and results go through the
/// machine's registers.
pub type SyscallHandler<U> = fn(&mut Machine<U>) -> Result<()>;

/// Called for system call numbers without a handler.
pub type UnhandledSyscall<U> = fn(&mut Machine<U>, u64) -> Result<()>;

/// Handlers indexed by system call number.
pub struct SyscallTable<U> {
    handlers: Vec<Option<SyscallHandler<U>>>,
    unhandled: UnhandledSyscall<U>,
}

impl<U> Clone for SyscallTable<U> {
    fn clone(&self) -> Self {
        SyscallTable {
            handlers: self.handlers.clone(),
            unhandled: self.unhandled,
        }
    }
}

impl<U> Default for SyscallTable<U> {
    fn default() -> Self {
        SyscallTable {
            handlers: vec![None; SYSCALLS_MAX],
            unhandled: default_unhandled,
        }
    }
}

fn default_unhandled<U>(machine: &mut Machine<U>, _number: u64) -> Result<()> {
    machine.set_result(-ENOSYS);
    Ok(())
}

/// Options for building a machine from a program.
#[derive(Clone, Debug)]
pub struct MachineOptions {
    /// Upper bound of the guest address space.
    pub memory_max: u64,
    /// Log each loaded segment.
    pub verbose_loader: bool,
}

impl Default for MachineOptions {
    fn default() -> Self {
        MachineOptions {
            memory_max: 64 << 20,
            verbose_loader: false,
        }
    }
}

/// Why a bounded run ended without an error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Done {
    /// The guest stopped or returned to the host.
    Halted,
    /// The instruction budget was used up.
    OutOfInstructions,
}

/// A single guest execution context: registers, memory and the system call
/// table, plus host data of type `U` available to system calls.
pub struct Machine<U> {
    pub cpu: Registers,
    pub memory: Memory,
    syscalls: Arc<SyscallTable<U>>,
    symbols: Arc<SymbolTable>,
    arena: Option<Arena>,
    counter: u64,
    max_counter: u64,
    stopped: bool,
    userdata: U,
}

impl<U> Machine<U> {
    /// Loads `binary` into a fresh address space of `options.memory_max`
    /// bytes. The program counter is left at the entry point.
    pub fn new(binary: &[u8], options: &MachineOptions, userdata: U) -> Result<Machine<U>> {
        let mut memory = Memory::new(options.memory_max);
        let program = elf::load(binary, &mut memory, options.verbose_loader)?;
        let mut cpu = Registers::default();
        cpu.pc = program.entry;
        cpu.set(REG_SP, memory.stack_initial());
        Ok(Machine {
            cpu,
            memory,
            syscalls: Arc::new(SyscallTable::default()),
            symbols: Arc::new(program.symbols),
            arena: None,
            counter: 0,
            max_counter: 0,
            stopped: false,
            userdata,
        })
    }

    /// Creates a machine that starts from `parent`'s registers and heap
    /// state, with memory supplied by `handler`.
    pub fn fork(parent: &Machine<U>, handler: Box<dyn PageFaultHandler>, userdata: U) -> Machine<U> {
        Machine {
            cpu: parent.cpu.clone(),
            memory: Memory::fork(&parent.memory, handler),
            syscalls: parent.syscalls.clone(),
            symbols: parent.symbols.clone(),
            arena: parent.arena.clone(),
            counter: 0,
            max_counter: 0,
            stopped: false,
            userdata,
        }
    }

    fn run(&mut self) -> Result<Done> {
        loop {
            if self.stopped || self.cpu.pc == HOST_RETURN_ADDR {
                return Ok(Done::Halted);
            }
            if self.counter >= self.max_counter {
                return Ok(Done::OutOfInstructions);
            }
            let insn = self.memory.fetch(self.cpu.pc)?;
            self.counter += 1;
            self.execute(insn)?;
        }
    }

    /// Runs until the guest halts, failing with [`MachineError::Timeout`]
    /// once `max_instructions` have executed.
    pub fn simulate(&mut self, max_instructions: u64) -> Result<()> {
        self.counter = 0;
        self.max_counter = max_instructions;
        self.stopped = false;
        match self.run()? {
            Done::Halted => Ok(()),
            Done::OutOfInstructions => Err(MachineError::Timeout {
                max: max_instructions,
            }),
        }
    }

    /// Runs for at most `cycles` more instructions. Running out is not an
    /// error.
    pub fn simulate_cycles(&mut self, cycles: u64) -> Result<Done> {
        self.max_counter = self.counter.saturating_add(cycles);
        self.run()
    }

    /// Places `args` in argument registers and on the stack, and points the
    /// return address back at the host.
    pub fn setup_call(&mut self, args: &[Arg<'_>]) -> Result<()> {
        let needed: usize = args.iter().map(Arg::registers).sum();
        if needed > REG_ARG7 - REG_ARG0 + 1 {
            return Err(MachineError::TooManyArguments);
        }
        self.cpu.set(REG_RA, HOST_RETURN_ADDR);
        let mut reg = REG_ARG0;
        for arg in args {
            match *arg {
                Arg::Int(v) => self.cpu.set(reg, v),
                Arg::Str(s) => {
                    let ptr = self.stack_push_str(s)?;
                    self.cpu.set(reg, ptr);
                }
                Arg::Bytes(b) => {
                    let ptr = self.stack_push(b)?;
                    self.cpu.set(reg, ptr);
                    self.cpu.set(reg + 1, b.len() as u64);
                }
            }
            reg += arg.registers();
        }
        let sp = self.cpu.get(REG_SP) & !0xf;
        self.cpu.set(REG_SP, sp);
        Ok(())
    }

    /// Pushes `data` onto the guest stack, returning its address.
    pub fn stack_push(&mut self, data: &[u8]) -> Result<u64> {
        let sp = self.cpu.get(REG_SP).wrapping_sub(data.len() as u64) & !7;
        self.memory.write_bytes(sp, data)?;
        self.cpu.set(REG_SP, sp);
        Ok(sp)
    }

    /// Pushes `s` onto the guest stack as a NUL-terminated string.
    pub fn stack_push_str(&mut self, s: &str) -> Result<u64> {
        let mut bytes = Vec::with_capacity(s.len() + 1);
        bytes.extend_from_slice(s.as_bytes());
        bytes.push(0);
        self.stack_push(&bytes)
    }

    /// Calls the guest function at `addr` on a fresh stack.
    pub fn vmcall(&mut self, addr: u64, max_instructions: u64, args: &[Arg<'_>]) -> Result<i64> {
        self.cpu.set(REG_SP, self.memory.stack_initial());
        self.setup_call(args)?;
        self.cpu.pc = addr;
        self.simulate(max_instructions)?;
        Ok(self.return_value())
    }

    /// Calls the guest function at `addr` below the current stack frame.
    ///
    /// Registers, instruction counters and the stop flag are restored
    /// afterwards, whatever the outcome, so a system call handler can use
    /// this to call back into the guest and then let the interrupted call
    /// carry on.
    pub fn preempt(&mut self, max_instructions: u64, addr: u64, args: &[Arg<'_>]) -> Result<i64> {
        let regs = self.cpu.clone();
        let saved = (self.counter, self.max_counter, self.stopped);
        let sp = self.cpu.get(REG_SP).wrapping_sub(128) & !0xf;
        self.cpu.set(REG_SP, sp);
        let result = self.nested_call(max_instructions, addr, args);
        self.cpu = regs;
        (self.counter, self.max_counter, self.stopped) = saved;
        result
    }

    fn nested_call(&mut self, max_instructions: u64, addr: u64, args: &[Arg<'_>]) -> Result<i64> {
        self.setup_call(args)?;
        self.cpu.pc = addr;
        self.simulate(max_instructions)?;
        Ok(self.return_value())
    }

    pub(crate) fn system_call(&mut self, number: u64) -> Result<()> {
        let handler = usize::try_from(number)
            .ok()
            .and_then(|n| self.syscalls.handlers.get(n).copied().flatten());
        match handler {
            Some(handler) => handler(self),
            None => {
                let unhandled = self.syscalls.unhandled;
                unhandled(self, number)
            }
        }
    }

    /// Installs `handler` for system call `number`.
    pub fn install_syscall_handler(&mut self, number: usize, handler: SyscallHandler<U>) {
        assert!(number < SYSCALLS_MAX, "system call number {number} out of range");
        Arc::make_mut(&mut self.syscalls).handlers[number] = Some(handler);
    }

    /// Installs the fallback for system calls without a handler.
    pub fn set_unhandled_syscall_handler(&mut self, handler: UnhandledSyscall<U>) {
        Arc::make_mut(&mut self.syscalls).unhandled = handler;
    }

    /// Integer system call argument `n` (a0 + n).
    #[inline]
    pub fn sysarg(&self, n: usize) -> u64 {
        self.cpu.get(REG_ARG0 + n)
    }

    /// Reads the NUL-terminated string pointed to by argument `n`.
    pub fn sysarg_string(&mut self, n: usize, max: usize) -> Result<String> {
        let addr = self.sysarg(n);
        self.memory.memstring(addr, max)
    }

    /// Reads the buffer described by arguments `n` (pointer) and `n + 1`
    /// (length).
    pub fn sysarg_buffer(&mut self, n: usize) -> Result<Vec<u8>> {
        let (addr, len) = (self.sysarg(n), self.sysarg(n + 1));
        let len = usize::try_from(len).map_err(|_| MachineError::ProtectionFault { addr })?;
        self.memory.read_vec(addr, len)
    }

    /// Sets the value returned to the guest in a0.
    #[inline]
    pub fn set_result(&mut self, value: i64) {
        self.cpu.set(REG_ARG0, value as u64);
    }

    /// The value in a0, read as the guest's return value.
    #[inline]
    pub fn return_value(&self) -> i64 {
        self.cpu.get(REG_ARG0) as i64
    }

    /// Stops execution after the current instruction.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    pub fn stopped(&self) -> bool {
        self.stopped
    }

    /// Instructions executed since the last call to [`Machine::simulate`].
    pub fn instruction_counter(&self) -> u64 {
        self.counter
    }

    pub fn max_instructions(&self) -> u64 {
        self.max_counter
    }

    pub fn copy_to_guest(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        self.memory.write_bytes(addr, data)
    }

    pub fn userdata(&self) -> &U {
        &self.userdata
    }

    pub fn userdata_mut(&mut self) -> &mut U {
        &mut self.userdata
    }

    pub fn symbols(&self) -> &Arc<SymbolTable> {
        &self.symbols
    }

    /// Address of the symbol `name`, or zero.
    pub fn address_of(&self, name: &str) -> u64 {
        self.symbols.address_of(name)
    }

    /// The symbol containing `addr`.
    pub fn lookup(&self, addr: u64) -> Callsite {
        self.symbols.lookup(addr)
    }

    pub fn arena(&self) -> Option<&Arena> {
        self.arena.as_ref()
    }

    pub fn arena_mut(&mut self) -> Option<&mut Arena> {
        self.arena.as_mut()
    }

    pub fn set_arena(&mut self, arena: Arena) {
        self.arena = Some(arena);
    }

    /// Return addresses of the active guest frames, innermost first.
    ///
    /// Frames are found through the frame pointer chain, so functions
    /// compiled without frame pointers are skipped.
    pub fn backtrace(&self) -> Vec<u64> {
        let mut frames = vec![self.cpu.pc];
        let push = |frames: &mut Vec<u64>, addr: u64| {
            if addr != 0 && addr != HOST_RETURN_ADDR && frames.last() != Some(&addr) {
                frames.push(addr);
            }
        };
        push(&mut frames, self.cpu.get(REG_RA));

        let mut fp = self.cpu.get(REG_FP);
        while frames.len() < BACKTRACE_MAX && fp >= 2 * PAGE_SIZE as u64 {
            let (Some(ra), Some(prev)) = (self.memory.peek_u64(fp - 8), self.memory.peek_u64(fp - 16))
            else {
                break;
            };
            if ra == 0 || ra == HOST_RETURN_ADDR {
                break;
            }
            push(&mut frames, ra);
            if prev <= fp {
                break;
            }
            fp = prev;
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forkvm_test_util::{Assembler, ElfBuilder};

    fn machine(build: impl FnOnce(&mut Assembler)) -> Machine<()> {
        let _ = env_logger::try_init();
        let mut asm = Assembler::new();
        build(&mut asm);
        let binary = ElfBuilder::new(asm).build();
        Machine::new(&binary, &MachineOptions::default(), ()).unwrap()
    }

    fn exit(m: &mut Machine<()>) -> Result<()> {
        m.stop();
        Ok(())
    }

    #[test]
    fn runs_to_completion() {
        let mut m = machine(|a| {
            a.label("_start");
            a.li(10, 5);
            a.li(11, 7);
            a.add(10, 10, 11);
            a.li(17, 93);
            a.ecall();
        });
        m.install_syscall_handler(93, exit);
        m.simulate(100).unwrap();
        assert_eq!(m.return_value(), 12);
    }

    #[test]
    fn budget_is_enforced() {
        let mut m = machine(|a| {
            a.label("_start");
            a.j("_start");
        });
        assert_eq!(m.simulate(1000), Err(MachineError::Timeout { max: 1000 }));
        assert_eq!(m.instruction_counter(), 1000);
    }

    #[test]
    fn cycles_resume_where_they_left_off() {
        let mut m = machine(|a| {
            a.label("_start");
            a.li(10, 0);
            a.label("loop");
            a.addi(10, 10, 1);
            a.j("loop");
        });
        assert_eq!(m.simulate_cycles(11).unwrap(), Done::OutOfInstructions);
        assert_eq!(m.return_value(), 5);
        assert_eq!(m.simulate_cycles(10).unwrap(), Done::OutOfInstructions);
        assert_eq!(m.return_value(), 10);
    }

    #[test]
    fn vmcall_passes_arguments() {
        let mut m = machine(|a| {
            a.label("_start");
            a.ebreak();
            a.label("sum");
            a.add(10, 10, 11);
            a.add(10, 10, 12);
            a.ret();
            a.label("first_byte");
            a.lbu(10, 10, 0);
            a.ret();
        });
        m.install_syscall_handler(SYSCALL_EBREAK, exit);
        m.simulate(10).unwrap();

        let sum = m.address_of("sum");
        assert_eq!(m.vmcall(sum, 100, &[1u64.into(), 2u64.into(), 3u64.into()]).unwrap(), 6);
        let first = m.address_of("first_byte");
        assert_eq!(m.vmcall(first, 100, &["xyz".into()]).unwrap(), i64::from(b'x'));
        assert_eq!(m.vmcall(first, 100, &[Arg::Bytes(b"q")]).unwrap(), i64::from(b'q'));
    }

    #[test]
    fn too_many_arguments() {
        let mut m = machine(|a| {
            a.label("_start");
            a.ret();
        });
        let args = [Arg::Bytes(b"1"); 5];
        assert_eq!(m.setup_call(&args), Err(MachineError::TooManyArguments));
    }

    #[test]
    fn unknown_syscalls_return_enosys() {
        let mut m = machine(|a| {
            a.label("_start");
            a.li(17, 300);
            a.ecall();
            a.ebreak();
        });
        m.install_syscall_handler(SYSCALL_EBREAK, exit);
        m.simulate(10).unwrap();
        assert_eq!(m.return_value(), -38);
    }

    #[test]
    fn faults_are_reported() {
        let mut m = machine(|a| {
            a.label("_start");
            a.li(5, 8);
            a.ld(10, 5, 0);
        });
        assert_eq!(m.simulate(10), Err(MachineError::ProtectionFault { addr: 8 }));

        let mut m = machine(|a| {
            a.label("_start");
            a.word(0);
        });
        assert_eq!(m.simulate(10), Err(MachineError::IllegalInstruction { bits: 0 }));
    }

    fn call_double(m: &mut Machine<()>) -> Result<()> {
        let (double, arg) = (m.address_of("double"), m.sysarg(0));
        let value = m.preempt(1000, double, &[arg.into()])?;
        m.set_result(value);
        Ok(())
    }

    #[test]
    fn syscall_handlers_can_preempt() {
        let mut m = machine(|a| {
            a.label("_start");
            a.li(5, 100);
            a.li(10, 21);
            a.li(17, 200);
            a.ecall();
            a.add(10, 10, 5);
            a.ebreak();
            a.label("double");
            a.li(5, 0);
            a.add(10, 10, 10);
            a.ret();
        });
        m.install_syscall_handler(200, call_double);
        m.install_syscall_handler(SYSCALL_EBREAK, exit);
        let sp = m.cpu.get(REG_SP);
        m.simulate(100).unwrap();
        assert_eq!(m.return_value(), 142);
        assert_eq!(m.cpu.get(REG_SP), sp);
        assert_eq!(m.instruction_counter(), 6);
    }

    #[test]
    fn backtrace_follows_frame_pointers() {
        let mut m = machine(|a| {
            a.label("_start");
            a.call("outer");
            a.ebreak();
            a.label("outer");
            a.addi(2, 2, -16);
            a.sd(1, 2, 8);
            a.sd(8, 2, 0);
            a.addi(8, 2, 16);
            a.call("inner");
            a.label("inner");
            a.ebreak();
        });
        m.install_syscall_handler(SYSCALL_EBREAK, exit);
        m.simulate(100).unwrap();
        let frames = m.backtrace();
        let names: Vec<_> = frames.iter().map(|pc| m.lookup(*pc).name).collect();
        assert_eq!(names[0], "inner");
        assert!(names.contains(&"_start".to_string()));
    }
}
