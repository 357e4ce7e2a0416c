//! Built-in system calls: native heap, native memory helpers and a small
//! Linux-compatible environment.

use crate::arena::Arena;
use crate::cpu::REG_SP;
use crate::error::{MachineError, Result};
use crate::machine::Machine;

/// Longest string the native memory helpers will scan.
pub const STRING_MAX: usize = 64 << 10;

const EBADF: i64 = 9;

const SYSCALL_WRITE: usize = 64;
const SYSCALL_EXIT: usize = 93;
const SYSCALL_EXIT_GROUP: usize = 94;

const AT_NULL: u64 = 0;
const AT_PAGESZ: u64 = 6;

fn heap<U>(machine: &mut Machine<U>) -> Result<&mut Arena> {
    machine
        .arena_mut()
        .ok_or_else(|| MachineError::guest("native heap is not set up", 0))
}

fn heap_malloc<U>(machine: &mut Machine<U>) -> Result<()> {
    let len = machine.sysarg(0);
    let addr = heap(machine)?.malloc(len).unwrap_or(0);
    log::trace!("malloc({len}) = {addr:#x}");
    machine.set_result(addr as i64);
    Ok(())
}

fn heap_calloc<U>(machine: &mut Machine<U>) -> Result<()> {
    let (count, size) = (machine.sysarg(0), machine.sysarg(1));
    let addr = match count.checked_mul(size) {
        Some(len) => match heap(machine)?.malloc(len) {
            Some(addr) => {
                machine.memory.memset(addr, 0, len)?;
                addr
            }
            None => 0,
        },
        None => 0,
    };
    log::trace!("calloc({count}, {size}) = {addr:#x}");
    machine.set_result(addr as i64);
    Ok(())
}

fn heap_realloc<U>(machine: &mut Machine<U>) -> Result<()> {
    let (ptr, len) = (machine.sysarg(0), machine.sysarg(1));
    let addr = match heap(machine)?.realloc(ptr, len) {
        Some((new, old)) => {
            if new != ptr && ptr != 0 {
                machine.memory.copy_within(new, ptr, old.min(len))?;
            }
            new
        }
        None => 0,
    };
    log::trace!("realloc({ptr:#x}, {len}) = {addr:#x}");
    machine.set_result(addr as i64);
    Ok(())
}

fn heap_free<U>(machine: &mut Machine<U>) -> Result<()> {
    let ptr = machine.sysarg(0);
    if !heap(machine)?.free(ptr) {
        return Err(MachineError::guest("free() on invalid pointer", ptr));
    }
    machine.set_result(0);
    Ok(())
}

fn heap_meminfo<U>(machine: &mut Machine<U>) -> Result<()> {
    let dst = machine.sysarg(0);
    let arena = heap(machine)?;
    let info = [
        arena.bytes_free(),
        arena.bytes_used(),
        arena.chunks_used() as u64,
    ];
    for (i, v) in info.iter().enumerate() {
        machine.memory.write_u64(dst + 8 * i as u64, *v)?;
    }
    machine.set_result(0);
    Ok(())
}

fn mem_copy<U>(machine: &mut Machine<U>) -> Result<()> {
    let (dst, src, len) = (machine.sysarg(0), machine.sysarg(1), machine.sysarg(2));
    machine.memory.copy_within(dst, src, len)?;
    machine.set_result(dst as i64);
    Ok(())
}

fn mem_set<U>(machine: &mut Machine<U>) -> Result<()> {
    let (dst, value, len) = (machine.sysarg(0), machine.sysarg(1), machine.sysarg(2));
    machine.memory.memset(dst, value as u8, len)?;
    machine.set_result(dst as i64);
    Ok(())
}

fn mem_compare<U>(machine: &mut Machine<U>) -> Result<()> {
    let (a, b, len) = (machine.sysarg(0), machine.sysarg(1), machine.sysarg(2));
    let lhs = machine.memory.read_vec(a, len as usize)?;
    let rhs = machine.memory.read_vec(b, len as usize)?;
    let result = lhs
        .iter()
        .zip(&rhs)
        .find(|(x, y)| x != y)
        .map_or(0, |(x, y)| i64::from(*x) - i64::from(*y));
    machine.set_result(result);
    Ok(())
}

fn mem_strlen<U>(machine: &mut Machine<U>) -> Result<()> {
    let addr = machine.sysarg(0);
    let len = machine.memory.strlen(addr, STRING_MAX)?;
    machine.set_result(len as i64);
    Ok(())
}

impl<U> Machine<U> {
    /// Installs malloc, calloc, realloc, free and meminfo as system calls
    /// `base..base + 5`, managing `size` bytes starting at `heap_base`.
    pub fn setup_native_heap(&mut self, base: usize, heap_base: u64, size: u64) {
        self.set_arena(Arena::new(heap_base, size));
        self.install_syscall_handler(base, heap_malloc);
        self.install_syscall_handler(base + 1, heap_calloc);
        self.install_syscall_handler(base + 2, heap_realloc);
        self.install_syscall_handler(base + 3, heap_free);
        self.install_syscall_handler(base + 4, heap_meminfo);
    }

    /// Installs memcpy, memset, memmove, memcmp and strlen as system calls
    /// `base..base + 5`.
    pub fn setup_native_memory(&mut self, base: usize) {
        self.install_syscall_handler(base, mem_copy);
        self.install_syscall_handler(base + 1, mem_set);
        self.install_syscall_handler(base + 2, mem_copy);
        self.install_syscall_handler(base + 3, mem_compare);
        self.install_syscall_handler(base + 4, mem_strlen);
    }

    /// Lays out `argv`, `envp` and the auxiliary vector on the stack the
    /// way a Linux program expects to find them at its entry point.
    pub fn setup_linux(&mut self, args: &[&str], env: &[&str]) -> Result<()> {
        self.cpu.set(REG_SP, self.memory.stack_initial());
        let argv = args
            .iter()
            .map(|s| self.stack_push_str(s))
            .collect::<Result<Vec<_>>>()?;
        let envp = env
            .iter()
            .map(|s| self.stack_push_str(s))
            .collect::<Result<Vec<_>>>()?;

        let mut words = Vec::with_capacity(argv.len() + envp.len() + 7);
        words.push(argv.len() as u64);
        words.extend(&argv);
        words.push(0);
        words.extend(&envp);
        words.push(0);
        words.extend([AT_PAGESZ, crate::page::PAGE_SIZE as u64, AT_NULL, 0]);

        let sp = (self.cpu.get(REG_SP) - 8 * words.len() as u64) & !0xf;
        for (i, word) in words.iter().enumerate() {
            self.memory.write_u64(sp + 8 * i as u64, *word)?;
        }
        self.cpu.set(REG_SP, sp);
        self.memory.set_stack_initial(sp);
        Ok(())
    }

    /// Installs `write` for stdout and stderr, `exit` and `exit_group`.
    pub fn setup_linux_syscalls(&mut self) {
        self.install_syscall_handler(SYSCALL_WRITE, linux_write);
        self.install_syscall_handler(SYSCALL_EXIT, linux_exit);
        self.install_syscall_handler(SYSCALL_EXIT_GROUP, linux_exit);
    }
}

fn linux_write<U>(machine: &mut Machine<U>) -> Result<()> {
    let fd = machine.sysarg(0);
    if fd != 1 && fd != 2 {
        machine.set_result(-EBADF);
        return Ok(());
    }
    let data = machine.sysarg_buffer(1)?;
    log::info!("{}", String::from_utf8_lossy(&data).trim_end());
    machine.set_result(data.len() as i64);
    Ok(())
}

fn linux_exit<U>(machine: &mut Machine<U>) -> Result<()> {
    log::trace!("guest exit({})", machine.sysarg(0) as i64);
    machine.stop();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{MachineOptions, SYSCALL_EBREAK};
    use forkvm_test_util::{Assembler, ElfBuilder};

    fn halt(m: &mut Machine<()>) -> Result<()> {
        m.stop();
        Ok(())
    }

    fn machine() -> Machine<()> {
        let _ = env_logger::try_init();
        let mut asm = Assembler::new();
        asm.label("_start");
        asm.ebreak();
        asm.label("syscall");
        asm.ecall();
        asm.ret();
        let binary = ElfBuilder::new(asm).build();
        let mut m = Machine::new(&binary, &MachineOptions::default(), ()).unwrap();
        m.install_syscall_handler(SYSCALL_EBREAK, halt);
        m.setup_linux(&["prog"], &["USER=groot"]).unwrap();
        m.setup_linux_syscalls();
        let heap = m.memory.mmap_allocate(1 << 20).unwrap();
        m.setup_native_heap(80, heap, 1 << 20);
        m.setup_native_memory(85);
        m
    }

    fn syscall(m: &mut Machine<()>, number: u64, args: &[u64]) -> Result<i64> {
        let addr = m.address_of("syscall");
        let call: Vec<_> = args.iter().map(|a| crate::Arg::Int(*a)).collect();
        m.cpu.set(crate::cpu::REG_SP, m.memory.stack_initial());
        m.setup_call(&call)?;
        m.cpu.set(crate::cpu::REG_ARG7, number);
        m.cpu.pc = addr;
        m.simulate(100)?;
        Ok(m.return_value())
    }

    #[test]
    fn linux_stack_layout() {
        let mut m = machine();
        let sp = m.memory.stack_initial();
        assert_eq!(sp % 16, 0);
        assert_eq!(m.memory.read_u64(sp).unwrap(), 1);
        let argv0 = m.memory.read_u64(sp + 8).unwrap();
        assert_eq!(m.memory.memstring(argv0, 64).unwrap(), "prog");
        assert_eq!(m.memory.read_u64(sp + 16).unwrap(), 0);
        let env0 = m.memory.read_u64(sp + 24).unwrap();
        assert_eq!(m.memory.memstring(env0, 64).unwrap(), "USER=groot");
    }

    #[test]
    fn heap_calls() {
        let mut m = machine();
        let a = syscall(&mut m, 80, &[32]).unwrap();
        assert_ne!(a, 0);
        let b = syscall(&mut m, 81, &[4, 8]).unwrap();
        assert_ne!(b, 0);
        assert_eq!(m.memory.read_u64(b as u64).unwrap(), 0);

        m.memory.write_bytes(a as u64, b"abc").unwrap();
        let c = syscall(&mut m, 82, &[a as u64, 4096]).unwrap();
        assert_eq!(m.memory.read_vec(c as u64, 3).unwrap(), b"abc");

        assert_eq!(syscall(&mut m, 83, &[c as u64]).unwrap(), 0);
        assert!(syscall(&mut m, 83, &[c as u64]).is_err());
        assert_eq!(m.arena().unwrap().chunks_used(), 1);
    }

    #[test]
    fn memory_calls() {
        let mut m = machine();
        let buf = syscall(&mut m, 80, &[64]).unwrap() as u64;
        syscall(&mut m, 86, &[buf, u64::from(b'x'), 4]).unwrap();
        assert_eq!(syscall(&mut m, 89, &[buf]).unwrap(), 4);
        syscall(&mut m, 85, &[buf + 16, buf, 5]).unwrap();
        assert_eq!(syscall(&mut m, 88, &[buf, buf + 16, 5]).unwrap(), 0);
        m.memory.write_u8(buf + 16, b'a').unwrap();
        assert!(syscall(&mut m, 88, &[buf, buf + 16, 5]).unwrap() > 0);
    }

    #[test]
    fn write_to_unknown_fd() {
        let mut m = machine();
        assert_eq!(syscall(&mut m, 64, &[7, 0, 0]).unwrap(), -EBADF);
    }
}
