//! The system call interface offered to tenant programs.

use crate::script::GuestMachine;
use forkvm_machine::{Result, STRING_MAX, SYSCALL_EBREAK};

pub const SELF_TEST: usize = 100;
pub const ASSERTION_FAILED: usize = 101;
pub const PRINT: usize = 102;
pub const WRITE_LOG: usize = 103;
pub const REGEX_COMPILE: usize = 104;
pub const REGEX_MATCH: usize = 105;
pub const REGEX_SUBST: usize = 106;
pub const REGEX_SUBST_HDR: usize = 107;
pub const REGEX_FREE: usize = 108;
pub const MY_NAME: usize = 109;
pub const SET_DECISION: usize = 110;
pub const CREATE_RESPONSE: usize = 111;

const ENOSYS: i64 = 38;

fn name(machine: &GuestMachine) -> &str {
    &machine.userdata().name
}

fn self_test(_machine: &mut GuestMachine) -> Result<()> {
    Ok(())
}

fn assertion_failed(machine: &mut GuestMachine) -> Result<()> {
    let expr = machine.sysarg_string(0, STRING_MAX)?;
    let file = machine.sysarg_string(1, STRING_MAX)?;
    let line = machine.sysarg(2) as i32;
    let func = machine.sysarg_string(3, STRING_MAX)?;
    log::error!(
        ">>> {}: assertion failed: {expr} in {file}:{line}, function {func}",
        name(machine)
    );
    machine.stop();
    Ok(())
}

fn print(machine: &mut GuestMachine) -> Result<()> {
    let buffer = machine.sysarg_buffer(0)?;
    let text = String::from_utf8_lossy(&buffer);
    log::info!(">>> {}: {}", name(machine), text.trim_end_matches('\n'));
    machine.set_result(buffer.len() as i64);
    Ok(())
}

/// Returns the number of bytes written. Bytes that are not UTF-8 are only
/// replaced in the log line.
fn write_log(machine: &mut GuestMachine) -> Result<()> {
    let addr = machine.sysarg(0);
    let len = machine.memory.strlen(addr, STRING_MAX)?;
    let bytes = machine.memory.read_vec(addr, len)?;
    let text = String::from_utf8_lossy(&bytes);
    log::info!(">>> {}: {}", name(machine), text.trim_end_matches('\n'));
    machine.set_result(len as i64);
    Ok(())
}

/// Regex and decision calls are reserved; the host side has no
/// implementation for them.
fn reserved(machine: &mut GuestMachine) -> Result<()> {
    log::trace!(
        "{}: reserved system call {}",
        name(machine),
        machine.sysarg(7)
    );
    Ok(())
}

fn my_name(machine: &mut GuestMachine) -> Result<()> {
    let config = machine.userdata().clone();
    let mut bytes = Vec::with_capacity(config.name.len() + 1);
    bytes.extend_from_slice(config.name.as_bytes());
    bytes.push(0);
    let ptr = machine
        .arena_mut()
        .and_then(|arena| arena.malloc(bytes.len() as u64))
        .unwrap_or(0);
    if ptr != 0 {
        machine.copy_to_guest(ptr, &bytes)?;
    }
    machine.cpu.set(forkvm_machine::REG_ARG1, config.name.len() as u64);
    machine.set_result(ptr as i64);
    Ok(())
}

fn create_response(machine: &mut GuestMachine) -> Result<()> {
    machine.stop();
    Ok(())
}

fn breakpoint(machine: &mut GuestMachine) -> Result<()> {
    machine.stop();
    Ok(())
}

fn unhandled(machine: &mut GuestMachine, number: u64) -> Result<()> {
    log::warn!("{}: VM unhandled system call: {number}", name(machine));
    machine.set_result(-ENOSYS);
    Ok(())
}

/// Installs the tenant API, the halt-on-breakpoint handler and the logger
/// for unknown system calls.
pub(crate) fn install(machine: &mut GuestMachine) {
    machine.install_syscall_handler(SELF_TEST, self_test);
    machine.install_syscall_handler(ASSERTION_FAILED, assertion_failed);
    machine.install_syscall_handler(PRINT, print);
    machine.install_syscall_handler(WRITE_LOG, write_log);
    machine.install_syscall_handler(REGEX_COMPILE, reserved);
    machine.install_syscall_handler(REGEX_MATCH, reserved);
    machine.install_syscall_handler(REGEX_SUBST, reserved);
    machine.install_syscall_handler(REGEX_SUBST_HDR, reserved);
    machine.install_syscall_handler(REGEX_FREE, reserved);
    machine.install_syscall_handler(MY_NAME, my_name);
    machine.install_syscall_handler(SET_DECISION, reserved);
    machine.install_syscall_handler(CREATE_RESPONSE, create_response);

    machine.install_syscall_handler(SYSCALL_EBREAK, breakpoint);
    machine.set_unhandled_syscall_handler(unhandled);
}
