//! Ready-made guest programs shared by the test suites.
//!
//! Every program exits from `_start` (after running `on_init` when it has
//! one), so it can be used as a template.

use crate::asm::*;
use crate::elf::ElfBuilder;

/// The text published by [`hello_world`]'s `on_client_request`.
pub const HELLO: &[u8] = b"Hello World";

/// Value `on_init` stores in the request counter of [`hello_world`].
pub const INIT_COUNTER: i64 = 42;

/// Size of the buffer published by [`large_response`].
pub const LARGE_LEN: usize = 10_000;

pub const SYS_SELF_TEST: i64 = 100;
pub const SYS_ASSERTION_FAILED: i64 = 101;
pub const SYS_PRINT: i64 = 102;
pub const SYS_WRITE_LOG: i64 = 103;
pub const SYS_MY_NAME: i64 = 109;
pub const SYS_CREATE_RESPONSE: i64 = 111;
pub const SYS_MALLOC: i64 = 80;
pub const SYS_FREE: i64 = 83;
pub const SYS_EXIT: i64 = 93;
/// Unassigned by the sandbox; tests install their own handler.
pub const SYS_HOST_CALLBACK: i64 = 200;

fn exit(a: &mut Assembler) {
    a.li(A0, 0);
    a.syscall(SYS_EXIT);
}

/// Publishes `table` through a2/a3 with `count` entries.
fn publish(a: &mut Assembler, table: &str, count: i64) {
    a.la(A2, table);
    a.li(A3, count);
}

/// The pattern stored in [`large_response`]'s buffer.
pub fn large_pattern() -> Vec<u8> {
    (0..LARGE_LEN).map(|i| (i % 251) as u8).collect()
}

/// A request handler with global state.
///
/// - `on_init` sets `counter` to [`INIT_COUNTER`].
/// - `on_client_request` increments `counter`, publishes [`HELLO`] as a
///   single buffer and returns the new counter value.
/// - `get_counter` returns `counter`; `set_counter(v)` overwrites it.
/// - `scribble(v)` fills the first word of the two pages after `scratch`
///   with `v` and returns it.
pub fn hello_world() -> Vec<u8> {
    let mut a = Assembler::new();
    a.label("_start");
    a.call("on_init");
    exit(&mut a);

    a.label("on_init");
    a.la(T0, "counter");
    a.li(T1, INIT_COUNTER);
    a.sd(T1, T0, 0);
    a.ret();

    a.label("on_client_request");
    a.la(T0, "counter");
    a.ld(A0, T0, 0);
    a.addi(A0, A0, 1);
    a.sd(A0, T0, 0);
    a.la(T1, "table");
    a.la(T2, "message");
    a.sd(T2, T1, 0);
    a.li(T3, HELLO.len() as i64);
    a.sd(T3, T1, 8);
    publish(&mut a, "table", 1);
    a.ret();

    a.label("get_counter");
    a.la(T0, "counter");
    a.ld(A0, T0, 0);
    a.ret();

    a.label("set_counter");
    a.la(T0, "counter");
    a.sd(A0, T0, 0);
    a.ret();

    a.label("scribble");
    a.la(T0, "scratch");
    a.sd(A0, T0, 0);
    a.li(T1, 4096);
    a.add(T0, T0, T1);
    a.sd(A0, T0, 0);
    a.ret();

    a.align(8);
    a.label("message");
    a.bytes(HELLO);
    a.align(8);
    a.label("table");
    a.dword(0);
    a.dword(0);
    a.label("counter");
    a.dword(0);
    a.align(4096);
    a.label("scratch");
    a.zeros(2 * 4096);
    ElfBuilder::new(a).build()
}

/// `on_client_request` publishes [`large_pattern`] as one table entry
/// spanning several pages.
pub fn large_response() -> Vec<u8> {
    let mut a = Assembler::new();
    a.label("_start");
    exit(&mut a);

    a.label("on_client_request");
    publish(&mut a, "table", 1);
    a.li(A0, 0);
    a.ret();

    a.align(8);
    a.label("table");
    a.dword_label("big");
    a.dword(LARGE_LEN as u64);
    a.align(4096);
    a.bytes(&[0xee; 100]);
    a.label("big");
    a.bytes(&large_pattern());
    ElfBuilder::new(a).build()
}

/// Functions that never return: `spin` loops forever, `count(n)` counts up
/// in a0 forever starting at `n`.
pub fn infinite_loop() -> Vec<u8> {
    let mut a = Assembler::new();
    a.label("_start");
    exit(&mut a);

    a.label("on_client_request");
    a.label("spin");
    a.j("spin");

    a.label("count");
    a.addi(A0, A0, 1);
    a.j("count");
    ElfBuilder::new(a).build()
}

/// A program whose initialization never finishes.
pub fn init_loop() -> Vec<u8> {
    let mut a = Assembler::new();
    a.label("_start");
    a.j("_start");
    ElfBuilder::new(a).build()
}

/// A program whose initialization crashes.
pub fn init_crash() -> Vec<u8> {
    let mut a = Assembler::new();
    a.label("_start");
    a.li(T0, 16);
    a.sd(T0, T0, 0);
    exit(&mut a);
    ElfBuilder::new(a).build()
}

/// Functions that fault: `illegal` executes an all-zero instruction,
/// `null_write` stores through a null pointer from a nested call.
pub fn faulting() -> Vec<u8> {
    let mut a = Assembler::new();
    a.label("_start");
    exit(&mut a);

    a.label("on_client_request");
    a.label("illegal");
    a.word(0);

    a.label("null_write");
    a.addi(SP, SP, -16);
    a.sd(RA, SP, 8);
    a.sd(FP, SP, 0);
    a.addi(FP, SP, 16);
    a.call("null_write_inner");
    a.ld(RA, SP, 8);
    a.ld(FP, SP, 0);
    a.addi(SP, SP, 16);
    a.ret();

    a.label("null_write_inner");
    a.sd(A0, ZERO, 0);
    a.ret();
    ElfBuilder::new(a).build()
}

/// Functions exercising the guest system call API.
///
/// - `say_hello` prints [`HELLO`] and returns what `print` returned.
/// - `log_line` writes a log line and returns its length.
/// - `log_raw` writes the two bytes `ff fe`, which are not UTF-8.
/// - `whoami` publishes the tenant name.
/// - `respond` requests a response and never returns.
/// - `assert_fail` reports a failed assertion.
/// - `heap_cycle` allocates and frees 100 bytes, returning free's result.
/// - `bad_free` frees a pointer that was never allocated.
/// - `self_test` makes the self-test call and returns 7.
/// - `unknown` makes an unassigned system call.
pub fn guest_api() -> Vec<u8> {
    let mut a = Assembler::new();
    a.label("_start");
    exit(&mut a);

    a.label("say_hello");
    a.la(A0, "message");
    a.li(A1, HELLO.len() as i64);
    a.syscall(SYS_PRINT);
    a.ret();

    a.label("log_line");
    a.la(A0, "line");
    a.syscall(SYS_WRITE_LOG);
    a.ret();

    a.label("log_raw");
    a.la(A0, "raw");
    a.syscall(SYS_WRITE_LOG);
    a.ret();

    a.label("whoami");
    a.syscall(SYS_MY_NAME);
    a.la(T0, "table");
    a.sd(A0, T0, 0);
    a.sd(A1, T0, 8);
    publish(&mut a, "table", 1);
    a.ret();

    a.label("respond");
    a.syscall(SYS_CREATE_RESPONSE);
    a.label("respond_spin");
    a.j("respond_spin");

    a.label("assert_fail");
    a.la(A0, "line");
    a.la(A1, "line");
    a.li(A2, 12);
    a.la(A3, "line");
    a.syscall(SYS_ASSERTION_FAILED);
    a.label("assert_spin");
    a.j("assert_spin");

    a.label("heap_cycle");
    a.li(A0, 100);
    a.syscall(SYS_MALLOC);
    a.syscall(SYS_FREE);
    a.ret();

    a.label("bad_free");
    a.li(A0, 0x12340);
    a.syscall(SYS_FREE);
    a.ret();

    a.label("self_test");
    a.syscall(SYS_SELF_TEST);
    a.li(A0, 7);
    a.ret();

    a.label("unknown");
    a.syscall(399);
    a.ret();

    a.align(8);
    a.label("message");
    a.bytes(HELLO);
    a.bytes(&[0]);
    a.label("line");
    a.bytes(b"hello from the guest\0");
    a.label("raw");
    a.bytes(&[0xff, 0xfe, 0]);
    a.align(8);
    a.label("table");
    a.dword(0);
    a.dword(0);
    ElfBuilder::new(a).build()
}

/// `double(x)` returns `2 * x`; `spin` never returns.
///
/// `outer(x)` makes the [`SYS_HOST_CALLBACK`] system call with `x` and
/// returns its result plus 100.
pub fn preempt_target() -> Vec<u8> {
    let mut a = Assembler::new();
    a.label("_start");
    exit(&mut a);

    a.label("double");
    a.add(A0, A0, A0);
    a.ret();

    a.label("spin");
    a.j("spin");

    a.label("outer");
    a.li(T1, 100);
    a.syscall(SYS_HOST_CALLBACK);
    a.add(A0, A0, T1);
    a.ret();
    ElfBuilder::new(a).build()
}
