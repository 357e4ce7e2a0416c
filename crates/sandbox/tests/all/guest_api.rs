use forkvm::{MachineError, Script};
use forkvm_test_util::programs;

fn fork() -> Script {
    super::tenant(programs::guest_api()).vmfork().unwrap()
}

fn call(script: &mut Script, name: &str) -> forkvm::CallResult {
    let addr = script.resolve_address(name);
    assert_ne!(addr, 0, "{name} is not defined");
    script.call(addr, &[])
}

#[test]
fn print_and_log_return_lengths() {
    let mut script = fork();
    assert_eq!(
        call(&mut script, "say_hello").value(),
        Some(programs::HELLO.len() as i64)
    );
    assert_eq!(
        call(&mut script, "log_line").value(),
        Some("hello from the guest".len() as i64)
    );
    assert_eq!(call(&mut script, "self_test").value(), Some(7));
}

#[test]
fn log_length_counts_raw_bytes() {
    let mut script = fork();
    assert_eq!(call(&mut script, "log_raw").value(), Some(2));
}

#[test]
fn my_name_is_published() {
    let tenant = super::tenant(programs::guest_api());
    let call = tenant.forkcall(tenant.lookup("whoami"), 4).unwrap();
    assert_eq!(call.to_vec(), b"integration");
}

#[test]
fn halting_calls_return_to_the_host() {
    let mut script = fork();
    assert!(call(&mut script, "respond").value().is_some());
    assert!(call(&mut script, "assert_fail").value().is_some());
}

#[test]
fn native_heap() {
    let mut script = fork();
    let before = script.machine().arena().unwrap().bytes_used();
    assert_eq!(call(&mut script, "heap_cycle").value(), Some(0));
    assert_eq!(script.machine().arena().unwrap().bytes_used(), before);

    let result = call(&mut script, "bad_free");
    let report = result.fault().unwrap();
    assert_eq!(report.error.data(), 0x12340);
    assert!(matches!(report.error, MachineError::Guest { .. }));
    assert_eq!(report.callsite.name, "bad_free");
}

#[test]
fn unknown_system_calls_fail_softly() {
    let mut script = fork();
    assert_eq!(call(&mut script, "unknown").value(), Some(-38));
}
