use forkvm::{SandboxError, TenantInstance};
use forkvm_test_util::programs;
use std::fs;
use std::thread;

#[test]
fn no_program_loaded() {
    let tenant = TenantInstance::new(super::config("empty"));
    assert!(tenant.no_program_loaded());
    assert!(tenant.current_instance().is_none());
    assert_eq!(tenant.lookup("on_client_request"), 0);
    assert!(matches!(
        tenant.forkcall(0, 64),
        Err(SandboxError::NoProgramLoaded)
    ));
}

#[test]
fn failed_initialization_leaves_no_program() {
    for binary in [programs::init_loop(), programs::init_crash(), vec![0; 64]] {
        let tenant = TenantInstance::with_binary(super::config("broken"), binary);
        assert!(tenant.no_program_loaded());
    }
}

#[test]
fn load_from_file_and_reload() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hello.elf");
    fs::write(&path, programs::hello_world()).unwrap();
    let mut config = super::config("file");
    config.filename = path.clone();

    let tenant = TenantInstance::new(config);
    assert_ne!(tenant.lookup("on_init"), 0);
    assert_ne!(tenant.lookup("get_counter"), 0);

    fs::write(&path, programs::large_response()).unwrap();
    tenant.reload().unwrap();
    assert_eq!(tenant.lookup("get_counter"), 0);

    fs::write(&path, b"garbage").unwrap();
    assert!(tenant.reload().is_err());
    assert_ne!(tenant.lookup("on_client_request"), 0);
}

#[test]
fn end_to_end() {
    let tenant = super::tenant(programs::hello_world());
    let entry = tenant.lookup("on_client_request");
    assert_ne!(entry, 0);
    let call = tenant.forkcall(entry, 64).unwrap();
    assert!(call.count() <= 64);
    assert_eq!(call.buffer(0), Some(programs::HELLO));

    // Each request sees the initialized state, never a previous request's.
    let call = tenant.forkcall(entry, 64).unwrap();
    assert_eq!(call.result().value(), Some(programs::INIT_COUNTER + 1));
}

#[test]
fn concurrent_forkcalls_agree() {
    let tenant = super::tenant(programs::large_response());
    let entry = tenant.lookup("on_client_request");
    let tenant = &tenant;
    let results: Vec<Vec<u8>> = thread::scope(|s| {
        let workers: Vec<_> = (0..2)
            .map(|_| s.spawn(move || tenant.forkcall(entry, 64).unwrap().to_vec()))
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });
    assert_eq!(results[0], results[1]);
    assert_eq!(results[0], programs::large_pattern());
}

#[test]
fn fork_faults_are_reported() {
    let tenant = super::tenant(programs::faulting());
    let call = tenant.forkcall(tenant.lookup("on_client_request"), 64).unwrap();
    assert!(call.result().fault().is_some());
    assert_eq!(call.count(), 0);
}
