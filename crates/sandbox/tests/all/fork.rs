use forkvm::page_pool;
use forkvm_test_util::programs;

#[test]
fn writes_are_private_to_a_fork() {
    let tenant = super::tenant(programs::hello_world());
    let set = tenant.lookup("set_counter");
    let get = tenant.lookup("get_counter");

    let mut a = tenant.vmfork().unwrap();
    let mut b = tenant.vmfork().unwrap();
    assert_eq!(a.call(set, &[1000u64.into()]).value(), Some(1000));
    assert_eq!(a.call(get, &[]).value(), Some(1000));
    assert_eq!(b.call(get, &[]).value(), Some(programs::INIT_COUNTER));

    let mut c = tenant.vmfork().unwrap();
    assert_eq!(c.call(get, &[]).value(), Some(programs::INIT_COUNTER));
}

#[test]
fn forks_inherit_committed_bytes() {
    let tenant = super::tenant(programs::hello_world());
    let scribble = tenant.lookup("scribble");
    let get = tenant.lookup("get_counter");

    // Sibling forks write the same scratch pages.
    let mut sibling = tenant.vmfork().unwrap();
    assert_eq!(sibling.call(scribble, &[5u64.into()]).value(), Some(5));
    let mut fork = tenant.vmfork().unwrap();
    assert_eq!(fork.call(scribble, &[6u64.into()]).value(), Some(6));
    assert_eq!(fork.call(get, &[]).value(), Some(programs::INIT_COUNTER));

    let scratch = fork.resolve_address("scratch");
    let memory = &mut fork.machine_mut().memory;
    assert_eq!(memory.read_u64(scratch).unwrap(), 6);
    assert_eq!(memory.read_u64(scratch + 4096).unwrap(), 6);
    assert_eq!(memory.read_u64(scratch + 8).unwrap(), 0);
    let memory = &mut sibling.machine_mut().memory;
    assert_eq!(memory.read_u64(scratch).unwrap(), 5);
}

#[test]
fn fork_writes_to_inherited_page_keep_the_rest() {
    let tenant = super::tenant(programs::hello_world());
    let entry = tenant.lookup("on_client_request");
    let mut fork = tenant.vmfork().unwrap();
    let message = fork.resolve_address("message");
    fork.machine_mut().memory.write_u8(message, b'J').unwrap();
    assert_eq!(fork.call(entry, &[]).value(), Some(programs::INIT_COUNTER + 1));
    let memory = &mut fork.machine_mut().memory;
    assert_eq!(
        memory.read_vec(message, programs::HELLO.len()).unwrap(),
        b"Jello World"
    );
}

#[test]
fn pool_pages_come_back_zeroed() {
    let tenant = super::tenant(programs::hello_world());
    let scribble = tenant.lookup("scribble");
    for round in 1..5u64 {
        let mut fork = tenant.vmfork().unwrap();
        let scratch = fork.resolve_address("scratch");
        let memory = &mut fork.machine_mut().memory;
        assert_eq!(memory.read_u64(scratch).unwrap(), 0);
        assert_eq!(memory.read_u64(scratch + 4096).unwrap(), 0);
        assert_eq!(fork.call(scribble, &[round.into()]).value(), Some(round as i64));
    }
    assert!(page_pool::free_pages() >= 2);
}

#[test]
fn every_call_is_bounded() {
    let tenant = super::tenant(programs::infinite_loop());
    let spin = tenant.lookup("spin");
    let mut fork = tenant.vmfork().unwrap();
    for _ in 0..3 {
        assert!(fork.call(spin, &[]).is_timeout());
        assert!(fork.machine().instruction_counter() <= 200_000);
    }
}

#[test]
fn fork_survives_its_tenant() {
    let tenant = super::tenant(programs::hello_world());
    let entry = tenant.lookup("on_client_request");
    let mut fork = tenant.vmfork().unwrap();
    drop(tenant);
    assert_eq!(fork.call(entry, &[]).value(), Some(programs::INIT_COUNTER + 1));
}
