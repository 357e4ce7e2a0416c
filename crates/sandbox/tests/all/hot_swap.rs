use forkvm::MachineInstance;
use forkvm_test_util::programs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

#[test]
fn readers_see_whole_instances() {
    let tenant = super::tenant(programs::hello_world());
    let hello = tenant.current_instance().unwrap();
    let large = Arc::new(
        MachineInstance::new(
            Arc::new(programs::large_response()),
            tenant.config().clone(),
        )
        .unwrap(),
    );
    let done = &AtomicBool::new(false);
    let tenant = &tenant;

    thread::scope(|s| {
        let readers: Vec<_> = (0..4)
            .map(|_| {
                s.spawn(move || {
                    let mut calls = 0;
                    while !done.load(Ordering::Relaxed) || calls == 0 {
                        let entry = tenant.lookup("on_client_request");
                        assert_ne!(entry, 0);
                        let call = tenant.forkcall(entry, 64).unwrap();
                        let bytes = call.to_vec();
                        assert!(
                            bytes == programs::HELLO || bytes == programs::large_pattern(),
                            "torn result of {} bytes",
                            bytes.len()
                        );
                        calls += 1;
                    }
                    calls
                })
            })
            .collect();

        for i in 0..50 {
            let next = if i % 2 == 0 { &large } else { &hello };
            let old = tenant.install(next.clone()).unwrap();
            assert!(Arc::ptr_eq(&old, &hello) || Arc::ptr_eq(&old, &large));
            thread::yield_now();
        }
        done.store(true, Ordering::Relaxed);
        for reader in readers {
            assert!(reader.join().unwrap() > 0);
        }
    });
}

#[test]
fn superseded_instance_outlives_its_forks() {
    let tenant = super::tenant(programs::hello_world());
    let entry = tenant.lookup("on_client_request");
    let call = tenant.forkcall(entry, 64).unwrap();
    let old = tenant.current_instance().unwrap();
    let weak = Arc::downgrade(&old);
    drop(old);

    tenant.reload_from(programs::large_response()).unwrap();
    assert!(weak.upgrade().is_some());
    assert_eq!(call.buffer(0), Some(programs::HELLO));
    drop(call);
    assert!(weak.upgrade().is_none());
}
