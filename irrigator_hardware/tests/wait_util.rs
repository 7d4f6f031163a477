use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};
use std::thread;
use std::time::Duration;

use irrigator_hardware::error::HwError;
use irrigator_hardware::util::wait_until_with_timeout;

#[test]
fn conversion_ready_success_path() {
    let ready = Arc::new(AtomicBool::new(false));
    let ready_bg = ready.clone();
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(3));
        ready_bg.store(true, Ordering::Relaxed);
    });

    let res = wait_until_with_timeout(
        || Ok(ready.load(Ordering::Relaxed)),
        Duration::from_millis(200),
        Duration::from_micros(200),
    );
    assert!(res.is_ok(), "expected success, got {res:?}");
}

#[test]
fn conversion_ready_timeout_path() {
    let err = wait_until_with_timeout(
        || Ok(false),
        Duration::from_millis(5),
        Duration::from_micros(200),
    )
    .expect_err("expected timeout error");

    match err {
        HwError::Timeout => {}
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn predicate_error_stops_the_wait() {
    let calls = AtomicUsize::new(0);
    let err = wait_until_with_timeout(
        || {
            calls.fetch_add(1, Ordering::Relaxed);
            Err(HwError::NoAck { addr: 0x2a })
        },
        Duration::from_secs(5),
        Duration::from_millis(1),
    )
    .expect_err("expected bus error");

    assert!(matches!(err, HwError::NoAck { addr: 0x2a }));
    assert_eq!(calls.load(Ordering::Relaxed), 1);
}
