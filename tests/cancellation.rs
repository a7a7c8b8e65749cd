//! Scenario 6 (spec §8): a listening worker blocked in receive is
//! terminated by `listen_cancel` promptly, and a second cancel is a no-op.

use std::time::{Duration, Instant};

use librecast6::{Context, Socket};

#[test]
fn cancel_unblocks_a_worker_parked_in_receive() {
    let ctx = Context::new();
    let sock = Socket::new(&ctx).unwrap();

    sock.listen(|_msg| {}, |_err| {}).unwrap();

    let start = Instant::now();
    sock.listen_cancel().unwrap();
    assert!(
        start.elapsed() < Duration::from_secs(2),
        "cancellation should unblock the worker promptly"
    );

    // Idempotent: no worker is running any more.
    sock.listen_cancel().unwrap();
}
