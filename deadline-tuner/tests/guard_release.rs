//! Release ordering of guarded transports.
//!
//! All tests run on a paused clock: the sink "writes" for seconds of virtual
//! time while the tests complete instantly.

use std::time::Duration;

use deadline_tuner::dispose::{run_dispose_race, SlowSink};
use deadline_tuner::{Outcome, TransferError, TransportGuard};

#[tokio::test(start_paused = true)]
async fn release_waits_for_expiring_write() {
    let report = run_dispose_race(Duration::from_secs(10), Duration::from_secs(1))
        .await
        .expect("release");

    assert_eq!(report.write_outcome, Outcome::DeadlineExpired);
    assert!(report.sink_closed);
    assert!(!report.closed_while_active, "sink closed under a live write");
    assert!(report.elapsed >= Duration::from_secs(1));
    assert!(report.elapsed < Duration::from_secs(10));
}

#[tokio::test(start_paused = true)]
async fn release_waits_for_completing_write() {
    let report = run_dispose_race(Duration::from_millis(200), Duration::from_secs(1))
        .await
        .expect("release");

    assert_eq!(report.write_outcome, Outcome::Success);
    assert_eq!(report.write_error, None);
    assert!(report.sink_closed);
    assert!(!report.closed_while_active);
    assert!(report.elapsed >= Duration::from_millis(200));
    assert!(report.elapsed < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn release_waits_for_every_queued_writer() {
    let sink = SlowSink::new(Duration::from_millis(100));
    let probe = sink.probe();
    let guard = TransportGuard::new(sink);

    // Writes are serialized by the guard: 100ms, 200ms, ... to finish.
    let mut writers = Vec::new();
    for _ in 0..5 {
        let guard = guard.clone();
        writers.push(tokio::spawn(async move {
            guard.send(b"x", Duration::from_secs(5)).await
        }));
    }
    probe.write_started().await;
    assert!(guard.in_flight() >= 1);

    guard.shutdown().await.expect("release");
    assert_eq!(guard.in_flight(), 0);
    assert!(probe.is_closed());
    assert!(!probe.closed_while_active());

    for w in writers {
        let result = w.await.unwrap();
        // a writer that had not yet registered when shutdown began is refused
        assert!(
            matches!(result, Ok(()) | Err(TransferError::ShuttingDown)),
            "unexpected: {result:?}"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn queued_writers_expire_independently() {
    let sink = SlowSink::new(Duration::from_millis(300));
    let probe = sink.probe();
    let guard = TransportGuard::new(sink);

    let first = {
        let guard = guard.clone();
        tokio::spawn(async move { guard.send(b"a", Duration::from_secs(1)).await })
    };
    probe.write_started().await;

    // Waits behind `first` for the lock and runs out of time doing so.
    let second = guard.send(b"b", Duration::from_millis(100)).await;
    assert!(matches!(second, Err(TransferError::DeadlineExpired)));

    // The expiry of `second` did not disturb `first`.
    assert!(first.await.unwrap().is_ok());
    assert_eq!(probe.active_writes(), 0);
    assert!(!probe.is_closed());
}

#[tokio::test(start_paused = true)]
async fn writes_after_release_are_refused() {
    let guard = TransportGuard::new(SlowSink::new(Duration::from_millis(10)));
    guard.shutdown().await.unwrap();
    let err = guard.send(b"late", Duration::from_secs(1)).await.unwrap_err();
    assert!(matches!(err, TransferError::ShuttingDown));
}
