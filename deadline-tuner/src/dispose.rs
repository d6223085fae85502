//! Releasing a transport while a slow write is still in flight.
//!
//! The scenario: a sink whose every write takes a very long time, a write
//! issued against it with a short deadline, and a release requested while
//! that write is outstanding.  Released naively, the handle would be torn
//! down underneath the write and the deadline timer would then fire against
//! a dead object.
//!
//! Routed through [`TransportGuard`] the order is always:
//!
//! 1. release requested, new operations refused;
//! 2. deadline fires, the write future is dropped and unwinds;
//! 3. in-flight count hits zero, the sink is closed.
//!
//! [`SlowSink`] records whether `close` ever ran with a write active so the
//! ordering can be checked rather than assumed.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::controller::Outcome;
use crate::guard::TransportGuard;
use crate::transport::{classify, TransferError, Transport};

/// Message written by [`run_dispose_race`].
pub const GREETING: &[u8] = b"Hello, World!";

/// Shared view into a [`SlowSink`] that outlives the sink itself.
#[derive(Debug, Default)]
pub struct SinkProbe {
    active_writes: AtomicUsize,
    closed: AtomicBool,
    closed_while_active: AtomicBool,
    /// Latched by the first write; never cleared.
    any_write_started: AtomicBool,
    write_started: Notify,
}

impl SinkProbe {
    pub fn active_writes(&self) -> usize {
        self.active_writes.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// `true` if `close` ran while a write was still active.
    pub fn closed_while_active(&self) -> bool {
        self.closed_while_active.load(Ordering::SeqCst)
    }

    /// Resolves once a write has started, immediately if one already has.
    pub async fn write_started(&self) {
        loop {
            let started = self.write_started.notified();
            tokio::pin!(started);
            started.as_mut().enable();
            if self.any_write_started.load(Ordering::SeqCst) {
                return;
            }
            started.await;
        }
    }
}

/// Marks a write active until dropped, including when cancelled.
struct ActiveWrite<'a>(&'a SinkProbe);

impl Drop for ActiveWrite<'_> {
    fn drop(&mut self) {
        self.0.active_writes.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A write-only transport whose writes take `write_delay` each.
#[derive(Debug)]
pub struct SlowSink {
    write_delay: Duration,
    probe: Arc<SinkProbe>,
}

impl SlowSink {
    pub fn new(write_delay: Duration) -> Self {
        Self {
            write_delay,
            probe: Arc::new(SinkProbe::default()),
        }
    }

    pub fn probe(&self) -> Arc<SinkProbe> {
        Arc::clone(&self.probe)
    }
}

impl Transport for SlowSink {
    async fn send(&mut self, _payload: &[u8]) -> Result<(), TransferError> {
        if self.probe.is_closed() {
            return Err(TransferError::Closed);
        }
        self.probe.active_writes.fetch_add(1, Ordering::SeqCst);
        let _active = ActiveWrite(&self.probe);
        self.probe.any_write_started.store(true, Ordering::SeqCst);
        self.probe.write_started.notify_waiters();
        tokio::time::sleep(self.write_delay).await;
        Ok(())
    }

    async fn receive(&mut self) -> Result<Vec<u8>, TransferError> {
        Err(std::io::Error::new(std::io::ErrorKind::Unsupported, "sink is write-only").into())
    }

    async fn close(&mut self) -> Result<(), TransferError> {
        if self.probe.active_writes() > 0 {
            self.probe.closed_while_active.store(true, Ordering::SeqCst);
        }
        self.probe.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// What happened during one run of the scenario.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisposeReport {
    pub write_outcome: Outcome,
    /// Error text of the write, if it failed.
    pub write_error: Option<String>,
    pub sink_closed: bool,
    pub closed_while_active: bool,
    /// From the write being issued until the release completed.
    pub elapsed: Duration,
}

/// Issue a write with `deadline` against a sink that needs `write_delay`,
/// request release while it is in flight, and report the ordering observed.
pub async fn run_dispose_race(
    write_delay: Duration,
    deadline: Duration,
) -> Result<DisposeReport, TransferError> {
    let sink = SlowSink::new(write_delay);
    let probe = sink.probe();
    let guard = TransportGuard::new(sink);

    let start = Instant::now();
    let writer = {
        let guard = guard.clone();
        tokio::spawn(async move { guard.send(GREETING, deadline).await })
    };

    // Release only once the write is really in progress.  A zero deadline
    // never reaches the sink, so don't wait for it in that case.
    if !deadline.is_zero() {
        probe.write_started().await;
    }
    log::info!(
        "[dispose] releasing with {} write(s) in flight",
        guard.in_flight()
    );
    guard.shutdown().await?;
    let elapsed = start.elapsed();

    let write = match writer.await {
        Ok(result) => result,
        Err(join_err) => {
            log::error!("[dispose] writer task failed: {join_err}");
            Err(TransferError::Closed)
        }
    };
    let write_outcome = classify(&write);
    let write_error = write.err().map(|e| e.to_string());
    log::info!("[dispose] write ended: {write_outcome}; released after {elapsed:?}");

    Ok(DisposeReport {
        write_outcome,
        write_error,
        sink_closed: probe.is_closed(),
        closed_while_active: probe.closed_while_active(),
        elapsed,
    })
}
