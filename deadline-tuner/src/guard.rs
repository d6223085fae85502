//! Scoped acquisition of a shared transport.
//!
//! [`TransportGuard`] is the only way the rest of the crate touches a
//! [`Transport`].  It enforces two rules:
//!
//! 1. Every operation is bounded by its own deadline.  When the deadline
//!    expires the operation's future is dropped *inside* the guard, so the
//!    transport lock is released and the in-flight count decremented before
//!    the caller ever sees [`TransferError::DeadlineExpired`].
//! 2. [`TransportGuard::shutdown`] refuses new operations, waits until the
//!    in-flight count drops to zero, and only then calls
//!    [`Transport::close`], exactly once.
//!
//! ```text
//!   attempt A ──send──┐
//!   attempt B ──send──┼──▶ in_flight ──▶ Mutex<Option<T>> ──▶ transport
//!   shutdown ─────────┘        │                    ▲
//!        └── wait until 0 ─────┘── take() + close ──┘
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;

use crate::transport::{TransferError, Transport};

/// Cloneable handle to a guarded transport.
pub struct TransportGuard<T> {
    inner: Arc<Shared<T>>,
}

impl<T> Clone for TransportGuard<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Shared<T> {
    /// `None` once the transport has been released.
    transport: Mutex<Option<T>>,
    in_flight: AtomicUsize,
    closing: AtomicBool,
    /// Signalled whenever `in_flight` drops to zero.
    idle: Notify,
}

/// Counts one operation as in flight for as long as it lives.
struct InFlight<'a> {
    count: &'a AtomicUsize,
    idle: &'a Notify,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

impl<T: Transport> TransportGuard<T> {
    pub fn new(transport: T) -> Self {
        Self {
            inner: Arc::new(Shared {
                transport: Mutex::new(Some(transport)),
                in_flight: AtomicUsize::new(0),
                closing: AtomicBool::new(false),
                idle: Notify::new(),
            }),
        }
    }

    /// Operations currently holding (or waiting for) the transport.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// `true` once [`shutdown`](Self::shutdown) has been requested.
    pub fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::SeqCst)
    }

    /// Send one message within `deadline`.
    pub async fn send(&self, payload: &[u8], deadline: Duration) -> Result<(), TransferError> {
        let _op = self.begin()?;
        bounded(deadline, async {
            let mut slot = self.inner.transport.lock().await;
            let transport = slot.as_mut().ok_or(TransferError::Closed)?;
            transport.send(payload).await
        })
        .await
    }

    /// Receive one message within `deadline`.
    pub async fn receive(&self, deadline: Duration) -> Result<Vec<u8>, TransferError> {
        let _op = self.begin()?;
        bounded(deadline, async {
            let mut slot = self.inner.transport.lock().await;
            let transport = slot.as_mut().ok_or(TransferError::Closed)?;
            transport.receive().await
        })
        .await
    }

    /// Send `payload` and wait for the reply, both within one `deadline`.
    ///
    /// The transport is held for the whole exchange so replies cannot be
    /// picked up by a concurrent attempt.
    pub async fn round_trip(
        &self,
        payload: &[u8],
        deadline: Duration,
    ) -> Result<Vec<u8>, TransferError> {
        let _op = self.begin()?;
        bounded(deadline, async {
            let mut slot = self.inner.transport.lock().await;
            let transport = slot.as_mut().ok_or(TransferError::Closed)?;
            transport.send(payload).await?;
            transport.receive().await
        })
        .await
    }

    /// Refuse new operations, wait for outstanding ones to finish or unwind,
    /// then release the transport.
    ///
    /// Safe to call more than once and from several tasks; only the first
    /// caller to reach the transport closes it, and no caller returns before
    /// that close has finished.
    pub async fn shutdown(&self) -> Result<(), TransferError> {
        if !self.inner.closing.swap(true, Ordering::SeqCst) {
            log::debug!("[guard] shutdown requested; in_flight={}", self.in_flight());
        }

        loop {
            let idle = self.inner.idle.notified();
            tokio::pin!(idle);
            // Register before checking the count so a drop to zero in between
            // is not missed.
            idle.as_mut().enable();
            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                break;
            }
            idle.await;
        }

        // Held across `close` so a concurrent caller returns only after the
        // transport is actually released.
        let mut slot = self.inner.transport.lock().await;
        match slot.take() {
            Some(mut transport) => {
                log::debug!("[guard] no operations in flight; releasing transport");
                transport.close().await
            }
            None => Ok(()),
        }
    }

    fn begin(&self) -> Result<InFlight<'_>, TransferError> {
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        let op = InFlight {
            count: &self.inner.in_flight,
            idle: &self.inner.idle,
        };
        if self.inner.closing.load(Ordering::SeqCst) {
            // dropping `op` undoes the increment
            return Err(TransferError::ShuttingDown);
        }
        Ok(op)
    }
}

/// Run `fut` under an attempt-scoped deadline.  A zero deadline has already
/// expired, so the operation is never started.
async fn bounded<R>(
    deadline: Duration,
    fut: impl Future<Output = Result<R, TransferError>>,
) -> Result<R, TransferError> {
    if deadline.is_zero() {
        return Err(TransferError::DeadlineExpired);
    }
    match timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_elapsed) => Err(TransferError::DeadlineExpired),
    }
}
