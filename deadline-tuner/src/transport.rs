//! Message-transport boundary.
//!
//! [`Transport`] is the only thing the driving loop knows about the wire.
//! Implementations do byte I/O and nothing else: deadlines are applied by the
//! caller (see [`crate::guard::TransportGuard`]) so that expiry of one
//! attempt never cancels anything but that attempt.
//!
//! [`classify`] is the single place where a transfer result turns into a
//! controller [`Outcome`].

use std::future::Future;
use std::io;

use thiserror::Error;

use crate::controller::Outcome;

/// Errors a transfer can end with.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("deadline expired before the transfer completed")]
    DeadlineExpired,
    #[error("transport closed")]
    Closed,
    #[error("transport is shutting down")]
    ShuttingDown,
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },
    #[error("reply did not match the request ({sent} bytes sent, {received} received)")]
    UnexpectedReply { sent: usize, received: usize },
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A bidirectional message transport.
///
/// Methods take `&mut self`; exclusive access is arbitrated by the guard, so
/// implementations never see two operations at once.  Every returned future
/// must be safe to drop at an `.await` point: an expired deadline does exactly
/// that.
pub trait Transport: Send + 'static {
    /// Send one message.
    fn send(&mut self, payload: &[u8]) -> impl Future<Output = Result<(), TransferError>> + Send;

    /// Receive one message.  A peer that went away yields
    /// [`TransferError::Closed`].
    fn receive(&mut self) -> impl Future<Output = Result<Vec<u8>, TransferError>> + Send;

    /// Release the transport.  Called at most once, and only after every
    /// in-flight operation has terminated.
    fn close(&mut self) -> impl Future<Output = Result<(), TransferError>> + Send;
}

/// Map a transfer result onto the controller's outcome.
pub fn classify<T>(result: &Result<T, TransferError>) -> Outcome {
    match result {
        Ok(_) => Outcome::Success,
        Err(TransferError::DeadlineExpired) => Outcome::DeadlineExpired,
        Err(_) => Outcome::OtherFailure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_deadline_expiry_counts_as_expiry() {
        assert_eq!(classify(&Ok::<_, TransferError>(())), Outcome::Success);
        assert_eq!(
            classify::<()>(&Err(TransferError::DeadlineExpired)),
            Outcome::DeadlineExpired
        );

        let others = [
            TransferError::Closed,
            TransferError::ShuttingDown,
            TransferError::FrameTooLarge { len: 10, max: 5 },
            TransferError::UnexpectedReply {
                sent: 3,
                received: 4,
            },
            TransferError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
            // a timeout reported by the OS is not our deadline
            TransferError::Io(io::Error::new(io::ErrorKind::TimedOut, "os timeout")),
        ];
        for e in others {
            assert_eq!(classify::<()>(&Err(e)), Outcome::OtherFailure);
        }
    }
}
