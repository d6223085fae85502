//! In-process network simulator for deterministic runs.
//!
//! [`SimulatedTransport`] stands in for a real peer so the controller can be
//! exercised without sockets.  Each send costs a latency drawn from a
//! configurable range plus a per-byte cost, and fails with an injected I/O
//! error at a configurable rate:
//!
//! | Knob                  | Effect                                         |
//! |-----------------------|------------------------------------------------|
//! | `latency_ms`          | Base delay per send, uniform in the range.     |
//! | `per_byte_latency_us` | Extra delay proportional to payload size.      |
//! | `failure_rate`        | Probability a send fails with `ConnectionReset`.|
//! | `seed`                | Seeds the RNG so runs are reproducible.        |
//!
//! A receive returns the payload of the last successful send (echo).

use std::io;
use std::ops::Range;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::transport::{TransferError, Transport};

/// Fault and latency model.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatorConfig {
    /// Base latency per send in milliseconds; `start == end` means fixed.
    pub latency_ms: Range<u64>,
    /// Additional microseconds per payload byte.
    pub per_byte_latency_us: u64,
    /// Probability in `[0.0, 1.0]` that a send fails.
    pub failure_rate: f64,
    pub seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        // No faults by default; a fixed, short latency.
        Self {
            latency_ms: 5..5,
            per_byte_latency_us: 0,
            failure_rate: 0.0,
            seed: 0,
        }
    }
}

/// Seeded, fault-injecting echo transport.
#[derive(Debug)]
pub struct SimulatedTransport {
    config: SimulatorConfig,
    rng: StdRng,
    echo: Option<Vec<u8>>,
    closed: bool,
    sends: u64,
    injected_failures: u64,
}

impl SimulatedTransport {
    pub fn new(config: SimulatorConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            rng,
            echo: None,
            closed: false,
            sends: 0,
            injected_failures: 0,
        }
    }

    /// Sends attempted so far, including failed and cancelled ones.
    pub fn sends(&self) -> u64 {
        self.sends
    }

    pub fn injected_failures(&self) -> u64 {
        self.injected_failures
    }

    /// Latency for a payload of `len` bytes; consumes randomness.
    fn latency_for(&mut self, len: usize) -> Duration {
        let (start, end) = (self.config.latency_ms.start, self.config.latency_ms.end);
        let base = if start < end {
            self.rng.gen_range(start..end)
        } else {
            start
        };
        let per_byte = self.config.per_byte_latency_us.saturating_mul(len as u64);
        Duration::from_millis(base) + Duration::from_micros(per_byte)
    }

    fn should_fail(&mut self) -> bool {
        let p = self.config.failure_rate;
        if p.is_nan() || p <= 0.0 {
            return false;
        }
        self.rng.gen_bool(p.min(1.0))
    }
}

impl Transport for SimulatedTransport {
    async fn send(&mut self, payload: &[u8]) -> Result<(), TransferError> {
        if self.closed {
            return Err(TransferError::Closed);
        }
        self.sends += 1;
        // Draw both values before sleeping so the random sequence does not
        // depend on whether this send is cancelled.
        let latency = self.latency_for(payload.len());
        let fail = self.should_fail();

        tokio::time::sleep(latency).await;

        if fail {
            self.injected_failures += 1;
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "simulated fault").into());
        }
        self.echo = Some(payload.to_vec());
        Ok(())
    }

    async fn receive(&mut self) -> Result<Vec<u8>, TransferError> {
        if self.closed {
            return Err(TransferError::Closed);
        }
        self.echo.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "nothing to receive").into()
        })
    }

    async fn close(&mut self) -> Result<(), TransferError> {
        self.closed = true;
        self.echo = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn echoes_after_configured_latency() {
        let mut sim = SimulatedTransport::new(SimulatorConfig {
            latency_ms: 20..20,
            per_byte_latency_us: 1000,
            ..SimulatorConfig::default()
        });
        let start = tokio::time::Instant::now();
        sim.send(b"hello").await.unwrap();
        assert_eq!(sim.sends(), 1);
        // 20ms base + 5 bytes * 1ms
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(25), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(30), "{elapsed:?}");
        assert_eq!(sim.receive().await.unwrap(), b"hello");
        assert!(sim.receive().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn same_seed_same_faults() {
        let cfg = SimulatorConfig {
            latency_ms: 1..10,
            failure_rate: 0.5,
            seed: 42,
            ..SimulatorConfig::default()
        };
        let mut a = SimulatedTransport::new(cfg.clone());
        let mut b = SimulatedTransport::new(cfg);

        let mut ra = Vec::new();
        let mut rb = Vec::new();
        for _ in 0..32 {
            ra.push(a.send(b"x").await.is_ok());
            rb.push(b.send(b"x").await.is_ok());
        }
        assert_eq!(ra, rb);
        assert_eq!(a.injected_failures(), b.injected_failures());
        assert!(a.injected_failures() > 0);
        assert!(a.injected_failures() < 32);
    }

    #[tokio::test]
    async fn closed_transport_refuses_io() {
        let mut sim = SimulatedTransport::new(SimulatorConfig::default());
        sim.close().await.unwrap();
        assert!(matches!(sim.send(b"x").await, Err(TransferError::Closed)));
        assert!(matches!(sim.receive().await, Err(TransferError::Closed)));
    }
}
