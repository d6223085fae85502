//! The driving loop.
//!
//! ```text
//!  interval tick ──▶ spawn attempt ──▶ JoinSet ──▶ reap ──▶ RunSummary
//!                      │    ▲                      │
//!       deadline() ◀───┘    └── record(outcome) ───┘ (via ControllerHandle)
//! ```
//!
//! Each tick launches one attempt as its own task; the loop never waits for
//! an attempt before the next tick.  Attempts are not fire-and-forget: every
//! one lands in a [`JoinSet`] and is reaped by the same `select!`, so panics
//! and outcomes are observed.  On shutdown the loop stops launching, waits
//! for every outstanding attempt (each bounded by its own deadline), then
//! releases the transport, then stops the controller.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{interval, MissedTickBehavior};

use crate::actor::{self, ActorError, ControllerHandle, ControllerTask};
use crate::config::{ConfigError, TunerConfig};
use crate::controller::{ControllerState, Outcome};
use crate::guard::TransportGuard;
use crate::transport::{classify, TransferError, Transport};

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("controller: {0}")]
    Controller(#[from] ActorError),
    #[error("releasing transport: {0}")]
    Release(#[from] TransferError),
}

// ---------------------------------------------------------------------------
// Payload schedule
// ---------------------------------------------------------------------------

/// Grows the payload by a fixed step per attempt, independent of the
/// controller.
#[derive(Debug, Clone)]
pub struct PayloadSchedule {
    next_size: usize,
    growth: usize,
    max: usize,
    fill: u8,
}

impl PayloadSchedule {
    pub fn new(initial: usize, growth: usize, max: usize) -> Self {
        Self {
            next_size: initial.min(max),
            growth,
            max,
            fill: 0,
        }
    }

    /// Size the next call to [`next_payload`](Self::next_payload) will use.
    pub fn peek_size(&self) -> usize {
        self.next_size
    }

    /// Next payload.  The fill byte changes per attempt so a stale echo is
    /// distinguishable from the expected one.
    pub fn next_payload(&mut self) -> Vec<u8> {
        let payload = vec![self.fill; self.next_size];
        self.fill = self.fill.wrapping_add(1);
        self.next_size = self.next_size.saturating_add(self.growth).min(self.max);
        payload
    }
}

// ---------------------------------------------------------------------------
// Attempt
// ---------------------------------------------------------------------------

/// Result of one attempt, after the controller has applied it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptReport {
    pub cycle: u64,
    pub payload_len: usize,
    pub deadline: Duration,
    pub outcome: Outcome,
    pub state_after: ControllerState,
}

/// Run one attempt: echo `payload` through the transport under the current
/// deadline, classify the result, and feed it to the controller.
pub async fn attempt<T: Transport>(
    cycle: u64,
    guard: &TransportGuard<T>,
    controller: &ControllerHandle,
    payload: Vec<u8>,
) -> Result<AttemptReport, ActorError> {
    let deadline = controller.deadline();

    let result = guard
        .round_trip(&payload, deadline)
        .await
        .and_then(|reply| {
            if reply == payload {
                Ok(())
            } else {
                Err(TransferError::UnexpectedReply {
                    sent: payload.len(),
                    received: reply.len(),
                })
            }
        });

    let outcome = classify(&result);
    if let Err(e) = &result {
        log::trace!("[driver] cycle {cycle}: {e}");
    }
    let state_after = controller.record(outcome).await?;

    Ok(AttemptReport {
        cycle,
        payload_len: payload.len(),
        deadline,
        outcome,
        state_after,
    })
}

// ---------------------------------------------------------------------------
// Run summary
// ---------------------------------------------------------------------------

/// Totals for a finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Ticks observed, including skipped ones.
    pub cycles: u64,
    /// Attempts launched and reaped.
    pub attempts: u64,
    pub successes: u64,
    pub deadline_expired: u64,
    pub other_failures: u64,
    /// Ticks skipped because `max_in_flight` attempts were outstanding.
    pub skipped: u64,
    pub final_state: ControllerState,
}

#[derive(Debug, Default)]
struct Tally {
    cycles: u64,
    attempts: u64,
    successes: u64,
    deadline_expired: u64,
    other_failures: u64,
    skipped: u64,
}

impl Tally {
    fn count(&mut self, outcome: Outcome) {
        self.attempts += 1;
        match outcome {
            Outcome::Success => self.successes += 1,
            Outcome::DeadlineExpired => self.deadline_expired += 1,
            Outcome::OtherFailure => self.other_failures += 1,
        }
    }

    fn into_summary(self, final_state: ControllerState) -> RunSummary {
        RunSummary {
            cycles: self.cycles,
            attempts: self.attempts,
            successes: self.successes,
            deadline_expired: self.deadline_expired,
            other_failures: self.other_failures,
            skipped: self.skipped,
            final_state,
        }
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Owns the transport guard and the controller for one run.
pub struct Driver<T> {
    config: TunerConfig,
    guard: TransportGuard<T>,
    controller: ControllerHandle,
    controller_task: ControllerTask,
    payloads: PayloadSchedule,
}

impl<T: Transport> Driver<T> {
    /// Validate `config`, wrap `transport` in a guard, and start the
    /// controller task.  Must be called inside a tokio runtime.
    pub fn new(config: TunerConfig, transport: T) -> Result<Self, DriverError> {
        config.validate()?;
        let (controller, controller_task) = actor::spawn(
            ControllerState::new(config.initial_timeout_ms),
            config.min_deadline_ms,
            config.history_capacity,
        );
        let payloads = PayloadSchedule::new(
            config.initial_payload_size,
            config.payload_growth,
            config.max_payload_size,
        );
        Ok(Self {
            config,
            guard: TransportGuard::new(transport),
            controller,
            controller_task,
            payloads,
        })
    }

    pub fn controller(&self) -> &ControllerHandle {
        &self.controller
    }

    pub fn guard(&self) -> &TransportGuard<T> {
        &self.guard
    }

    /// Run until `shutdown` resolves or the configured cycle count is
    /// reached, then wind everything down in order.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<RunSummary, DriverError> {
        let mut ticker = interval(self.config.cycle_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut attempts: JoinSet<Result<AttemptReport, ActorError>> = JoinSet::new();
        let mut tally = Tally::default();
        tokio::pin!(shutdown);

        log::info!(
            "[driver] starting: timeout={}ms payload={}B (+{}B/attempt) every {:?}",
            self.config.initial_timeout_ms,
            self.payloads.peek_size(),
            self.config.payload_growth,
            self.config.cycle_interval
        );

        loop {
            if self.config.cycles.is_some_and(|n| tally.cycles >= n) {
                log::info!("[driver] reached {} cycle(s)", tally.cycles);
                break;
            }

            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("[driver] shutdown requested");
                    break;
                }

                // ── Reap a finished attempt ──────────────────────────────────
                Some(joined) = attempts.join_next() => {
                    self.absorb(joined, &mut tally).await?;
                }

                // ── External trigger: launch the next attempt ───────────────
                _ = ticker.tick() => {
                    tally.cycles += 1;
                    let cycle = tally.cycles;
                    if attempts.len() >= self.config.max_in_flight {
                        tally.skipped += 1;
                        log::warn!(
                            "[driver] cycle {cycle}: {} attempt(s) outstanding; skipping",
                            attempts.len()
                        );
                        continue;
                    }

                    let payload = self.payloads.next_payload();
                    log::debug!(
                        "[driver] cycle {cycle}: {}B with deadline {:?} ({})",
                        payload.len(),
                        self.controller.deadline(),
                        self.controller.current()
                    );
                    let guard = self.guard.clone();
                    let controller = self.controller.clone();
                    attempts.spawn(async move {
                        attempt(cycle, &guard, &controller, payload).await
                    });
                }
            }
        }

        // Stop launching; let every outstanding attempt finish or expire.
        log::debug!("[driver] draining {} attempt(s)", attempts.len());
        while let Some(joined) = attempts.join_next().await {
            self.absorb(joined, &mut tally).await?;
        }

        // Nothing is in flight any more, so the release cannot race a write.
        self.guard.shutdown().await?;

        self.controller.shutdown().await;
        let final_state = self.controller_task.join().await?;

        let summary = tally.into_summary(final_state);
        log::info!(
            "[driver] done: {} attempt(s), {} ok, {} expired, {} failed, {} skipped; final {}",
            summary.attempts,
            summary.successes,
            summary.deadline_expired,
            summary.other_failures,
            summary.skipped,
            summary.final_state
        );
        Ok(summary)
    }

    async fn absorb(
        &self,
        joined: Result<Result<AttemptReport, ActorError>, JoinError>,
        tally: &mut Tally,
    ) -> Result<(), DriverError> {
        match joined {
            Ok(Ok(report)) => {
                log::debug!(
                    "[driver] cycle {} {}B: {} -> {}",
                    report.cycle,
                    report.payload_len,
                    report.outcome,
                    report.state_after
                );
                tally.count(report.outcome);
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(join_err) => {
                // The attempt never reported; account for it here.
                log::error!("[driver] attempt task failed: {join_err}");
                self.controller.record(Outcome::OtherFailure).await?;
                tally.count(Outcome::OtherFailure);
            }
        }
        Ok(())
    }
}
