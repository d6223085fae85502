//! Tuning parameters for the driving loop.
//!
//! [`TunerConfig`] starts from sensible defaults and is adjusted from CLI
//! flags in `main.rs`.  Call [`TunerConfig::validate`] before handing it to
//! [`crate::driver::Driver`].

use std::time::Duration;

use thiserror::Error;

/// Default frame cap shared by the payload growth limit and the TCP framing.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("cycle interval must be greater than zero")]
    ZeroInterval,
    #[error("max_in_flight must be at least 1")]
    ZeroInFlight,
    #[error("initial payload size {initial} exceeds max payload size {max}")]
    PayloadTooLarge { initial: usize, max: usize },
    #[error("history capacity must be at least 1")]
    ZeroHistory,
}

/// Adjustable parameters for one tuning run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunerConfig {
    /// Deadline budget for the very first attempt.
    pub initial_timeout_ms: i64,
    /// Floor applied when turning the budget into a deadline.
    pub min_deadline_ms: u64,
    /// Payload size of the first attempt, in bytes.
    pub initial_payload_size: usize,
    /// Bytes added to the payload on every subsequent attempt.
    pub payload_growth: usize,
    /// Payload growth saturates here.
    pub max_payload_size: usize,
    /// Period of the external trigger that launches attempts.
    pub cycle_interval: Duration,
    /// Cycles are skipped while this many attempts are outstanding.
    pub max_in_flight: usize,
    /// Stop after this many cycles; `None` runs until Ctrl-C.
    pub cycles: Option<u64>,
    /// Controller transitions kept for diagnostics.
    pub history_capacity: usize,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            initial_timeout_ms: 100,
            min_deadline_ms: 0,
            initial_payload_size: 1024,
            payload_growth: 1024,
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            cycle_interval: Duration::from_millis(50),
            max_in_flight: 64,
            cycles: None,
            history_capacity: 1024,
        }
    }
}

impl TunerConfig {
    pub fn with_initial_timeout_ms(mut self, ms: i64) -> Self {
        self.initial_timeout_ms = ms;
        self
    }

    pub fn with_min_deadline_ms(mut self, ms: u64) -> Self {
        self.min_deadline_ms = ms;
        self
    }

    pub fn with_payload(mut self, initial: usize, growth: usize) -> Self {
        self.initial_payload_size = initial;
        self.payload_growth = growth;
        self
    }

    pub fn with_max_payload_size(mut self, max: usize) -> Self {
        self.max_payload_size = max;
        self
    }

    pub fn with_cycle_interval(mut self, interval: Duration) -> Self {
        self.cycle_interval = interval;
        self
    }

    pub fn with_max_in_flight(mut self, n: usize) -> Self {
        self.max_in_flight = n;
        self
    }

    pub fn with_cycles(mut self, cycles: Option<u64>) -> Self {
        self.cycles = cycles;
        self
    }

    pub fn with_history_capacity(mut self, n: usize) -> Self {
        self.history_capacity = n;
        self
    }

    /// Reject combinations the driving loop cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cycle_interval.is_zero() {
            return Err(ConfigError::ZeroInterval);
        }
        if self.max_in_flight == 0 {
            return Err(ConfigError::ZeroInFlight);
        }
        if self.initial_payload_size > self.max_payload_size {
            return Err(ConfigError::PayloadTooLarge {
                initial: self.initial_payload_size,
                max: self.max_payload_size,
            });
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::ZeroHistory);
        }
        Ok(())
    }
}
