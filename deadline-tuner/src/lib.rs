//! `deadline-tuner` — adaptive per-attempt deadlines for message transfers.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────┐  tick   ┌─────────────┐  round_trip(deadline)  ┌────────────────┐
//!  │  Driver  │────────▶│  attempt N  │───────────────────────▶│ TransportGuard │
//!  └────┬─────┘ JoinSet └──────┬──────┘                        └───────┬────────┘
//!       │                      │ record(outcome)                       │
//!       │               ┌──────▼───────────┐                  ┌────────▼───────┐
//!       │  deadline()   │ controller task  │                  │   Transport    │
//!       └──────────────▶│ (sole owner of   │                  │ (TCP framing / │
//!                       │ ControllerState) │                  │  simulator)    │
//!                       └──────────────────┘                  └────────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`controller`] — the pure deadline update rule
//! - [`actor`]      — single-writer task that owns the controller state
//! - [`transport`]  — transport trait, transfer errors, outcome classification
//! - [`guard`]      — deadline-bounded operations and deferred release
//! - [`driver`]     — payload schedule, attempts, and the driving loop
//! - [`config`]     — tuning parameters
//! - [`framed`]     — length-prefixed TCP transport and echo server
//! - [`simulator`]  — seeded, fault-injecting in-process transport
//! - [`dispose`]    — releasing a transport under a slow in-flight write

pub mod actor;
pub mod config;
pub mod controller;
pub mod dispose;
pub mod driver;
pub mod framed;
pub mod guard;
pub mod simulator;
pub mod transport;

pub use config::TunerConfig;
pub use controller::{record_outcome, ControllerState, Outcome};
pub use driver::{Driver, RunSummary};
pub use guard::TransportGuard;
pub use transport::{TransferError, Transport};
