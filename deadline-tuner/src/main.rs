//! Entry point for `deadline-tuner`.
//!
//! Parses CLI arguments and dispatches into one of four modes.  All actual
//! work is delegated to library modules; `main.rs` owns only process setup
//! (logging, signal handling, argument parsing).

use std::net::SocketAddr;
use std::ops::Range;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::net::TcpListener;

use deadline_tuner::config::DEFAULT_MAX_PAYLOAD;
use deadline_tuner::dispose::run_dispose_race;
use deadline_tuner::framed::{serve_echo, FramedTcp};
use deadline_tuner::simulator::{SimulatedTransport, SimulatorConfig};
use deadline_tuner::{Driver, RunSummary, Transport, TunerConfig};

/// Adaptive per-attempt deadlines for message transfers.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Run an echo server for `client` mode.
    Server {
        /// Local address to bind.
        #[arg(short, long, default_value = "127.0.0.1:9000")]
        bind: SocketAddr,
        /// Largest frame accepted, in bytes.
        #[arg(long, default_value_t = DEFAULT_MAX_PAYLOAD)]
        max_frame: usize,
    },
    /// Tune deadlines against a running echo server.
    Client {
        /// Echo server address.
        #[arg(short, long, default_value = "127.0.0.1:9000")]
        server: SocketAddr,
        #[command(flatten)]
        tuning: TuningArgs,
    },
    /// Tune deadlines against an in-process simulated peer.
    Simulate {
        /// Base latency range per send in ms, e.g. `5..40`.
        #[arg(long, default_value = "5..40", value_parser = parse_ms_range)]
        latency_ms: Range<u64>,
        /// Extra latency per payload byte, in microseconds.
        #[arg(long, default_value_t = 0)]
        per_byte_us: u64,
        /// Probability that a send fails with an injected error.
        #[arg(long, default_value_t = 0.05)]
        failure_rate: f64,
        /// RNG seed for reproducible runs.
        #[arg(long, default_value_t = 0)]
        seed: u64,
        #[command(flatten)]
        tuning: TuningArgs,
    },
    /// Release a transport while a slow write is in flight, safely.
    DisposeRace {
        /// How long each write to the sink takes.
        #[arg(long, default_value_t = 10_000)]
        write_delay_ms: u64,
        /// Deadline for the write.
        #[arg(long, default_value_t = 1_000)]
        deadline_ms: u64,
    },
}

/// Flags shared by the tuning modes.
#[derive(Args)]
struct TuningArgs {
    /// Deadline budget for the first attempt.
    #[arg(long, default_value_t = 100)]
    initial_timeout_ms: i64,
    /// Floor applied to the deadline handed to each attempt.
    #[arg(long, default_value_t = 0)]
    min_deadline_ms: u64,
    /// Payload size of the first attempt.
    #[arg(long, default_value_t = 1024)]
    payload_size: usize,
    /// Bytes added to the payload per attempt.
    #[arg(long, default_value_t = 1024)]
    payload_growth: usize,
    /// Milliseconds between attempts.
    #[arg(long, default_value_t = 50)]
    interval_ms: u64,
    /// Attempts allowed to be outstanding at once.
    #[arg(long, default_value_t = 64)]
    max_in_flight: usize,
    /// Stop after this many cycles (default: run until Ctrl-C).
    #[arg(long)]
    cycles: Option<u64>,
}

impl TuningArgs {
    fn into_config(self) -> TunerConfig {
        TunerConfig::default()
            .with_initial_timeout_ms(self.initial_timeout_ms)
            .with_min_deadline_ms(self.min_deadline_ms)
            .with_payload(self.payload_size, self.payload_growth)
            .with_cycle_interval(Duration::from_millis(self.interval_ms))
            .with_max_in_flight(self.max_in_flight)
            .with_cycles(self.cycles)
    }
}

fn parse_ms_range(s: &str) -> Result<Range<u64>, String> {
    let (lo, hi) = s
        .split_once("..")
        .ok_or_else(|| format!("expected `LOW..HIGH`, got `{s}`"))?;
    let lo: u64 = lo.trim().parse().map_err(|e| format!("bad low bound: {e}"))?;
    let hi: u64 = hi.trim().parse().map_err(|e| format!("bad high bound: {e}"))?;
    if lo > hi {
        return Err(format!("low bound {lo} exceeds high bound {hi}"));
    }
    Ok(lo..hi)
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::warn!("cannot listen for Ctrl-C ({e}); running until the cycle limit");
        std::future::pending::<()>().await;
    }
}

async fn tune<T: Transport>(config: TunerConfig, transport: T) -> Result<RunSummary> {
    let driver = Driver::new(config, transport)?;
    let summary = driver.run(ctrl_c()).await?;
    Ok(summary)
}

fn print_summary(summary: &RunSummary) {
    println!(
        "attempts={} ok={} expired={} failed={} skipped={} final_timeout={}ms streak={}",
        summary.attempts,
        summary.successes,
        summary.deadline_expired,
        summary.other_failures,
        summary.skipped,
        summary.final_state.timeout_ms,
        summary.final_state.consecutive_cancellations
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();

    match cli.mode {
        Mode::Server { bind, max_frame } => {
            let listener = TcpListener::bind(bind)
                .await
                .with_context(|| format!("binding {bind}"))?;
            log::info!("Echo server listening on {}", listener.local_addr()?);
            tokio::select! {
                res = serve_echo(listener, max_frame) => res.context("echo server")?,
                _ = ctrl_c() => log::info!("Server shutting down"),
            }
        }
        Mode::Client { server, tuning } => {
            log::info!("Tuning against {server}");
            let transport = FramedTcp::connect(server)
                .await
                .with_context(|| format!("connecting to {server}"))?;
            let summary = tune(tuning.into_config(), transport).await?;
            print_summary(&summary);
        }
        Mode::Simulate {
            latency_ms,
            per_byte_us,
            failure_rate,
            seed,
            tuning,
        } => {
            if !(0.0..=1.0).contains(&failure_rate) {
                anyhow::bail!("--failure-rate must be within 0.0..=1.0, got {failure_rate}");
            }
            let transport = SimulatedTransport::new(SimulatorConfig {
                latency_ms,
                per_byte_latency_us: per_byte_us,
                failure_rate,
                seed,
            });
            let summary = tune(tuning.into_config(), transport).await?;
            print_summary(&summary);
        }
        Mode::DisposeRace {
            write_delay_ms,
            deadline_ms,
        } => {
            let report = run_dispose_race(
                Duration::from_millis(write_delay_ms),
                Duration::from_millis(deadline_ms),
            )
            .await?;
            println!(
                "write={} error={} closed={} closed_while_active={} elapsed={:?}",
                report.write_outcome,
                report.write_error.as_deref().unwrap_or("-"),
                report.sink_closed,
                report.closed_while_active,
                report.elapsed
            );
        }
    }

    Ok(())
}
