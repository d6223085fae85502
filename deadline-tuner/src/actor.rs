//! Single-owner controller task.
//!
//! Attempts run concurrently, but [`ControllerState`] has exactly one writer:
//! the task spawned by [`spawn`].  Outcomes travel to it over an `mpsc`
//! channel and are applied strictly in the order they are received, which is
//! the order in which attempts *complete*.  After every update the new state
//! is republished on a `watch` channel so the next attempt can read its
//! deadline without a round-trip.
//!
//! ```text
//!  attempt ─┐  Record(outcome)        ┌──────────────────────┐
//!  attempt ─┼────────────────────────▶│ controller_loop      │
//!  attempt ─┘       (mpsc)            │  owns ControllerState│
//!      ▲                              └──────────┬───────────┘
//!      └──────── deadline() ◀── watch ───────────┘
//! ```

use std::collections::VecDeque;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::controller::{record_outcome, ControllerState, Outcome};

const COMMAND_QUEUE: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ActorError {
    #[error("controller task has stopped")]
    Stopped,
}

/// One applied update, kept for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Position in application order, starting at 1.
    pub seq: u64,
    pub outcome: Outcome,
    pub before: ControllerState,
    pub after: ControllerState,
}

enum Command {
    Record {
        outcome: Outcome,
        reply: oneshot::Sender<ControllerState>,
    },
    Snapshot {
        reply: oneshot::Sender<ControllerState>,
    },
    History {
        reply: oneshot::Sender<Vec<Transition>>,
    },
    Shutdown,
}

/// Cheap, cloneable handle used by attempts to talk to the controller task.
#[derive(Clone)]
pub struct ControllerHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ControllerState>,
    min_deadline_ms: u64,
}

/// Owns the controller task; await [`ControllerTask::join`] for the final
/// state.
pub struct ControllerTask {
    handle: JoinHandle<ControllerState>,
}

/// Spawn the controller task.
///
/// `history_capacity` bounds how many transitions [`ControllerHandle::history`]
/// can return; older ones are discarded first.
pub fn spawn(
    initial: ControllerState,
    min_deadline_ms: u64,
    history_capacity: usize,
) -> (ControllerHandle, ControllerTask) {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
    let (state_tx, state_rx) = watch::channel(initial);

    let handle = tokio::spawn(controller_loop(
        initial,
        history_capacity.max(1),
        cmd_rx,
        state_tx,
    ));

    (
        ControllerHandle {
            commands: cmd_tx,
            state: state_rx,
            min_deadline_ms,
        },
        ControllerTask { handle },
    )
}

impl ControllerHandle {
    /// Apply `outcome` and return the state right after it.
    pub async fn record(&self, outcome: Outcome) -> Result<ControllerState, ActorError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Record { outcome, reply })
            .await
            .map_err(|_| ActorError::Stopped)?;
        rx.await.map_err(|_| ActorError::Stopped)
    }

    /// Current state, queued behind any outcomes already sent.
    pub async fn snapshot(&self) -> Result<ControllerState, ActorError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot { reply })
            .await
            .map_err(|_| ActorError::Stopped)?;
        rx.await.map_err(|_| ActorError::Stopped)
    }

    /// Transitions applied so far, oldest first.
    pub async fn history(&self) -> Result<Vec<Transition>, ActorError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::History { reply })
            .await
            .map_err(|_| ActorError::Stopped)?;
        rx.await.map_err(|_| ActorError::Stopped)
    }

    /// Most recently published state.
    pub fn current(&self) -> ControllerState {
        *self.state.borrow()
    }

    /// Deadline for the next attempt, clamped to the configured floor.
    pub fn deadline(&self) -> Duration {
        self.current().deadline(self.min_deadline_ms)
    }

    /// Ask the task to stop after draining commands already queued.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}

impl ControllerTask {
    /// Wait for the task to finish and return its final state.
    pub async fn join(self) -> Result<ControllerState, ActorError> {
        self.handle.await.map_err(|_| ActorError::Stopped)
    }
}

async fn controller_loop(
    mut state: ControllerState,
    history_capacity: usize,
    mut commands: mpsc::Receiver<Command>,
    published: watch::Sender<ControllerState>,
) -> ControllerState {
    let mut history: VecDeque<Transition> = VecDeque::with_capacity(history_capacity.min(1024));
    let mut seq = 0u64;

    // Ends on Shutdown, or when every handle has been dropped.
    while let Some(cmd) = commands.recv().await {
        match cmd {
            Command::Record { outcome, reply } => {
                let before = state;
                state = record_outcome(outcome, state);
                seq += 1;

                if history.len() == history_capacity {
                    history.pop_front();
                }
                history.push_back(Transition {
                    seq,
                    outcome,
                    before,
                    after: state,
                });

                published.send_replace(state);
                log::trace!("[actor] #{seq} {outcome}: {before} -> {state}");
                // The attempt may have been aborted while waiting; the update
                // still stands.
                let _ = reply.send(state);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(state);
            }
            Command::History { reply } => {
                let _ = reply.send(history.iter().copied().collect());
            }
            Command::Shutdown => {
                log::debug!("[actor] shutdown after {seq} update(s); final {state}");
                break;
            }
        }
    }

    state
}
