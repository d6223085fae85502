//! Adaptive deadline controller.
//!
//! Every transfer attempt is bounded by a deadline.  After each attempt the
//! controller folds the attempt's [`Outcome`] into its [`ControllerState`]:
//!
//! | Outcome           | `timeout_ms`                          | streak      |
//! |-------------------|---------------------------------------|-------------|
//! | `Success`         | `- 1`                                 | reset to 0  |
//! | `OtherFailure`    | `- 1`                                 | reset to 0  |
//! | `DeadlineExpired` | `+ floor(streak / 2)` (after `+= 1`)  | `+ 1`       |
//!
//! Under sustained success the deadline keeps probing shorter; a run of
//! expiries grows it super-linearly so the controller escapes a deadline that
//! is too aggressive.  Errors unrelated to the deadline are not evidence that
//! the deadline is too short, so they probe shorter exactly like a success.
//!
//! There is no floor on `timeout_ms`.  The clamp happens only when the value
//! is turned into a [`Duration`] for the next attempt (see
//! [`ControllerState::deadline`]); a zero deadline expires immediately.

use std::fmt;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// How a single transfer attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// Completed within its deadline.
    Success,
    /// Aborted because its deadline expired.
    DeadlineExpired,
    /// Failed for any reason other than the deadline.
    OtherFailure,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::DeadlineExpired => "deadline-expired",
            Self::OtherFailure => "other-failure",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ControllerState
// ---------------------------------------------------------------------------

/// Deadline budget plus the current deadline-expiry streak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ControllerState {
    /// Budget in milliseconds handed to the next attempt.  May go negative.
    pub timeout_ms: i64,
    /// Back-to-back attempts that ended in [`Outcome::DeadlineExpired`].
    pub consecutive_cancellations: u32,
}

impl ControllerState {
    /// Fresh state: `initial_timeout_ms` and an empty streak.
    pub const fn new(initial_timeout_ms: i64) -> Self {
        Self {
            timeout_ms: initial_timeout_ms,
            consecutive_cancellations: 0,
        }
    }

    /// Deadline for the next attempt, clamped to at least `min_ms`
    /// (and never below zero).
    pub fn deadline(&self, min_ms: u64) -> Duration {
        let floor = i64::try_from(min_ms).unwrap_or(i64::MAX);
        let ms = self.timeout_ms.max(floor).max(0);
        Duration::from_millis(ms as u64)
    }

    /// Apply one outcome in place.
    pub fn apply(&mut self, outcome: Outcome) {
        *self = record_outcome(outcome, *self);
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "timeout={}ms streak={}",
            self.timeout_ms, self.consecutive_cancellations
        )
    }
}

/// Fold one attempt outcome into the controller state.
///
/// Pure and total: saturating arithmetic means it cannot panic for any input.
pub fn record_outcome(outcome: Outcome, state: ControllerState) -> ControllerState {
    match outcome {
        Outcome::Success | Outcome::OtherFailure => ControllerState {
            timeout_ms: state.timeout_ms.saturating_sub(1),
            consecutive_cancellations: 0,
        },
        Outcome::DeadlineExpired => {
            let streak = state.consecutive_cancellations.saturating_add(1);
            ControllerState {
                timeout_ms: state.timeout_ms.saturating_add(i64::from(streak / 2)),
                consecutive_cancellations: streak,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn st(timeout_ms: i64, consecutive_cancellations: u32) -> ControllerState {
        ControllerState {
            timeout_ms,
            consecutive_cancellations,
        }
    }

    #[test]
    fn success_shortens_and_resets() {
        assert_eq!(record_outcome(Outcome::Success, st(100, 3)), st(99, 0));
    }

    #[test]
    fn other_failure_behaves_like_success() {
        for s in [st(100, 0), st(7, 5), st(-3, 1), st(0, 0)] {
            assert_eq!(
                record_outcome(Outcome::OtherFailure, s),
                record_outcome(Outcome::Success, s)
            );
        }
    }

    #[test]
    fn three_expiries_from_fresh_state() {
        let mut s = st(100, 0);
        let mut seen = Vec::new();
        for _ in 0..3 {
            s = record_outcome(Outcome::DeadlineExpired, s);
            seen.push(s);
        }
        assert_eq!(seen, vec![st(100, 1), st(101, 2), st(102, 3)]);
    }

    #[test]
    fn single_expiry_leaves_small_timeout_alone() {
        let s = record_outcome(Outcome::DeadlineExpired, st(5, 0));
        assert_eq!(s, st(5, 1));
        assert_eq!(s.deadline(0), Duration::from_millis(5));
    }

    #[test]
    fn expiry_growth_matches_formula() {
        for c in 0..50u32 {
            for t in [-10i64, 0, 1, 100] {
                let next = record_outcome(Outcome::DeadlineExpired, st(t, c));
                assert_eq!(next.consecutive_cancellations, c + 1);
                assert_eq!(next.timeout_ms, t + i64::from((c + 1) / 2));
            }
        }
    }

    #[test]
    fn expiry_run_is_non_decreasing() {
        let mut s = st(10, 0);
        let mut prev = s.timeout_ms;
        for _ in 0..200 {
            s.apply(Outcome::DeadlineExpired);
            assert!(s.timeout_ms >= prev);
            prev = s.timeout_ms;
        }
        // sum of floor(k/2) for k = 1..=200
        assert_eq!(s.timeout_ms, 10 + 100 * 100);
    }

    #[test]
    fn alternating_never_accumulates_streak() {
        let mut s = st(50, 0);
        for i in 0..20 {
            if i % 2 == 0 {
                s.apply(Outcome::DeadlineExpired);
                assert_eq!(s.consecutive_cancellations, 1);
            } else {
                s.apply(Outcome::Success);
                assert_eq!(s.consecutive_cancellations, 0);
            }
        }
        // every expiry adds 0, every success subtracts 1
        assert_eq!(s.timeout_ms, 40);
    }

    #[test]
    fn timeout_may_go_negative_but_deadline_clamps() {
        let mut s = st(1, 0);
        for _ in 0..3 {
            s.apply(Outcome::Success);
        }
        assert_eq!(s.timeout_ms, -2);
        assert_eq!(s.deadline(0), Duration::ZERO);
        assert_eq!(s.deadline(5), Duration::from_millis(5));
    }

    #[test]
    fn saturates_at_extremes() {
        assert_eq!(
            record_outcome(Outcome::Success, st(i64::MIN, 0)).timeout_ms,
            i64::MIN
        );
        let s = record_outcome(Outcome::DeadlineExpired, st(i64::MAX, u32::MAX));
        assert_eq!(s.timeout_ms, i64::MAX);
        assert_eq!(s.consecutive_cancellations, u32::MAX);
    }
}
