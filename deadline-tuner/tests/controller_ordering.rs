//! Serialization tests for the controller task.
//!
//! Many attempts run concurrently on a multi-threaded runtime, but each is
//! only allowed to report once the previous one in the script has been
//! applied.  The transitions the task records must then be identical to a
//! plain sequential fold of `record_outcome` over the same script.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::oneshot;
use tokio::task::JoinSet;

use deadline_tuner::actor;
use deadline_tuner::{record_outcome, ControllerState, Outcome};

fn script(len: usize, seed: u64) -> Vec<Outcome> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len)
        .map(|_| match rng.gen_range(0..4) {
            // bias towards expiries so long streaks show up
            0 | 1 => Outcome::DeadlineExpired,
            2 => Outcome::Success,
            _ => Outcome::OtherFailure,
        })
        .collect()
}

fn sequential(initial: ControllerState, script: &[Outcome]) -> Vec<ControllerState> {
    script
        .iter()
        .scan(initial, |s, &o| {
            *s = record_outcome(o, *s);
            Some(*s)
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_attempts_match_sequential_fold() {
    const ATTEMPTS: usize = 200;
    let initial = ControllerState::new(100);
    let script = script(ATTEMPTS, 7);
    let expected = sequential(initial, &script);

    let (ctl, task) = actor::spawn(initial, 0, ATTEMPTS);

    // turn[i] is released once attempt i-1 has been applied
    let mut txs = Vec::with_capacity(ATTEMPTS + 1);
    let mut rxs = Vec::with_capacity(ATTEMPTS + 1);
    for _ in 0..=ATTEMPTS {
        let (tx, rx) = oneshot::channel::<()>();
        txs.push(Some(tx));
        rxs.push(Some(rx));
    }

    let mut set = JoinSet::new();
    // Spawn in reverse so launch order differs from report order.
    for i in (0..ATTEMPTS).rev() {
        let ctl = ctl.clone();
        let outcome = script[i];
        let my_turn = rxs[i].take().unwrap();
        let next_turn = txs[i + 1].take().unwrap();
        set.spawn(async move {
            my_turn.await.expect("previous attempt vanished");
            let state = ctl.record(outcome).await.expect("controller alive");
            let _ = next_turn.send(());
            (i, state)
        });
    }
    txs[0].take().unwrap().send(()).unwrap();

    let mut observed = vec![None; ATTEMPTS];
    while let Some(joined) = set.join_next().await {
        let (i, state) = joined.unwrap();
        observed[i] = Some(state);
    }
    let observed: Vec<ControllerState> = observed.into_iter().map(Option::unwrap).collect();
    assert_eq!(observed, expected);

    let history = ctl.history().await.unwrap();
    assert_eq!(history.len(), ATTEMPTS);
    for (i, t) in history.iter().enumerate() {
        assert_eq!(t.seq, i as u64 + 1);
        assert_eq!(t.outcome, script[i]);
        assert_eq!(t.after, expected[i]);
    }

    ctl.shutdown().await;
    assert_eq!(task.join().await.unwrap(), expected[ATTEMPTS - 1]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unordered_reports_still_apply_each_outcome_once() {
    // Without a fixed order the final state is order-dependent, but the
    // number of transitions and the streak bookkeeping are not.
    let (ctl, task) = actor::spawn(ControllerState::new(0), 0, 1024);

    let mut set = JoinSet::new();
    for _ in 0..100 {
        let ctl = ctl.clone();
        set.spawn(async move { ctl.record(Outcome::Success).await.unwrap() });
    }
    while let Some(joined) = set.join_next().await {
        assert_eq!(joined.unwrap().consecutive_cancellations, 0);
    }

    let history = ctl.history().await.unwrap();
    assert_eq!(history.len(), 100);
    for pair in history.windows(2) {
        assert_eq!(pair[0].after, pair[1].before);
    }

    ctl.shutdown().await;
    assert_eq!(task.join().await.unwrap(), ControllerState::new(-100));
}
