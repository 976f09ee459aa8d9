//! Killed and saturated session recovery on the persisted backoff schedule.
//!
//! A killed session triggers a recovery attempt and schedules the next
//! one roughly a minute out (± jitter). Ticks inside the window must not
//! attempt again; the first tick past it attempts exactly once more. A
//! saturated session gets one scheduled retry, spent at most once, and
//! any non-saturated observation clears the whole recovery record.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use tokio::sync::mpsc;

use gossip_core::CoreEvent;
use gossip_core::clock::ManualClock;
use gossip_core::config::CoreConfig;
use gossip_core::crypto::stub::StubSessionManager;
use gossip_core::discussions::InitiateOptions;
use gossip_core::engine::{CoreEngine, Identity};
use gossip_core::store::memory::MemoryStore;
use gossip_core::store::model::DiscussionStatus;
use gossip_core::transport::memory::InMemoryBoard;
use gossip_proto::ident::UserId;

type Engine = CoreEngine<StubSessionManager, InMemoryBoard, MemoryStore>;

const ALICE: UserId = UserId::from_bytes([0xA1; 32]);
const BOB: UserId = UserId::from_bytes([0xB0; 32]);

fn open_engine(
    user: UserId,
    name: &str,
    board: &InMemoryBoard,
    clock: &ManualClock,
) -> (Engine, mpsc::Receiver<CoreEvent>) {
    let identity = Identity {
        user_id: user,
        username: name.to_string(),
        public_keys: StubSessionManager::public_keys_of(&user),
        secret_keys_blob: name.as_bytes().to_vec(),
    };
    CoreEngine::open(
        identity,
        b"blob key".to_vec(),
        StubSessionManager::new(user),
        board.clone(),
        MemoryStore::new(),
        CoreConfig::default(),
        Arc::new(clock.clone()),
    )
    .unwrap()
}

async fn connected_pair() -> (
    Engine,
    mpsc::Receiver<CoreEvent>,
    Engine,
    ManualClock,
) {
    let board = InMemoryBoard::new();
    let clock = ManualClock::starting_at(1_700_000_000_000);
    let (alice, alice_events) = open_engine(ALICE, "alice", &board, &clock);
    let (bob, _bob_events) = open_engine(BOB, "bob", &board, &clock);

    alice
        .add_contact(BOB, "bob", StubSessionManager::public_keys_of(&BOB))
        .unwrap();
    alice
        .initialize(&BOB, InitiateOptions::default())
        .await
        .unwrap();
    bob.state_update().await.unwrap();
    bob.accept(&ALICE).await.unwrap();
    alice.state_update().await.unwrap();
    bob.state_update().await.unwrap();
    (alice, alice_events, bob, clock)
}

/// Counts announcements Alice has published so far; each recovery attempt
/// that reaches the transport adds one.
fn announcements(board_handle: &Engine) -> usize {
    board_handle.transport().announcement_count()
}

#[tokio::test]
async fn killed_session_recovers_once_per_window() {
    let (alice, _alice_events, _bob, clock) = connected_pair().await;
    let baseline = announcements(&alice);

    alice.with_crypto(|c| c.kill_peer(&BOB));

    // First observation: one recovery attempt, schedule the next.
    alice.state_update().await.unwrap();
    assert_eq!(announcements(&alice), baseline + 1);
    let recovery = alice
        .discussion_with(&BOB)
        .unwrap()
        .unwrap()
        .session_recovery
        .expect("recovery schedule must be persisted");
    assert!(recovery.killed_next_retry_at.is_some());

    // The attempt re-keyed our half; force the session dead again so the
    // schedule keeps gating.
    alice.with_crypto(|c| c.kill_peer(&BOB));

    // Inside the window (jitter reaches at most +2 s past 60 s): no-ops.
    for advance_ms in [10_000, 20_000, 20_000] {
        clock.advance(advance_ms); // +10 s, +30 s, +50 s
        alice.state_update().await.unwrap();
        assert_eq!(
            announcements(&alice),
            baseline + 1,
            "no recovery attempt inside the backoff window"
        );
    }

    // Past the window: exactly one more attempt, rescheduled.
    clock.advance(15_000); // +65 s
    alice.state_update().await.unwrap();
    assert_eq!(announcements(&alice), baseline + 2);
}

#[tokio::test]
async fn killed_recovery_requires_our_acceptance() {
    let board = InMemoryBoard::new();
    let clock = ManualClock::starting_at(1_700_000_000_000);
    let (alice, _alice_events) = open_engine(ALICE, "alice", &board, &clock);
    let (bob, _bob_events) = open_engine(BOB, "bob", &board, &clock);

    alice
        .add_contact(BOB, "bob", StubSessionManager::public_keys_of(&BOB))
        .unwrap();
    alice
        .initialize(&BOB, InitiateOptions::default())
        .await
        .unwrap();
    bob.state_update().await.unwrap();

    // Bob never accepted; even a killed observation must not make his
    // engine publish a handshake.
    bob.with_crypto(|c| c.kill_peer(&ALICE));
    let before = bob.transport().announcement_count();
    bob.state_update().await.unwrap();
    assert_eq!(bob.transport().announcement_count(), before);
}

#[tokio::test]
async fn active_discussion_with_killed_session_breaks() {
    let (alice, mut alice_events, _bob, _clock) = connected_pair().await;

    // refresh() kills the session mid-tick, after the status handler ran.
    alice.with_crypto(|c| {
        c.set_fail_establish(true);
        c.kill_peer_on_refresh(BOB);
    });
    alice.state_update().await.unwrap();

    assert_eq!(
        alice.discussion_with(&BOB).unwrap().unwrap().status,
        DiscussionStatus::Broken
    );
    let mut saw_status_change = false;
    while let Ok(event) = alice_events.try_recv() {
        if matches!(
            event,
            CoreEvent::DiscussionStatusChanged {
                new: DiscussionStatus::Broken,
                ..
            }
        ) {
            saw_status_change = true;
        }
    }
    assert!(saw_status_change, "the failsafe must surface the break");
}

#[tokio::test]
async fn saturated_session_gets_one_scheduled_retry() {
    let (alice, _alice_events, _bob, clock) = connected_pair().await;
    let baseline = announcements(&alice);

    alice.with_crypto(|c| c.set_saturated(&BOB, true));

    // First observation only schedules.
    alice.state_update().await.unwrap();
    assert_eq!(announcements(&alice), baseline);
    let recovery = alice
        .discussion_with(&BOB)
        .unwrap()
        .unwrap()
        .session_recovery
        .expect("saturated schedule must be persisted");
    assert!(recovery.saturated_retry_at.is_some());
    assert!(!recovery.saturated_retry_done);

    // Before the scheduled time: nothing.
    clock.advance(30_000);
    alice.state_update().await.unwrap();
    assert_eq!(announcements(&alice), baseline);

    // Past it: exactly one attempt, marked spent.
    clock.advance(35_000);
    alice.state_update().await.unwrap();
    assert_eq!(announcements(&alice), baseline + 1);

    // The renewal cleared saturation in the stub, so the session reports
    // active again and the next tick clears the recovery record.
    alice.state_update().await.unwrap();
    assert!(
        alice
            .discussion_with(&BOB)
            .unwrap()
            .unwrap()
            .session_recovery
            .is_none(),
        "a non-saturated observation resets recovery state"
    );
}

#[tokio::test]
async fn recovery_attempt_failure_still_reschedules() {
    let (alice, mut alice_events, _bob, _clock) = connected_pair().await;

    alice.with_crypto(|c| {
        c.kill_peer(&BOB);
        c.set_fail_establish(true);
    });
    alice.state_update().await.unwrap();

    // The establish failed, but the schedule must still be written.
    let recovery = alice
        .discussion_with(&BOB)
        .unwrap()
        .unwrap()
        .session_recovery
        .expect("failed attempts still reschedule");
    assert!(recovery.killed_next_retry_at.is_some());

    let mut saw_error = false;
    while let Ok(event) = alice_events.try_recv() {
        if matches!(event, CoreEvent::CoreError { .. }) {
            saw_error = true;
        }
    }
    assert!(saw_error, "the failed attempt must be surfaced");
}
