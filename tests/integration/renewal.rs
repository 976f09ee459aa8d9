//! Session renewal: pending messages survive, delivered ones are left alone.
//!
//! Renewing re-keys the session. Everything not yet acknowledged returns
//! to the queue with its ciphertext discarded and is re-encrypted under
//! the new keys; acknowledged rows never move. The peer receives each
//! message exactly once.

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
use gossip_core::store::model::{
    DiscussionStatus, MessageDirection, MessageKind, MessageStatus,
};
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

async fn connected_pair() -> (Engine, Engine, InMemoryBoard, ManualClock) {
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
    bob.accept(&ALICE).await.unwrap();
    alice.state_update().await.unwrap();
    bob.state_update().await.unwrap();
    (alice, bob, board, clock)
}

fn outgoing_text(engine: &Engine, peer: &UserId, content: &str) -> gossip_core::store::model::Message {
    engine
        .messages_with(peer)
        .unwrap()
        .into_iter()
        .find(|m| {
            m.direction == MessageDirection::Outgoing
                && m.kind == MessageKind::Text
                && m.content == content
        })
        .unwrap()
}

#[tokio::test]
async fn renew_preserves_pending_and_skips_delivered() {
    let (alice, bob, _board, clock) = connected_pair().await;

    // "x" goes all the way to delivered.
    alice.send_text(&BOB, "x").await.unwrap();
    bob.state_update().await.unwrap();
    bob.send_text(&ALICE, "seen").await.unwrap();
    alice.state_update().await.unwrap();
    assert_eq!(outgoing_text(&alice, &BOB, "x").status, MessageStatus::Delivered);

    // "y" stays sent: Bob does not fetch before the renewal.
    clock.advance(50);
    alice.send_text(&BOB, "y").await.unwrap();
    assert_eq!(outgoing_text(&alice, &BOB, "y").status, MessageStatus::Sent);

    alice.renew(&BOB).await.unwrap();

    let x = outgoing_text(&alice, &BOB, "x");
    assert_eq!(x.status, MessageStatus::Delivered, "delivered rows are never reset");

    let y = outgoing_text(&alice, &BOB, "y");
    assert_eq!(y.status, MessageStatus::WaitingSession);
    assert!(y.seeker.is_none(), "old-session seeker must be cleared");
    assert!(y.encrypted.is_none(), "old-session ciphertext must be cleared");
    assert_eq!(y.content, "y", "content is preserved across the renewal");
}

#[tokio::test]
async fn renewed_message_is_received_exactly_once() {
    let (alice, bob, _board, clock) = connected_pair().await;

    alice.send_text(&BOB, "y").await.unwrap();
    // The relay holds the old-epoch ciphertext but Bob has not read it.
    alice.renew(&BOB).await.unwrap();

    clock.advance(10);
    alice.state_update().await.unwrap(); // re-encrypts "y" under new keys
    let y = outgoing_text(&alice, &BOB, "y");
    assert_eq!(y.status, MessageStatus::Sent);

    bob.state_update().await.unwrap(); // renewal announcement + message
    let received: Vec<_> = bob
        .messages_with(&ALICE)
        .unwrap()
        .into_iter()
        .filter(|m| m.direction == MessageDirection::Incoming && m.content == "y")
        .collect();
    assert_eq!(received.len(), 1, "exactly one copy of the renewed message");
}

#[tokio::test]
async fn renew_over_active_session_stays_active() {
    let (alice, _bob, _board, _clock) = connected_pair().await;
    alice.renew(&BOB).await.unwrap();
    assert_eq!(
        alice.discussion_with(&BOB).unwrap().unwrap().status,
        DiscussionStatus::Active
    );
}

#[tokio::test]
async fn renew_during_outage_marks_send_failed_then_reconnects() {
    let (alice, _bob, board, clock) = connected_pair().await;

    board.fail_next_sends(u32::MAX);
    assert!(alice.renew(&BOB).await.is_err());
    let discussion = alice.discussion_with(&BOB).unwrap().unwrap();
    assert_eq!(discussion.status, DiscussionStatus::SendFailed);
    assert!(discussion.send_announcement.is_some());

    board.fail_next_sends(0);
    clock.advance(6_000);
    alice.state_update().await.unwrap();
    let discussion = alice.discussion_with(&BOB).unwrap().unwrap();
    assert!(discussion.send_announcement.is_none());
    // The stub session stayed mutually keyed, so the resend settles active.
    assert_eq!(discussion.status, DiscussionStatus::Active);
}

#[tokio::test]
async fn renew_without_discussion_is_rejected() {
    let board = InMemoryBoard::new();
    let clock = ManualClock::starting_at(1_700_000_000_000);
    let (alice, _events) = open_engine(ALICE, "alice", &board, &clock);
    assert!(alice.renew(&BOB).await.is_err());
}
