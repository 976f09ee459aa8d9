//! End-to-end happy path: initiate, accept, exchange, acknowledge.
//!
//! Covers the full S-shaped flow between two engines sharing one board:
//! Alice opens a discussion with a greeting, Bob's tick surfaces the
//! request, Bob accepts, both sides turn active, messages flow in order,
//! and acknowledgments flip Alice's rows to delivered.

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
    DiscussionDirection, DiscussionStatus, MessageDirection, MessageKind, MessageStatus,
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

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn setup() -> (
    Engine,
    mpsc::Receiver<CoreEvent>,
    Engine,
    mpsc::Receiver<CoreEvent>,
    ManualClock,
) {
    init_tracing();
    let board = InMemoryBoard::new();
    let clock = ManualClock::starting_at(1_700_000_000_000);
    let (alice, alice_events) = open_engine(ALICE, "alice", &board, &clock);
    let (bob, bob_events) = open_engine(BOB, "bob", &board, &clock);
    (alice, alice_events, bob, bob_events, clock)
}

fn drain(rx: &mut mpsc::Receiver<CoreEvent>) -> Vec<CoreEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn request_surfaces_on_receiver_side() {
    let (alice, _alice_events, bob, mut bob_events, _clock) = setup();
    alice
        .add_contact(BOB, "bob", StubSessionManager::public_keys_of(&BOB))
        .unwrap();
    alice
        .initialize(
            &BOB,
            InitiateOptions {
                username: None,
                greeting: Some("Hi".into()),
            },
        )
        .await
        .unwrap();

    bob.state_update().await.unwrap();

    let discussion = bob.discussion_with(&ALICE).unwrap().unwrap();
    assert_eq!(discussion.direction, DiscussionDirection::Received);
    assert_eq!(discussion.status, DiscussionStatus::Pending);
    assert!(!discussion.we_accepted);
    assert_eq!(discussion.announcement_message.as_deref(), Some("Hi"));

    let events = drain(&mut bob_events);
    assert!(
        events.iter().any(|e| matches!(
            e,
            CoreEvent::DiscussionRequest { contact, greeting, .. }
                if *contact == ALICE && greeting.as_deref() == Some("Hi")
        )),
        "expected a discussion request event, got {events:?}"
    );

    // The greeting lands in the timeline as an announcement row.
    let greeting_rows: Vec<_> = bob
        .messages_with(&ALICE)
        .unwrap()
        .into_iter()
        .filter(|m| m.kind == MessageKind::Announcement)
        .collect();
    assert_eq!(greeting_rows.len(), 1);
    assert_eq!(greeting_rows[0].content, "Hi");
}

#[tokio::test]
async fn brand_new_contact_is_never_auto_accepted() {
    let (alice, _alice_events, bob, _bob_events, _clock) = setup();
    alice
        .add_contact(BOB, "bob", StubSessionManager::public_keys_of(&BOB))
        .unwrap();
    alice
        .initialize(&BOB, InitiateOptions::default())
        .await
        .unwrap();

    bob.state_update().await.unwrap();
    bob.state_update().await.unwrap();

    // Without an explicit accept, Bob never publishes a handshake: the
    // only announcement on the board is still Alice's.
    let discussion = bob.discussion_with(&ALICE).unwrap().unwrap();
    assert!(!discussion.we_accepted);
    assert_eq!(
        bob.transport().announcement_count(),
        1,
        "auto-accept must not fire for a first-contact announcement"
    );
}

#[tokio::test]
async fn accept_activates_both_sides() {
    let (alice, mut alice_events, bob, _bob_events, _clock) = setup();
    alice
        .add_contact(BOB, "bob", StubSessionManager::public_keys_of(&BOB))
        .unwrap();
    alice
        .initialize(&BOB, InitiateOptions::default())
        .await
        .unwrap();

    bob.state_update().await.unwrap();
    bob.accept(&ALICE).await.unwrap();
    assert_eq!(
        bob.discussion_with(&ALICE).unwrap().unwrap().status,
        DiscussionStatus::Active
    );

    alice.state_update().await.unwrap();
    assert_eq!(
        alice.discussion_with(&BOB).unwrap().unwrap().status,
        DiscussionStatus::Active
    );
    let events = drain(&mut alice_events);
    assert!(
        events
            .iter()
            .any(|e| matches!(e, CoreEvent::SessionBecameActive { contact } if *contact == BOB)),
        "expected session-became-active on the initiator, got {events:?}"
    );
}

#[tokio::test]
async fn messages_flow_in_order_and_acks_return() {
    let (alice, _alice_events, bob, _bob_events, clock) = setup();
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

    alice.send_text(&BOB, "msg1").await.unwrap();
    clock.advance(10);
    alice.send_text(&BOB, "msg2").await.unwrap();

    bob.state_update().await.unwrap();
    let incoming: Vec<_> = bob
        .messages_with(&ALICE)
        .unwrap()
        .into_iter()
        .filter(|m| m.direction == MessageDirection::Incoming && m.kind == MessageKind::Text)
        .collect();
    assert_eq!(incoming.len(), 2);
    assert_eq!(incoming[0].content, "msg1");
    assert_eq!(incoming[1].content, "msg2");
    assert!(incoming.iter().all(|m| m.status == MessageStatus::Delivered));

    // Unread accounting follows the incoming rows.
    assert_eq!(bob.discussion_with(&ALICE).unwrap().unwrap().unread_count, 2);

    // Bob's reply piggybacks the ack set; Alice's rows flip to delivered.
    bob.send_text(&ALICE, "got them").await.unwrap();
    alice.state_update().await.unwrap();

    let outgoing: Vec<_> = alice
        .messages_with(&BOB)
        .unwrap()
        .into_iter()
        .filter(|m| m.direction == MessageDirection::Outgoing && m.kind == MessageKind::Text)
        .collect();
    assert_eq!(outgoing.len(), 2);
    assert!(
        outgoing.iter().all(|m| m.status == MessageStatus::Delivered),
        "acks must promote sent rows, got {outgoing:?}"
    );
    // Delivered order equals enqueue order.
    assert_eq!(outgoing[0].content, "msg1");
    assert_eq!(outgoing[1].content, "msg2");
    // Ciphertext is dropped once delivered; the seeker is kept.
    assert!(outgoing.iter().all(|m| m.encrypted.is_none()));
    assert!(outgoing.iter().all(|m| m.seeker.is_some()));
}

#[tokio::test]
async fn cursor_never_decreases() {
    let (alice, _alice_events, bob, _bob_events, _clock) = setup();
    alice
        .add_contact(BOB, "bob", StubSessionManager::public_keys_of(&BOB))
        .unwrap();
    alice
        .initialize(&BOB, InitiateOptions::default())
        .await
        .unwrap();

    let mut last = None;
    for _ in 0..4 {
        bob.state_update().await.unwrap();
        let cursor = bob.profile().unwrap().last_announcement_cursor;
        assert!(cursor >= last, "cursor went backwards: {cursor:?} < {last:?}");
        last = cursor;
    }
    assert!(last.is_some(), "cursor must advance past the announcement");
}

#[tokio::test]
async fn published_keys_are_resolvable_by_peers() {
    let (alice, _alice_events, bob, _bob_events, _clock) = setup();

    // Alice's first tick republishes her keys to the relay.
    alice.state_update().await.unwrap();

    let keys = bob.lookup_public_keys(&ALICE).await.unwrap();
    assert_eq!(keys, StubSessionManager::public_keys_of(&ALICE));

    let unknown = UserId::from_bytes([0x77; 32]);
    assert!(bob.lookup_public_keys(&unknown).await.is_err());
}

#[tokio::test]
async fn mark_read_clears_unread_and_settles_rows() {
    let (alice, _alice_events, bob, _bob_events, _clock) = setup();
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

    alice.send_text(&BOB, "hello").await.unwrap();
    bob.state_update().await.unwrap();
    bob.send_text(&ALICE, "hi back").await.unwrap();
    alice.state_update().await.unwrap();

    alice.mark_read(&BOB).unwrap();
    assert_eq!(alice.discussion_with(&BOB).unwrap().unwrap().unread_count, 0);
    let delivered_read: Vec<_> = alice
        .messages_with(&BOB)
        .unwrap()
        .into_iter()
        .filter(|m| {
            m.direction == MessageDirection::Outgoing && m.kind == MessageKind::Text
        })
        .collect();
    assert!(delivered_read.iter().all(|m| m.status == MessageStatus::Read));
}
