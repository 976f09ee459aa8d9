//! Duplicate and staged announcements: one contact, one discussion.
//!
//! The same announcement can reach an engine twice — once through the
//! staged inbox a background collector filled, once through the cursor
//! fetch. Processing must be idempotent at the contact/discussion level,
//! and the staged inbox must always drain before the board is fetched.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use tokio::sync::mpsc;

use gossip_core::CoreEvent;
use gossip_core::clock::ManualClock;
use gossip_core::config::CoreConfig;
use gossip_core::crypto::stub::StubSessionManager;
use gossip_core::discussions::InitiateOptions;
use gossip_core::engine::{CoreEngine, Identity};
use gossip_core::store::Store as _;
use gossip_core::store::memory::MemoryStore;
use gossip_core::transport::memory::InMemoryBoard;
use gossip_proto::board::Cursor;
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

fn contact_count(engine: &Engine, owner: &UserId) -> usize {
    engine
        .store()
        .with_tx(|tx| Ok(tx.contact_names(owner).len()))
        .unwrap()
}

#[tokio::test]
async fn same_announcement_via_staging_and_cursor_creates_one_of_each() {
    let board = InMemoryBoard::new();
    let clock = ManualClock::starting_at(1_700_000_000_000);
    let (alice, _alice_events) = open_engine(ALICE, "alice", &board, &clock);
    let (bob, mut bob_events) = open_engine(BOB, "bob", &board, &clock);

    alice
        .add_contact(BOB, "bob", StubSessionManager::public_keys_of(&BOB))
        .unwrap();
    let initiated = alice
        .initialize(
            &BOB,
            InitiateOptions {
                username: None,
                greeting: Some("Hi".into()),
            },
        )
        .await
        .unwrap();

    // A collector staged the announcement without knowing its counter, so
    // the cursor stays behind and the board fetch replays it next tick.
    bob.stage_pending_announcement(Cursor::new(0), initiated.announcement)
        .unwrap();
    bob.state_update().await.unwrap(); // drains the staged copy
    bob.state_update().await.unwrap(); // fetches the board copy

    assert_eq!(contact_count(&bob, &BOB), 1, "exactly one contact row");
    assert!(bob.discussion_with(&ALICE).unwrap().is_some());

    // The replay must not raise a second request.
    let requests = {
        let mut count = 0;
        while let Ok(event) = bob_events.try_recv() {
            if matches!(event, CoreEvent::DiscussionRequest { .. }) {
                count += 1;
            }
        }
        count
    };
    assert_eq!(requests, 1, "one discussion request for one peer");
}

#[tokio::test]
async fn staged_inbox_drains_before_the_board_is_fetched() {
    let board = InMemoryBoard::new();
    let clock = ManualClock::starting_at(1_700_000_000_000);
    let (alice, _alice_events) = open_engine(ALICE, "alice", &board, &clock);
    let (bob, _bob_events) = open_engine(BOB, "bob", &board, &clock);

    alice
        .add_contact(BOB, "bob", StubSessionManager::public_keys_of(&BOB))
        .unwrap();
    let initiated = alice
        .initialize(&BOB, InitiateOptions::default())
        .await
        .unwrap();

    // Stage the announcement with its real counter, then take the board
    // offline: the staged drain must succeed without any fetch.
    bob.stage_pending_announcement(Cursor::new(1), initiated.announcement)
        .unwrap();
    board.set_offline(true);
    bob.state_update().await.unwrap();

    assert!(bob.discussion_with(&ALICE).unwrap().is_some());
    assert_eq!(
        bob.profile().unwrap().last_announcement_cursor,
        Some(Cursor::new(1)),
        "cursor advances to the staged counter"
    );

    // Back online: the already-consumed counter is never refetched.
    board.set_offline(false);
    bob.state_update().await.unwrap();
    assert_eq!(contact_count(&bob, &BOB), 1);
}

#[tokio::test]
async fn announcement_without_username_gets_fallback_name() {
    let board = InMemoryBoard::new();
    let clock = ManualClock::starting_at(1_700_000_000_000);
    let (alice, _alice_events) = open_engine(ALICE, "", &board, &clock);
    let (bob, _bob_events) = open_engine(BOB, "bob", &board, &clock);

    alice
        .add_contact(BOB, "bob", StubSessionManager::public_keys_of(&BOB))
        .unwrap();
    // Empty profile username: the announcement carries no usable name.
    alice
        .initialize(&BOB, InitiateOptions::default())
        .await
        .unwrap();

    bob.state_update().await.unwrap();
    let name = bob
        .store()
        .with_tx(|tx| Ok(tx.contact(&BOB, &ALICE).map(|c| c.name)))
        .unwrap()
        .unwrap();
    assert_eq!(name, "New Request 1");
}

#[tokio::test]
async fn announced_name_collision_falls_back_to_generated_name() {
    let board = InMemoryBoard::new();
    let clock = ManualClock::starting_at(1_700_000_000_000);
    let (alice, _alice_events) = open_engine(ALICE, "alice", &board, &clock);
    let (bob, _bob_events) = open_engine(BOB, "bob", &board, &clock);

    // Bob already knows someone called "alice".
    let other = UserId::from_bytes([0xCC; 32]);
    bob.add_contact(other, "alice", StubSessionManager::public_keys_of(&other))
        .unwrap();

    alice
        .add_contact(BOB, "bob", StubSessionManager::public_keys_of(&BOB))
        .unwrap();
    alice
        .initialize(&BOB, InitiateOptions::default())
        .await
        .unwrap();

    bob.state_update().await.unwrap();
    let name = bob
        .store()
        .with_tx(|tx| Ok(tx.contact(&BOB, &ALICE).map(|c| c.name)))
        .unwrap()
        .unwrap();
    assert_eq!(name, "New Request 1", "taken names fall back, never clash");
}

#[tokio::test]
async fn staged_ciphertext_is_deduplicated_by_seeker() {
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

    alice.send_text(&BOB, "hello").await.unwrap();
    let seeker = alice
        .messages_with(&BOB)
        .unwrap()
        .into_iter()
        .find(|m| m.content == "hello")
        .and_then(|m| m.seeker)
        .unwrap();
    let ciphertext = board.message_for(&seeker).unwrap();

    // A background collector staged the same ciphertext twice; the relay
    // still holds it too.
    bob.stage_pending_ciphertext(seeker.clone(), ciphertext.clone())
        .unwrap();
    bob.stage_pending_ciphertext(seeker, ciphertext).unwrap();
    bob.state_update().await.unwrap();
    bob.state_update().await.unwrap();

    let copies: Vec<_> = bob
        .messages_with(&ALICE)
        .unwrap()
        .into_iter()
        .filter(|m| m.content == "hello")
        .collect();
    assert_eq!(copies.len(), 1, "replays collapse to a single row");
}

#[tokio::test]
async fn foreign_announcements_are_consumed_silently() {
    let board = InMemoryBoard::new();
    let clock = ManualClock::starting_at(1_700_000_000_000);
    let (alice, _alice_events) = open_engine(ALICE, "alice", &board, &clock);
    let (bob, _bob_events) = open_engine(BOB, "bob", &board, &clock);
    let (carol, _carol_events) = open_engine(UserId::from_bytes([0xCC; 32]), "carol", &board, &clock);

    // Alice announces to Bob; Carol's tick sees an announcement that is
    // not for her and must advance past it without creating anything.
    alice
        .add_contact(BOB, "bob", StubSessionManager::public_keys_of(&BOB))
        .unwrap();
    alice
        .initialize(&BOB, InitiateOptions::default())
        .await
        .unwrap();

    carol.state_update().await.unwrap();
    assert_eq!(contact_count(&carol, carol.owner()), 0);
    assert!(
        carol.profile().unwrap().last_announcement_cursor.is_some(),
        "not-for-us still advances the cursor"
    );
    let _ = bob;
}
