//! In-process board shared between engines under test.
//!
//! One [`InMemoryBoard`] models the relay: an append-only announcement
//! board with monotonic counters and a seeker-indexed message board with
//! idempotent writes. Cloning a board yields another handle onto the same
//! shared state, so two engines wired to clones exchange traffic exactly
//! as they would through a real relay.
//!
//! Failure injection covers the outage scenarios: a counted number of
//! failed sends, or a fully offline relay.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use gossip_proto::board::{BoardEntry, Cursor, Seeker};
use gossip_proto::ident::UserId;

use super::{MessageProtocol, TransportError};

#[derive(Default)]
struct BoardInner {
    announcements: Vec<BoardEntry>,
    next_counter: u64,
    messages: HashMap<Vec<u8>, Vec<u8>>,
    public_keys: HashMap<UserId, String>,
    /// Number of upcoming send operations to fail.
    fail_sends: u32,
    /// When set, every operation fails with a connectivity error.
    offline: bool,
}

/// Shared in-memory relay for tests. Clone for additional handles.
#[derive(Clone, Default)]
pub struct InMemoryBoard {
    inner: Arc<Mutex<BoardInner>>,
}

impl InMemoryBoard {
    /// Creates an empty board.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arranges for the next `n` send operations (announcement or message)
    /// to fail with a connectivity error.
    pub fn fail_next_sends(&self, n: u32) {
        self.inner.lock().fail_sends = n;
    }

    /// Takes the whole relay offline (or back online).
    pub fn set_offline(&self, offline: bool) {
        self.inner.lock().offline = offline;
    }

    /// Number of announcements on the board.
    #[must_use]
    pub fn announcement_count(&self) -> usize {
        self.inner.lock().announcements.len()
    }

    /// Number of ciphertexts on the message board.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.inner.lock().messages.len()
    }

    /// Reads the ciphertext stored under a seeker, for test assertions.
    #[must_use]
    pub fn message_for(&self, seeker: &Seeker) -> Option<Vec<u8>> {
        self.inner.lock().messages.get(seeker.as_bytes()).cloned()
    }

    fn check_send(inner: &mut BoardInner) -> Result<(), TransportError> {
        if inner.offline {
            return Err(TransportError::Connectivity("relay offline".into()));
        }
        if inner.fail_sends > 0 {
            inner.fail_sends -= 1;
            return Err(TransportError::Connectivity("injected send failure".into()));
        }
        Ok(())
    }

    fn check_fetch(inner: &BoardInner) -> Result<(), TransportError> {
        if inner.offline {
            return Err(TransportError::Connectivity("relay offline".into()));
        }
        Ok(())
    }
}

impl MessageProtocol for InMemoryBoard {
    async fn send_announcement(&self, data: &[u8]) -> Result<Cursor, TransportError> {
        let mut inner = self.inner.lock();
        Self::check_send(&mut inner)?;
        inner.next_counter += 1;
        let counter = Cursor::new(inner.next_counter);
        inner.announcements.push(BoardEntry {
            counter,
            data: data.to_vec(),
        });
        Ok(counter)
    }

    async fn fetch_announcements(
        &self,
        limit: usize,
        cursor: Option<Cursor>,
    ) -> Result<Vec<BoardEntry>, TransportError> {
        let inner = self.inner.lock();
        Self::check_fetch(&inner)?;
        let after = cursor.unwrap_or_default();
        Ok(inner
            .announcements
            .iter()
            .filter(|entry| entry.counter > after)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn send_message(&self, seeker: &Seeker, ciphertext: &[u8]) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        Self::check_send(&mut inner)?;
        // Idempotent by seeker: the first write wins.
        inner
            .messages
            .entry(seeker.as_bytes().to_vec())
            .or_insert_with(|| ciphertext.to_vec());
        Ok(())
    }

    async fn fetch_messages(
        &self,
        seekers: &[Seeker],
    ) -> Result<Vec<(Seeker, Vec<u8>)>, TransportError> {
        let inner = self.inner.lock();
        Self::check_fetch(&inner)?;
        Ok(seekers
            .iter()
            .filter_map(|seeker| {
                inner
                    .messages
                    .get(seeker.as_bytes())
                    .map(|ct| (seeker.clone(), ct.clone()))
            })
            .collect())
    }

    async fn fetch_public_key(&self, user_id: &UserId) -> Result<String, TransportError> {
        let inner = self.inner.lock();
        Self::check_fetch(&inner)?;
        inner
            .public_keys
            .get(user_id)
            .cloned()
            .ok_or(TransportError::NotFound)
    }

    async fn post_public_key(&self, public_keys: &str) -> Result<String, TransportError> {
        let mut inner = self.inner.lock();
        Self::check_send(&mut inner)?;
        // The relay derives the owner from the submitted key material; the
        // stub can only hash it for the acknowledgment.
        let hash = format!("{:08x}", simple_hash(public_keys.as_bytes()));
        if let Some(id) = UserId::from_slice(&gossip_proto::payload::decode_blob(public_keys).unwrap_or_default())
        {
            inner.public_keys.insert(id, public_keys.to_string());
        }
        Ok(hash)
    }
}

fn simple_hash(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(0x811c_9dc5_u32, |acc, b| (acc ^ u32::from(*b)).wrapping_mul(0x0100_0193))
}
