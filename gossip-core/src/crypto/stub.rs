//! In-memory stand-in for the production session library.
//!
//! `StubSessionManager` implements the full [`SessionManager`] contract
//! with deterministic seekers and JSON "ciphertext", so two engines wired
//! through a shared board interoperate in tests without real key material.
//! Test knobs expose the failure modes the engine must handle: killed and
//! saturated sessions, refused establishment, refused encryption, and
//! keep-alive demands.
//!
//! Sessions follow the real handshake shape: each side's announcement
//! carries an epoch; a session is active once both sides have announced,
//! and every epoch restarts the seeker sequence for that direction.

use serde::{Deserialize, Serialize};

use gossip_proto::board::{Seeker, Timestamp};
use gossip_proto::ident::UserId;

use super::{
    CryptoError, IncomingAnnouncement, OpenedMessage, PeerSessionStatus, SealedMessage,
    SessionManager,
};

/// Fake announcement wire form.
#[derive(Serialize, Deserialize)]
struct StubAnnouncement {
    from: UserId,
    to: UserId,
    public_keys: Vec<u8>,
    user_data: Vec<u8>,
    epoch: u64,
    timestamp: u64,
}

/// Fake ciphertext wire form.
#[derive(Serialize, Deserialize)]
struct StubCiphertext {
    from: UserId,
    to: UserId,
    epoch: u64,
    index: u64,
    plaintext: Vec<u8>,
    timestamp: u64,
    acks: Vec<Seeker>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PeerState {
    public_keys: Vec<u8>,
    sent_request: bool,
    received_request: bool,
    send_epoch: u64,
    send_count: u64,
    recv_epoch: u64,
    recv_count: u64,
    killed: bool,
    saturated: bool,
    needs_keep_alive: bool,
    /// Seekers of messages we have read, piggybacked on every outgoing
    /// message as the cumulative ack set.
    acks_to_send: Vec<Seeker>,
}

impl PeerState {
    const fn is_active(&self) -> bool {
        self.sent_request && self.received_request && !self.killed
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PeerEntry {
    id: UserId,
    state: PeerState,
}

/// Deterministic per-direction seeker: 8 bytes of each id plus the epoch
/// and index. Opaque to the engine, computable by both ends.
fn seeker_for(from: &UserId, to: &UserId, epoch: u64, index: u64) -> Seeker {
    let mut bytes = Vec::with_capacity(32);
    bytes.extend_from_slice(&from.as_bytes()[..8]);
    bytes.extend_from_slice(&to.as_bytes()[..8]);
    bytes.extend_from_slice(&epoch.to_be_bytes());
    bytes.extend_from_slice(&index.to_be_bytes());
    Seeker::new(bytes)
}

fn xor_with_key(data: &[u8], key: &[u8]) -> Vec<u8> {
    if key.is_empty() {
        return data.to_vec();
    }
    data.iter()
        .zip(key.iter().cycle())
        .map(|(d, k)| d ^ k)
        .collect()
}

/// Stubbed session manager for tests.
#[derive(Debug, Serialize, Deserialize)]
pub struct StubSessionManager {
    me: UserId,
    peers: Vec<PeerEntry>,
    /// When set, `establish_outgoing_session` returns empty bytes.
    fail_establish: bool,
    /// Peers for which `send_message` reports a permanent refusal.
    refuse_encrypt: Vec<UserId>,
    /// Peers whose sessions the next `refresh` call kills.
    kill_on_refresh: Vec<UserId>,
}

impl StubSessionManager {
    /// Creates a stub identity. Its "public keys" are the id bytes.
    #[must_use]
    pub fn new(me: UserId) -> Self {
        Self {
            me,
            peers: Vec::new(),
            fail_establish: false,
            refuse_encrypt: Vec::new(),
            kill_on_refresh: Vec::new(),
        }
    }

    /// The serialized public keys of a stub identity.
    #[must_use]
    pub fn public_keys_of(id: &UserId) -> Vec<u8> {
        id.as_bytes().to_vec()
    }

    // --- test knobs ---

    /// Kills the session with a peer immediately.
    pub fn kill_peer(&mut self, peer: &UserId) {
        if let Some(state) = self.peer_mut(peer) {
            state.killed = true;
        }
    }

    /// Arranges for the next `refresh` to kill the session with a peer.
    pub fn kill_peer_on_refresh(&mut self, peer: UserId) {
        self.kill_on_refresh.push(peer);
    }

    /// Marks the session with a peer as saturated (or clears it).
    pub fn set_saturated(&mut self, peer: &UserId, saturated: bool) {
        if let Some(state) = self.peer_mut(peer) {
            state.saturated = saturated;
        }
    }

    /// Flags a peer as needing a keep-alive on the next `refresh`.
    pub fn set_needs_keep_alive(&mut self, peer: &UserId) {
        if let Some(state) = self.peer_mut(peer) {
            state.needs_keep_alive = true;
        }
    }

    /// Makes `establish_outgoing_session` fail (or succeed again).
    pub fn set_fail_establish(&mut self, fail: bool) {
        self.fail_establish = fail;
    }

    /// Makes `send_message` permanently refuse a peer.
    pub fn refuse_encrypt_for(&mut self, peer: UserId) {
        self.refuse_encrypt.push(peer);
    }

    /// Lifts a `refuse_encrypt_for` refusal.
    pub fn allow_encrypt_for(&mut self, peer: &UserId) {
        self.refuse_encrypt.retain(|p| p != peer);
    }

    // --- internals ---

    fn peer(&self, id: &UserId) -> Option<&PeerState> {
        self.peers.iter().find(|p| p.id == *id).map(|p| &p.state)
    }

    fn peer_mut(&mut self, id: &UserId) -> Option<&mut PeerState> {
        self.peers
            .iter_mut()
            .find(|p| p.id == *id)
            .map(|p| &mut p.state)
    }

    fn peer_entry_mut(&mut self, id: UserId) -> &mut PeerState {
        if let Some(pos) = self.peers.iter().position(|p| p.id == id) {
            return &mut self.peers[pos].state;
        }
        self.peers.push(PeerEntry {
            id,
            state: PeerState::default(),
        });
        // Just pushed, the vector cannot be empty.
        let last = self.peers.len() - 1;
        &mut self.peers[last].state
    }
}

impl SessionManager for StubSessionManager {
    fn establish_outgoing_session(&mut self, peer_public_keys: &[u8], user_data: &[u8]) -> Vec<u8> {
        if self.fail_establish {
            return Vec::new();
        }
        let Some(peer_id) = UserId::from_slice(peer_public_keys) else {
            return Vec::new();
        };
        let me = self.me;
        let state = self.peer_entry_mut(peer_id);
        state.public_keys = peer_public_keys.to_vec();
        state.sent_request = true;
        state.send_epoch += 1;
        state.send_count = 0;
        if state.killed {
            // A fresh outgoing request replaces the killed session; the
            // peer's old announcement cannot key the new one.
            state.killed = false;
            state.received_request = false;
        }
        state.saturated = false;

        let announcement = StubAnnouncement {
            from: me,
            to: peer_id,
            public_keys: Self::public_keys_of(&me),
            user_data: user_data.to_vec(),
            epoch: state.send_epoch,
            timestamp: Timestamp::now().as_millis(),
        };
        serde_json::to_vec(&announcement).unwrap_or_default()
    }

    fn feed_incoming_announcement(&mut self, announcement: &[u8]) -> Option<IncomingAnnouncement> {
        let ann: StubAnnouncement = serde_json::from_slice(announcement).ok()?;
        if ann.to != self.me {
            return None;
        }
        let state = self.peer_entry_mut(ann.from);
        state.public_keys = ann.public_keys.clone();
        state.received_request = true;
        state.recv_epoch = ann.epoch;
        state.recv_count = 0;
        if state.killed {
            state.killed = false;
            state.sent_request = false;
        }
        state.saturated = false;

        Some(IncomingAnnouncement {
            announcer: ann.from,
            announcer_public_keys: ann.public_keys,
            timestamp: Timestamp::from_millis(ann.timestamp),
            user_data: ann.user_data,
        })
    }

    fn send_message(
        &mut self,
        peer: &UserId,
        plaintext: &[u8],
    ) -> Result<Option<SealedMessage>, CryptoError> {
        if self.refuse_encrypt.contains(peer) {
            return Err(CryptoError::EncryptionRefused("stub refusal".into()));
        }
        let me = self.me;
        let Some(state) = self.peer_mut(peer) else {
            return Ok(None);
        };
        if !state.is_active() || state.saturated {
            return Ok(None);
        }
        let seeker = seeker_for(&me, peer, state.send_epoch, state.send_count);
        let ciphertext = StubCiphertext {
            from: me,
            to: *peer,
            epoch: state.send_epoch,
            index: state.send_count,
            plaintext: plaintext.to_vec(),
            timestamp: Timestamp::now().as_millis(),
            acks: state.acks_to_send.clone(),
        };
        state.send_count += 1;
        state.needs_keep_alive = false;
        let ciphertext = serde_json::to_vec(&ciphertext)
            .map_err(|e| CryptoError::EncryptionRefused(e.to_string()))?;
        Ok(Some(SealedMessage { seeker, ciphertext }))
    }

    fn feed_incoming_message_board_read(
        &mut self,
        seeker: &Seeker,
        ciphertext: &[u8],
    ) -> Option<OpenedMessage> {
        let ct: StubCiphertext = serde_json::from_slice(ciphertext).ok()?;
        if ct.to != self.me {
            return None;
        }
        let me = self.me;
        let state = self.peer_mut(&ct.from)?;
        if !state.is_active() || ct.epoch != state.recv_epoch {
            return None;
        }
        let expected = seeker_for(&ct.from, &me, ct.epoch, ct.index);
        if *seeker != expected || ct.index > state.recv_count {
            return None;
        }
        if ct.index == state.recv_count {
            state.recv_count += 1;
        }
        // Replays (index below the counter) still decrypt via retained
        // message keys; the store's uniqueness constraint deduplicates.
        if !state.acks_to_send.contains(&expected) {
            state.acks_to_send.push(expected);
        }
        Some(OpenedMessage {
            plaintext: ct.plaintext,
            timestamp: Timestamp::from_millis(ct.timestamp),
            sender: ct.from,
            acknowledged_seekers: ct.acks,
        })
    }

    fn get_message_board_read_keys(&self) -> Vec<Seeker> {
        self.peers
            .iter()
            .filter(|p| p.state.is_active())
            .map(|p| seeker_for(&p.id, &self.me, p.state.recv_epoch, p.state.recv_count))
            .collect()
    }

    fn peer_session_status(&self, peer: &UserId) -> PeerSessionStatus {
        let Some(state) = self.peer(peer) else {
            return PeerSessionStatus::UnknownPeer;
        };
        if state.killed {
            PeerSessionStatus::Killed
        } else if state.saturated {
            PeerSessionStatus::Saturated
        } else if state.sent_request && state.received_request {
            PeerSessionStatus::Active
        } else if state.sent_request {
            PeerSessionStatus::SelfRequested
        } else if state.received_request {
            PeerSessionStatus::PeerRequested
        } else {
            PeerSessionStatus::NoSession
        }
    }

    fn refresh(&mut self) -> Vec<UserId> {
        let to_kill = std::mem::take(&mut self.kill_on_refresh);
        for id in &to_kill {
            if let Some(state) = self.peer_mut(id) {
                state.killed = true;
            }
        }
        self.peers
            .iter()
            .filter(|p| p.state.is_active() && p.state.needs_keep_alive)
            .map(|p| p.id)
            .collect()
    }

    fn to_encrypted_blob(&self, key: &[u8]) -> Option<Vec<u8>> {
        let serialized = serde_json::to_vec(self).ok()?;
        Some(xor_with_key(&serialized, key))
    }

    fn from_encrypted_blob(blob: &[u8], key: &[u8]) -> Option<Self> {
        let serialized = xor_with_key(blob, key);
        serde_json::from_slice(&serialized).ok()
    }
}
