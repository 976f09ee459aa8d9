//! The opaque cryptographic session layer.
//!
//! The engine never touches key material or ratchet state. Everything
//! cryptographic lives behind [`SessionManager`]: session establishment,
//! per-message sealing/opening, seeker enumeration for board reads, peer
//! status, keep-alive hints, and encrypted persistence of the whole state.
//!
//! All methods are synchronous and non-suspending; they may be expensive
//! but never block on I/O. The engine serializes access through a single
//! lock, preserving the single-writer model.
//!
//! # Current status
//!
//! A stubbed implementation ([`stub::StubSessionManager`]) exercises the
//! full contract in-memory for tests. The production implementation wraps
//! the post-quantum session library and is linked by the platform build.

pub mod stub;

use gossip_proto::board::{Seeker, Timestamp};
use gossip_proto::ident::UserId;

/// Errors the crypto layer reports for permanent failures.
///
/// Transient conditions (session not yet keyed, ratchet saturated) are not
/// errors: the affected method returns `None` and the caller retries on a
/// later tick.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Encryption was refused and retrying cannot help.
    #[error("encryption refused: {0}")]
    EncryptionRefused(String),

    /// Peer key material could not be interpreted.
    #[error("invalid key material: {0}")]
    InvalidKeys(String),
}

/// Crypto's view of a conversation with one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSessionStatus {
    /// A keyed session exists; messages can flow.
    Active,
    /// The peer is not known to the session manager.
    UnknownPeer,
    /// The peer is known but no session exists.
    NoSession,
    /// The peer requested a session and awaits our answer.
    PeerRequested,
    /// We requested a session and await the peer's answer.
    SelfRequested,
    /// The session was recently killed due to an inconsistency.
    Killed,
    /// The session is active but saturated by lag.
    Saturated,
}

/// Result of feeding an incoming announcement that was addressed to us.
#[derive(Debug, Clone)]
pub struct IncomingAnnouncement {
    /// The announcer's user id, derived from their public keys.
    pub announcer: UserId,
    /// The announcer's serialized public keys.
    pub announcer_public_keys: Vec<u8>,
    /// When the announcement was created.
    pub timestamp: Timestamp,
    /// User data embedded in the announcement (may be empty).
    pub user_data: Vec<u8>,
}

/// An encrypted outgoing message, ready for the message board.
#[derive(Debug, Clone)]
pub struct SealedMessage {
    /// Board key under which the ciphertext is stored.
    pub seeker: Seeker,
    /// The ciphertext.
    pub ciphertext: Vec<u8>,
}

/// A decrypted incoming message.
#[derive(Debug, Clone)]
pub struct OpenedMessage {
    /// The plaintext; empty for keep-alives.
    pub plaintext: Vec<u8>,
    /// Sender-side message time.
    pub timestamp: Timestamp,
    /// Who sent it.
    pub sender: UserId,
    /// Seekers of our outgoing messages the sender proves it has read.
    pub acknowledged_seekers: Vec<Seeker>,
}

/// Stateful opaque session manager, one per logged-in identity.
///
/// # Contract
///
/// - `establish_outgoing_session` may return an empty vector to signal
///   failure; a non-empty return is the announcement to publish.
/// - `send_message` returns `Ok(None)` for transient inability (session
///   not yet keyed) and `Err` for a permanent refusal.
/// - `feed_incoming_announcement` / `feed_incoming_message_board_read`
///   return `None` when the input is not for us, is stale, or is
///   tampered — never an error.
/// - `refresh` may expire idle sessions as a side effect; its return value
///   lists peers that need a keep-alive message.
pub trait SessionManager: Send {
    /// Builds a session-opening announcement toward a peer.
    ///
    /// Returns the announcement bytes, or an empty vector on failure.
    fn establish_outgoing_session(&mut self, peer_public_keys: &[u8], user_data: &[u8]) -> Vec<u8>;

    /// Feeds an announcement fetched from the board.
    ///
    /// Returns `None` when the announcement is not addressed to us.
    fn feed_incoming_announcement(&mut self, announcement: &[u8]) -> Option<IncomingAnnouncement>;

    /// Encrypts a message toward a peer, producing its seeker.
    ///
    /// `Ok(None)` means the session cannot seal right now (not yet keyed,
    /// saturated); the message stays queued.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError`] when encryption is permanently refused.
    fn send_message(
        &mut self,
        peer: &UserId,
        plaintext: &[u8],
    ) -> Result<Option<SealedMessage>, CryptoError>;

    /// Decrypts a message-board read.
    ///
    /// Returns `None` on stale, foreign, or tampered ciphertext.
    fn feed_incoming_message_board_read(
        &mut self,
        seeker: &Seeker,
        ciphertext: &[u8],
    ) -> Option<OpenedMessage>;

    /// Enumerates the seekers to fetch from the message board.
    ///
    /// The set is unstable: it changes as messages decrypt, so callers
    /// iterate until it is fixed.
    fn get_message_board_read_keys(&self) -> Vec<Seeker>;

    /// Crypto's authoritative status for a peer.
    fn peer_session_status(&self, peer: &UserId) -> PeerSessionStatus;

    /// Expires idle state and returns peers needing a keep-alive.
    fn refresh(&mut self) -> Vec<UserId>;

    /// Serializes the whole state into an encrypted blob.
    ///
    /// Returns `None` if serialization or encryption fails.
    fn to_encrypted_blob(&self, key: &[u8]) -> Option<Vec<u8>>;

    /// Restores a session manager from an encrypted blob.
    ///
    /// Returns `None` on wrong key, corruption, or format mismatch.
    fn from_encrypted_blob(blob: &[u8], key: &[u8]) -> Option<Self>
    where
        Self: Sized;
}
