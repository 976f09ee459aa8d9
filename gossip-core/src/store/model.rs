//! Durable entities: the rows the engine reads and writes.
//!
//! Times are wall-clock milliseconds ([`Timestamp`]). Byte arrays are
//! opaque to everything but the crypto layer. Uniqueness rules live with
//! the store implementation; the types here only carry the data.

use gossip_proto::board::{Cursor, Seeker, Timestamp};
use gossip_proto::ident::UserId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One per logged-in identity.
///
/// Created at first session open; the cursor advances with announcement
/// processing and `last_key_publish` moves on each republish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    /// The identity this profile belongs to.
    pub user_id: UserId,
    /// Display username, unique case-insensitively among local identities.
    pub username: String,
    /// Serialized public keys, as published to the relay.
    pub public_keys: Vec<u8>,
    /// Encrypted secret-keys blob; opaque here.
    pub secret_keys_blob: Vec<u8>,
    /// Position on the announcement board up to which we have processed.
    pub last_announcement_cursor: Option<Cursor>,
    /// When the public keys were last republished to the relay.
    pub last_key_publish: Option<Timestamp>,
}

/// A known peer: keys plus the name the local user sees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    /// The local identity that owns this row.
    pub owner: UserId,
    /// The peer's user id.
    pub user_id: UserId,
    /// Display name, unique per owner.
    pub name: String,
    /// The peer's serialized public keys.
    pub public_keys: Vec<u8>,
    /// Optional avatar image bytes.
    pub avatar: Option<Vec<u8>>,
    /// Last time a message from this peer decrypted successfully.
    pub last_seen: Option<Timestamp>,
    /// Row creation time.
    pub created_at: Timestamp,
}

/// Unique identifier for a discussion, time-ordered (UUID v7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiscussionId(Uuid);

impl DiscussionId {
    /// Creates a new time-ordered discussion identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Returns the inner UUID value.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for DiscussionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DiscussionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who opened the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscussionDirection {
    /// We sent the first announcement.
    Initiated,
    /// The peer sent the first announcement.
    Received,
}

/// Orchestration's view of a conversation.
///
/// Advisory only: when it disagrees with the crypto layer's peer status,
/// the crypto status wins and the next tick reconciles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscussionStatus {
    /// Handshake in flight, waiting on the peer.
    Pending,
    /// Both sides answered; messages flow.
    Active,
    /// Our announcement could not reach the relay; the driver retries.
    SendFailed,
    /// The session was killed and has not recovered.
    Broken,
    /// A renewal is in flight over a previously active conversation.
    Reconnecting,
    /// The peer requested; the local user has not accepted yet.
    Received,
}

impl std::fmt::Display for DiscussionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::SendFailed => "send-failed",
            Self::Broken => "broken",
            Self::Reconnecting => "reconnecting",
            Self::Received => "received",
        };
        write!(f, "{name}")
    }
}

/// An announcement the refresh driver still owes the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedAnnouncement {
    /// The announcement bytes to (re)send.
    pub data: Vec<u8>,
    /// Earliest time to attempt the send.
    pub when_to_send: Timestamp,
}

/// Persisted backoff state for killed/saturated session recovery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecovery {
    /// Next time a killed-session recovery may be attempted.
    pub killed_next_retry_at: Option<Timestamp>,
    /// Scheduled one-shot retry for a saturated session.
    pub saturated_retry_at: Option<Timestamp>,
    /// Whether the saturated retry has already been spent.
    pub saturated_retry_done: bool,
}

/// The conversation-level session lifecycle for one (owner, contact) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discussion {
    /// Row id.
    pub id: DiscussionId,
    /// The local identity.
    pub owner: UserId,
    /// The peer.
    pub contact: UserId,
    /// Who opened the conversation.
    pub direction: DiscussionDirection,
    /// Current lifecycle status.
    pub status: DiscussionStatus,
    /// Whether we have sent our side of the handshake.
    pub we_accepted: bool,
    /// Last announcement we produced for this peer, retained for resend.
    pub initiation_announcement: Option<Vec<u8>>,
    /// Queued announcement awaiting the refresh driver.
    pub send_announcement: Option<QueuedAnnouncement>,
    /// Greeting carried in the most recent announcement either way.
    pub announcement_message: Option<String>,
    /// Persisted recovery backoff state.
    pub session_recovery: Option<SessionRecovery>,
    /// Incoming messages not yet marked read by the local user.
    pub unread_count: u32,
    /// Row creation time.
    pub created_at: Timestamp,
    /// Last mutation time.
    pub updated_at: Timestamp,
}

/// Local auto-increment message row id, assigned by the store.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct MessageId(u64);

impl MessageId {
    /// Wraps a raw row id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw row id.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which way a message traveled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageDirection {
    /// From the peer to us.
    Incoming,
    /// From us to the peer.
    Outgoing,
}

/// What kind of row this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// User text.
    Text,
    /// Greeting carried by a session announcement.
    Announcement,
    /// Zero-content acknowledgment carrier.
    KeepAlive,
}

/// Delivery lifecycle of a message row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageStatus {
    /// Enqueued; no active session yet, or queued behind one that isn't.
    WaitingSession,
    /// Encrypted and schedulable; `when_to_send` gates retries.
    Ready,
    /// A transport attempt is in flight.
    Sending,
    /// The relay accepted the ciphertext.
    Sent,
    /// The peer acknowledged the seeker.
    Delivered,
    /// Marked read locally.
    Read,
    /// The crypto layer permanently refused to encrypt.
    Failed,
}

impl MessageStatus {
    /// Terminal statuses a session renewal never touches.
    #[must_use]
    pub const fn is_settled(self) -> bool {
        matches!(self, Self::Delivered | Self::Read)
    }
}

/// A message row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Store-assigned row id.
    pub id: MessageId,
    /// The local identity.
    pub owner: UserId,
    /// The peer.
    pub contact: UserId,
    /// Travel direction.
    pub direction: MessageDirection,
    /// Row kind.
    pub kind: MessageKind,
    /// Delivery status.
    pub status: MessageStatus,
    /// Plaintext content; empty for keep-alives.
    pub content: String,
    /// Board key, present once the crypto layer has encrypted the message.
    /// Deduplication axis for incoming rows; kept after delivery for
    /// forensic lookup.
    pub seeker: Option<Seeker>,
    /// Ciphertext, present from encryption until delivery.
    pub encrypted: Option<Vec<u8>>,
    /// Retry gate: do not attempt a send before this time.
    pub when_to_send: Option<Timestamp>,
    /// Failed transport attempts so far, drives the backoff exponent.
    pub attempts: u32,
    /// Message time.
    pub timestamp: Timestamp,
}

/// A message row before the store has assigned its id.
#[derive(Debug, Clone)]
pub struct NewMessage {
    /// The local identity.
    pub owner: UserId,
    /// The peer.
    pub contact: UserId,
    /// Travel direction.
    pub direction: MessageDirection,
    /// Row kind.
    pub kind: MessageKind,
    /// Initial delivery status.
    pub status: MessageStatus,
    /// Plaintext content.
    pub content: String,
    /// Board key, when known at insert time (incoming rows).
    pub seeker: Option<Seeker>,
    /// Message time.
    pub timestamp: Timestamp,
}

/// Staged incoming announcement, written by the transport or a background
/// collector and drained FIFO by the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAnnouncement {
    /// Staging row id.
    pub id: u64,
    /// The local identity.
    pub owner: UserId,
    /// Board position of the announcement.
    pub counter: Cursor,
    /// Opaque announcement bytes.
    pub data: Vec<u8>,
}

/// Staged incoming ciphertext, drained FIFO by the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCiphertext {
    /// Staging row id.
    pub id: u64,
    /// The local identity.
    pub owner: UserId,
    /// Board key of the ciphertext.
    pub seeker: Seeker,
    /// Opaque ciphertext bytes.
    pub ciphertext: Vec<u8>,
}
