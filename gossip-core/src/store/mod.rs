//! Durable storage behind a transactional table abstraction.
//!
//! The store is the engine's only shared resource. Multi-row mutations
//! that must be atomic (discussion update + queue reset, contact create +
//! discussion create, incoming insert + ack application) run inside a
//! single [`Store::with_tx`] call; readers outside the engine only ever
//! see committed state.
//!
//! Transactions are synchronous: the closure does pure data work, never
//! I/O, so a transaction can never interleave with another engine step.
//! Implementations include:
//! - [`memory::MemoryStore`] — snapshot-rollback in-memory tables
//! - a platform-backed store (SQLite, IndexedDB bridge) in the app shells

pub mod memory;
pub mod model;

use gossip_proto::board::{Cursor, Seeker};
use gossip_proto::ident::UserId;

use model::{
    Contact, Discussion, Message, MessageId, MessageStatus, NewMessage, PendingAnnouncement,
    PendingCiphertext, UserProfile,
};

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A uniqueness constraint rejected the write.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The underlying storage is unavailable.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// The store returned something the schema forbids.
    #[error("store invariant violated: {0}")]
    Invariant(String),
}

/// A transactional store.
pub trait Store: Send + Sync {
    /// Runs `f` inside one atomic transaction.
    ///
    /// If `f` returns `Err`, every mutation it made is rolled back and the
    /// error is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns whatever error `f` produced, or a [`StoreError`] from the
    /// storage layer itself.
    fn with_tx<R>(
        &self,
        f: impl FnOnce(&mut dyn StoreTx) -> Result<R, StoreError>,
    ) -> Result<R, StoreError>;
}

/// The table surface visible inside a transaction.
///
/// All reads reflect writes made earlier in the same transaction.
pub trait StoreTx {
    // --- user profile ---

    /// Reads the profile of an identity.
    fn profile(&self, owner: &UserId) -> Option<UserProfile>;

    /// Inserts or replaces a profile row.
    fn put_profile(&mut self, profile: UserProfile);

    /// Advances the announcement cursor, keeping it monotonic: a value not
    /// greater than the stored one is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the profile row is missing.
    fn advance_cursor(&mut self, owner: &UserId, cursor: Cursor) -> Result<(), StoreError>;

    /// Reads the persisted crypto-state blob for an identity.
    fn session_blob(&self, owner: &UserId) -> Option<Vec<u8>>;

    /// Stores the crypto-state blob for an identity.
    fn put_session_blob(&mut self, owner: &UserId, blob: Vec<u8>);

    // --- contacts ---

    /// Looks up a contact by peer id.
    fn contact(&self, owner: &UserId, contact: &UserId) -> Option<Contact>;

    /// Looks up a contact by display name.
    fn contact_by_name(&self, owner: &UserId, name: &str) -> Option<Contact>;

    /// All contact display names for an owner.
    fn contact_names(&self, owner: &UserId) -> Vec<String>;

    /// Inserts a contact.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyExists`] when the (owner, contact) pair
    /// or the (owner, name) pair is taken.
    fn insert_contact(&mut self, contact: Contact) -> Result<(), StoreError>;

    /// Updates an existing contact.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the row is missing.
    fn update_contact(&mut self, contact: Contact) -> Result<(), StoreError>;

    // --- discussions ---

    /// Looks up the discussion for an (owner, contact) pair.
    fn discussion(&self, owner: &UserId, contact: &UserId) -> Option<Discussion>;

    /// All discussions for an owner.
    fn discussions(&self, owner: &UserId) -> Vec<Discussion>;

    /// Inserts a discussion.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyExists`] when the (owner, contact)
    /// pair already has one.
    fn insert_discussion(&mut self, discussion: Discussion) -> Result<(), StoreError>;

    /// Updates an existing discussion.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the row is missing.
    fn update_discussion(&mut self, discussion: Discussion) -> Result<(), StoreError>;

    // --- messages ---

    /// Inserts a message, assigning its row id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyExists`] when the row carries a seeker
    /// already present for this (owner, contact) — the deduplication axis.
    fn insert_message(&mut self, message: NewMessage) -> Result<Message, StoreError>;

    /// Updates an existing message.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the row is missing, or
    /// [`StoreError::AlreadyExists`] if the update would duplicate a
    /// (owner, contact, seeker) triple.
    fn update_message(&mut self, message: Message) -> Result<(), StoreError>;

    /// Reads one message by row id.
    fn message(&self, id: MessageId) -> Option<Message>;

    /// Outgoing messages for a peer in any of the given statuses, ordered
    /// by timestamp ascending with row id as the tiebreak.
    fn outgoing_in_statuses(
        &self,
        owner: &UserId,
        contact: &UserId,
        statuses: &[MessageStatus],
    ) -> Vec<Message>;

    /// All messages of an owner in one status, any peer, ordered by row id.
    fn messages_in_status(&self, owner: &UserId, status: MessageStatus) -> Vec<Message>;

    /// Finds the outgoing message carrying a seeker, if any.
    fn outgoing_by_seeker(&self, owner: &UserId, seeker: &Seeker) -> Option<Message>;

    /// Full timeline for a peer, ordered by timestamp then row id.
    fn messages_for_contact(&self, owner: &UserId, contact: &UserId) -> Vec<Message>;

    // --- staging tables ---

    /// Appends to the pending-announcement inbox.
    fn push_pending_announcement(&mut self, owner: &UserId, counter: Cursor, data: Vec<u8>);

    /// Reads the pending-announcement inbox in FIFO order.
    fn pending_announcements(&self, owner: &UserId) -> Vec<PendingAnnouncement>;

    /// Deletes one pending announcement by staging id.
    fn delete_pending_announcement(&mut self, id: u64);

    /// Appends to the pending-ciphertext inbox.
    fn push_pending_ciphertext(&mut self, owner: &UserId, seeker: Seeker, ciphertext: Vec<u8>);

    /// Reads the pending-ciphertext inbox in FIFO order.
    fn pending_ciphertexts(&self, owner: &UserId) -> Vec<PendingCiphertext>;

    /// Deletes one pending ciphertext by staging id.
    fn delete_pending_ciphertext(&mut self, id: u64);
}
