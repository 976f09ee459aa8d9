//! Transport layer toward the relay's boards.
//!
//! Defines the [`MessageProtocol`] trait the engine drives. Concrete
//! implementations include:
//! - [`memory::InMemoryBoard`] — in-process shared board for testing
//! - the HTTP relay client, built by the platform layer
//!
//! The transport never inspects payloads: announcements and ciphertext are
//! opaque bytes, produced and consumed only by the crypto layer.

pub mod memory;

use gossip_proto::board::{BoardEntry, Cursor, Seeker};
use gossip_proto::ident::UserId;

/// Errors that can occur during transport operations.
///
/// Everything except [`NotFound`](Self::NotFound) is retryable: the engine
/// leaves the affected row in a recoverable state and the refresh driver
/// tries again with backoff.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The operation timed out before completing.
    #[error("transport operation timed out")]
    Timeout,

    /// The relay could not be reached.
    #[error("connectivity failure: {0}")]
    Connectivity(String),

    /// The relay answered with a server-side failure.
    #[error("relay error: status {0}")]
    Server(u16),

    /// The requested entity does not exist on the relay.
    #[error("not found")]
    NotFound,
}

impl TransportError {
    /// Whether retrying later can succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::NotFound)
    }
}

/// Async client for the relay's announcement and message boards.
///
/// # Invariant
///
/// Payloads passed to [`send_announcement`](Self::send_announcement) and
/// [`send_message`](Self::send_message) MUST already be encrypted. The
/// transport treats them as opaque bytes.
pub trait MessageProtocol: Send + Sync {
    /// Publishes an announcement; returns its board counter.
    fn send_announcement(
        &self,
        data: &[u8],
    ) -> impl std::future::Future<Output = Result<Cursor, TransportError>> + Send;

    /// Fetches announcements with counters strictly after `cursor`
    /// (from the beginning when `None`), ascending, at most `limit`.
    fn fetch_announcements(
        &self,
        limit: usize,
        cursor: Option<Cursor>,
    ) -> impl std::future::Future<Output = Result<Vec<BoardEntry>, TransportError>> + Send;

    /// Stores ciphertext under its seeker. Idempotent by seeker: the relay
    /// keeps the first write and ignores replays.
    fn send_message(
        &self,
        seeker: &Seeker,
        ciphertext: &[u8],
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;

    /// Fetches the ciphertexts present for the given seekers. Absent
    /// seekers are silently omitted from the result.
    fn fetch_messages(
        &self,
        seekers: &[Seeker],
    ) -> impl std::future::Future<Output = Result<Vec<(Seeker, Vec<u8>)>, TransportError>> + Send;

    /// Looks up a peer's published public keys (base64).
    fn fetch_public_key(
        &self,
        user_id: &UserId,
    ) -> impl std::future::Future<Output = Result<String, TransportError>> + Send;

    /// Publishes our public keys (base64); returns the relay's hash.
    fn post_public_key(
        &self,
        public_keys: &str,
    ) -> impl std::future::Future<Output = Result<String, TransportError>> + Send;
}
