//! `gossip-core` — client orchestration engine for board-relayed,
//! end-to-end-encrypted messaging.
//!
//! All ciphertext flows through an untrusted relay's two append-only boards:
//! announcements (session handshakes) and messages (keyed by unlinkable
//! per-message seekers). This crate owns everything between the caller and
//! the three collaborators it orchestrates:
//!
//! - [`crypto::SessionManager`] — the opaque double-ratchet-style session
//!   state, one per logged-in identity
//! - [`transport::MessageProtocol`] — the relay boards
//! - [`store::Store`] — the durable tables
//!
//! The engine itself is the [`engine::CoreEngine`]: discussion lifecycle,
//! the outgoing message queue, the incoming reception loop, and the
//! periodic refresh driver ([`CoreEngine::state_update`]).
//!
//! [`CoreEngine::state_update`]: engine::CoreEngine::state_update

pub mod announce;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod discussions;
pub mod driver;
pub mod engine;
pub mod events;
pub mod messages;
pub mod store;
pub mod transport;

pub use engine::{CoreEngine, CoreError, Identity};
pub use events::CoreEvent;
