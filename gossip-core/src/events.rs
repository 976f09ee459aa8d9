//! Typed event channel from the engine to its caller.
//!
//! Events are advisory UI signals, not state: everything they describe is
//! already committed to the store when they fire. Emission is lossy under
//! backpressure — a full channel drops the event with a debug log, and the
//! caller re-reads the store to catch up.

use tokio::sync::mpsc;

use gossip_proto::ident::UserId;

use crate::store::model::{DiscussionId, DiscussionStatus};

/// Events emitted by the engine for caller notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreEvent {
    /// A peer requested a conversation and the local user must accept.
    DiscussionRequest {
        /// The discussion awaiting acceptance.
        discussion_id: DiscussionId,
        /// The requesting peer.
        contact: UserId,
        /// Greeting carried in the announcement, if any.
        greeting: Option<String>,
    },

    /// A session turned active; queued messages will start flowing.
    SessionBecameActive {
        /// The peer whose session activated.
        contact: UserId,
    },

    /// A stale handshake should be renewed; the driver schedules it.
    SessionRenewalNeeded {
        /// The peer whose session needs renewal.
        contact: UserId,
    },

    /// A discussion moved between lifecycle statuses.
    DiscussionStatusChanged {
        /// The discussion that changed.
        discussion_id: DiscussionId,
        /// The peer it belongs to.
        contact: UserId,
        /// Status before the change.
        old: DiscussionStatus,
        /// Status after the change.
        new: DiscussionStatus,
    },

    /// A recoverable error was logged and the tick continued.
    CoreError {
        /// Which operation failed.
        context: String,
        /// Error description.
        detail: String,
    },
}

/// Sending half of the event channel, shared by the engine's services.
#[derive(Debug, Clone)]
pub struct Events {
    tx: mpsc::Sender<CoreEvent>,
}

impl Events {
    /// Creates the event channel with the given buffer size.
    #[must_use]
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<CoreEvent>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }

    /// Emits an event, dropping it if the channel is full or closed.
    pub(crate) fn emit(&self, event: CoreEvent) {
        if let Err(e) = self.tx.try_send(event) {
            tracing::debug!(error = %e, "event channel full or closed, dropping event");
        }
    }
}
