//! Outgoing queue and incoming reception for one identity.
//!
//! The outgoing state machine:
//!
//! ```text
//!             enqueue
//!     [ ] ─────────────► WaitingSession
//!                            │ session active & queue head
//!                            ▼
//!                        Ready (seeker, ciphertext, when_to_send = now)
//!                            │ driver picks up, when_to_send ≤ now
//!                            ▼
//!                        Sending ─── transport err ──► Ready (backoff)
//!                            │ transport ok
//!                            ▼
//!                          Sent
//!                            │ peer ack observed via incoming decrypt
//!                            ▼
//!                        Delivered ─── local mark-read ──► Read
//! ```
//!
//! `Failed` is entered only when the crypto layer permanently refuses to
//! encrypt. Session renewal returns everything not yet settled to
//! `WaitingSession` with the ciphertext discarded, so nothing is ever
//! silently lost.
//!
//! Submodules carry the pipelines: [`send`] (per-peer FIFO send loop),
//! [`receive`] (drain-then-iterate board reads, deduplication, ack
//! propagation), [`keepalive`] (ack carriers when no text is pending).

pub mod keepalive;
pub mod receive;
pub mod send;

use gossip_proto::ident::UserId;

use crate::crypto::SessionManager;
use crate::engine::CoreEngine;
use crate::store::model::{
    MessageDirection, MessageId, MessageKind, MessageStatus, NewMessage,
};
use crate::store::{Store, StoreError};
use crate::transport::MessageProtocol;

/// Errors returned by the user-facing message operations.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    /// No discussion exists with this contact; open one first.
    #[error("no discussion with {0:?}")]
    DiscussionNotFound(UserId),

    /// The store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl<C: SessionManager, T: MessageProtocol, S: Store> CoreEngine<C, T, S> {
    /// Enqueues an outgoing text message for a contact.
    ///
    /// The message enters the queue as `WaitingSession` and is encrypted
    /// at send time; the per-peer pipeline runs immediately for
    /// responsiveness and again on every tick.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::DiscussionNotFound`] when no discussion
    /// exists, or a store error.
    pub async fn send_text(
        &self,
        contact: &UserId,
        content: &str,
    ) -> Result<MessageId, MessageError> {
        let now = self.now();
        let id = self.store.with_tx(|tx| {
            if tx.discussion(&self.owner, contact).is_none() {
                return Err(StoreError::NotFound(format!("discussion {contact:?}")));
            }
            let row = tx.insert_message(NewMessage {
                owner: self.owner,
                contact: *contact,
                direction: MessageDirection::Outgoing,
                kind: MessageKind::Text,
                status: MessageStatus::WaitingSession,
                content: content.to_string(),
                seeker: None,
                timestamp: now,
            })?;
            Ok(row.id)
        })
        .map_err(|e| match e {
            StoreError::NotFound(_) => MessageError::DiscussionNotFound(*contact),
            other => MessageError::Store(other),
        })?;

        if let Err(e) = self.process_send_queue(contact).await {
            self.report_error("send pipeline", &e);
        }
        Ok(id)
    }

    /// Marks a conversation read: resets the unread counter and promotes
    /// the contact's delivered outgoing rows to `Read`.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::DiscussionNotFound`] when no discussion
    /// exists, or a store error.
    pub fn mark_read(&self, contact: &UserId) -> Result<(), MessageError> {
        let now = self.now();
        self.store.with_tx(|tx| {
            let mut discussion = tx
                .discussion(&self.owner, contact)
                .ok_or_else(|| StoreError::NotFound(format!("discussion {contact:?}")))?;
            discussion.unread_count = 0;
            discussion.updated_at = now;
            tx.update_discussion(discussion)?;
            for mut message in
                tx.outgoing_in_statuses(&self.owner, contact, &[MessageStatus::Delivered])
            {
                message.status = MessageStatus::Read;
                tx.update_message(message)?;
            }
            Ok(())
        })
        .map_err(|e| match e {
            StoreError::NotFound(_) => MessageError::DiscussionNotFound(*contact),
            other => MessageError::Store(other),
        })
    }
}
