//! Keep-alive enqueueing.
//!
//! A keep-alive is a zero-content outgoing message whose sole purpose is
//! to carry piggybacked acknowledgments when no text needs to be sent.
//! The crypto layer's `refresh()` names the peers that need one; this
//! module enqueues at most one per peer, and only when nothing else
//! outgoing would carry the acks anyway.

use gossip_proto::ident::UserId;

use crate::crypto::SessionManager;
use crate::engine::{CoreEngine, CoreError};
use crate::store::model::{
    DiscussionStatus, MessageDirection, MessageKind, MessageStatus, NewMessage,
};
use crate::store::Store;
use crate::transport::MessageProtocol;

impl<C: SessionManager, T: MessageProtocol, S: Store> CoreEngine<C, T, S> {
    /// Enqueues keep-alives for the given peers.
    ///
    /// A peer gets one only when its discussion is `Active` and no
    /// outgoing message (keep-alive or text) is already on its way —
    /// anything unsettled will carry the ack set itself. Returns the peers
    /// actually enqueued so the driver can run their send pipelines.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError`] if the store fails.
    pub(crate) fn enqueue_keep_alives(
        &self,
        peers: &[UserId],
    ) -> Result<Vec<UserId>, CoreError> {
        let now = self.now();
        let mut enqueued = Vec::new();
        for peer in peers {
            let inserted = self.store.with_tx(|tx| {
                let Some(discussion) = tx.discussion(&self.owner, peer) else {
                    return Ok(false);
                };
                if discussion.status != DiscussionStatus::Active {
                    return Ok(false);
                }
                let outstanding = tx.outgoing_in_statuses(
                    &self.owner,
                    peer,
                    &[
                        MessageStatus::WaitingSession,
                        MessageStatus::Ready,
                        MessageStatus::Sending,
                        MessageStatus::Sent,
                    ],
                );
                if !outstanding.is_empty() {
                    return Ok(false);
                }
                tx.insert_message(NewMessage {
                    owner: self.owner,
                    contact: *peer,
                    direction: MessageDirection::Outgoing,
                    kind: MessageKind::KeepAlive,
                    status: MessageStatus::WaitingSession,
                    content: String::new(),
                    seeker: None,
                    timestamp: now,
                })?;
                Ok(true)
            })?;
            if inserted {
                tracing::debug!(peer = ?peer, "keep-alive enqueued");
                enqueued.push(*peer);
            }
        }
        Ok(enqueued)
    }
}
