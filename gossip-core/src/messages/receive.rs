//! Incoming reception: staged drain, board fetch, dedup, acks.
//!
//! Reception is pull-based. Staged ciphertexts (written by a background
//! collector) drain first, then the board is fetched with the seeker set
//! the crypto layer exposes. That set is unstable — every successful
//! decryption can reveal new seekers — so the fetch iterates until the
//! set is fixed or the iteration bound is hit.
//!
//! Keep-alives are never persisted on the receiving side; they exist only
//! to carry the sender's ack set.

use std::collections::HashSet;

use gossip_proto::board::Seeker;
use gossip_proto::ident::UserId;

use crate::crypto::{OpenedMessage, SessionManager};
use crate::engine::{CoreEngine, CoreError};
use crate::store::model::{MessageDirection, MessageKind, MessageStatus, NewMessage};
use crate::store::{Store, StoreError, StoreTx};
use crate::transport::MessageProtocol;

/// What processing one ciphertext concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReceiveOutcome {
    /// Not decryptable (stale, foreign, or tampered) — dropped silently.
    Dropped,
    /// Decrypted and applied (possibly a duplicate, possibly a keep-alive).
    Processed,
}

impl<C: SessionManager, T: MessageProtocol, S: Store> CoreEngine<C, T, S> {
    /// Drains staged ciphertexts, then iterates board fetches until the
    /// seeker set is stable.
    ///
    /// # Errors
    ///
    /// Only fatal [`CoreError`]s escape; network failures end the fetch
    /// loop for this tick and are reported on the event channel.
    pub async fn fetch_messages(&self) -> Result<(), CoreError> {
        let mut handled: HashSet<Seeker> = HashSet::new();
        let mut decrypted_any = false;

        // Staged inbox first, FIFO, deduplicated by seeker within the pass.
        let staged = self
            .store
            .with_tx(|tx| Ok(tx.pending_ciphertexts(&self.owner)))?;
        for row in staged {
            if handled.contains(&row.seeker) {
                self.store.with_tx(|tx| {
                    tx.delete_pending_ciphertext(row.id);
                    Ok(())
                })?;
                continue;
            }
            match self.process_ciphertext(&row.seeker, &row.ciphertext).await {
                Ok(outcome) => {
                    if outcome == ReceiveOutcome::Processed {
                        decrypted_any = true;
                    }
                    handled.insert(row.seeker.clone());
                    self.store.with_tx(|tx| {
                        tx.delete_pending_ciphertext(row.id);
                        Ok(())
                    })?;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => self.report_error("staged ciphertext", &e),
            }
        }

        // Board fetch, iterating on the unstable seeker set.
        let mut previous: HashSet<Seeker> = HashSet::new();
        for _ in 0..self.config.messages.max_fetch_iterations {
            let seekers: Vec<Seeker> = self
                .crypto
                .lock()
                .get_message_board_read_keys()
                .into_iter()
                .filter(|s| !handled.contains(s))
                .collect();
            let current: HashSet<Seeker> = seekers.iter().cloned().collect();
            if current.is_empty() || current == previous {
                break;
            }
            previous = current;

            let fetched = match self
                .transport_timeout(self.transport.fetch_messages(&seekers))
                .await
            {
                Ok(fetched) => fetched,
                Err(e) => {
                    self.report_error("message fetch", &e);
                    break;
                }
            };
            if fetched.is_empty() {
                break;
            }
            for (seeker, ciphertext) in fetched {
                match self.process_ciphertext(&seeker, &ciphertext).await {
                    Ok(outcome) => {
                        if outcome == ReceiveOutcome::Processed {
                            decrypted_any = true;
                        }
                        handled.insert(seeker);
                    }
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => self.report_error("incoming message", &e),
                }
            }
        }

        if decrypted_any {
            self.persist_sessions();
        }
        Ok(())
    }

    /// Decrypts one board read and applies it: dedup by seeker, unread
    /// accounting, contact last-seen, and ack propagation.
    pub(crate) async fn process_ciphertext(
        &self,
        seeker: &Seeker,
        ciphertext: &[u8],
    ) -> Result<ReceiveOutcome, CoreError> {
        let opened = self
            .crypto
            .lock()
            .feed_incoming_message_board_read(seeker, ciphertext);
        let Some(opened) = opened else {
            // Tampered or stale ciphertext is dropped without a trace.
            return Ok(ReceiveOutcome::Dropped);
        };

        let now = self.now();
        let sender = opened.sender;
        let seeker = seeker.clone();
        self.store.with_tx(|tx| {
            let Some(mut discussion) = tx.discussion(&self.owner, &sender) else {
                // Decryptable but no conversation: drop silently. The row
                // is still consumed so it is not retried forever.
                tracing::debug!(sender = ?sender, "message from peer without discussion, dropped");
                return Ok(ReceiveOutcome::Processed);
            };

            if let Some(mut contact) = tx.contact(&self.owner, &sender) {
                contact.last_seen = Some(now);
                tx.update_contact(contact)?;
            }

            let is_keep_alive = opened.plaintext.is_empty();
            if !is_keep_alive {
                let content = String::from_utf8_lossy(&opened.plaintext).into_owned();
                match tx.insert_message(NewMessage {
                    owner: self.owner,
                    contact: sender,
                    direction: MessageDirection::Incoming,
                    kind: MessageKind::Text,
                    status: MessageStatus::Delivered,
                    content,
                    seeker: Some(seeker.clone()),
                    timestamp: opened.timestamp,
                }) {
                    Ok(_) => {
                        discussion.unread_count += 1;
                        discussion.updated_at = now;
                        tx.update_discussion(discussion)?;
                    }
                    Err(StoreError::AlreadyExists(_)) => {
                        tracing::debug!(seeker = ?seeker, "duplicate incoming message dropped");
                    }
                    Err(e) => return Err(e),
                }
            }

            Self::apply_acks(tx, &self.owner, &opened)?;
            Ok(ReceiveOutcome::Processed)
        })
        .map_err(CoreError::Store)
    }

    /// Promotes every acknowledged outgoing row to `Delivered`.
    ///
    /// Applies to any row not yet settled, not only `Sent`: a client-side
    /// send timeout can leave a relay-accepted message in `Ready`, and the
    /// peer's ack proves receipt. Repeated ack sets are no-ops.
    fn apply_acks(
        tx: &mut dyn StoreTx,
        owner: &UserId,
        opened: &OpenedMessage,
    ) -> Result<(), StoreError> {
        for acked in &opened.acknowledged_seekers {
            let Some(mut message) = tx.outgoing_by_seeker(owner, acked) else {
                continue;
            };
            if message.status.is_settled() {
                continue;
            }
            message.status = MessageStatus::Delivered;
            message.encrypted = None;
            message.when_to_send = None;
            tracing::debug!(id = %message.id, "outgoing message acknowledged");
            tx.update_message(message)?;
        }
        Ok(())
    }
}
