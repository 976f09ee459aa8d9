//! Per-peer outgoing send pipeline.
//!
//! Encrypt-once, send-many: a message is encrypted exactly once per
//! session (entering `Ready` with its seeker and ciphertext), and retries
//! reuse the stored ciphertext. At most one message per peer is in flight,
//! and the pipeline never dequeues ahead: if the head can't go, nothing
//! behind it goes this tick. That is what keeps per-peer FIFO intact
//! across retries.

use gossip_proto::ident::UserId;

use crate::crypto::{PeerSessionStatus, SessionManager};
use crate::engine::{CoreEngine, CoreError};
use crate::store::model::{Message, MessageStatus};
use crate::store::{Store, StoreError};
use crate::transport::MessageProtocol;

/// Why the pipeline stopped before exhausting the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    /// The crypto layer cannot seal right now; retry next tick.
    SessionNotReady,
    /// The head is gated by its retry backoff.
    BackoffGated,
    /// A transport attempt failed; backoff was scheduled.
    TransportFailed,
}

impl<C: SessionManager, T: MessageProtocol, S: Store> CoreEngine<C, T, S> {
    /// Runs the send pipeline for one peer.
    ///
    /// No-op unless the crypto session is `Active` and we have sent our
    /// side of the handshake. Messages are processed in timestamp order
    /// (row id as tiebreak); the pipeline stops at the first message that
    /// cannot be sent this tick.
    ///
    /// # Errors
    ///
    /// Only fatal [`CoreError`]s escape; transport failures schedule a
    /// backoff and return normally.
    pub(crate) async fn process_send_queue(&self, contact: &UserId) -> Result<(), CoreError> {
        if self.crypto.lock().peer_session_status(contact) != PeerSessionStatus::Active {
            return Ok(());
        }
        let accepted = self
            .store
            .with_tx(|tx| Ok(tx.discussion(&self.owner, contact).is_some_and(|d| d.we_accepted)))?;
        if !accepted {
            return Ok(());
        }

        let queue = self.store.with_tx(|tx| {
            Ok(tx.outgoing_in_statuses(
                &self.owner,
                contact,
                &[MessageStatus::WaitingSession, MessageStatus::Ready],
            ))
        })?;

        let mut encrypted_any = false;
        for message in queue {
            match self.pump_one(contact, message, &mut encrypted_any).await? {
                None => {}
                Some(stop) => {
                    tracing::debug!(contact = ?contact, reason = ?stop, "send pipeline stopped");
                    break;
                }
            }
        }
        if encrypted_any {
            self.persist_sessions();
        }
        Ok(())
    }

    /// Advances one queue entry. Returns `Some(stop)` when the pipeline
    /// must not look at later messages this tick.
    async fn pump_one(
        &self,
        contact: &UserId,
        mut message: Message,
        encrypted_any: &mut bool,
    ) -> Result<Option<Stop>, CoreError> {
        let now = self.now();

        if message.status == MessageStatus::WaitingSession {
            let sealed = self
                .crypto
                .lock()
                .send_message(contact, message.content.as_bytes());
            match sealed {
                Ok(Some(sealed)) => {
                    *encrypted_any = true;
                    message.seeker = Some(sealed.seeker);
                    message.encrypted = Some(sealed.ciphertext);
                    message.status = MessageStatus::Ready;
                    message.when_to_send = Some(now);
                    let row = message.clone();
                    self.store.with_tx(|tx| tx.update_message(row)).map_err(
                        |e| match e {
                            // A duplicate seeker from the crypto layer is
                            // impossible state, not a retryable condition.
                            StoreError::AlreadyExists(what) => {
                                CoreError::Invariant(format!("duplicate outgoing seeker: {what}"))
                            }
                            other => CoreError::Store(other),
                        },
                    )?;
                }
                Ok(None) => return Ok(Some(Stop::SessionNotReady)),
                Err(e) => {
                    tracing::warn!(contact = ?contact, error = %e, "encryption refused, message failed");
                    message.status = MessageStatus::Failed;
                    let row = message;
                    self.store.with_tx(|tx| tx.update_message(row))?;
                    // Permanently failed rows don't block the queue.
                    return Ok(None);
                }
            }
        } else if message.when_to_send.is_some_and(|t| t > now) {
            // Backoff-gated head: stop rather than skip, or a retried
            // message would be overtaken by a younger one.
            return Ok(Some(Stop::BackoffGated));
        }

        let Some((seeker, ciphertext)) = message.seeker.clone().zip(message.encrypted.clone())
        else {
            return Err(CoreError::Invariant(format!(
                "message {} is ready without seeker or ciphertext",
                message.id
            )));
        };

        message.status = MessageStatus::Sending;
        let row = message.clone();
        self.store.with_tx(|tx| tx.update_message(row))?;

        match self
            .transport_timeout(self.transport.send_message(&seeker, &ciphertext))
            .await
        {
            Ok(()) => {
                message.status = MessageStatus::Sent;
                message.when_to_send = None;
                let row = message;
                self.store.with_tx(|tx| tx.update_message(row))?;
                Ok(None)
            }
            Err(e) => {
                let delay = self.config.backoff_delay(message.attempts);
                tracing::debug!(
                    contact = ?contact,
                    attempts = message.attempts,
                    delay_ms = delay,
                    error = %e,
                    "send failed, scheduling retry"
                );
                message.status = MessageStatus::Ready;
                message.attempts += 1;
                message.when_to_send = Some(now.plus_millis(delay));
                let row = message;
                self.store.with_tx(|tx| tx.update_message(row))?;
                Ok(Some(Stop::TransportFailed))
            }
        }
    }
}
