//! The refresh driver: one reentrancy-guarded tick.
//!
//! `state_update` is the engine's heartbeat. Platform layers call it on a
//! timer, on push notifications, or on foregrounding; overlapping calls
//! return immediately as successful no-ops. One tick, in order:
//!
//! 1. reset crashed-while-`Sending` rows (once per process start)
//! 2. drain and fetch announcements
//! 3. drain and fetch message-board reads
//! 4. reconcile every discussion with crypto's peer status
//! 5. resend announcements still owed to the transport
//! 6. run the send pipeline for every active discussion
//! 7. `refresh()` the crypto layer: enqueue keep-alives, catch sessions
//!    it killed
//! 8. republish our public keys when the interval has elapsed
//! 9. persist the crypto state blob
//!
//! Work that doesn't finish in one tick resumes on the next; every state
//! machine here is safe to resume.

use std::sync::atomic::Ordering;

use gossip_proto::payload::encode_blob;

use crate::crypto::{PeerSessionStatus, SessionManager};
use crate::engine::{CoreEngine, CoreError, try_guard};
use crate::store::model::{Discussion, DiscussionStatus, MessageStatus};
use crate::store::{Store, StoreError};
use crate::transport::MessageProtocol;

impl<C: SessionManager, T: MessageProtocol, S: Store> CoreEngine<C, T, S> {
    /// Runs one refresh tick.
    ///
    /// # Errors
    ///
    /// Returns a [`CoreError`] only when the store reports impossible
    /// state; the caller must then re-open the session. Every retryable
    /// failure is logged, surfaced on the event channel, and retried on a
    /// later tick.
    pub async fn state_update(&self) -> Result<(), CoreError> {
        let Some(_guard) = try_guard(&self.state_updating) else {
            tracing::debug!("state update already running, skipping");
            return Ok(());
        };

        // 1. Crash recovery: ciphertext of interrupted sends is discarded
        // and re-produced, which is safe because nothing observed it.
        if !self.startup_reset_done.swap(true, Ordering::SeqCst) {
            self.reset_crashed_sends()?;
        }

        // 2-3. Ingest.
        self.fetch_and_process_announcements().await?;
        self.fetch_messages().await?;

        // 4. Session status is authoritative; reconcile each discussion.
        for discussion in self.load_discussions()? {
            let status = self.crypto.lock().peer_session_status(&discussion.contact);
            if let Err(e) = self.handle_session_status(&discussion, status).await {
                if e.is_fatal() {
                    return Err(e);
                }
                self.report_error("session status handler", &e);
            }
        }

        // 5. Announcements still owed to the transport.
        let queued: Vec<Discussion> = self
            .load_discussions()?
            .into_iter()
            .filter(|d| d.send_announcement.is_some())
            .collect();
        if !queued.is_empty() {
            if let Err(e) = self.resend_announcements(&queued).await {
                if e.is_fatal() {
                    return Err(e);
                }
                self.report_error("announcement resend", &e);
            }
        }

        // 6. Outgoing pipelines.
        for discussion in self.load_discussions()? {
            if discussion.status != DiscussionStatus::Active {
                continue;
            }
            if let Err(e) = self.process_send_queue(&discussion.contact).await {
                if e.is_fatal() {
                    return Err(e);
                }
                self.report_error("send pipeline", &e);
            }
        }

        // 7. Keep-alives, and the failsafe for sessions refresh() killed.
        let keep_alive_peers = self.crypto.lock().refresh();
        let enqueued = match self.enqueue_keep_alives(&keep_alive_peers) {
            Ok(enqueued) => enqueued,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                self.report_error("keep-alive enqueue", &e);
                Vec::new()
            }
        };
        for peer in &enqueued {
            if let Err(e) = self.process_send_queue(peer).await {
                if e.is_fatal() {
                    return Err(e);
                }
                self.report_error("keep-alive send", &e);
            }
        }
        self.mark_freshly_killed_broken()?;

        // 8. Key republish on the configured interval.
        self.maybe_republish_keys().await?;

        // 9. Durable crypto state.
        self.persist_sessions();
        Ok(())
    }

    fn load_discussions(&self) -> Result<Vec<Discussion>, CoreError> {
        Ok(self.store.with_tx(|tx| Ok(tx.discussions(&self.owner)))?)
    }

    /// Rows interrupted mid-send return to the queue head with their
    /// ciphertext discarded. Idempotent: after the first tick nothing is
    /// left in `Sending`.
    fn reset_crashed_sends(&self) -> Result<(), CoreError> {
        let reset = self.store.with_tx(|tx| {
            let rows = tx.messages_in_status(&self.owner, MessageStatus::Sending);
            let count = rows.len();
            for mut message in rows {
                message.status = MessageStatus::WaitingSession;
                message.seeker = None;
                message.encrypted = None;
                message.when_to_send = None;
                message.attempts = 0;
                tx.update_message(message)?;
            }
            Ok(count)
        })?;
        if reset > 0 {
            tracing::info!(count = reset, "reset interrupted sends after restart");
        }
        Ok(())
    }

    /// Failsafe for step 7: a discussion still locally `Active` whose peer
    /// `refresh()` just killed is marked `Broken`; the next tick's status
    /// handler drives recovery from there.
    fn mark_freshly_killed_broken(&self) -> Result<(), CoreError> {
        let now = self.now();
        for discussion in self.load_discussions()? {
            if discussion.status != DiscussionStatus::Active {
                continue;
            }
            if self.crypto.lock().peer_session_status(&discussion.contact)
                != PeerSessionStatus::Killed
            {
                continue;
            }
            tracing::warn!(contact = ?discussion.contact, "active discussion has killed session");
            let event = self.store.with_tx(|tx| {
                let d = tx
                    .discussion(&self.owner, &discussion.contact)
                    .ok_or_else(|| StoreError::NotFound("discussion".into()))?;
                Self::write_status(tx, d, DiscussionStatus::Broken, now)
            })?;
            self.emit_if_changed(event);
        }
        Ok(())
    }

    /// Republishes the profile's public keys at most once per interval.
    async fn maybe_republish_keys(&self) -> Result<(), CoreError> {
        let now = self.now();
        let Some(profile) = self.store.with_tx(|tx| Ok(tx.profile(&self.owner)))? else {
            return Err(CoreError::Invariant("profile row missing".into()));
        };
        let interval = self.config.profile.key_republish_interval_ms;
        let due = profile
            .last_key_publish
            .is_none_or(|t| now.millis_since(t) >= interval);
        if !due {
            return Ok(());
        }

        let encoded = encode_blob(&profile.public_keys);
        match self
            .transport_timeout(self.transport.post_public_key(&encoded))
            .await
        {
            Ok(hash) => {
                tracing::info!(hash = %hash, "public keys republished");
                self.store.with_tx(|tx| {
                    let Some(mut profile) = tx.profile(&self.owner) else {
                        return Err(StoreError::NotFound("profile".into()));
                    };
                    profile.last_key_publish = Some(now);
                    tx.put_profile(profile);
                    Ok(())
                })?;
            }
            Err(e) => self.report_error("key republish", &e),
        }
        Ok(())
    }
}
