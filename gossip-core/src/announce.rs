//! Announcement ingestion, resending, and cursor bookkeeping.
//!
//! Incoming announcements arrive two ways: staged rows written by a
//! background collector while the engine was absent, and fresh fetches
//! from the announcement board. The staged inbox is always drained first
//! so the cursor can never race past rows the collector already pulled.
//!
//! Processing is reentrancy-guarded per owner: a second concurrent call
//! returns immediately as a successful no-op.

use gossip_proto::board::Cursor;
use gossip_proto::ident::UserId;
use gossip_proto::payload::decode_payload;

use crate::crypto::{IncomingAnnouncement, PeerSessionStatus, SessionManager};
use crate::engine::{CoreEngine, CoreError, try_guard};
use crate::events::CoreEvent;
use crate::store::model::{
    Contact, Discussion, DiscussionDirection, DiscussionId, DiscussionStatus, MessageDirection,
    MessageKind, MessageStatus, NewMessage,
};
use crate::store::{Store, StoreError, StoreTx};
use crate::transport::MessageProtocol;

/// What processing one announcement concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AnnouncementOutcome {
    /// The announcement was not addressed to us.
    NotForUs,
    /// The announcement was consumed and the stores updated.
    Processed,
}

/// What the ingest transaction decided, for post-commit signaling.
struct IngestResult {
    /// A new discussion awaits user acceptance.
    request: Option<(DiscussionId, Option<String>)>,
    /// Our initiation was mutually answered.
    became_active: bool,
    /// The contact existed before this announcement.
    contact_existed: bool,
    /// We had already sent our side of the handshake.
    previously_accepted: bool,
}

impl<C: SessionManager, T: MessageProtocol, S: Store> CoreEngine<C, T, S> {
    /// Drains staged announcements, then fetches new ones from the board.
    ///
    /// Staged rows are processed FIFO; a row is deleted on any outcome
    /// except a processing error (those stay for retry). If the staged
    /// inbox was non-empty, the cursor advances to the highest processed
    /// counter and the board fetch waits for the next tick.
    ///
    /// # Errors
    ///
    /// Only fatal [`CoreError`]s escape; network failures are reported and
    /// retried on a later tick.
    pub async fn fetch_and_process_announcements(&self) -> Result<(), CoreError> {
        let Some(_guard) = try_guard(&self.processing_announcements) else {
            tracing::debug!("announcement processing already running, skipping");
            return Ok(());
        };

        let pending = self
            .store
            .with_tx(|tx| Ok(tx.pending_announcements(&self.owner)))?;
        if !pending.is_empty() {
            let mut max_counter: Option<Cursor> = None;
            for row in pending {
                match self.process_announcement(&row.data).await {
                    Ok(_) => {
                        max_counter = Some(max_counter.map_or(row.counter, |c| c.max(row.counter)));
                        self.store.with_tx(|tx| {
                            tx.delete_pending_announcement(row.id);
                            Ok(())
                        })?;
                    }
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => self.report_error("staged announcement", &e),
                }
            }
            if let Some(counter) = max_counter {
                self.store
                    .with_tx(|tx| tx.advance_cursor(&self.owner, counter))?;
            }
            return Ok(());
        }

        let cursor = self.store.with_tx(|tx| {
            Ok(tx
                .profile(&self.owner)
                .and_then(|p| p.last_announcement_cursor))
        })?;
        let limit = self.config.announcements.fetch_limit;
        let entries = match self
            .transport_timeout(self.transport.fetch_announcements(limit, cursor))
            .await
        {
            Ok(entries) => entries,
            Err(e) => {
                self.report_error("announcement fetch", &e);
                return Ok(());
            }
        };

        for entry in entries {
            match self.process_announcement(&entry.data).await {
                Ok(_) => {
                    self.store
                        .with_tx(|tx| tx.advance_cursor(&self.owner, entry.counter))?;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    // Leave the cursor before this entry so the next tick
                    // retries from here.
                    self.report_error("announcement processing", &e);
                    break;
                }
            }
        }
        Ok(())
    }

    /// Processes a single announcement through crypto, contact, and
    /// discussion state, then applies the auto-accept rule.
    pub(crate) async fn process_announcement(
        &self,
        data: &[u8],
    ) -> Result<AnnouncementOutcome, CoreError> {
        let fed = self.crypto.lock().feed_incoming_announcement(data);
        let Some(incoming) = fed else {
            return Ok(AnnouncementOutcome::NotForUs);
        };
        let announcer = incoming.announcer;
        let payload = decode_payload(&incoming.user_data).unwrap_or_else(|e| {
            tracing::debug!(error = %e, "unreadable announcement payload, ignoring");
            gossip_proto::payload::AnnouncementPayload::default()
        });
        tracing::debug!(announcer = ?announcer, "processing announcement");

        let now = self.now();
        let (ingest, status_event) = self.store.with_tx(|tx| {
            let mut status_event = None;
            let existing = tx.contact(&self.owner, &announcer);
            let contact_existed = existing.is_some();
            if let Some(mut contact) = existing {
                contact.public_keys = incoming.announcer_public_keys.clone();
                contact.last_seen = Some(now);
                tx.update_contact(contact)?;
            } else {
                let name = Self::pick_contact_name(tx, &self.owner, payload.username.as_deref());
                tx.insert_contact(Contact {
                    owner: self.owner,
                    user_id: announcer,
                    name,
                    public_keys: incoming.announcer_public_keys.clone(),
                    avatar: None,
                    last_seen: Some(now),
                    created_at: now,
                })?;
            }

            let mut request = None;
            let mut became_active = false;
            let mut previously_accepted = false;
            match tx.discussion(&self.owner, &announcer) {
                None => {
                    let id = DiscussionId::new();
                    tx.insert_discussion(Discussion {
                        id,
                        owner: self.owner,
                        contact: announcer,
                        direction: DiscussionDirection::Received,
                        status: DiscussionStatus::Pending,
                        we_accepted: false,
                        initiation_announcement: None,
                        send_announcement: None,
                        announcement_message: payload.greeting.clone(),
                        session_recovery: None,
                        unread_count: 0,
                        created_at: now,
                        updated_at: now,
                    })?;
                    if let Some(greeting) = &payload.greeting {
                        tx.insert_message(NewMessage {
                            owner: self.owner,
                            contact: announcer,
                            direction: MessageDirection::Incoming,
                            kind: MessageKind::Announcement,
                            status: MessageStatus::Delivered,
                            content: greeting.clone(),
                            seeker: None,
                            timestamp: incoming.timestamp,
                        })?;
                    }
                    request = Some((id, payload.greeting.clone()));
                }
                Some(discussion) => {
                    previously_accepted = discussion.we_accepted;
                    if discussion.direction == DiscussionDirection::Initiated
                        && discussion.status == DiscussionStatus::Pending
                    {
                        // Our initiation was mutually answered.
                        became_active = true;
                        status_event =
                            Self::write_status(tx, discussion, DiscussionStatus::Active, now)?;
                    } else {
                        let mut d = discussion;
                        if payload.greeting.is_some() {
                            d.announcement_message = payload.greeting.clone();
                        }
                        d.updated_at = now;
                        tx.update_discussion(d)?;
                    }
                }
            }
            Ok((
                IngestResult {
                    request,
                    became_active,
                    contact_existed,
                    previously_accepted,
                },
                status_event,
            ))
        })?;
        self.persist_sessions();
        self.emit_if_changed(status_event);

        if let Some((discussion_id, ref greeting)) = ingest.request {
            self.events.emit(CoreEvent::DiscussionRequest {
                discussion_id,
                contact: announcer,
                greeting: greeting.clone(),
            });
        }
        if ingest.became_active {
            self.events
                .emit(CoreEvent::SessionBecameActive { contact: announcer });
        }

        self.maybe_auto_accept(&incoming, &ingest).await;
        Ok(AnnouncementOutcome::Processed)
    }

    /// Auto-accept applies only to session recovery: the contact existed
    /// before this announcement and we had already sent our side of the
    /// handshake. A brand-new peer always waits for the user.
    async fn maybe_auto_accept(&self, incoming: &IncomingAnnouncement, ingest: &IngestResult) {
        if !ingest.contact_existed || !ingest.previously_accepted {
            return;
        }
        let status = self.crypto.lock().peer_session_status(&incoming.announcer);
        if status != PeerSessionStatus::PeerRequested {
            return;
        }
        tracing::info!(contact = ?incoming.announcer, "auto-accepting session recovery");
        if let Err(e) = self.establish_and_dispatch(&incoming.announcer).await {
            self.report_error("auto-accept", &e);
        }
    }

    /// Resend path for discussions whose announcement is still owed to the
    /// transport. Called by the refresh driver each tick.
    pub(crate) async fn resend_announcements(
        &self,
        discussions: &[Discussion],
    ) -> Result<(), CoreError> {
        let now = self.now();
        for discussion in discussions {
            let Some(queued) = &discussion.send_announcement else {
                continue;
            };
            if queued.when_to_send > now {
                continue;
            }

            match self
                .transport_timeout(self.transport.send_announcement(&queued.data))
                .await
            {
                Ok(_) => {
                    let peer_status = self.crypto.lock().peer_session_status(&discussion.contact);
                    let event = self.store.with_tx(|tx| {
                        let mut d = tx
                            .discussion(&self.owner, &discussion.contact)
                            .ok_or_else(|| StoreError::NotFound("discussion".into()))?;
                        d.send_announcement = None;
                        match peer_status {
                            PeerSessionStatus::Active => {
                                Self::write_status(tx, d, DiscussionStatus::Active, now)
                            }
                            PeerSessionStatus::SelfRequested => {
                                Self::write_status(tx, d, DiscussionStatus::Pending, now)
                            }
                            _ => {
                                tx.update_discussion(d)?;
                                Ok(None)
                            }
                        }
                    })?;
                    self.emit_if_changed(event);
                    if peer_status == PeerSessionStatus::Active {
                        self.events.emit(CoreEvent::SessionBecameActive {
                            contact: discussion.contact,
                        });
                    }
                    tracing::debug!(contact = ?discussion.contact, "queued announcement resent");
                }
                Err(e) => {
                    self.report_error("announcement resend", &e);
                    let retry_at = now.plus_millis(self.config.messages.retry_delay_ms);
                    self.store.with_tx(|tx| {
                        let mut d = tx
                            .discussion(&self.owner, &discussion.contact)
                            .ok_or_else(|| StoreError::NotFound("discussion".into()))?;
                        if let Some(q) = &mut d.send_announcement {
                            q.when_to_send = retry_at;
                        }
                        tx.update_discussion(d)
                    })?;
                }
            }

            // A handshake unanswered for too long needs a fresh session;
            // the status handler performs the renewal, not this path.
            if now.millis_since(discussion.updated_at) > self.config.announcements.broken_threshold_ms
            {
                self.store.with_tx(|tx| {
                    let mut d = tx
                        .discussion(&self.owner, &discussion.contact)
                        .ok_or_else(|| StoreError::NotFound("discussion".into()))?;
                    d.initiation_announcement = None;
                    tx.update_discussion(d)
                })?;
                self.events.emit(CoreEvent::SessionRenewalNeeded {
                    contact: discussion.contact,
                });
            }
        }
        Ok(())
    }

    /// The announced username when free, otherwise the smallest unused
    /// "New Request N" fallback.
    fn pick_contact_name(tx: &dyn StoreTx, owner: &UserId, announced: Option<&str>) -> String {
        if let Some(name) = announced
            && !name.is_empty()
            && tx.contact_by_name(owner, name).is_none()
        {
            return name.to_string();
        }
        let taken = tx.contact_names(owner);
        let mut n = 1u32;
        loop {
            let candidate = format!("New Request {n}");
            if !taken.contains(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }
}
