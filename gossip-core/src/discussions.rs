//! Discussion lifecycle: initiate, accept, renew, and recover sessions.
//!
//! A discussion binds one contact to one crypto session lifecycle. The
//! user-facing operations return `Result` variants rather than throwing
//! for control flow; the per-tick session-status handler reconciles the
//! advisory discussion status with crypto's authoritative peer status and
//! drives killed/saturated recovery with persisted, jittered backoff.

use gossip_proto::ident::UserId;
use gossip_proto::payload::{AnnouncementPayload, encode_payload};

use crate::crypto::{PeerSessionStatus, SessionManager};
use crate::engine::{CoreEngine, CoreError};
use crate::events::CoreEvent;
use crate::store::model::{
    Discussion, DiscussionDirection, DiscussionId, DiscussionStatus, MessageDirection,
    MessageKind, MessageStatus, NewMessage, QueuedAnnouncement, SessionRecovery,
};
use crate::store::{Store, StoreError};
use crate::transport::{MessageProtocol, TransportError};

/// Errors returned by the user-facing discussion operations.
#[derive(Debug, thiserror::Error)]
pub enum DiscussionError {
    /// A discussion with this contact already exists.
    #[error("discussion with {0:?} already exists")]
    AlreadyExists(UserId),

    /// The contact is not in the store.
    #[error("contact {0:?} not found")]
    ContactNotFound(UserId),

    /// No discussion exists with this contact.
    #[error("no discussion with {0:?}")]
    NotFound(UserId),

    /// The discussion is not in a state the operation applies to.
    #[error("discussion with {0:?} is not awaiting acceptance")]
    NotAcceptable(UserId),

    /// The crypto layer could not build the announcement.
    #[error("session establishment failed")]
    EstablishFailed,

    /// The announcement could not reach the relay; the refresh driver owns
    /// the retry and the discussion is marked send-failed.
    #[error("announcement send failed: {0}")]
    SendFailed(TransportError),

    /// The store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Optional presentation data for [`CoreEngine::initialize`].
#[derive(Debug, Clone, Default)]
pub struct InitiateOptions {
    /// Name to announce ourselves under; defaults to the profile username.
    pub username: Option<String>,
    /// Greeting carried in the announcement.
    pub greeting: Option<String>,
}

/// Result of a successful [`CoreEngine::initialize`].
#[derive(Debug, Clone)]
pub struct Initiated {
    /// The created discussion.
    pub discussion_id: DiscussionId,
    /// The announcement that was published.
    pub announcement: Vec<u8>,
}

/// What triggered a session renewal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RenewTrigger {
    /// Explicit user action; clears any persisted recovery schedule.
    User,
    /// The session-status handler recovering a killed/saturated session.
    Recovery,
}

impl<C: SessionManager, T: MessageProtocol, S: Store> CoreEngine<C, T, S> {
    /// Opens a conversation with a known contact.
    ///
    /// Creates the discussion in `Pending`/`Initiated` with our side of
    /// the handshake done, asks the crypto layer for an announcement, and
    /// publishes it. If the publish fails the discussion is kept in
    /// `SendFailed` and the refresh driver owns the retry — the error is
    /// still returned so the caller can surface it.
    ///
    /// # Errors
    ///
    /// [`DiscussionError::ContactNotFound`], [`DiscussionError::AlreadyExists`],
    /// [`DiscussionError::EstablishFailed`], or [`DiscussionError::SendFailed`].
    pub async fn initialize(
        &self,
        contact_id: &UserId,
        options: InitiateOptions,
    ) -> Result<Initiated, DiscussionError> {
        let now = self.now();
        let (contact, profile) = self.store.with_tx(|tx| {
            let contact = tx
                .contact(&self.owner, contact_id)
                .ok_or_else(|| StoreError::NotFound(format!("contact {contact_id:?}")))?;
            if tx.discussion(&self.owner, contact_id).is_some() {
                return Err(StoreError::AlreadyExists(format!(
                    "discussion with {contact_id:?}"
                )));
            }
            let profile = tx
                .profile(&self.owner)
                .ok_or_else(|| StoreError::NotFound("profile".into()))?;
            Ok((contact, profile))
        })
        .map_err(|e| match e {
            StoreError::NotFound(_) => DiscussionError::ContactNotFound(*contact_id),
            StoreError::AlreadyExists(_) => DiscussionError::AlreadyExists(*contact_id),
            other => DiscussionError::Store(other),
        })?;

        let payload = AnnouncementPayload::new(
            options.username.clone().or(Some(profile.username)),
            options.greeting.clone(),
        );
        let user_data = encode_payload(&payload).unwrap_or_default();

        let announcement = self
            .crypto
            .lock()
            .establish_outgoing_session(&contact.public_keys, &user_data);
        if announcement.is_empty() {
            return Err(DiscussionError::EstablishFailed);
        }

        let discussion_id = DiscussionId::new();
        self.store.with_tx(|tx| {
            tx.insert_discussion(Discussion {
                id: discussion_id,
                owner: self.owner,
                contact: *contact_id,
                direction: DiscussionDirection::Initiated,
                status: DiscussionStatus::Pending,
                we_accepted: true,
                initiation_announcement: Some(announcement.clone()),
                send_announcement: None,
                announcement_message: options.greeting.clone(),
                session_recovery: None,
                unread_count: 0,
                created_at: now,
                updated_at: now,
            })?;
            if let Some(greeting) = &options.greeting {
                tx.insert_message(NewMessage {
                    owner: self.owner,
                    contact: *contact_id,
                    direction: MessageDirection::Outgoing,
                    kind: MessageKind::Announcement,
                    status: MessageStatus::Sent,
                    content: greeting.clone(),
                    seeker: None,
                    timestamp: now,
                })?;
            }
            Ok(())
        })?;
        self.persist_sessions();

        match self.send_announcement_with_retry(&announcement).await {
            Ok(counter) => {
                tracing::info!(contact = ?contact_id, %counter, "discussion initiated");
                Ok(Initiated {
                    discussion_id,
                    announcement,
                })
            }
            Err(e) => {
                self.queue_failed_announcement(contact_id, &announcement)?;
                Err(DiscussionError::SendFailed(e))
            }
        }
    }

    /// Accepts a peer-initiated discussion.
    ///
    /// Valid only while the discussion is `Pending` or `Received` and the
    /// crypto layer reports the peer as `PeerRequested`. Same flow as
    /// [`initialize`](Self::initialize), except no contact is created.
    ///
    /// # Errors
    ///
    /// [`DiscussionError::NotFound`], [`DiscussionError::NotAcceptable`],
    /// [`DiscussionError::EstablishFailed`], or [`DiscussionError::SendFailed`].
    pub async fn accept(&self, contact_id: &UserId) -> Result<Vec<u8>, DiscussionError> {
        let discussion = self
            .discussion_with(contact_id)?
            .ok_or(DiscussionError::NotFound(*contact_id))?;
        if !matches!(
            discussion.status,
            DiscussionStatus::Pending | DiscussionStatus::Received
        ) {
            return Err(DiscussionError::NotAcceptable(*contact_id));
        }
        if self.crypto.lock().peer_session_status(contact_id) != PeerSessionStatus::PeerRequested {
            return Err(DiscussionError::NotAcceptable(*contact_id));
        }
        self.establish_and_dispatch(contact_id).await
    }

    /// Forces a new outgoing session even if the current one is active.
    ///
    /// Every outgoing message in `Sending`, `Failed`, `Sent`, or `Ready`
    /// returns to `WaitingSession` with its seeker and ciphertext cleared;
    /// `Delivered` and `Read` rows are never touched.
    ///
    /// # Errors
    ///
    /// [`DiscussionError::NotFound`], [`DiscussionError::ContactNotFound`],
    /// [`DiscussionError::EstablishFailed`], or [`DiscussionError::SendFailed`].
    pub async fn renew(&self, contact_id: &UserId) -> Result<Vec<u8>, DiscussionError> {
        self.renew_session(contact_id, RenewTrigger::User).await
    }

    /// Recovery entry point used by the session-status handler.
    pub(crate) async fn create_session_for_contact(
        &self,
        contact_id: &UserId,
    ) -> Result<Vec<u8>, DiscussionError> {
        self.renew_session(contact_id, RenewTrigger::Recovery).await
    }

    /// Shared accept flow: establish toward the peer's keys and publish.
    pub(crate) async fn establish_and_dispatch(
        &self,
        contact_id: &UserId,
    ) -> Result<Vec<u8>, DiscussionError> {
        let now = self.now();
        let (contact, profile) = self.store.with_tx(|tx| {
            let contact = tx
                .contact(&self.owner, contact_id)
                .ok_or_else(|| StoreError::NotFound(format!("contact {contact_id:?}")))?;
            let profile = tx
                .profile(&self.owner)
                .ok_or_else(|| StoreError::NotFound("profile".into()))?;
            Ok((contact, profile))
        })
        .map_err(|e| match e {
            StoreError::NotFound(_) => DiscussionError::ContactNotFound(*contact_id),
            other => DiscussionError::Store(other),
        })?;

        let payload = AnnouncementPayload::new(Some(profile.username), None);
        let user_data = encode_payload(&payload).unwrap_or_default();
        let announcement = self
            .crypto
            .lock()
            .establish_outgoing_session(&contact.public_keys, &user_data);
        if announcement.is_empty() {
            return Err(DiscussionError::EstablishFailed);
        }

        self.store.with_tx(|tx| {
            let mut d = tx
                .discussion(&self.owner, contact_id)
                .ok_or_else(|| StoreError::NotFound(format!("discussion {contact_id:?}")))?;
            d.we_accepted = true;
            d.initiation_announcement = Some(announcement.clone());
            d.updated_at = now;
            tx.update_discussion(d)
        })?;
        self.persist_sessions();

        match self.send_announcement_with_retry(&announcement).await {
            Ok(_) => {
                let active = self.crypto.lock().peer_session_status(contact_id)
                    == PeerSessionStatus::Active;
                let new_status = if active {
                    DiscussionStatus::Active
                } else {
                    DiscussionStatus::Pending
                };
                let event = self.store.with_tx(|tx| {
                    let d = tx
                        .discussion(&self.owner, contact_id)
                        .ok_or_else(|| StoreError::NotFound(format!("discussion {contact_id:?}")))?;
                    Self::write_status(tx, d, new_status, now)
                })?;
                self.emit_if_changed(event);
                if active {
                    self.events.emit(CoreEvent::SessionBecameActive {
                        contact: *contact_id,
                    });
                }
                Ok(announcement)
            }
            Err(e) => {
                self.queue_failed_announcement(contact_id, &announcement)?;
                Err(DiscussionError::SendFailed(e))
            }
        }
    }

    async fn renew_session(
        &self,
        contact_id: &UserId,
        trigger: RenewTrigger,
    ) -> Result<Vec<u8>, DiscussionError> {
        let now = self.now();
        let (contact, profile, prior_status) = self.store.with_tx(|tx| {
            let discussion = tx
                .discussion(&self.owner, contact_id)
                .ok_or_else(|| StoreError::NotFound(format!("discussion {contact_id:?}")))?;
            let contact = tx
                .contact(&self.owner, contact_id)
                .ok_or_else(|| StoreError::NotFound(format!("contact {contact_id:?}")))?;
            let profile = tx
                .profile(&self.owner)
                .ok_or_else(|| StoreError::NotFound("profile".into()))?;
            Ok((contact, profile, discussion.status))
        })
        .map_err(|e| match e {
            StoreError::NotFound(what) if what.starts_with("discussion") => {
                DiscussionError::NotFound(*contact_id)
            }
            StoreError::NotFound(_) => DiscussionError::ContactNotFound(*contact_id),
            other => DiscussionError::Store(other),
        })?;

        let payload = AnnouncementPayload::new(Some(profile.username), None);
        let user_data = encode_payload(&payload).unwrap_or_default();
        let announcement = self
            .crypto
            .lock()
            .establish_outgoing_session(&contact.public_keys, &user_data);
        if announcement.is_empty() {
            return Err(DiscussionError::EstablishFailed);
        }

        // Reset the queue and rebind the discussion to the new session in
        // one transaction: no message may keep ciphertext from old keys.
        self.store.with_tx(|tx| {
            let resettable = [
                MessageStatus::Sending,
                MessageStatus::Failed,
                MessageStatus::Sent,
                MessageStatus::Ready,
            ];
            for mut message in tx.outgoing_in_statuses(&self.owner, contact_id, &resettable) {
                message.status = MessageStatus::WaitingSession;
                message.seeker = None;
                message.encrypted = None;
                message.when_to_send = None;
                message.attempts = 0;
                tx.update_message(message)?;
            }
            let mut d = tx
                .discussion(&self.owner, contact_id)
                .ok_or_else(|| StoreError::NotFound(format!("discussion {contact_id:?}")))?;
            d.we_accepted = true;
            d.initiation_announcement = Some(announcement.clone());
            if trigger == RenewTrigger::User {
                d.session_recovery = None;
            }
            d.updated_at = now;
            tx.update_discussion(d)
        })?;
        self.persist_sessions();

        match self.send_announcement_with_retry(&announcement).await {
            Ok(_) => {
                let peer_status = self.crypto.lock().peer_session_status(contact_id);
                let new_status = if peer_status == PeerSessionStatus::Active {
                    DiscussionStatus::Active
                } else if prior_status == DiscussionStatus::Active {
                    DiscussionStatus::Reconnecting
                } else {
                    DiscussionStatus::Pending
                };
                let event = self.store.with_tx(|tx| {
                    let d = tx
                        .discussion(&self.owner, contact_id)
                        .ok_or_else(|| StoreError::NotFound(format!("discussion {contact_id:?}")))?;
                    Self::write_status(tx, d, new_status, now)
                })?;
                self.emit_if_changed(event);
                if new_status == DiscussionStatus::Active {
                    self.events.emit(CoreEvent::SessionBecameActive {
                        contact: *contact_id,
                    });
                }
                tracing::info!(contact = ?contact_id, status = %new_status, "session renewed");
                Ok(announcement)
            }
            Err(e) => {
                self.queue_failed_announcement(contact_id, &announcement)?;
                Err(DiscussionError::SendFailed(e))
            }
        }
    }

    /// Marks the discussion send-failed and hands the announcement to the
    /// refresh driver for resending.
    fn queue_failed_announcement(
        &self,
        contact_id: &UserId,
        announcement: &[u8],
    ) -> Result<(), StoreError> {
        let now = self.now();
        let event = self.store.with_tx(|tx| {
            let mut d = tx
                .discussion(&self.owner, contact_id)
                .ok_or_else(|| StoreError::NotFound(format!("discussion {contact_id:?}")))?;
            d.send_announcement = Some(QueuedAnnouncement {
                data: announcement.to_vec(),
                when_to_send: now,
            });
            Self::write_status(tx, d, DiscussionStatus::SendFailed, now)
        })?;
        self.emit_if_changed(event);
        Ok(())
    }

    /// Per-discussion, per-tick reconciliation with crypto's peer status.
    ///
    /// Crypto is authoritative: `Active` clears any recovery state, while
    /// `Killed` and `Saturated` drive recovery attempts on the persisted,
    /// jittered schedule. All recovery requires our side of the handshake
    /// (`we_accepted`).
    pub(crate) async fn handle_session_status(
        &self,
        discussion: &Discussion,
        status: PeerSessionStatus,
    ) -> Result<(), CoreError> {
        let now = self.now();
        match status {
            PeerSessionStatus::Active => {
                if discussion.session_recovery.is_some() {
                    self.store.with_tx(|tx| {
                        let mut d = tx
                            .discussion(&self.owner, &discussion.contact)
                            .ok_or_else(|| StoreError::NotFound("discussion".into()))?;
                        d.session_recovery = None;
                        d.updated_at = now;
                        tx.update_discussion(d)
                    })?;
                }
                Ok(())
            }
            PeerSessionStatus::SelfRequested
            | PeerSessionStatus::PeerRequested
            | PeerSessionStatus::NoSession
            | PeerSessionStatus::UnknownPeer => Ok(()),
            PeerSessionStatus::Killed => {
                if !discussion.we_accepted {
                    return Ok(());
                }
                let recovery = discussion.session_recovery.clone().unwrap_or_default();
                let due = recovery.killed_next_retry_at.is_none_or(|t| now >= t);
                if !due {
                    return Ok(());
                }
                tracing::info!(contact = ?discussion.contact, "recovering killed session");
                if let Err(e) = self.create_session_for_contact(&discussion.contact).await {
                    self.report_error("killed-session recovery", &e);
                }
                let delay = self
                    .config
                    .jittered_recovery_delay(self.config.session_recovery.killed_retry_delay_ms);
                self.store.with_tx(|tx| {
                    let mut d = tx
                        .discussion(&self.owner, &discussion.contact)
                        .ok_or_else(|| StoreError::NotFound("discussion".into()))?;
                    d.session_recovery = Some(SessionRecovery {
                        killed_next_retry_at: Some(now.plus_millis(delay)),
                        saturated_retry_at: None,
                        saturated_retry_done: false,
                    });
                    d.updated_at = now;
                    tx.update_discussion(d)
                })?;
                Ok(())
            }
            PeerSessionStatus::Saturated => {
                if !discussion.we_accepted {
                    return Ok(());
                }
                let mut recovery = discussion.session_recovery.clone().unwrap_or_default();
                match recovery.saturated_retry_at {
                    None => {
                        let delay = self.config.jittered_recovery_delay(
                            self.config.session_recovery.saturated_retry_delay_ms,
                        );
                        recovery.saturated_retry_at = Some(now.plus_millis(delay));
                        recovery.saturated_retry_done = false;
                    }
                    Some(at) if now >= at && !recovery.saturated_retry_done => {
                        tracing::info!(contact = ?discussion.contact, "retrying saturated session");
                        if let Err(e) =
                            self.create_session_for_contact(&discussion.contact).await
                        {
                            self.report_error("saturated-session retry", &e);
                        }
                        recovery.saturated_retry_done = true;
                    }
                    Some(_) => return Ok(()),
                }
                self.store.with_tx(|tx| {
                    let mut d = tx
                        .discussion(&self.owner, &discussion.contact)
                        .ok_or_else(|| StoreError::NotFound("discussion".into()))?;
                    d.session_recovery = Some(recovery);
                    d.updated_at = now;
                    tx.update_discussion(d)
                })?;
                Ok(())
            }
        }
    }
}
