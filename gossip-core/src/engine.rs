//! The engine: one logged-in identity, three collaborators, two guards.
//!
//! `CoreEngine` owns the crypto session manager, the transport handle, and
//! the store, and exposes the user-facing operations (initialize, accept,
//! renew, send) plus the periodic [`state_update`](CoreEngine::state_update)
//! tick. Service logic lives in impl blocks spread across the sibling
//! modules (`discussions`, `announce`, `messages`, `driver`); this module
//! holds the struct, construction, and the helpers everything shares.
//!
//! # Concurrency
//!
//! Single-writer cooperative: all operations run on one logical task. The
//! crypto lock is held only across individual synchronous calls, never
//! across an await. The two reentrancy guards make overlapping
//! `state_update` / announcement-processing calls return immediately as
//! successful no-ops.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use gossip_proto::board::{Cursor, Seeker, Timestamp};
use gossip_proto::ident::UserId;

use crate::clock::Clock;
use crate::config::CoreConfig;
use crate::crypto::SessionManager;
use crate::events::{CoreEvent, Events};
use crate::store::model::{Contact, Discussion, DiscussionStatus, Message, UserProfile};
use crate::store::{Store, StoreError, StoreTx};
use crate::transport::{MessageProtocol, TransportError};

/// Errors that escape a refresh tick.
///
/// Anything retryable is handled inside the tick (logged, row left in a
/// recoverable state); what reaches the caller means the store reported
/// something impossible and the session must be re-opened.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// The store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The committed state contradicts the schema.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl CoreError {
    /// Whether this error must stop the tick for the owner.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Invariant(_) | Self::Store(StoreError::Invariant(_))
        )
    }
}

/// The local identity the engine operates for.
#[derive(Debug, Clone)]
pub struct Identity {
    /// Our user id.
    pub user_id: UserId,
    /// Display username.
    pub username: String,
    /// Serialized public keys, as published to the relay.
    pub public_keys: Vec<u8>,
    /// Encrypted secret-keys blob; opaque to the engine.
    pub secret_keys_blob: Vec<u8>,
}

/// RAII release for a reentrancy guard flag.
pub(crate) struct GuardToken<'a>(&'a AtomicBool);

impl Drop for GuardToken<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Tries to take a guard; `None` means another call is already inside.
pub(crate) fn try_guard(flag: &AtomicBool) -> Option<GuardToken<'_>> {
    flag.compare_exchange(false, true, Ordering::Acquire, Ordering::Acquire)
        .ok()
        .map(|_| GuardToken(flag))
}

/// Client engine for one logged-in identity.
pub struct CoreEngine<C: SessionManager, T: MessageProtocol, S: Store> {
    /// The identity this engine operates for.
    pub(crate) owner: UserId,
    /// Resolved configuration.
    pub(crate) config: CoreConfig,
    /// The opaque crypto session state.
    pub(crate) crypto: Mutex<C>,
    /// Relay transport.
    pub(crate) transport: T,
    /// Durable tables.
    pub(crate) store: S,
    /// Event channel to the caller.
    pub(crate) events: Events,
    /// Wall-clock source.
    pub(crate) clock: Arc<dyn Clock>,
    /// Key for the persisted crypto-state blob.
    pub(crate) blob_key: Vec<u8>,
    /// Guard: one announcement-processing run at a time.
    pub(crate) processing_announcements: AtomicBool,
    /// Guard: one refresh tick at a time.
    pub(crate) state_updating: AtomicBool,
    /// The crashed-SENDING reset runs at most once per process start.
    pub(crate) startup_reset_done: AtomicBool,
}

impl<C: SessionManager, T: MessageProtocol, S: Store> CoreEngine<C, T, S> {
    /// Opens the engine for an identity, creating its profile row on first
    /// use.
    ///
    /// Returns the engine and the receiver for [`CoreEvent`]s the caller
    /// should consume.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the profile row cannot be read or written.
    pub fn open(
        identity: Identity,
        blob_key: Vec<u8>,
        crypto: C,
        transport: T,
        store: S,
        config: CoreConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<(Self, mpsc::Receiver<CoreEvent>), StoreError> {
        let (events, event_rx) = Events::channel(config.event_buffer);
        let owner = identity.user_id;

        store.with_tx(|tx| {
            if tx.profile(&owner).is_none() {
                tx.put_profile(UserProfile {
                    user_id: owner,
                    username: identity.username.clone(),
                    public_keys: identity.public_keys.clone(),
                    secret_keys_blob: identity.secret_keys_blob.clone(),
                    last_announcement_cursor: None,
                    last_key_publish: None,
                });
                tracing::info!(owner = ?owner, "created user profile");
            }
            Ok(())
        })?;

        let engine = Self {
            owner,
            config,
            crypto: Mutex::new(crypto),
            transport,
            store,
            events,
            clock,
            blob_key,
            processing_announcements: AtomicBool::new(false),
            state_updating: AtomicBool::new(false),
            startup_reset_done: AtomicBool::new(false),
        };
        Ok((engine, event_rx))
    }

    /// The identity this engine operates for.
    #[must_use]
    pub const fn owner(&self) -> &UserId {
        &self.owner
    }

    /// Runs a closure against the crypto session under the engine's lock.
    ///
    /// Intended for platform glue and tests; engine code paths use it
    /// internally for every crypto call.
    pub fn with_crypto<R>(&self, f: impl FnOnce(&mut C) -> R) -> R {
        f(&mut self.crypto.lock())
    }

    /// Returns a reference to the underlying store.
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Returns a reference to the underlying transport.
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// Adds a contact the local user obtained out of band (invite, QR).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyExists`] if the peer or the name is
    /// already present.
    pub fn add_contact(
        &self,
        user_id: UserId,
        name: &str,
        public_keys: Vec<u8>,
    ) -> Result<(), StoreError> {
        let now = self.now();
        self.store.with_tx(|tx| {
            tx.insert_contact(Contact {
                owner: self.owner,
                user_id,
                name: name.to_string(),
                public_keys,
                avatar: None,
                last_seen: None,
                created_at: now,
            })
        })
    }

    /// Reads the discussion with a peer, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    pub fn discussion_with(&self, contact: &UserId) -> Result<Option<Discussion>, StoreError> {
        self.store.with_tx(|tx| Ok(tx.discussion(&self.owner, contact)))
    }

    /// Reads the message timeline with a peer.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    pub fn messages_with(&self, contact: &UserId) -> Result<Vec<Message>, StoreError> {
        self.store
            .with_tx(|tx| Ok(tx.messages_for_contact(&self.owner, contact)))
    }

    /// Reads the owner's profile row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the profile is missing.
    pub fn profile(&self) -> Result<UserProfile, StoreError> {
        self.store.with_tx(|tx| {
            tx.profile(&self.owner)
                .ok_or_else(|| StoreError::NotFound("profile".into()))
        })
    }

    /// Resolves a peer's published public keys through the relay.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotFound`] when the peer has never
    /// published, or a network error.
    pub async fn lookup_public_keys(&self, user_id: &UserId) -> Result<Vec<u8>, TransportError> {
        let encoded = self
            .transport_timeout(self.transport.fetch_public_key(user_id))
            .await?;
        gossip_proto::payload::decode_blob(&encoded)
            .map_err(|e| TransportError::Connectivity(format!("undecodable key material: {e}")))
    }

    /// Stages an announcement collected while the engine was absent
    /// (background runner, service worker). Drained on the next tick.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the staging write fails.
    pub fn stage_pending_announcement(
        &self,
        counter: Cursor,
        data: Vec<u8>,
    ) -> Result<(), StoreError> {
        self.store.with_tx(|tx| {
            tx.push_pending_announcement(&self.owner, counter, data);
            Ok(())
        })
    }

    /// Stages a ciphertext collected while the engine was absent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the staging write fails.
    pub fn stage_pending_ciphertext(
        &self,
        seeker: Seeker,
        ciphertext: Vec<u8>,
    ) -> Result<(), StoreError> {
        self.store.with_tx(|tx| {
            tx.push_pending_ciphertext(&self.owner, seeker, ciphertext);
            Ok(())
        })
    }

    // --- shared internals ---

    pub(crate) fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Wraps a transport call with the configured timeout; a timeout is
    /// indistinguishable from any other network failure downstream.
    pub(crate) async fn transport_timeout<R>(
        &self,
        fut: impl Future<Output = Result<R, TransportError>>,
    ) -> Result<R, TransportError> {
        let timeout = Duration::from_millis(self.config.transport.timeout_ms);
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        }
    }

    /// Sends an announcement with immediate in-call retries, for the
    /// user-initiated paths where the caller is waiting on the result.
    pub(crate) async fn send_announcement_with_retry(
        &self,
        data: &[u8],
    ) -> Result<Cursor, TransportError> {
        let mut last_err = TransportError::Timeout;
        for attempt in 0..self.config.transport.retry_attempts.max(1) {
            match self
                .transport_timeout(self.transport.send_announcement(data))
                .await
            {
                Ok(counter) => return Ok(counter),
                Err(e) if e.is_retryable() => {
                    tracing::debug!(attempt, error = %e, "announcement send failed, will retry");
                    last_err = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    /// Persists the crypto state as an encrypted blob. Failures are logged
    /// and do not interrupt the caller: the state is re-persisted on the
    /// next tick.
    pub(crate) fn persist_sessions(&self) {
        let blob = self.crypto.lock().to_encrypted_blob(&self.blob_key);
        match blob {
            Some(blob) => {
                let result = self.store.with_tx(|tx| {
                    tx.put_session_blob(&self.owner, blob);
                    Ok(())
                });
                if let Err(e) = result {
                    tracing::warn!(error = %e, "failed to persist crypto state");
                }
            }
            None => tracing::warn!("crypto state serialization failed, not persisted"),
        }
    }

    /// Writes a discussion status inside the given transaction and returns
    /// the event to emit after commit, if the status actually changed.
    pub(crate) fn write_status(
        tx: &mut dyn StoreTx,
        mut discussion: Discussion,
        new_status: DiscussionStatus,
        now: Timestamp,
    ) -> Result<Option<CoreEvent>, StoreError> {
        let old = discussion.status;
        discussion.status = new_status;
        discussion.updated_at = now;
        let event = (old != new_status).then(|| CoreEvent::DiscussionStatusChanged {
            discussion_id: discussion.id,
            contact: discussion.contact,
            old,
            new: new_status,
        });
        tx.update_discussion(discussion)?;
        Ok(event)
    }

    /// Emits an event if one was produced by [`Self::write_status`].
    pub(crate) fn emit_if_changed(&self, event: Option<CoreEvent>) {
        if let Some(event) = event {
            self.events.emit(event);
        }
    }

    /// Logs a recoverable failure and surfaces it on the event channel.
    pub(crate) fn report_error(&self, context: &str, detail: &impl std::fmt::Display) {
        tracing::warn!(context, error = %detail, "recoverable engine error");
        self.events.emit(CoreEvent::CoreError {
            context: context.to_string(),
            detail: detail.to_string(),
        });
    }
}
