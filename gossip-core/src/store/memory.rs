//! In-memory reference store.
//!
//! Tables live behind one mutex; a transaction locks it, snapshots the
//! tables, and restores the snapshot if the closure fails. Cloning whole
//! tables per transaction is fine at client scale and buys exact
//! rollback semantics without a write-ahead log.

use std::collections::HashMap;

use parking_lot::Mutex;

use gossip_proto::board::{Cursor, Seeker};
use gossip_proto::ident::UserId;

use super::model::{
    Contact, Discussion, Message, MessageDirection, MessageId, MessageStatus, NewMessage,
    PendingAnnouncement, PendingCiphertext, UserProfile,
};
use super::{Store, StoreError, StoreTx};

#[derive(Default, Clone)]
struct Tables {
    profiles: HashMap<UserId, UserProfile>,
    session_blobs: HashMap<UserId, Vec<u8>>,
    contacts: Vec<Contact>,
    discussions: Vec<Discussion>,
    messages: Vec<Message>,
    next_message_id: u64,
    pending_announcements: Vec<PendingAnnouncement>,
    next_pending_announcement_id: u64,
    pending_ciphertexts: Vec<PendingCiphertext>,
    next_pending_ciphertext_id: u64,
}

/// In-memory [`Store`] with snapshot-rollback transactions.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn with_tx<R>(
        &self,
        f: impl FnOnce(&mut dyn StoreTx) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let mut tables = self.tables.lock();
        let snapshot = tables.clone();
        match f(&mut *tables) {
            Ok(value) => Ok(value),
            Err(e) => {
                *tables = snapshot;
                Err(e)
            }
        }
    }
}

impl Tables {
    fn message_ordering(a: &Message, b: &Message) -> std::cmp::Ordering {
        a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id))
    }

    /// Enforces the (owner, contact, seeker) uniqueness axis, excluding
    /// the row `except` when updating in place.
    fn seeker_taken(&self, message: &Message, except: Option<MessageId>) -> bool {
        let Some(seeker) = &message.seeker else {
            return false;
        };
        self.messages.iter().any(|m| {
            Some(m.id) != except
                && m.owner == message.owner
                && m.contact == message.contact
                && m.seeker.as_ref() == Some(seeker)
        })
    }
}

impl StoreTx for Tables {
    fn profile(&self, owner: &UserId) -> Option<UserProfile> {
        self.profiles.get(owner).cloned()
    }

    fn put_profile(&mut self, profile: UserProfile) {
        self.profiles.insert(profile.user_id, profile);
    }

    fn advance_cursor(&mut self, owner: &UserId, cursor: Cursor) -> Result<(), StoreError> {
        let profile = self
            .profiles
            .get_mut(owner)
            .ok_or_else(|| StoreError::NotFound(format!("profile {owner:?}")))?;
        if profile.last_announcement_cursor.is_none_or(|c| cursor > c) {
            profile.last_announcement_cursor = Some(cursor);
        }
        Ok(())
    }

    fn session_blob(&self, owner: &UserId) -> Option<Vec<u8>> {
        self.session_blobs.get(owner).cloned()
    }

    fn put_session_blob(&mut self, owner: &UserId, blob: Vec<u8>) {
        self.session_blobs.insert(*owner, blob);
    }

    fn contact(&self, owner: &UserId, contact: &UserId) -> Option<Contact> {
        self.contacts
            .iter()
            .find(|c| c.owner == *owner && c.user_id == *contact)
            .cloned()
    }

    fn contact_by_name(&self, owner: &UserId, name: &str) -> Option<Contact> {
        self.contacts
            .iter()
            .find(|c| c.owner == *owner && c.name == name)
            .cloned()
    }

    fn contact_names(&self, owner: &UserId) -> Vec<String> {
        self.contacts
            .iter()
            .filter(|c| c.owner == *owner)
            .map(|c| c.name.clone())
            .collect()
    }

    fn insert_contact(&mut self, contact: Contact) -> Result<(), StoreError> {
        if self.contact(&contact.owner, &contact.user_id).is_some() {
            return Err(StoreError::AlreadyExists(format!(
                "contact {:?}",
                contact.user_id
            )));
        }
        if self.contact_by_name(&contact.owner, &contact.name).is_some() {
            return Err(StoreError::AlreadyExists(format!(
                "contact name {:?}",
                contact.name
            )));
        }
        self.contacts.push(contact);
        Ok(())
    }

    fn update_contact(&mut self, contact: Contact) -> Result<(), StoreError> {
        let row = self
            .contacts
            .iter_mut()
            .find(|c| c.owner == contact.owner && c.user_id == contact.user_id)
            .ok_or_else(|| StoreError::NotFound(format!("contact {:?}", contact.user_id)))?;
        *row = contact;
        Ok(())
    }

    fn discussion(&self, owner: &UserId, contact: &UserId) -> Option<Discussion> {
        self.discussions
            .iter()
            .find(|d| d.owner == *owner && d.contact == *contact)
            .cloned()
    }

    fn discussions(&self, owner: &UserId) -> Vec<Discussion> {
        self.discussions
            .iter()
            .filter(|d| d.owner == *owner)
            .cloned()
            .collect()
    }

    fn insert_discussion(&mut self, discussion: Discussion) -> Result<(), StoreError> {
        if self.discussion(&discussion.owner, &discussion.contact).is_some() {
            return Err(StoreError::AlreadyExists(format!(
                "discussion with {:?}",
                discussion.contact
            )));
        }
        self.discussions.push(discussion);
        Ok(())
    }

    fn update_discussion(&mut self, discussion: Discussion) -> Result<(), StoreError> {
        let row = self
            .discussions
            .iter_mut()
            .find(|d| d.owner == discussion.owner && d.contact == discussion.contact)
            .ok_or_else(|| StoreError::NotFound(format!("discussion with {:?}", discussion.contact)))?;
        *row = discussion;
        Ok(())
    }

    fn insert_message(&mut self, message: NewMessage) -> Result<Message, StoreError> {
        self.next_message_id += 1;
        let row = Message {
            id: MessageId::new(self.next_message_id),
            owner: message.owner,
            contact: message.contact,
            direction: message.direction,
            kind: message.kind,
            status: message.status,
            content: message.content,
            seeker: message.seeker,
            encrypted: None,
            when_to_send: None,
            attempts: 0,
            timestamp: message.timestamp,
        };
        if self.seeker_taken(&row, None) {
            self.next_message_id -= 1;
            return Err(StoreError::AlreadyExists(format!(
                "message with seeker {:?}",
                row.seeker
            )));
        }
        self.messages.push(row.clone());
        Ok(row)
    }

    fn update_message(&mut self, message: Message) -> Result<(), StoreError> {
        if self.seeker_taken(&message, Some(message.id)) {
            return Err(StoreError::AlreadyExists(format!(
                "message with seeker {:?}",
                message.seeker
            )));
        }
        let row = self
            .messages
            .iter_mut()
            .find(|m| m.id == message.id)
            .ok_or_else(|| StoreError::NotFound(format!("message {}", message.id)))?;
        *row = message;
        Ok(())
    }

    fn message(&self, id: MessageId) -> Option<Message> {
        self.messages.iter().find(|m| m.id == id).cloned()
    }

    fn outgoing_in_statuses(
        &self,
        owner: &UserId,
        contact: &UserId,
        statuses: &[MessageStatus],
    ) -> Vec<Message> {
        let mut rows: Vec<Message> = self
            .messages
            .iter()
            .filter(|m| {
                m.owner == *owner
                    && m.contact == *contact
                    && m.direction == MessageDirection::Outgoing
                    && statuses.contains(&m.status)
            })
            .cloned()
            .collect();
        rows.sort_by(Self::message_ordering);
        rows
    }

    fn messages_in_status(&self, owner: &UserId, status: MessageStatus) -> Vec<Message> {
        let mut rows: Vec<Message> = self
            .messages
            .iter()
            .filter(|m| m.owner == *owner && m.status == status)
            .cloned()
            .collect();
        rows.sort_by_key(|m| m.id);
        rows
    }

    fn outgoing_by_seeker(&self, owner: &UserId, seeker: &Seeker) -> Option<Message> {
        self.messages
            .iter()
            .find(|m| {
                m.owner == *owner
                    && m.direction == MessageDirection::Outgoing
                    && m.seeker.as_ref() == Some(seeker)
            })
            .cloned()
    }

    fn messages_for_contact(&self, owner: &UserId, contact: &UserId) -> Vec<Message> {
        let mut rows: Vec<Message> = self
            .messages
            .iter()
            .filter(|m| m.owner == *owner && m.contact == *contact)
            .cloned()
            .collect();
        rows.sort_by(Self::message_ordering);
        rows
    }

    fn push_pending_announcement(&mut self, owner: &UserId, counter: Cursor, data: Vec<u8>) {
        self.next_pending_announcement_id += 1;
        self.pending_announcements.push(PendingAnnouncement {
            id: self.next_pending_announcement_id,
            owner: *owner,
            counter,
            data,
        });
    }

    fn pending_announcements(&self, owner: &UserId) -> Vec<PendingAnnouncement> {
        self.pending_announcements
            .iter()
            .filter(|p| p.owner == *owner)
            .cloned()
            .collect()
    }

    fn delete_pending_announcement(&mut self, id: u64) {
        self.pending_announcements.retain(|p| p.id != id);
    }

    fn push_pending_ciphertext(&mut self, owner: &UserId, seeker: Seeker, ciphertext: Vec<u8>) {
        self.next_pending_ciphertext_id += 1;
        self.pending_ciphertexts.push(PendingCiphertext {
            id: self.next_pending_ciphertext_id,
            owner: *owner,
            seeker,
            ciphertext,
        });
    }

    fn pending_ciphertexts(&self, owner: &UserId) -> Vec<PendingCiphertext> {
        self.pending_ciphertexts
            .iter()
            .filter(|p| p.owner == *owner)
            .cloned()
            .collect()
    }

    fn delete_pending_ciphertext(&mut self, id: u64) {
        self.pending_ciphertexts.retain(|p| p.id != id);
    }
}
