use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use parley_db::Database;
use parley_types::models::{Message, MessageId, MessageStatus, REDACTED_PLACEHOLDER, UserId};

use crate::{GatewayError, Result};

/// Message lifecycle: sent -> delivered -> read, plus redaction.
///
/// Every transition is a single forward-only statement against the store,
/// so racing callers can only ever split a batch between them, never apply
/// it twice or observe half of it. All methods block on SQLite.
#[derive(Clone)]
pub struct DeliveryTracker {
    db: Arc<Database>,
}

impl DeliveryTracker {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Persist a new message in status `sent`.
    ///
    /// Whitespace-only content counts as missing; a message needs content or
    /// an attachment. Unknown participants surface as `UnknownUser`.
    pub fn create(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        content: Option<&str>,
        attachment: Option<&str>,
    ) -> Result<Message> {
        if sender_id == receiver_id {
            return Err(GatewayError::Validation(format!(
                "sender and receiver are both {}",
                sender_id
            )));
        }

        let content = content.filter(|c| !c.trim().is_empty());
        let attachment = attachment.filter(|a| !a.trim().is_empty());
        if content.is_none() && attachment.is_none() {
            return Err(GatewayError::Validation("empty message".into()));
        }

        let row = self
            .db
            .insert_message(sender_id, receiver_id, content, attachment, Utc::now())?;
        Ok(Message::from(row))
    }

    /// Everything still `sent` to `receiver_id` becomes `delivered`, sharing
    /// one delivered-at stamp. Returns the ids touched; empty on repeat.
    pub fn mark_delivered(&self, receiver_id: UserId) -> Result<Vec<MessageId>> {
        let ids = self
            .db
            .advance_status(receiver_id, None, MessageStatus::Delivered, Utc::now())?;
        debug!("Marked {} message(s) to {} delivered", ids.len(), receiver_id);
        Ok(ids)
    }

    /// Everything from `other_user_id` to `reader_id` that is not yet `read`
    /// becomes `read`, whether it was `sent` or `delivered`.
    pub fn mark_read(&self, reader_id: UserId, other_user_id: UserId) -> Result<Vec<MessageId>> {
        if reader_id == other_user_id {
            return Ok(vec![]);
        }
        let ids = self.db.advance_status(
            reader_id,
            Some(other_user_id),
            MessageStatus::Read,
            Utc::now(),
        )?;
        debug!(
            "Marked {} message(s) from {} to {} read",
            ids.len(),
            other_user_id,
            reader_id
        );
        Ok(ids)
    }

    /// Redact for everyone (content replaced by a placeholder) or hide from
    /// the receiver. `None` means the message does not exist.
    pub fn redact(&self, message_id: MessageId, for_everyone: bool) -> Result<Option<MessageId>> {
        let id = self
            .db
            .redact_message(message_id, for_everyone, REDACTED_PLACEHOLDER)?;
        if id.is_none() {
            debug!("Redaction of missing message {} ignored", message_id);
        }
        Ok(id)
    }

    pub fn get(&self, message_id: MessageId) -> Result<Option<Message>> {
        Ok(self.db.get_message(message_id)?.map(Message::from))
    }

    pub fn conversation(
        &self,
        a: UserId,
        b: UserId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>> {
        let rows = self.db.get_conversation(a, b, limit, before)?;
        Ok(rows.into_iter().map(Message::from).collect())
    }
}
