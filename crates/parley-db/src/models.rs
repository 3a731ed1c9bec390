//! Database row types. These map directly to SQLite rows.
//! Timestamps and status stay as stored text; the `From` impls convert into parley-types models.

use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::warn;

use parley_types::models::{Message, MessageId, MessageStatus, Presence, UserId};

pub struct PresenceRow {
    pub user_id: UserId,
    pub is_online: bool,
    pub last_seen: Option<String>,
}

pub struct MessageRow {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: Option<String>,
    pub attachment: Option<String>,
    pub created_at: String,
    pub delivered_at: Option<String>,
    pub seen_at: Option<String>,
    pub status: String,
    pub deleted_for_receiver: bool,
    pub deleted_for_everyone: bool,
}

/// Timestamps are stored as fixed-width UTC text so that string comparison
/// in SQL matches chronological order.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

pub fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| {
            // Rows written by SQLite's datetime('now') have no zone suffix
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .ok()
}

fn parse_opt_ts(raw: Option<&str>, column: &str, owner: i64) -> Option<DateTime<Utc>> {
    let raw = raw?;
    let parsed = parse_ts(raw);
    if parsed.is_none() {
        warn!("Corrupt {} '{}' on row {}", column, raw, owner);
    }
    parsed
}

impl From<PresenceRow> for Presence {
    fn from(row: PresenceRow) -> Self {
        Self {
            user_id: row.user_id,
            online: row.is_online,
            last_seen: parse_opt_ts(row.last_seen.as_deref(), "last_seen", row.user_id),
        }
    }
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        let created_at = parse_ts(&row.created_at).unwrap_or_else(|| {
            warn!("Corrupt created_at '{}' on message {}", row.created_at, row.id);
            DateTime::default()
        });
        let status = MessageStatus::parse(&row.status).unwrap_or_else(|| {
            warn!("Corrupt status '{}' on message {}", row.status, row.id);
            MessageStatus::Sent
        });

        Self {
            id: row.id,
            sender_id: row.sender_id,
            receiver_id: row.receiver_id,
            delivered_at: parse_opt_ts(row.delivered_at.as_deref(), "delivered_at", row.id),
            seen_at: parse_opt_ts(row.seen_at.as_deref(), "seen_at", row.id),
            content: row.content,
            attachment: row.attachment,
            created_at,
            status,
            deleted_for_receiver: row.deleted_for_receiver,
            deleted_for_everyone: row.deleted_for_everyone,
        }
    }
}
