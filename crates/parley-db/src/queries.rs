use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row, params};

use parley_types::models::{MessageId, MessageStatus, UserId};

use crate::models::{MessageRow, PresenceRow, format_ts};
use crate::{Database, DbError, Result};

const MESSAGE_COLUMNS: &str = "id, sender_id, receiver_id, content, attachment, created_at, \
     delivered_at, seen_at, status, deleted_for_receiver, deleted_for_everyone";

impl Database {
    // -- Users --

    pub fn create_user(&self, name: &str, number: &str) -> Result<UserId> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (name, number) VALUES (?1, ?2)",
                (name, number),
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Create the user unless one with this number already exists.
    /// Returns the id either way.
    pub fn ensure_user(&self, name: &str, number: &str) -> Result<UserId> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO users (name, number) VALUES (?1, ?2)",
                (name, number),
            )?;
            let id = conn.query_row("SELECT id FROM users WHERE number = ?1", [number], |row| {
                row.get(0)
            })?;
            Ok(id)
        })
    }

    // -- Presence --

    /// Set the online flag. Going offline stamps `last_seen` with `now`;
    /// going online leaves it alone. Returns `None` for an unknown user.
    pub fn set_user_online(
        &self,
        id: UserId,
        online: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<PresenceRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "UPDATE users
                    SET is_online = ?1,
                        last_seen = CASE WHEN ?1 THEN last_seen ELSE ?2 END
                  WHERE id = ?3
              RETURNING id, is_online, last_seen",
                params![online, format_ts(now), id],
                presence_from_row,
            )
            .optional()
        })
    }

    /// Refresh `last_seen` without touching the online flag.
    /// Returns false when the user does not exist.
    pub fn touch_user(&self, id: UserId, now: DateTime<Utc>) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE users SET last_seen = ?1 WHERE id = ?2",
                params![format_ts(now), id],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn get_presence(&self, id: UserId) -> Result<Option<PresenceRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, is_online, last_seen FROM users WHERE id = ?1",
                [id],
                presence_from_row,
            )
            .optional()
        })
    }

    /// Users marked online whose last sign of life is older than `cutoff`.
    pub fn stale_online_users(&self, cutoff: DateTime<Utc>) -> Result<Vec<UserId>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM users
                  WHERE is_online = 1
                    AND (last_seen IS NULL OR last_seen < ?1)
                  ORDER BY id",
            )?;
            let ids = stmt
                .query_map([format_ts(cutoff)], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    /// Flip a user offline only if they are still online and still stale.
    pub fn mark_offline_if_stale(
        &self,
        id: UserId,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<PresenceRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "UPDATE users
                    SET is_online = 0, last_seen = ?1
                  WHERE id = ?2
                    AND is_online = 1
                    AND (last_seen IS NULL OR last_seen < ?3)
              RETURNING id, is_online, last_seen",
                params![format_ts(now), id, format_ts(cutoff)],
                presence_from_row,
            )
            .optional()
        })
    }

    // -- Messages --

    /// Insert a message in status `sent`. Fails with `UnknownUser` if either
    /// participant does not exist.
    pub fn insert_message(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        content: Option<&str>,
        attachment: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<MessageRow> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;

            for id in [sender_id, receiver_id] {
                if !user_exists(&tx, id)? {
                    return Err(DbError::UnknownUser(id));
                }
            }

            let row = tx.query_row(
                &format!(
                    "INSERT INTO messages (sender_id, receiver_id, content, attachment, created_at, status)
                     VALUES (?1, ?2, ?3, ?4, ?5, 'sent')
                     RETURNING {MESSAGE_COLUMNS}"
                ),
                params![sender_id, receiver_id, content, attachment, format_ts(now)],
                message_from_row,
            )?;

            tx.commit()?;
            Ok(row)
        })
    }

    pub fn get_message(&self, id: MessageId) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                [id],
                message_from_row,
            )
            .optional()
        })
    }

    /// Move every message addressed to `receiver_id` (optionally only those
    /// from `sender_id`) that is still before `target` in the lifecycle into
    /// `target`, stamping the batch with one timestamp.
    ///
    /// `delivered_at` is filled wherever it is still null, so a jump straight
    /// from sent to read also records delivery. `seen_at` is filled on entry
    /// into read. Runs as one statement; returns the touched ids ascending.
    pub fn advance_status(
        &self,
        receiver_id: UserId,
        sender_id: Option<UserId>,
        target: MessageStatus,
        now: DateTime<Utc>,
    ) -> Result<Vec<MessageId>> {
        let from = target.predecessors();
        if from.is_empty() {
            return Ok(vec![]);
        }

        let from_list = from
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE messages
                SET status = ?1,
                    delivered_at = COALESCE(delivered_at, ?2),
                    seen_at = CASE WHEN ?1 = 'read' THEN COALESCE(seen_at, ?2) ELSE seen_at END
              WHERE receiver_id = ?3
                AND (?4 IS NULL OR sender_id = ?4)
                AND status IN ({from_list})
          RETURNING id"
        );

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let mut ids = stmt
                .query_map(
                    params![target.as_str(), format_ts(now), receiver_id, sender_id],
                    |row| row.get::<_, MessageId>(0),
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            ids.sort_unstable();
            Ok(ids)
        })
    }

    /// Redact a message. `for_everyone` replaces the content with
    /// `placeholder` and drops any attachment; otherwise only the
    /// receiver-side visibility flag is set. Returns `None` if no such message.
    pub fn redact_message(
        &self,
        id: MessageId,
        for_everyone: bool,
        placeholder: &str,
    ) -> Result<Option<MessageId>> {
        self.with_conn(|conn| {
            if for_everyone {
                conn.query_row(
                    "UPDATE messages
                        SET content = ?1, attachment = NULL, deleted_for_everyone = 1
                      WHERE id = ?2
                  RETURNING id",
                    params![placeholder, id],
                    |row| row.get(0),
                )
                .optional()
            } else {
                conn.query_row(
                    "UPDATE messages SET deleted_for_receiver = 1 WHERE id = ?1 RETURNING id",
                    [id],
                    |row| row.get(0),
                )
                .optional()
            }
        })
    }

    /// Messages exchanged between two users, newest first. `before` is an
    /// exclusive message-id cursor for paging back.
    pub fn get_conversation(
        &self,
        a: UserId,
        b: UserId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                  WHERE ((sender_id = ?1 AND receiver_id = ?2) OR (sender_id = ?2 AND receiver_id = ?1))
                    AND (?3 IS NULL OR id < ?3)
                  ORDER BY id DESC
                  LIMIT ?4"
            ))?;
            let rows = stmt
                .query_map(params![a, b, before, limit], message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn user_exists(conn: &Connection, id: UserId) -> Result<bool> {
    let found = conn
        .query_row("SELECT 1 FROM users WHERE id = ?1", [id], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

fn presence_from_row(row: &Row<'_>) -> rusqlite::Result<PresenceRow> {
    Ok(PresenceRow {
        user_id: row.get(0)?,
        is_online: row.get(1)?,
        last_seen: row.get(2)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        sender_id: row.get(1)?,
        receiver_id: row.get(2)?,
        content: row.get(3)?,
        attachment: row.get(4)?,
        created_at: row.get(5)?,
        delivered_at: row.get(6)?,
        seen_at: row.get(7)?,
        status: row.get(8)?,
        deleted_for_receiver: row.get(9)?,
        deleted_for_everyone: row.get(10)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
