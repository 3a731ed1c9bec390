use rusqlite::Connection;
use tracing::info;

use crate::Result;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            name        TEXT NOT NULL,
            number      TEXT NOT NULL UNIQUE,
            is_online   INTEGER NOT NULL DEFAULT 0,
            last_seen   TEXT
        );

        CREATE TABLE IF NOT EXISTS messages (
            id                      INTEGER PRIMARY KEY AUTOINCREMENT,
            sender_id               INTEGER NOT NULL REFERENCES users(id),
            receiver_id             INTEGER NOT NULL REFERENCES users(id),
            content                 TEXT,
            attachment              TEXT,
            created_at              TEXT NOT NULL,
            delivered_at            TEXT,
            seen_at                 TEXT,
            status                  TEXT NOT NULL DEFAULT 'sent'
                                    CHECK (status IN ('sent', 'delivered', 'read')),
            deleted_for_receiver    INTEGER NOT NULL DEFAULT 0,
            deleted_for_everyone    INTEGER NOT NULL DEFAULT 0,
            CHECK (sender_id <> receiver_id)
        );

        CREATE INDEX IF NOT EXISTS idx_messages_receiver_status
            ON messages(receiver_id, status);

        CREATE INDEX IF NOT EXISTS idx_messages_pair
            ON messages(sender_id, receiver_id, id);

        -- Status only moves forward: sent -> delivered -> read
        CREATE TRIGGER IF NOT EXISTS messages_status_forward_only
            BEFORE UPDATE OF status ON messages
            WHEN (CASE NEW.status WHEN 'sent' THEN 0 WHEN 'delivered' THEN 1 ELSE 2 END)
               < (CASE OLD.status WHEN 'sent' THEN 0 WHEN 'delivered' THEN 1 ELSE 2 END)
        BEGIN
            SELECT RAISE(ABORT, 'message status cannot move backwards');
        END;
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
