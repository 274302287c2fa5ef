//! Inbound P2P message log.
//!
//! Writes are idempotent on `message_id`: an unreliable transport may
//! deliver the same ciphertext twice, and the second record must be a
//! no-op rather than an error.

use rusqlite::{params, params_from_iter};

use crate::database::Database;
use crate::error::Result;
use crate::models::InboundMessage;

impl Database {
    /// Record a decrypted inbound message. Returns `false` when a row
    /// with the same `message_id` already exists.
    pub fn add_inbound_message(
        &self,
        message_id: &str,
        sender_device_id: &str,
        sender_user_id: &str,
        plaintext: &str,
        status: &str,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO inbound_p2p_messages
                 (message_id, sender_device_id, sender_user_id, plaintext, status)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![message_id, sender_device_id, sender_user_id, plaintext, status],
        )?;
        Ok(affected > 0)
    }

    pub fn get_all_inbound_messages(&self) -> Result<Vec<InboundMessage>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, message_id, sender_device_id, sender_user_id, plaintext, status
             FROM inbound_p2p_messages
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], row_to_inbound_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    pub fn get_inbound_messages_by_id(&self, ids: &[String]) -> Result<Vec<InboundMessage>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT id, message_id, sender_device_id, sender_user_id, plaintext, status
             FROM inbound_p2p_messages
             WHERE message_id IN ({placeholders})
             ORDER BY id ASC",
        );

        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(ids.iter()), row_to_inbound_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    pub fn remove_inbound_messages(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql =
            format!("DELETE FROM inbound_p2p_messages WHERE message_id IN ({placeholders})");
        self.conn().execute(&sql, params_from_iter(ids.iter()))?;
        Ok(())
    }

    /// Trim processed history: delete every row up to and including the
    /// last confirmed message's rowid.
    pub fn remove_inbound_messages_before(&self, last_confirmed_id: i64) -> Result<()> {
        self.conn().execute(
            "DELETE FROM inbound_p2p_messages WHERE id <= ?1",
            params![last_confirmed_id],
        )?;
        Ok(())
    }
}

fn row_to_inbound_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<InboundMessage> {
    Ok(InboundMessage {
        id: row.get(0)?,
        message_id: row.get(1)?,
        sender_device_id: row.get(2)?,
        sender_user_id: row.get(3)?,
        plaintext: row.get(4)?,
        status: row.get(5)?,
    })
}
