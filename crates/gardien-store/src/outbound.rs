//! Outbound P2P message queue.
//!
//! Rows are created in `persisted` state with plaintext only; a later
//! encryption step fills `ciphertext` and flips the status. Delivery
//! confirmation deletes the row. When a peer re-keys, affected rows are
//! returned to `persisted` for re-encryption against the fresh session.

use rusqlite::{params, params_from_iter};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{DeliveryStatus, OutboundMessage};

impl Database {
    pub fn add_outbound_message(&self, message: &OutboundMessage) -> Result<()> {
        self.conn().execute(
            "INSERT INTO outbound_p2p_messages
                 (message_id, device_id, user_id, timestamp, plaintext,
                  ciphertext, status, supports_auto_retry)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                message.message_id,
                message.device_id,
                message.user_id,
                message.timestamp,
                message.plaintext,
                message.ciphertext,
                message.status.as_str(),
                message.supports_auto_retry as i64,
            ],
        )?;
        Ok(())
    }

    /// All messages not yet confirmed delivered, in replay order.
    pub fn get_unsent_outbound_messages(&self) -> Result<Vec<OutboundMessage>> {
        let mut stmt = self.conn().prepare(
            "SELECT message_id, device_id, user_id, timestamp, plaintext,
                    ciphertext, status, supports_auto_retry
             FROM outbound_p2p_messages
             WHERE status != 'sent'
             ORDER BY timestamp ASC, device_id ASC",
        )?;

        let rows = stmt.query_map([], row_to_outbound_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Targeted lookup for resends.
    pub fn get_outbound_messages_by_id(&self, ids: &[String]) -> Result<Vec<OutboundMessage>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT message_id, device_id, user_id, timestamp, plaintext,
                    ciphertext, status, supports_auto_retry
             FROM outbound_p2p_messages
             WHERE message_id IN ({placeholders})
             ORDER BY timestamp ASC, device_id ASC",
        );

        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(ids.iter()), row_to_outbound_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Record the encryption result: fills `ciphertext` and flips the row
    /// to `encrypted`. Fails with [`StoreError::NotFound`] when the row
    /// does not exist.
    pub fn set_ciphertext_for_outbound_message(
        &self,
        message_id: &str,
        device_id: &str,
        ciphertext: &str,
    ) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE outbound_p2p_messages
             SET ciphertext = ?3, status = 'encrypted'
             WHERE message_id = ?1 AND device_id = ?2",
            params![message_id, device_id, ciphertext],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Delivery confirmation. Sent messages are not retained, so this
    /// deletes the row; confirming an already-deleted message is a no-op.
    pub fn mark_outbound_message_as_sent(&self, message_id: &str, device_id: &str) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM outbound_p2p_messages
             WHERE message_id = ?1 AND device_id = ?2",
            params![message_id, device_id],
        )?;
        Ok(affected > 0)
    }

    pub fn remove_outbound_message(&self, message_id: &str, device_id: &str) -> Result<()> {
        self.conn().execute(
            "DELETE FROM outbound_p2p_messages
             WHERE message_id = ?1 AND device_id = ?2",
            params![message_id, device_id],
        )?;
        Ok(())
    }

    pub fn remove_all_outbound_messages(&self, device_id: &str) -> Result<()> {
        self.conn().execute(
            "DELETE FROM outbound_p2p_messages WHERE device_id = ?1",
            params![device_id],
        )?;
        Ok(())
    }

    /// Return a re-keyed device's messages to the `persisted` state for
    /// re-encryption.
    ///
    /// Selected rows are those that can be resent without caller help:
    /// everything flagged for auto-retry, plus already-`sent` rows
    /// interrupted mid-confirmation. Their ciphertext is cleared (it was
    /// produced against the dead session), auto-retry is forced on, and
    /// the rows are optionally re-keyed under `new_device_id`. Returns the
    /// affected message IDs in timestamp order so the caller can
    /// re-trigger encryption.
    pub fn reset_outbound_messages_for_device(
        &self,
        device_id: &str,
        new_device_id: Option<&str>,
    ) -> Result<Vec<String>> {
        let mut stmt = self.conn().prepare(
            "SELECT message_id
             FROM outbound_p2p_messages
             WHERE device_id = ?1
               AND (supports_auto_retry = 1 OR status = 'sent')
             ORDER BY timestamp ASC",
        )?;
        let rows = stmt.query_map(params![device_id], |row| row.get::<_, String>(0))?;

        let mut message_ids = Vec::new();
        for row in rows {
            message_ids.push(row?);
        }

        let target_device = new_device_id.unwrap_or(device_id);
        for message_id in &message_ids {
            self.conn().execute(
                "UPDATE outbound_p2p_messages
                 SET status = 'persisted', ciphertext = '',
                     supports_auto_retry = 1, device_id = ?1
                 WHERE message_id = ?2 AND device_id = ?3",
                params![target_device, message_id, device_id],
            )?;
        }

        tracing::debug!(
            device_id,
            reset = message_ids.len(),
            "reset outbound messages for device"
        );

        Ok(message_ids)
    }
}

fn row_to_outbound_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboundMessage> {
    let status_str: String = row.get(6)?;
    let status = DeliveryStatus::from_str(&status_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            6,
            rusqlite::types::Type::Text,
            format!("unknown delivery status: {status_str}").into(),
        )
    })?;

    Ok(OutboundMessage {
        message_id: row.get(0)?,
        device_id: row.get(1)?,
        user_id: row.get(2)?,
        timestamp: row.get(3)?,
        plaintext: row.get(4)?,
        ciphertext: row.get(5)?,
        status,
        supports_auto_retry: row.get::<_, i64>(7)? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str, device: &str, ts: i64, auto_retry: bool) -> OutboundMessage {
        OutboundMessage {
            message_id: id.to_string(),
            device_id: device.to_string(),
            user_id: "user-1".to_string(),
            timestamp: ts,
            plaintext: format!("plaintext of {id}"),
            ciphertext: String::new(),
            status: DeliveryStatus::Persisted,
            supports_auto_retry: auto_retry,
        }
    }

    #[test]
    fn unsent_messages_come_back_in_replay_order() {
        let db = Database::open_in_memory().unwrap();
        db.add_outbound_message(&message("m2", "d1", 200, false)).unwrap();
        db.add_outbound_message(&message("m1", "d1", 100, false)).unwrap();
        db.add_outbound_message(&message("m3", "d0", 200, false)).unwrap();

        let unsent = db.get_unsent_outbound_messages().unwrap();
        let ids: Vec<&str> = unsent.iter().map(|m| m.message_id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m3", "m2"]);
    }

    #[test]
    fn set_ciphertext_flips_status() {
        let db = Database::open_in_memory().unwrap();
        db.add_outbound_message(&message("m1", "d1", 1, false)).unwrap();

        db.set_ciphertext_for_outbound_message("m1", "d1", "{\"message\":\"x\"}")
            .unwrap();

        let rows = db.get_outbound_messages_by_id(&["m1".to_string()]).unwrap();
        assert_eq!(rows[0].status, DeliveryStatus::Encrypted);
        assert_eq!(rows[0].ciphertext, "{\"message\":\"x\"}");
    }

    #[test]
    fn set_ciphertext_on_missing_row_fails() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(
            db.set_ciphertext_for_outbound_message("nope", "d1", "c"),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn mark_sent_deletes_and_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.add_outbound_message(&message("m1", "d1", 1, false)).unwrap();

        assert!(db.mark_outbound_message_as_sent("m1", "d1").unwrap());
        assert!(db.get_unsent_outbound_messages().unwrap().is_empty());

        // Second confirmation is a no-op, not an error.
        assert!(!db.mark_outbound_message_as_sent("m1", "d1").unwrap());
    }

    #[test]
    fn reset_covers_auto_retry_and_sent_rows_only() {
        let db = Database::open_in_memory().unwrap();

        // encrypted + auto-retry: reset
        db.add_outbound_message(&message("m1", "d1", 1, true)).unwrap();
        db.set_ciphertext_for_outbound_message("m1", "d1", "c1").unwrap();
        // encrypted, no auto-retry: untouched
        db.add_outbound_message(&message("m2", "d1", 2, false)).unwrap();
        db.set_ciphertext_for_outbound_message("m2", "d1", "c2").unwrap();
        // sent, no auto-retry (crash before confirmation cleanup): reset
        let mut sent = message("m3", "d1", 3, false);
        sent.status = DeliveryStatus::Sent;
        sent.ciphertext = "c3".to_string();
        db.add_outbound_message(&sent).unwrap();
        // other device: untouched
        db.add_outbound_message(&message("m4", "d2", 4, true)).unwrap();

        let reset = db.reset_outbound_messages_for_device("d1", None).unwrap();
        assert_eq!(reset, vec!["m1".to_string(), "m3".to_string()]);

        let rows = db
            .get_outbound_messages_by_id(&[
                "m1".to_string(),
                "m2".to_string(),
                "m3".to_string(),
            ])
            .unwrap();
        for row in &rows {
            match row.message_id.as_str() {
                "m1" | "m3" => {
                    assert_eq!(row.status, DeliveryStatus::Persisted);
                    assert!(row.ciphertext.is_empty());
                    assert!(row.supports_auto_retry);
                }
                "m2" => {
                    assert_eq!(row.status, DeliveryStatus::Encrypted);
                    assert_eq!(row.ciphertext, "c2");
                }
                other => panic!("unexpected row {other}"),
            }
        }
    }

    #[test]
    fn reset_can_rekey_to_new_device_id() {
        let db = Database::open_in_memory().unwrap();
        db.add_outbound_message(&message("m1", "old-device", 1, true)).unwrap();

        let reset = db
            .reset_outbound_messages_for_device("old-device", Some("new-device"))
            .unwrap();
        assert_eq!(reset, vec!["m1".to_string()]);

        let rows = db.get_outbound_messages_by_id(&["m1".to_string()]).unwrap();
        assert_eq!(rows[0].device_id, "new-device");
    }

    #[test]
    fn get_by_id_with_empty_input() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get_outbound_messages_by_id(&[]).unwrap().is_empty());
    }
}
