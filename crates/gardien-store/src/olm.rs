//! Persistence of pickled Olm accounts and content sessions.
//!
//! Accounts are keyed by fixed logical IDs (`content` / `notifications`);
//! sessions by the peer device's ed25519 key. The pickles themselves are
//! already encrypted by the crypto layer, so this module only moves
//! opaque strings.

use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::Result;
use crate::models::{PickledAccount, PickledSession};

impl Database {
    pub fn store_olm_account(&self, account_id: &str, record: &PickledAccount) -> Result<()> {
        let data = serde_json::to_string(record)?;
        self.conn().execute(
            "INSERT OR REPLACE INTO olm_accounts (id, account_data) VALUES (?1, ?2)",
            params![account_id, data],
        )?;
        Ok(())
    }

    pub fn get_olm_account(&self, account_id: &str) -> Result<Option<PickledAccount>> {
        let data: Option<String> = self
            .conn()
            .query_row(
                "SELECT account_data FROM olm_accounts WHERE id = ?1",
                params![account_id],
                |row| row.get(0),
            )
            .optional()?;

        match data {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub fn store_olm_session(
        &self,
        target_device_id: &str,
        session_data: &str,
        version: i64,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO olm_sessions (target_device_id, session_data, version)
             VALUES (?1, ?2, ?3)",
            params![target_device_id, session_data, version],
        )?;
        Ok(())
    }

    pub fn get_olm_sessions(&self) -> Result<Vec<PickledSession>> {
        let mut stmt = self.conn().prepare(
            "SELECT target_device_id, session_data, version FROM olm_sessions",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(PickledSession {
                target_device_id: row.get(0)?,
                session_data: row.get(1)?,
                version: row.get(2)?,
            })
        })?;

        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?);
        }
        Ok(sessions)
    }

    // ------------------------------------------------------------------
    // Metadata
    // ------------------------------------------------------------------

    pub fn set_metadata(&self, name: &str, data: &str) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO metadata (name, data) VALUES (?1, ?2)",
            params![name, data],
        )?;
        Ok(())
    }

    pub fn get_metadata(&self, name: &str) -> Result<Option<String>> {
        let data = self
            .conn()
            .query_row(
                "SELECT data FROM metadata WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(data)
    }

    pub fn remove_metadata(&self, name: &str) -> Result<()> {
        self.conn()
            .execute("DELETE FROM metadata WHERE name = ?1", params![name])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        let record = PickledAccount {
            pickling_key: "pk".to_string(),
            pickled_account: "opaque".to_string(),
            prekey: Some("cHJla2V5".to_string()),
            prekey_signature: Some("c2ln".to_string()),
            prekey_published_at: Some(1_700_000_000_000),
            prekey_rotated_at: None,
        };

        db.store_olm_account("content", &record).unwrap();

        let loaded = db.get_olm_account("content").unwrap().unwrap();
        assert_eq!(loaded.pickled_account, "opaque");
        assert_eq!(loaded.prekey_published_at, Some(1_700_000_000_000));
        assert!(db.get_olm_account("notifications").unwrap().is_none());
    }

    #[test]
    fn session_upsert_keeps_latest() {
        let db = Database::open_in_memory().unwrap();

        db.store_olm_session("device-a", "pickle-v1", 1).unwrap();
        db.store_olm_session("device-a", "pickle-v2", 2).unwrap();

        let sessions = db.get_olm_sessions().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_data, "pickle-v2");
        assert_eq!(sessions[0].version, 2);
    }

    #[test]
    fn metadata_roundtrip() {
        let db = Database::open_in_memory().unwrap();

        db.set_metadata("current_user_id", "alice").unwrap();
        assert_eq!(
            db.get_metadata("current_user_id").unwrap().as_deref(),
            Some("alice")
        );

        db.remove_metadata("current_user_id").unwrap();
        assert!(db.get_metadata("current_user_id").unwrap().is_none());
    }
}
