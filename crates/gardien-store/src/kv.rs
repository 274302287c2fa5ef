//! Opaque blob store with optimistic-concurrency writes.
//!
//! Every row carries a synchronization token regenerated on each write.
//! [`Database::kv_put`] only succeeds when the caller presents the token
//! it last read; a mismatch means some other writer got there first and
//! surfaces as [`StoreError::Conflict`] instead of silently overwriting.
//! [`Database::kv_force_put`] is the explicit unconditional variant.

use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::database::Database;
use crate::error::{Result, StoreError};

impl Database {
    /// Read a blob and its current synchronization token.
    pub fn kv_get(&self, key: &str) -> Result<Option<(Vec<u8>, String)>> {
        let row = self
            .conn()
            .query_row(
                "SELECT item, sync_token FROM persist_storage WHERE key = ?1",
                params![key],
                |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        Ok(row)
    }

    /// Write a blob with an expected-token precondition.
    ///
    /// `expected = None` asserts the key must not exist yet. Returns the
    /// new token on success.
    pub fn kv_put(&self, key: &str, item: &[u8], expected: Option<&str>) -> Result<String> {
        let new_token = Uuid::new_v4().to_string();

        let affected = match expected {
            None => self.conn().execute(
                "INSERT INTO persist_storage (key, item, sync_token)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO NOTHING",
                params![key, item, new_token],
            )?,
            Some(token) => self.conn().execute(
                "UPDATE persist_storage SET item = ?2, sync_token = ?3
                 WHERE key = ?1 AND sync_token = ?4",
                params![key, item, new_token, token],
            )?,
        };

        if affected == 0 {
            return Err(StoreError::Conflict(key.to_string()));
        }
        Ok(new_token)
    }

    /// Unconditional write. Returns the new token.
    pub fn kv_force_put(&self, key: &str, item: &[u8]) -> Result<String> {
        let new_token = Uuid::new_v4().to_string();
        self.conn().execute(
            "INSERT OR REPLACE INTO persist_storage (key, item, sync_token)
             VALUES (?1, ?2, ?3)",
            params![key, item, new_token],
        )?;
        Ok(new_token)
    }

    pub fn kv_remove(&self, key: &str) -> Result<()> {
        self.conn()
            .execute("DELETE FROM persist_storage WHERE key = ?1", params![key])?;
        Ok(())
    }

    /// All keys starting with `prefix`, sorted. Used to prune stale
    /// generations of a logical entry.
    pub fn kv_keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn().prepare(
            "SELECT key FROM persist_storage WHERE key LIKE ?1 || '%' ORDER BY key",
        )?;
        let rows = stmt.query_map(params![prefix], |row| row.get::<_, String>(0))?;

        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }
}
