//! v001 -- Initial schema creation.
//!
//! Creates the six core tables: `olm_accounts`, `olm_sessions`,
//! `outbound_p2p_messages`, `inbound_p2p_messages`, `metadata`, and
//! `persist_storage`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Pickled Olm accounts, keyed by fixed logical IDs
-- ('content' / 'notifications')
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS olm_accounts (
    id           TEXT PRIMARY KEY NOT NULL,
    account_data TEXT NOT NULL                -- JSON {picklingKey, pickledAccount, ...}
);

-- ----------------------------------------------------------------
-- Pickled content sessions, one per remote device
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS olm_sessions (
    target_device_id TEXT PRIMARY KEY NOT NULL,  -- peer's ed25519 key, base64
    session_data     TEXT NOT NULL,              -- encrypted pickle
    version          INTEGER NOT NULL DEFAULT 1
);

-- ----------------------------------------------------------------
-- Outbound P2P delivery queue
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS outbound_p2p_messages (
    message_id          TEXT NOT NULL,
    device_id           TEXT NOT NULL,
    user_id             TEXT NOT NULL,
    timestamp           BIGINT NOT NULL,         -- ms since epoch
    plaintext           TEXT NOT NULL,
    ciphertext          TEXT NOT NULL,           -- '' until encrypted
    status              TEXT NOT NULL,           -- persisted | encrypted | sent
    supports_auto_retry INTEGER NOT NULL DEFAULT 0,

    PRIMARY KEY (message_id, device_id)
);

CREATE INDEX IF NOT EXISTS idx_outbound_p2p_device_ts
    ON outbound_p2p_messages(device_id, timestamp);

-- ----------------------------------------------------------------
-- Inbound P2P messages, write-once per message_id
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS inbound_p2p_messages (
    id               INTEGER PRIMARY KEY,
    message_id       TEXT NOT NULL UNIQUE,
    sender_device_id TEXT NOT NULL,
    sender_user_id   TEXT NOT NULL,
    plaintext        TEXT NOT NULL,
    status           TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Small typed metadata (stamped user ID, ...)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS metadata (
    name TEXT PRIMARY KEY NOT NULL,
    data TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Opaque blob store with per-row synchronization tokens
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS persist_storage (
    key        TEXT PRIMARY KEY NOT NULL,
    item       BLOB NOT NULL,
    sync_token TEXT NOT NULL
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
