//! SQLite schema definitions

use rusqlite::{Connection, OptionalExtension};
use tracing::info;

use crate::error::StorageError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new capsule schema v{}", SCHEMA_VERSION);
        conn.execute_batch(CAPSULE_SCHEMA)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version > SCHEMA_VERSION {
        return Err(StorageError::Corrupt(format!(
            "database schema v{} is newer than supported v{}",
            current_version, SCHEMA_VERSION
        )));
    } else {
        info!("Capsule schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32, StorageError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .optional()?;

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), StorageError> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

/// Timestamps are microseconds since the Unix epoch (UTC).
const CAPSULE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS capsules (
    id TEXT PRIMARY KEY NOT NULL,
    title TEXT NOT NULL,
    status TEXT NOT NULL,
    recipients TEXT NOT NULL,
    target_letter_count INTEGER NOT NULL CHECK (target_letter_count > 0),
    target_date TEXT NOT NULL,
    deliver_on_goal_reached INTEGER NOT NULL,
    created_by TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    version INTEGER NOT NULL DEFAULT 0,
    closed_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_capsules_status ON capsules(status);

CREATE TABLE IF NOT EXISTS invites (
    code TEXT PRIMARY KEY NOT NULL,
    capsule_id TEXT NOT NULL REFERENCES capsules(id),
    issued_at INTEGER NOT NULL,
    expires_at INTEGER,
    max_uses INTEGER,
    uses INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS contributors (
    id TEXT PRIMARY KEY NOT NULL,
    capsule_id TEXT NOT NULL REFERENCES capsules(id),
    admission_key TEXT NOT NULL,
    display_name TEXT NOT NULL,
    relation_label TEXT NOT NULL,
    joined_at INTEGER NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    UNIQUE (capsule_id, admission_key)
);

CREATE TABLE IF NOT EXISTS letters (
    id TEXT PRIMARY KEY NOT NULL,
    capsule_id TEXT NOT NULL REFERENCES capsules(id),
    contributor_id TEXT NOT NULL REFERENCES contributors(id),
    body TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    submitted_at INTEGER NOT NULL,
    revision INTEGER NOT NULL DEFAULT 1,
    UNIQUE (capsule_id, contributor_id)
);

CREATE TABLE IF NOT EXISTS gifts (
    capsule_id TEXT NOT NULL REFERENCES capsules(id),
    sku_id TEXT NOT NULL,
    quantity INTEGER NOT NULL CHECK (quantity >= 0),
    PRIMARY KEY (capsule_id, sku_id)
);

CREATE TABLE IF NOT EXISTS outbox (
    id TEXT PRIMARY KEY NOT NULL,
    capsule_id TEXT NOT NULL UNIQUE REFERENCES capsules(id),
    snapshot TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    state TEXT NOT NULL,
    lease_until INTEGER,
    dispatched_at INTEGER,
    last_error TEXT
);

CREATE INDEX IF NOT EXISTS idx_outbox_state ON outbox(state, created_at);
"#;
