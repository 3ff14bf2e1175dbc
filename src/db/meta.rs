//! `schema_meta` accessors: schema version and the embedding model behind stored vectors.

use anyhow::{bail, Result};
use rusqlite::{Connection, OptionalExtension};

/// The schema version that the current binary writes and reads.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

pub fn get_schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM schema_meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
}

/// Refuse a database written by a newer binary.
pub fn check_schema_version(conn: &Connection) -> Result<u32> {
    let version = get_schema_version(conn)?;
    if version > CURRENT_SCHEMA_VERSION {
        bail!(
            "database schema version {version} is newer than this build supports \
             ({CURRENT_SCHEMA_VERSION})"
        );
    }
    tracing::debug!(schema_version = version, "schema is current");
    Ok(version)
}

/// The model that produced the stored vectors, if recorded.
pub fn get_embedding_model(conn: &Connection) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM schema_meta WHERE key = 'embedding_model'",
        [],
        |row| row.get(0),
    )
    .optional()
}

pub fn set_embedding_model(conn: &Connection, model: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO schema_meta (key, value) VALUES ('embedding_model', ?1) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        [model],
    )?;
    Ok(())
}
