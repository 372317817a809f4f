//! SQLite database handle and schema.

use std::path::Path;

use anyhow::{Context, Result};
use tokio_rusqlite::Connection;

const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS users (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    username             TEXT NOT NULL UNIQUE,
    is_admin             INTEGER NOT NULL DEFAULT 0,
    profile_image        BLOB,
    profile_image_sha256 TEXT,
    created_at           INTEGER NOT NULL,
    updated_at           INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS face_embeddings (
    collection TEXT    NOT NULL,
    user_key   INTEGER NOT NULL,
    vector     BLOB    NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (collection, user_key)
);

CREATE TABLE IF NOT EXISTS sessions (
    token      TEXT PRIMARY KEY,
    user_key   INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    expires_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_expires_at ON sessions(expires_at);
"#;

/// Open (creating if needed) the database file and apply the schema.
pub async fn open(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating database directory {}", parent.display()))?;
    }
    let conn = Connection::open(path)
        .await
        .with_context(|| format!("opening database {}", path.display()))?;
    migrate(&conn).await?;
    tracing::info!(path = %path.display(), "database ready");
    Ok(conn)
}

pub async fn migrate(conn: &Connection) -> Result<()> {
    conn.call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
    })
    .await
    .context("applying database schema")
}

#[cfg(test)]
pub async fn open_in_memory() -> Connection {
    let conn = Connection::open_in_memory().await.unwrap();
    migrate(&conn).await.unwrap();
    conn
}
