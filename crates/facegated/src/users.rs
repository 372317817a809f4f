//! User profiles in SQLite.

use async_trait::async_trait;
use facegate_core::{StoreError, UserStore};
use rusqlite::params;
use sha2::{Digest, Sha256};
use tokio_rusqlite::Connection;

fn backend(e: tokio_rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes).iter().map(|b| format!("{b:02x}")).collect()
}

pub struct SqliteUserStore {
    conn: Connection,
}

impl SqliteUserStore {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// Create the user if absent; returns its key either way.
    pub async fn ensure_user(&self, username: &str, is_admin: bool) -> Result<i64, StoreError> {
        let username = username.to_string();
        self.conn
            .call(move |conn| {
                let now = now_ms();
                conn.execute(
                    "INSERT INTO users (username, is_admin, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?3)
                     ON CONFLICT (username) DO NOTHING",
                    params![username, is_admin, now],
                )?;
                let id = conn.query_row("SELECT id FROM users WHERE username = ?1", params![username], |r| {
                    r.get(0)
                })?;
                Ok(id)
            })
            .await
            .map_err(backend)
    }

    /// Make sure the administrator account exists and carries the admin flag.
    pub async fn bootstrap_admin(&self, username: &str) -> Result<i64, StoreError> {
        let user_key = self.ensure_user(username, true).await?;
        self.conn
            .call(move |conn| {
                conn.execute("UPDATE users SET is_admin = 1 WHERE id = ?1", params![user_key])?;
                Ok(())
            })
            .await
            .map_err(backend)?;
        tracing::info!(username, user_key, "administrator account ready");
        Ok(user_key)
    }

    #[cfg(test)]
    pub async fn is_admin(&self, user_key: i64) -> Result<bool, StoreError> {
        use rusqlite::OptionalExtension;
        self.conn
            .call(move |conn| {
                let flag = conn
                    .query_row("SELECT is_admin FROM users WHERE id = ?1", params![user_key], |r| {
                        r.get::<_, bool>(0)
                    })
                    .optional()?;
                Ok(flag.unwrap_or(false))
            })
            .await
            .map_err(backend)
    }

    /// SHA-256 (hex) of the stored profile image, if any.
    #[cfg(test)]
    pub async fn profile_digest(&self, user_key: i64) -> Result<Option<String>, StoreError> {
        use rusqlite::OptionalExtension;
        self.conn
            .call(move |conn| {
                let digest = conn
                    .query_row(
                        "SELECT profile_image_sha256 FROM users WHERE id = ?1",
                        params![user_key],
                        |r| r.get::<_, Option<String>>(0),
                    )
                    .optional()?;
                Ok(digest.flatten())
            })
            .await
            .map_err(backend)
    }
}

#[async_trait]
impl UserStore for SqliteUserStore {
    async fn exists(&self, user_key: i64) -> Result<bool, StoreError> {
        self.conn
            .call(move |conn| {
                let found: bool = conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM users WHERE id = ?1)",
                    params![user_key],
                    |r| r.get(0),
                )?;
                Ok(found)
            })
            .await
            .map_err(backend)
    }

    async fn set_profile_image(&self, user_key: i64, image: Vec<u8>) -> Result<(), StoreError> {
        let digest = sha256_hex(&image);
        let updated = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE users SET profile_image = ?1, profile_image_sha256 = ?2, updated_at = ?3 WHERE id = ?4",
                    params![image, digest, now_ms(), user_key],
                )?;
                Ok(n)
            })
            .await
            .map_err(backend)?;
        if updated == 0 {
            return Err(StoreError::Backend(format!("user {user_key} disappeared")));
        }
        tracing::debug!(user_key, "profile image stored");
        Ok(())
    }
}
