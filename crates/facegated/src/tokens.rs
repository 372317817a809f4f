//! Opaque bearer tokens issued after a recognized verify.

use async_trait::async_trait;
use facegate_core::{AccessToken, AuthCollaborator, StoreError};
use rusqlite::{params, OptionalExtension};
use tokio_rusqlite::Connection;

pub const TOKEN_TYPE: &str = "Bearer";

fn backend(e: tokio_rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

pub struct SessionTokens {
    conn: Connection,
    ttl: chrono::Duration,
}

impl SessionTokens {
    pub fn new(conn: Connection, ttl: chrono::Duration) -> Self {
        Self { conn, ttl }
    }

    /// The user a live token was issued to. Expired tokens resolve to `None`
    /// and are removed.
    pub async fn resolve(&self, token: &str) -> Result<Option<i64>, StoreError> {
        let token = token.to_string();
        let now = chrono::Utc::now().timestamp_millis();
        self.conn
            .call(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT user_key, expires_at FROM sessions WHERE token = ?1",
                        params![token],
                        |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?)),
                    )
                    .optional()?;
                match row {
                    Some((user_key, expires_at)) if expires_at > now => Ok(Some(user_key)),
                    Some(_) => {
                        conn.execute("DELETE FROM sessions WHERE token = ?1", params![token])?;
                        Ok(None)
                    }
                    None => Ok(None),
                }
            })
            .await
            .map_err(backend)
    }
}

#[async_trait]
impl AuthCollaborator for SessionTokens {
    async fn issue_token(&self, subject: i64) -> Result<AccessToken, StoreError> {
        let now = chrono::Utc::now();
        let access = AccessToken {
            token: uuid::Uuid::new_v4().simple().to_string(),
            token_type: TOKEN_TYPE.to_string(),
            expires_at: (now + self.ttl).timestamp_millis(),
        };

        let (token, expires_at, now_ms) = (access.token.clone(), access.expires_at, now.timestamp_millis());
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM sessions WHERE expires_at <= ?1", params![now_ms])?;
                tx.execute(
                    "INSERT INTO sessions (token, user_key, expires_at) VALUES (?1, ?2, ?3)",
                    params![token, subject, expires_at],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(backend)?;

        tracing::debug!(user_key = subject, expires_at, "session token issued");
        Ok(access)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::users::SqliteUserStore;

    async fn setup(ttl: chrono::Duration) -> (SessionTokens, i64) {
        let conn = db::open_in_memory().await;
        let alice = SqliteUserStore::new(conn.clone()).ensure_user("alice", false).await.unwrap();
        (SessionTokens::new(conn, ttl), alice)
    }

    #[tokio::test]
    async fn test_issued_token_resolves_to_subject() {
        let (tokens, alice) = setup(chrono::Duration::minutes(30)).await;
        let issued = tokens.issue_token(alice).await.unwrap();
        assert_eq!(issued.token_type, "Bearer");
        assert_eq!(issued.token.len(), 32);
        assert!(issued.expires_at > chrono::Utc::now().timestamp_millis());
        assert_eq!(tokens.resolve(&issued.token).await.unwrap(), Some(alice));
    }

    #[tokio::test]
    async fn test_unknown_token() {
        let (tokens, _) = setup(chrono::Duration::minutes(30)).await;
        assert_eq!(tokens.resolve("not-a-token").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_token_does_not_resolve() {
        let (tokens, alice) = setup(chrono::Duration::milliseconds(-1)).await;
        let issued = tokens.issue_token(alice).await.unwrap();
        assert_eq!(tokens.resolve(&issued.token).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_tokens_are_unique() {
        let (tokens, alice) = setup(chrono::Duration::minutes(30)).await;
        let a = tokens.issue_token(alice).await.unwrap();
        let b = tokens.issue_token(alice).await.unwrap();
        assert_ne!(a.token, b.token);
        assert_eq!(tokens.resolve(&a.token).await.unwrap(), Some(alice));
    }
}
