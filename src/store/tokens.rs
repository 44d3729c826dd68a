use super::{now_ts, Store};
use crate::integrations::oauth1::Credentials;
use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension};

/// Which leg of an OAuth flow a stored token belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Request,
    Access,
}

impl TokenKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Access => "access",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredToken {
    pub client_id: i64,
    pub credentials: Credentials,
    /// Provider-specific extra, e.g. the Nokia user id.
    pub extra: Option<String>,
}

fn row_to_token(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredToken> {
    Ok(StoredToken {
        client_id: row.get(0)?,
        credentials: Credentials::new(row.get::<_, String>(1)?, row.get::<_, String>(2)?),
        extra: row.get(3)?,
    })
}

impl Store {
    pub fn upsert_token(
        &self,
        client_id: i64,
        provider: &str,
        kind: TokenKind,
        credentials: &Credentials,
        extra: Option<&str>,
    ) -> Result<()> {
        self.lock_conn()
            .execute(
                "INSERT INTO oauth_tokens (client_id, provider, kind, token, secret, extra, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(client_id, provider, kind) DO UPDATE SET
                    token = excluded.token,
                    secret = excluded.secret,
                    extra = COALESCE(excluded.extra, extra),
                    updated_at = excluded.updated_at",
                params![
                    client_id,
                    provider,
                    kind.as_str(),
                    credentials.key,
                    credentials.secret,
                    extra,
                    now_ts()
                ],
            )
            .with_context(|| format!("Failed to store {provider} {} token", kind.as_str()))?;
        Ok(())
    }

    pub fn token(&self, client_id: i64, provider: &str, kind: TokenKind) -> Result<Option<StoredToken>> {
        let conn = self.lock_conn();
        conn.query_row(
            "SELECT client_id, token, secret, extra FROM oauth_tokens
             WHERE client_id = ?1 AND provider = ?2 AND kind = ?3",
            params![client_id, provider, kind.as_str()],
            row_to_token,
        )
        .optional()
        .context("Failed to read token")
    }

    /// Find a stored token by its public key (OAuth1 callbacks only carry that).
    pub fn token_by_key(&self, provider: &str, kind: TokenKind, key: &str) -> Result<Option<StoredToken>> {
        let conn = self.lock_conn();
        conn.query_row(
            "SELECT client_id, token, secret, extra FROM oauth_tokens
             WHERE provider = ?1 AND kind = ?2 AND token = ?3
             ORDER BY updated_at DESC LIMIT 1",
            params![provider, kind.as_str(), key],
            row_to_token,
        )
        .optional()
        .context("Failed to look up token")
    }

    /// Find an access token by its provider extra (Nokia notifications carry
    /// the user id, not our client id).
    pub fn token_by_extra(&self, provider: &str, extra: &str) -> Result<Option<StoredToken>> {
        let conn = self.lock_conn();
        conn.query_row(
            "SELECT client_id, token, secret, extra FROM oauth_tokens
             WHERE provider = ?1 AND kind = 'access' AND extra = ?2
             ORDER BY updated_at DESC LIMIT 1",
            params![provider, extra],
            row_to_token,
        )
        .optional()
        .context("Failed to look up token by extra")
    }

    pub fn delete_token(&self, client_id: i64, provider: &str, kind: TokenKind) -> Result<bool> {
        let n = self
            .lock_conn()
            .execute(
                "DELETE FROM oauth_tokens WHERE client_id = ?1 AND provider = ?2 AND kind = ?3",
                params![client_id, provider, kind.as_str()],
            )
            .context("Failed to delete token")?;
        Ok(n > 0)
    }
}
