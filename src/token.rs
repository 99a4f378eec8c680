//! One-time tokens proving ownership of a mailbox.
//!
//! A token is bound to `(domain, email, purpose)`, at most one is alive for
//! each triple and it can be consumed exactly once.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Postgres};

use crate::crypto::random_bytes;
use crate::error::{Result, ServerError};
use crate::user::{User, UserRepository, find_by_email, mark_email_verified};

/// Raw token length, in bytes.
pub const TOKEN_SIZE: usize = 16;

const GENERATE: &str = "INSERT INTO tokens (id, domain, email, type) VALUES ($1, $2, $3, $4) \
     ON CONFLICT (domain, email, type) DO UPDATE SET id = EXCLUDED.id, sent = FALSE, created = NOW()";
const CONSUME: &str = "DELETE FROM tokens WHERE id = $1 RETURNING email, type, created";
const MARK_SENT: &str = "UPDATE tokens SET sent = TRUE WHERE id = $1";
const UNDELIVERED: &str = "SELECT id, domain, email, type AS purpose, created FROM tokens \
     WHERE NOT sent ORDER BY created";

/// What a token is meant for. It does not change how it is consumed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TokenPurpose {
    /// Confirm an email address.
    Email,
    /// Reset a forgotten password.
    Password,
}

impl TokenPurpose {
    fn code(self) -> i16 {
        match self {
            TokenPurpose::Email => 0,
            TokenPurpose::Password => 1,
        }
    }

    fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(TokenPurpose::Email),
            1 => Some(TokenPurpose::Password),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TokenPurpose::Email => "EMAIL",
            TokenPurpose::Password => "PASSWORD",
        }
    }
}

impl fmt::Display for TokenPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token identifier, URL-safe base64 without padding on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TokenId([u8; TOKEN_SIZE]);

impl TokenId {
    /// Draw a new identifier from the operating system RNG.
    pub fn generate() -> Self {
        Self(random_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Self)
    }
}

impl FromStr for TokenId {
    type Err = ServerError;

    /// Any malformed input is a [`ServerError::BadToken`], like an unknown one.
    fn from_str(token: &str) -> Result<Self> {
        URL_SAFE_NO_PAD
            .decode(token)
            .ok()
            .and_then(|bytes| Self::from_slice(&bytes))
            .ok_or(ServerError::BadToken)
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&URL_SAFE_NO_PAD.encode(self.0))
    }
}

/// A token still waiting to be mailed.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingToken {
    pub token: TokenId,
    pub domain: String,
    pub email: String,
    pub purpose: TokenPurpose,
    pub created: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct TokenRow {
    id: Vec<u8>,
    domain: String,
    email: String,
    purpose: i16,
    created: DateTime<Utc>,
}

impl TryFrom<TokenRow> for PendingToken {
    type Error = ServerError;

    fn try_from(row: TokenRow) -> Result<Self> {
        let token = TokenId::from_slice(&row.id).ok_or_else(|| ServerError::Internal {
            details: format!("token id of {} bytes", row.id.len()),
            source: None,
        })?;
        let purpose = TokenPurpose::from_code(row.purpose).ok_or_else(|| {
            ServerError::Internal {
                details: format!("unknown token type {}", row.purpose),
                source: None,
            }
        })?;

        Ok(Self {
            token,
            domain: row.domain,
            email: row.email,
            purpose,
            created: row.created,
        })
    }
}

/// Issue and consume one-time tokens.
#[derive(Clone)]
pub struct TokenLedger {
    pool: Pool<Postgres>,
    users: UserRepository,
}

impl TokenLedger {
    /// Create a new [`TokenLedger`].
    pub fn new(pool: Pool<Postgres>, users: UserRepository) -> Self {
        Self { pool, users }
    }

    /// Issue a token, replacing any previous one for the same triple.
    pub async fn generate(
        &self,
        domain: &str,
        email: &str,
        purpose: TokenPurpose,
    ) -> Result<TokenId> {
        if email.is_empty() {
            return Err(ServerError::EmptyEmail);
        }

        let id = TokenId::generate();
        sqlx::query(GENERATE)
            .bind(id.as_bytes())
            .bind(domain)
            .bind(email)
            .bind(purpose.code())
            .execute(&self.pool)
            .await?;

        metrics::counter!("warden_tokens_generated_total", "type" => purpose.as_str())
            .increment(1);
        tracing::debug!(%domain, %purpose, "token generated");
        Ok(id)
    }

    /// Consume `token` and return the owner of its email, now verified.
    pub async fn verify(&self, token: &str) -> Result<User> {
        let id: TokenId = token.parse()?;

        let (email, purpose, created): (String, i16, DateTime<Utc>) =
            sqlx::query_as(CONSUME)
                .bind(id.as_bytes())
                .fetch_optional(&self.pool)
                .await?
                .ok_or(ServerError::BadToken)?;

        let mut tx = self.pool.begin().await?;
        mark_email_verified(&mut *tx, &email).await?;
        let user = match find_by_email(&mut *tx, &email).await {
            Ok(user) => user,
            Err(err) => {
                tx.rollback().await?;
                return Err(err);
            },
        };
        tx.commit().await?;

        metrics::counter!("warden_tokens_verified_total").increment(1);
        tracing::debug!(
            uid = %user.uid,
            purpose = ?TokenPurpose::from_code(purpose),
            age_secs = (Utc::now() - created).num_seconds(),
            "token consumed"
        );

        self.users.touch_logged(user.uid).await;
        Ok(user)
    }

    /// Flag `token` as mailed. Tokens consumed or replaced meanwhile are
    /// ignored.
    pub async fn mark_sent(&self, token: &TokenId) -> Result<()> {
        sqlx::query(MARK_SENT)
            .bind(token.as_bytes())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Same as [`TokenLedger::mark_sent`] for a wire encoded token.
    pub async fn mark_sent_encoded(&self, token: &str) -> Result<()> {
        let id: TokenId = token.parse()?;
        self.mark_sent(&id).await
    }

    /// Tokens not mailed yet, oldest first.
    pub async fn list_undelivered(&self) -> Result<Vec<PendingToken>> {
        sqlx::query_as::<_, TokenRow>(UNDELIVERED)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(PendingToken::try_from)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user::UserLookup;
    use crate::user::tests::repository;

    const DOMAIN: &str = "example.com";

    fn ledger(pool: Pool<Postgres>) -> TokenLedger {
        TokenLedger::new(pool.clone(), repository(pool))
    }

    #[test]
    fn test_token_id_encoding() {
        let id = TokenId::generate();
        let encoded = id.to_string();

        assert_eq!(encoded.len(), 22);
        assert_eq!(encoded.parse::<TokenId>().unwrap(), id);
        assert!(matches!("".parse::<TokenId>(), Err(ServerError::BadToken)));
        assert!(matches!("not base64!".parse::<TokenId>(), Err(ServerError::BadToken)));
        // Valid base64, wrong length.
        assert!(matches!("AAAA".parse::<TokenId>(), Err(ServerError::BadToken)));
    }

    #[test]
    fn test_purpose_wire_names() {
        assert_eq!(serde_json::to_string(&TokenPurpose::Email).unwrap(), "\"EMAIL\"");
        let purpose: TokenPurpose = serde_json::from_str("\"PASSWORD\"").unwrap();
        assert_eq!(purpose, TokenPurpose::Password);
        assert_eq!(TokenPurpose::from_code(TokenPurpose::Password.code()), Some(purpose));
        assert_eq!(TokenPurpose::from_code(7), None);
    }

    #[sqlx::test]
    async fn test_generate_replaces_previous(pool: Pool<Postgres>) {
        let tokens = ledger(pool.clone());
        let users = repository(pool);
        let user = users.register("kim@example.com", "pwd").await.unwrap();

        let first = tokens
            .generate(DOMAIN, "kim@example.com", TokenPurpose::Email)
            .await
            .unwrap();
        let second = tokens
            .generate(DOMAIN, "kim@example.com", TokenPurpose::Email)
            .await
            .unwrap();
        assert_ne!(first, second);

        let err = tokens.verify(&first.to_string()).await.unwrap_err();
        assert!(matches!(err, ServerError::BadToken));

        let verified = tokens.verify(&second.to_string()).await.unwrap();
        assert_eq!(verified.uid, user.uid);
        assert!(verified.verified);

        let err = tokens.verify(&second.to_string()).await.unwrap_err();
        assert!(matches!(err, ServerError::BadToken));

        let user = users.get(&UserLookup::Uid(user.uid)).await.unwrap();
        assert!(user.logged.is_some());
    }

    #[sqlx::test]
    async fn test_purposes_are_independent(pool: Pool<Postgres>) {
        let tokens = ledger(pool.clone());
        repository(pool).register("lea@example.com", "pwd").await.unwrap();

        let email = tokens
            .generate(DOMAIN, "lea@example.com", TokenPurpose::Email)
            .await
            .unwrap();
        let reset = tokens
            .generate(DOMAIN, "lea@example.com", TokenPurpose::Password)
            .await
            .unwrap();
        let other = tokens
            .generate("example.org", "lea@example.com", TokenPurpose::Email)
            .await
            .unwrap();

        tokens.verify(&email.to_string()).await.unwrap();
        tokens.verify(&reset.to_string()).await.unwrap();
        tokens.verify(&other.to_string()).await.unwrap();
    }

    #[sqlx::test]
    async fn test_concurrent_verify(pool: Pool<Postgres>) {
        let tokens = ledger(pool.clone());
        repository(pool).register("max@example.com", "pwd").await.unwrap();
        let token = tokens
            .generate(DOMAIN, "max@example.com", TokenPurpose::Password)
            .await
            .unwrap()
            .to_string();

        let (a, b) = tokio::join!(tokens.verify(&token), tokens.verify(&token));
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        assert!(matches!(a.or(b), Ok(_)));
    }

    #[sqlx::test]
    async fn test_concurrent_generate(pool: Pool<Postgres>) {
        let tokens = ledger(pool.clone());
        repository(pool.clone()).register("noa@example.com", "pwd").await.unwrap();

        let (a, b) = tokio::join!(
            tokens.generate(DOMAIN, "noa@example.com", TokenPurpose::Email),
            tokens.generate(DOMAIN, "noa@example.com", TokenPurpose::Email)
        );
        let (a, b) = (a.unwrap().to_string(), b.unwrap().to_string());
        assert_ne!(a, b);

        let stored: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tokens")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(stored, 1);

        let (a, b) = (tokens.verify(&a).await, tokens.verify(&b).await);
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        assert!(matches!(a.and(b), Err(ServerError::BadToken)));
    }

    #[sqlx::test]
    async fn test_verify_without_account(pool: Pool<Postgres>) {
        let tokens = ledger(pool.clone());
        let token = tokens
            .generate(DOMAIN, "ghost@example.com", TokenPurpose::Email)
            .await
            .unwrap();

        let err = tokens.verify(&token.to_string()).await.unwrap_err();
        assert!(matches!(err, ServerError::NotFound));

        let verified: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM emails WHERE email = $1)")
                .bind("ghost@example.com")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert!(!verified);
    }

    #[sqlx::test]
    async fn test_verify_blocked(pool: Pool<Postgres>) {
        let tokens = ledger(pool.clone());
        let users = repository(pool);
        let user = users.register("ned@example.com", "pwd").await.unwrap();
        users.block(user.uid, true).await.unwrap();

        let token = tokens
            .generate(DOMAIN, "ned@example.com", TokenPurpose::Email)
            .await
            .unwrap();
        let err = tokens.verify(&token.to_string()).await.unwrap_err();
        assert!(matches!(err, ServerError::Blocked));
    }

    #[sqlx::test]
    async fn test_generate_empty_email(pool: Pool<Postgres>) {
        let tokens = ledger(pool);
        let err = tokens
            .generate(DOMAIN, "", TokenPurpose::Email)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::EmptyEmail));
    }

    #[sqlx::test]
    async fn test_undelivered(pool: Pool<Postgres>) {
        let tokens = ledger(pool);
        assert!(tokens.list_undelivered().await.unwrap().is_empty());

        let first = tokens
            .generate(DOMAIN, "olga@example.com", TokenPurpose::Email)
            .await
            .unwrap();
        let second = tokens
            .generate(DOMAIN, "pam@example.com", TokenPurpose::Password)
            .await
            .unwrap();

        let pending = tokens.list_undelivered().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].token, first);
        assert_eq!(pending[0].purpose, TokenPurpose::Email);
        assert_eq!(pending[1].token, second);
        assert_eq!(pending[1].email, "pam@example.com");

        tokens.mark_sent(&first).await.unwrap();
        tokens.mark_sent_encoded(&second.to_string()).await.unwrap();
        assert!(tokens.list_undelivered().await.unwrap().is_empty());

        // Consumed meanwhile, still fine.
        tokens.mark_sent(&TokenId::generate()).await.unwrap();
        assert!(matches!(
            tokens.mark_sent_encoded("%%%").await,
            Err(ServerError::BadToken)
        ));

        // A replacement is pending again.
        tokens
            .generate(DOMAIN, "olga@example.com", TokenPurpose::Email)
            .await
            .unwrap();
        assert_eq!(tokens.list_undelivered().await.unwrap().len(), 1);
    }
}
