//! Handle database requests.

use std::sync::Arc;

use sqlx::{PgExecutor, Pool, Postgres};
use uuid::Uuid;

use crate::crypto::PasswordManager;
use crate::error::{Result, ServerError, foreign_key_violation, unique_violation};
use crate::user::{Credentials, RegInfo, User, UserLookup};

/// Columns decoded into a [`User`].
macro_rules! user_columns {
    () => {
        "users.uid, users.email, users.properties, users.blocked, users.updated, users.logged, \
         EXISTS (SELECT 1 FROM emails WHERE emails.email = users.email) AS verified"
    };
}

const REGISTER: &str = concat!(
    "INSERT INTO users (email, password) VALUES ($1, $2) \
     ON CONFLICT (email) DO UPDATE SET password = EXCLUDED.password, updated = NOW() \
     WHERE users.password IS NULL \
     RETURNING ",
    user_columns!()
);
const AUTHORIZE: &str = concat!(
    "SELECT ",
    user_columns!(),
    ", users.password FROM users WHERE users.email = $1 AND users.password IS NOT NULL"
);
const SET_PASSWORD: &str =
    "UPDATE users SET password = $2, updated = NOW() WHERE uid = $1";
const UPDATE: &str = "UPDATE users SET email = $2, properties = $3, updated = NOW() \
     WHERE uid = $1 AND NOT blocked";
const BLOCK: &str = "UPDATE users SET blocked = $2, updated = NOW() WHERE uid = $1";
const GET: &str = concat!(
    "SELECT ",
    user_columns!(),
    " FROM users WHERE users.uid = $1 OR users.email = $2 \
     ORDER BY users.blocked, users.uid = $1 DESC LIMIT 1"
);
const GET_BY_EMAIL: &str =
    concat!("SELECT ", user_columns!(), " FROM users WHERE users.email = $1");
const OPENID_AUTHORIZE: &str = concat!(
    "SELECT ",
    user_columns!(),
    " FROM users JOIN openid ON openid.uid = users.uid \
     WHERE openid.provider = $1 AND openid.subject = $2"
);
const OPENID_UPSERT: &str = concat!(
    "INSERT INTO users (email, properties, logged) VALUES ($1, $2, NOW()) \
     ON CONFLICT (email) DO UPDATE SET properties = COALESCE(users.properties, EXCLUDED.properties), \
     updated = NOW(), logged = NOW() \
     RETURNING ",
    user_columns!()
);
const OPENID_LINK: &str = "INSERT INTO openid (provider, subject, uid) VALUES ($1, $2, $3) \
     ON CONFLICT (provider, subject) DO UPDATE SET uid = EXCLUDED.uid";
const EMAIL_VERIFIED: &str = "INSERT INTO emails (email) VALUES ($1) \
     ON CONFLICT (email) DO UPDATE SET updated = NOW()";
const LOGGED: &str = "UPDATE users SET logged = NOW() WHERE uid = $1";
const REG_INFO: &str = "INSERT INTO reginfo (domain, uid, email, provider, referer, utm) \
     VALUES ($1, $2, $3, $4, $5, $6)";

/// Reject missing users and hide blocked ones.
pub(crate) fn visible(user: Option<User>) -> Result<User> {
    match user {
        Some(user) if user.blocked => Err(ServerError::Blocked),
        Some(user) => Ok(user),
        None => Err(ServerError::NotFound),
    }
}

/// Add `email` to the verified set, or refresh it.
pub(crate) async fn mark_email_verified<'e>(
    executor: impl PgExecutor<'e>,
    email: &str,
) -> Result<()> {
    sqlx::query(EMAIL_VERIFIED)
        .bind(email)
        .execute(executor)
        .await?;
    Ok(())
}

/// Find a visible user owning `email`.
pub(crate) async fn find_by_email<'e>(
    executor: impl PgExecutor<'e>,
    email: &str,
) -> Result<User> {
    let user = sqlx::query_as::<_, User>(GET_BY_EMAIL)
        .bind(email)
        .fetch_optional(executor)
        .await?;
    visible(user)
}

/// An empty object, an empty string or `null` clears the stored document.
fn properties(value: Option<serde_json::Value>) -> Option<serde_json::Value> {
    value.filter(|value| match value {
        serde_json::Value::Null => false,
        serde_json::Value::String(text) => !text.is_empty(),
        serde_json::Value::Object(map) => !map.is_empty(),
        _ => true,
    })
}

#[derive(Clone)]
pub struct UserRepository {
    pool: Pool<Postgres>,
    pwd: Arc<PasswordManager>,
}

impl UserRepository {
    /// Create a new [`UserRepository`].
    pub fn new(pool: Pool<Postgres>, pwd: Arc<PasswordManager>) -> Self {
        Self { pool, pwd }
    }

    /// Create a password account, or give a password to an account which
    /// only logged in through OpenID so far.
    pub async fn register(&self, email: &str, password: &str) -> Result<User> {
        if email.is_empty() {
            return Err(ServerError::EmptyEmail);
        }
        let hash = self.pwd.hash_password(password)?;

        let mut tx = self.pool.begin().await?;
        let user = sqlx::query_as::<_, User>(REGISTER)
            .bind(email)
            .bind(hash)
            .fetch_optional(&mut *tx)
            .await?;

        match user {
            None => Err(ServerError::AlreadyRegistered),
            Some(user) if user.blocked => {
                tx.rollback().await?;
                Err(ServerError::Blocked)
            },
            Some(user) => {
                tx.commit().await?;
                metrics::counter!("warden_registrations_total", "method" => "password")
                    .increment(1);
                tracing::debug!(uid = %user.uid, "password registered");
                Ok(user)
            },
        }
    }

    /// Check `password` of the account owning `email`.
    ///
    /// Accounts without password are reported as missing.
    pub async fn authorize(&self, email: &str, password: &str) -> Result<User> {
        if email.is_empty() {
            return Err(ServerError::EmptyEmail);
        }

        let credentials = sqlx::query_as::<_, Credentials>(AUTHORIZE)
            .bind(email)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(ServerError::NotFound)?;
        if credentials.user.blocked {
            return Err(ServerError::Blocked);
        }

        let hash = credentials.password.unwrap_or_default();
        if !self.pwd.verify_password(password, &hash) {
            metrics::counter!("warden_logins_total", "result" => "invalid_password")
                .increment(1);
            return Err(ServerError::InvalidPassword);
        }

        metrics::counter!("warden_logins_total", "result" => "success").increment(1);
        self.touch_logged(credentials.user.uid).await;
        Ok(credentials.user)
    }

    /// Overwrite password of `uid`.
    pub async fn set_password(&self, uid: Uuid, password: &str) -> Result<()> {
        let hash = self.pwd.hash_password(password)?;
        let result = sqlx::query(SET_PASSWORD)
            .bind(uid)
            .bind(hash)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ServerError::NotFound);
        }
        Ok(())
    }

    /// Replace email and properties of `uid`.
    pub async fn update(
        &self,
        uid: Uuid,
        email: &str,
        properties: Option<serde_json::Value>,
    ) -> Result<()> {
        if email.is_empty() {
            return Err(ServerError::EmptyEmail);
        }

        let result = sqlx::query(UPDATE)
            .bind(uid)
            .bind(email)
            .bind(self::properties(properties))
            .execute(&self.pool)
            .await
            .map_err(unique_violation)?;

        if result.rows_affected() == 0 {
            return Err(ServerError::NotFound);
        }
        Ok(())
    }

    /// Block or unblock `uid`.
    pub async fn block(&self, uid: Uuid, blocked: bool) -> Result<()> {
        let result = sqlx::query(BLOCK)
            .bind(uid)
            .bind(blocked)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ServerError::NotFound);
        }
        tracing::info!(%uid, blocked, "user block status changed");
        Ok(())
    }

    /// Find a user by identifier or email. A visible match wins over a
    /// blocked one, then an identifier match wins.
    pub async fn get(&self, lookup: &UserLookup) -> Result<User> {
        let (uid, email) = lookup.keys();
        let user = sqlx::query_as::<_, User>(GET)
            .bind(uid)
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        visible(user)
    }

    /// Resolve the user linked to an OpenID subject.
    pub async fn openid_authorize(&self, provider: &str, subject: &str) -> Result<User> {
        let user = sqlx::query_as::<_, User>(OPENID_AUTHORIZE)
            .bind(provider)
            .bind(subject)
            .fetch_optional(&self.pool)
            .await?;
        let user = visible(user)?;

        self.touch_logged(user.uid).await;
        Ok(user)
    }

    /// Create or merge the account of an OpenID subject, then link it.
    ///
    /// An existing password is always kept and existing properties are never
    /// overwritten. The link follows the reported email: a subject already
    /// linked elsewhere is moved to the account owning that email.
    pub async fn openid_register(
        &self,
        provider: &str,
        subject: &str,
        email: &str,
        verified: bool,
        properties: Option<serde_json::Value>,
    ) -> Result<User> {
        if email.is_empty() {
            return Err(ServerError::EmptyEmail);
        }
        let properties = self::properties(properties);

        let mut tx = self.pool.begin().await?;
        if verified {
            mark_email_verified(&mut *tx, email).await?;
        }

        let user = sqlx::query_as::<_, User>(OPENID_UPSERT)
            .bind(email)
            .bind(&properties)
            .fetch_one(&mut *tx)
            .await?;
        sqlx::query(OPENID_LINK)
            .bind(provider)
            .bind(subject)
            .bind(user.uid)
            .execute(&mut *tx)
            .await?;

        if user.blocked {
            tx.rollback().await?;
            return Err(ServerError::Blocked);
        }
        tx.commit().await?;

        metrics::counter!("warden_registrations_total", "method" => "openid").increment(1);
        tracing::debug!(uid = %user.uid, %provider, "openid subject linked");
        Ok(user)
    }

    /// Add `email` to the verified set.
    pub async fn email_verified(&self, email: &str) -> Result<()> {
        if email.is_empty() {
            return Err(ServerError::EmptyEmail);
        }
        mark_email_verified(&self.pool, email).await
    }

    /// Stamp last login of `uid`.
    pub async fn logged(&self, uid: Uuid) -> Result<()> {
        let result = sqlx::query(LOGGED).bind(uid).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(ServerError::NotFound);
        }
        Ok(())
    }

    /// Stamp last login, failures are only logged.
    pub(crate) async fn touch_logged(&self, uid: Uuid) {
        if let Err(err) = self.logged(uid).await {
            tracing::warn!(%uid, error = %err, "failed to stamp last login");
        }
    }

    /// Append a registration to the audit log.
    pub async fn reg_info(
        &self,
        domain: &str,
        uid: Uuid,
        email: &str,
        provider: Option<&str>,
        info: &RegInfo,
    ) -> Result<()> {
        if email.is_empty() {
            return Err(ServerError::EmptyEmail);
        }
        let utm = if info.utm.is_empty() {
            None
        } else {
            Some(sqlx::types::Json(&info.utm))
        };

        sqlx::query(REG_INFO)
            .bind(domain)
            .bind(uid)
            .bind(email)
            .bind(provider)
            .bind(info.referer.as_deref())
            .bind(utm)
            .execute(&self.pool)
            .await
            .map_err(foreign_key_violation)?;
        Ok(())
    }

    /// Write to the audit log, failures are only logged.
    pub async fn try_reg_info(
        &self,
        domain: &str,
        user: &User,
        provider: Option<&str>,
        info: &RegInfo,
    ) {
        if let Err(err) = self.reg_info(domain, user.uid, &user.email, provider, info).await {
            tracing::warn!(uid = %user.uid, %domain, error = %err, "failed to log registration");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user::tests::repository;
    use serde_json::json;

    #[sqlx::test]
    async fn test_register_twice(pool: Pool<Postgres>) {
        let users = repository(pool);

        let user = users.register("jane@example.com", "first").await.unwrap();
        assert_eq!(user.email, "jane@example.com");
        assert!(!user.verified);

        let err = users.register("jane@example.com", "second").await.unwrap_err();
        assert!(matches!(err, ServerError::AlreadyRegistered));

        let authorized = users.authorize("jane@example.com", "first").await.unwrap();
        assert_eq!(authorized.uid, user.uid);
        assert!(authorized.logged.is_none());
        let err = users.authorize("jane@example.com", "second").await.unwrap_err();
        assert!(matches!(err, ServerError::InvalidPassword));

        let user = users.get(&UserLookup::Uid(user.uid)).await.unwrap();
        assert!(user.logged.is_some());
    }

    #[sqlx::test]
    async fn test_empty_email(pool: Pool<Postgres>) {
        let users = repository(pool);

        assert!(matches!(
            users.register("", "pwd").await,
            Err(ServerError::EmptyEmail)
        ));
        assert!(matches!(
            users.authorize("", "pwd").await,
            Err(ServerError::EmptyEmail)
        ));
        assert!(matches!(
            users.update(Uuid::new_v4(), "", None).await,
            Err(ServerError::EmptyEmail)
        ));
    }

    #[sqlx::test]
    async fn test_openid_account_gets_password(pool: Pool<Postgres>) {
        let users = repository(pool);

        let linked = users
            .openid_register("google", "sub-1", "ann@example.com", true, Some(json!({"name": "Ann"})))
            .await
            .unwrap();
        assert!(linked.verified);

        // No password yet, indistinguishable from a missing account.
        let err = users.authorize("ann@example.com", "pwd").await.unwrap_err();
        assert!(matches!(err, ServerError::NotFound));

        let user = users.register("ann@example.com", "pwd").await.unwrap();
        assert_eq!(user.uid, linked.uid);
        assert_eq!(user.properties, Some(json!({"name": "Ann"})));
        users.authorize("ann@example.com", "pwd").await.unwrap();
    }

    #[sqlx::test]
    async fn test_openid_register_merges(pool: Pool<Postgres>) {
        let users = repository(pool);

        let user = users.register("bob@example.com", "pwd").await.unwrap();
        let linked = users
            .openid_register("google", "sub-2", "bob@example.com", false, Some(json!({"name": "Bob"})))
            .await
            .unwrap();
        assert_eq!(linked.uid, user.uid);
        assert!(!linked.verified);
        assert_eq!(linked.properties, Some(json!({"name": "Bob"})));

        // Populated properties are never overwritten.
        let again = users
            .openid_register("google", "sub-2", "bob@example.com", true, Some(json!({"name": "Robert"})))
            .await
            .unwrap();
        assert_eq!(again.properties, Some(json!({"name": "Bob"})));
        assert!(again.verified);

        users.authorize("bob@example.com", "pwd").await.unwrap();
        let found = users.openid_authorize("google", "sub-2").await.unwrap();
        assert_eq!(found.uid, user.uid);
    }

    #[sqlx::test]
    async fn test_openid_register_other_email(pool: Pool<Postgres>) {
        let users = repository(pool.clone());

        let old = users
            .openid_register("google", "sub-3", "old@example.com", true, None)
            .await
            .unwrap();
        let new = users.register("new@example.com", "pwd").await.unwrap();
        assert_ne!(old.uid, new.uid);

        // The provider now reports another email, the link follows it.
        let moved = users
            .openid_register("google", "sub-3", "new@example.com", true, None)
            .await
            .unwrap();
        assert_eq!(moved.uid, new.uid);
        assert!(moved.verified);

        let found = users.openid_authorize("google", "sub-3").await.unwrap();
        assert_eq!(found.uid, new.uid);
        assert_eq!(found.email, "new@example.com");

        // The previous account stays, only unlinked.
        let user = users.get(&UserLookup::Uid(old.uid)).await.unwrap();
        assert_eq!(user.email, "old@example.com");

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 2);
        let links: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM openid")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(links, 1);
    }

    #[sqlx::test]
    async fn test_openid_authorize_unlinked(pool: Pool<Postgres>) {
        let users = repository(pool);
        let err = users.openid_authorize("google", "nobody").await.unwrap_err();
        assert!(matches!(err, ServerError::NotFound));
    }

    #[sqlx::test]
    async fn test_blocked_is_invisible(pool: Pool<Postgres>) {
        let users = repository(pool);
        let user = users.register("eve@example.com", "pwd").await.unwrap();
        users
            .openid_register("google", "sub-4", "eve@example.com", false, None)
            .await
            .unwrap();

        users.block(user.uid, true).await.unwrap();
        // Idempotent.
        users.block(user.uid, true).await.unwrap();

        assert!(matches!(
            users.get(&UserLookup::Uid(user.uid)).await,
            Err(ServerError::Blocked)
        ));
        assert!(matches!(
            users.get(&UserLookup::Email("eve@example.com".into())).await,
            Err(ServerError::Blocked)
        ));
        assert!(matches!(
            users.authorize("eve@example.com", "pwd").await,
            Err(ServerError::Blocked)
        ));
        assert!(matches!(
            users.update(user.uid, "eve@example.com", None).await,
            Err(ServerError::NotFound)
        ));
        assert!(matches!(
            users.openid_authorize("google", "sub-4").await,
            Err(ServerError::Blocked)
        ));
        assert!(matches!(
            users.openid_register("google", "sub-4", "eve@example.com", true, None).await,
            Err(ServerError::Blocked)
        ));

        users.block(user.uid, false).await.unwrap();
        let user = users.get(&UserLookup::Uid(user.uid)).await.unwrap();
        // Rolled back along with the blocked registration.
        assert!(!user.verified);
    }

    #[sqlx::test]
    async fn test_register_blocked_keeps_record(pool: Pool<Postgres>) {
        let users = repository(pool);
        let user = users
            .openid_register("google", "sub-5", "mal@example.com", false, None)
            .await
            .unwrap();
        users.block(user.uid, true).await.unwrap();

        let err = users.register("mal@example.com", "pwd").await.unwrap_err();
        assert!(matches!(err, ServerError::Blocked));

        users.block(user.uid, false).await.unwrap();
        let err = users.authorize("mal@example.com", "pwd").await.unwrap_err();
        assert!(matches!(err, ServerError::NotFound));
    }

    #[sqlx::test]
    async fn test_update(pool: Pool<Postgres>) {
        let users = repository(pool);
        let alice = users.register("alice@example.com", "pwd").await.unwrap();
        users.register("carol@example.com", "pwd").await.unwrap();

        users
            .update(alice.uid, "alice@example.org", Some(json!({"locale": "fr"})))
            .await
            .unwrap();
        let user = users.get(&UserLookup::Uid(alice.uid)).await.unwrap();
        assert_eq!(user.email, "alice@example.org");
        assert_eq!(user.properties, Some(json!({"locale": "fr"})));

        users
            .update(alice.uid, "alice@example.org", Some(json!({})))
            .await
            .unwrap();
        let user = users.get(&UserLookup::Uid(alice.uid)).await.unwrap();
        assert_eq!(user.properties, None);

        let err = users
            .update(alice.uid, "carol@example.com", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::AlreadyRegistered));

        let err = users
            .update(Uuid::new_v4(), "dave@example.com", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::NotFound));
    }

    #[sqlx::test]
    async fn test_set_password(pool: Pool<Postgres>) {
        let users = repository(pool);
        let user = users.register("frank@example.com", "old").await.unwrap();

        users.set_password(user.uid, "new").await.unwrap();
        users.authorize("frank@example.com", "new").await.unwrap();
        assert!(matches!(
            users.authorize("frank@example.com", "old").await,
            Err(ServerError::InvalidPassword)
        ));

        assert!(matches!(
            users.set_password(Uuid::new_v4(), "new").await,
            Err(ServerError::NotFound)
        ));
        assert!(matches!(
            users.block(Uuid::new_v4(), true).await,
            Err(ServerError::NotFound)
        ));
        assert!(matches!(
            users.logged(Uuid::new_v4()).await,
            Err(ServerError::NotFound)
        ));
    }

    #[sqlx::test]
    async fn test_get_lookup(pool: Pool<Postgres>) {
        let users = repository(pool);
        let grace = users.register("grace@example.com", "pwd").await.unwrap();
        let heidi = users.register("heidi@example.com", "pwd").await.unwrap();

        let user = users
            .get(&UserLookup::Email("heidi@example.com".into()))
            .await
            .unwrap();
        assert_eq!(user.uid, heidi.uid);

        let user = users
            .get(&UserLookup::Any {
                uid: grace.uid,
                email: "heidi@example.com".into(),
            })
            .await
            .unwrap();
        assert_eq!(user.uid, grace.uid);

        let user = users
            .get(&UserLookup::Any {
                uid: Uuid::new_v4(),
                email: "heidi@example.com".into(),
            })
            .await
            .unwrap();
        assert_eq!(user.uid, heidi.uid);

        assert!(matches!(
            users.get(&UserLookup::Uid(Uuid::new_v4())).await,
            Err(ServerError::NotFound)
        ));
    }

    #[sqlx::test]
    async fn test_get_lookup_skips_blocked(pool: Pool<Postgres>) {
        let users = repository(pool);
        let judy = users.register("judy@example.com", "pwd").await.unwrap();
        let kim = users.register("kim@example.com", "pwd").await.unwrap();
        users.block(judy.uid, true).await.unwrap();

        let user = users
            .get(&UserLookup::Any {
                uid: judy.uid,
                email: "kim@example.com".into(),
            })
            .await
            .unwrap();
        assert_eq!(user.uid, kim.uid);

        // Blocked when nothing else matches.
        assert!(matches!(
            users
                .get(&UserLookup::Any {
                    uid: judy.uid,
                    email: "nobody@example.com".into(),
                })
                .await,
            Err(ServerError::Blocked)
        ));
    }

    #[sqlx::test]
    async fn test_email_verified(pool: Pool<Postgres>) {
        let users = repository(pool);
        let user = users.register("ivan@example.com", "pwd").await.unwrap();
        assert!(!user.verified);

        users.email_verified("ivan@example.com").await.unwrap();
        users.email_verified("ivan@example.com").await.unwrap();
        let user = users.get(&UserLookup::Uid(user.uid)).await.unwrap();
        assert!(user.verified);
    }

    #[sqlx::test]
    async fn test_reg_info(pool: Pool<Postgres>) {
        let users = repository(pool.clone());
        let user = users.register("judy@example.com", "pwd").await.unwrap();
        let info = RegInfo {
            referer: Some("https://example.com/landing".into()),
            utm: [("source".to_owned(), "newsletter".to_owned())].into(),
        };

        users
            .reg_info("example.com", user.uid, &user.email, None, &info)
            .await
            .unwrap();
        let (referer, utm): (Option<String>, Option<serde_json::Value>) =
            sqlx::query_as("SELECT referer, utm FROM reginfo WHERE uid = $1")
                .bind(user.uid)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(referer.as_deref(), Some("https://example.com/landing"));
        assert_eq!(utm, Some(json!({"source": "newsletter"})));

        let err = users
            .reg_info("example.com", Uuid::new_v4(), "nobody@example.com", Some("google"), &info)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::NotFound));
    }
}
