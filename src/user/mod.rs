//! Canonical user records and the rules merging password and OpenID accounts.
mod repository;

pub use repository::*;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// User as saved on database.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub uid: Uuid,
    pub email: String,
    /// Free-form JSON document, replaced as a whole on update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<serde_json::Value>,
    /// Whether `email` belongs to the verified set.
    pub verified: bool,
    #[serde(skip)]
    pub blocked: bool,
    pub updated: DateTime<Utc>,
    #[serde(default)]
    pub logged: Option<DateTime<Utc>>,
}

/// [`User`] alongside its password hash, only used to authorize.
#[derive(sqlx::FromRow)]
pub(crate) struct Credentials {
    #[sqlx(flatten)]
    pub user: User,
    pub password: Option<String>,
}

/// Selects a user by its identifier, its email, or whichever matches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UserLookup {
    Uid(Uuid),
    Email(String),
    Any { uid: Uuid, email: String },
}

impl UserLookup {
    /// Build a lookup out of optional keys, `None` when both are missing.
    pub fn new(uid: Option<Uuid>, email: Option<String>) -> Option<Self> {
        let email = email.filter(|email| !email.is_empty());
        match (uid, email) {
            (Some(uid), Some(email)) => Some(Self::Any { uid, email }),
            (Some(uid), None) => Some(Self::Uid(uid)),
            (None, Some(email)) => Some(Self::Email(email)),
            (None, None) => None,
        }
    }

    fn keys(&self) -> (Option<Uuid>, Option<&str>) {
        match self {
            Self::Uid(uid) => (Some(*uid), None),
            Self::Email(email) => (None, Some(email)),
            Self::Any { uid, email } => (Some(*uid), Some(email)),
        }
    }
}

/// Provenance of a registration, logged once for audit.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referer: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub utm: HashMap<String, String>,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;

    use sqlx::{Pool, Postgres};

    use crate::crypto::PasswordManager;

    pub(crate) fn repository(pool: Pool<Postgres>) -> UserRepository {
        let pwd = PasswordManager::new(None).unwrap();
        UserRepository::new(pool, Arc::new(pwd))
    }

    #[test]
    fn test_lookup() {
        let uid = Uuid::new_v4();
        assert_eq!(UserLookup::new(None, None), None);
        assert_eq!(UserLookup::new(None, Some(String::new())), None);
        assert_eq!(UserLookup::new(Some(uid), None), Some(UserLookup::Uid(uid)));
        assert_eq!(
            UserLookup::new(Some(uid), Some("a@b.c".into())).unwrap().keys(),
            (Some(uid), Some("a@b.c"))
        );
    }

    #[test]
    fn test_blocked_and_password_not_serialized() {
        let user = User {
            uid: Uuid::nil(),
            email: "a@b.c".into(),
            properties: None,
            verified: true,
            blocked: true,
            updated: Utc::now(),
            logged: None,
        };
        let json = serde_json::to_value(&user).unwrap();

        assert!(json.get("blocked").is_none());
        assert!(json.get("properties").is_none());
        assert!(json.get("password").is_none());
        assert_eq!(json["verified"], true);
    }
}
