//! OpenID Connect login and registration.
//!
//! A login goes through the identity provider and back: [`OpenIdFlow::login_url`]
//! records a pending attempt in the [`StateCache`], then
//! [`OpenIdFlow::complete_login`] exchanges the returned code, checks the
//! identification token and resolves or creates the local account.
mod provider;
pub mod state;

pub use provider::*;
pub use state::StateCache;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::crypto::random_token;
use crate::error::{Result, ServerError};
use crate::user::{RegInfo, User, UserRepository};

/// Scopes always requested.
pub const SCOPES: [&str; 3] = ["openid", "profile", "email"];
const NONCE_LENGTH: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum OpenIdError {
    #[error("missing provider client id or secret")]
    MissingProviderKeys,
    #[error("unsupported provider {0}")]
    UnknownProvider(String),
    #[error("state did not match or expired")]
    BadState,
    #[error("missing identification token")]
    MissingIdToken,
    #[error("invalid identification token nonce")]
    Nonce,
    #[error("no key matches identification token key id {0:?}")]
    UnknownKey(Option<String>),
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("identification token verification error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error("invalid provider endpoint: {0}")]
    Url(#[from] url::ParseError),
}

/// Profile claims, stored as properties of users registered through OpenID.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub given_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub middle_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub birthdate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zoneinfo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number_verified: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

impl Profile {
    /// JSON document of the profile, `None` when no claim is set.
    pub fn to_properties(&self) -> Option<serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) if map.is_empty() => None,
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!(error = %err, "openid profile not serializable");
                None
            },
        }
    }
}

/// Verified claims of an identification token.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct IdTokenClaims {
    pub sub: String,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub email_verified: bool,
    #[serde(flatten)]
    pub profile: Profile,
}

/// An OpenID Connect identity provider.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Name clients refer to the provider with.
    fn name(&self) -> &str;

    /// Authorization endpoint for a new login.
    fn authorization_url(
        &self,
        redirect_uri: &str,
        state: &str,
        nonce: &str,
        params: &BTreeMap<String, String>,
    ) -> Url;

    /// Trade an authorization code for the claims of a verified
    /// identification token.
    async fn exchange(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> std::result::Result<IdTokenClaims, OpenIdError>;
}

/// Result of a successful OpenID login.
#[derive(Clone, Debug)]
pub struct CompletedLogin {
    pub user: User,
    /// Data given when the login began.
    pub data: RegInfo,
    /// Whether the account was created or linked by this login.
    pub registered: bool,
}

/// OpenID Connect login orchestration.
pub struct OpenIdFlow {
    providers: HashMap<String, Arc<dyn IdentityProvider>>,
    states: Arc<StateCache>,
    nonce: String,
    users: UserRepository,
}

impl OpenIdFlow {
    /// Create a flow without any provider and with a fresh server nonce.
    pub fn new(users: UserRepository, states: Arc<StateCache>) -> Self {
        Self {
            providers: HashMap::new(),
            states,
            nonce: random_token(NONCE_LENGTH),
            users,
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn IdentityProvider>) -> Self {
        self.providers.insert(provider.name().to_owned(), provider);
        self
    }

    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    pub fn states(&self) -> &Arc<StateCache> {
        &self.states
    }

    /// Names of configured providers, sorted.
    pub fn providers(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn provider(&self, name: &str) -> std::result::Result<&Arc<dyn IdentityProvider>, OpenIdError> {
        self.providers
            .get(name)
            .ok_or_else(|| OpenIdError::UnknownProvider(name.to_owned()))
    }

    /// Begin a login through `provider`, `data` is handed back once done.
    pub fn login_url(
        &self,
        provider: &str,
        redirect_uri: &str,
        params: &BTreeMap<String, String>,
        data: RegInfo,
    ) -> Result<Url> {
        let provider = self.provider(provider)?;
        let state = self.states.begin(provider.name(), redirect_uri, data);

        Ok(provider.authorization_url(redirect_uri, &state, &self.nonce, params))
    }

    /// Finish a login started with [`OpenIdFlow::login_url`].
    pub async fn complete_login(
        &self,
        provider: &str,
        state: &str,
        code: &str,
    ) -> Result<CompletedLogin> {
        let identity = self.provider(provider)?;
        let (redirect_uri, data) = self.states.resolve(state, provider)?;

        let claims = identity.exchange(code, &redirect_uri).await?;
        if claims.nonce.as_deref() != Some(self.nonce.as_str()) {
            return Err(OpenIdError::Nonce.into());
        }

        match self.users.openid_authorize(provider, &claims.sub).await {
            Ok(user) => {
                tracing::debug!(uid = %user.uid, %provider, "openid login");
                Ok(CompletedLogin {
                    user,
                    data,
                    registered: false,
                })
            },
            Err(ServerError::NotFound) => {
                let user = self
                    .users
                    .openid_register(
                        provider,
                        &claims.sub,
                        &claims.email,
                        claims.email_verified,
                        claims.profile.to_properties(),
                    )
                    .await?;
                Ok(CompletedLogin {
                    user,
                    data,
                    registered: true,
                })
            },
            Err(err) => Err(err),
        }
    }
}
