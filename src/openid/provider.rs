use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use jsonwebtoken::jwk::{Jwk, JwkSet};
use jsonwebtoken::{DecodingKey, Validation, decode, decode_header};
use reqwest::Client;
use serde::Deserialize;
use url::Url;

use crate::config::Provider as ProviderConfig;
use crate::openid::{IdTokenClaims, IdentityProvider, OpenIdError, SCOPES};

const DISCOVERY_PATH: &str = ".well-known/openid-configuration";
static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

type Result<T> = std::result::Result<T, OpenIdError>;

/// Subset of the discovery document in use.
#[derive(Clone, Debug, Deserialize)]
pub struct ProviderMetadata {
    pub issuer: String,
    pub authorization_endpoint: Url,
    pub token_endpoint: Url,
    pub jwks_uri: Url,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    id_token: Option<String>,
}

/// Provider reached through OpenID Connect discovery.
pub struct OidcProvider {
    name: String,
    client_id: String,
    client_secret: String,
    scopes: String,
    metadata: ProviderMetadata,
    keys: RwLock<JwkSet>,
    http: Client,
}

impl OidcProvider {
    /// Fetch the discovery document and signing keys of a provider.
    pub async fn discover(config: &ProviderConfig) -> Result<Self> {
        if config.client_id.is_empty() || config.client_secret.is_empty() {
            return Err(OpenIdError::MissingProviderKeys);
        }

        let mut issuer = Url::parse(&config.issuer)?;
        if !issuer.path().ends_with('/') {
            let path = format!("{}/", issuer.path());
            issuer.set_path(&path);
        }

        let http = Client::builder().user_agent(APP_USER_AGENT).build()?;
        let metadata = http
            .get(issuer.join(DISCOVERY_PATH)?)
            .send()
            .await?
            .error_for_status()?
            .json::<ProviderMetadata>()
            .await?;
        let keys = fetch_keys(&http, &metadata.jwks_uri).await?;

        let scopes = SCOPES
            .iter()
            .copied()
            .chain(config.scopes.iter().map(String::as_str))
            .filter(|scope| !scope.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        tracing::info!(
            provider = %config.name,
            issuer = %metadata.issuer,
            keys = keys.keys.len(),
            "openid provider discovered"
        );

        Ok(Self {
            name: config.name.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            scopes,
            metadata,
            keys: RwLock::new(keys),
            http,
        })
    }

    fn key(&self, kid: Option<&str>) -> Option<Jwk> {
        let keys = self.keys.read().ok()?;
        match kid {
            Some(kid) => keys.find(kid).cloned(),
            None => keys.keys.first().cloned(),
        }
    }

    /// Reload signing keys, providers rotate them.
    async fn refresh_keys(&self) -> Result<()> {
        let keys = fetch_keys(&self.http, &self.metadata.jwks_uri).await?;
        if let Ok(mut current) = self.keys.write() {
            *current = keys;
        }
        tracing::debug!(provider = %self.name, "openid signing keys refreshed");
        Ok(())
    }

    /// Check signature, issuer, audience and expiry of an identification
    /// token. The nonce is left to the caller.
    async fn verify(&self, id_token: &str) -> Result<IdTokenClaims> {
        let header = decode_header(id_token)?;
        let jwk = match self.key(header.kid.as_deref()) {
            Some(jwk) => jwk,
            None => {
                self.refresh_keys().await?;
                self.key(header.kid.as_deref())
                    .ok_or(OpenIdError::UnknownKey(header.kid.clone()))?
            },
        };

        let key = DecodingKey::from_jwk(&jwk)?;
        let mut validation = Validation::new(header.alg);
        validation.set_audience(&[&self.client_id]);
        validation.set_issuer(&[&self.metadata.issuer]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);

        Ok(decode::<IdTokenClaims>(id_token, &key, &validation)?.claims)
    }
}

async fn fetch_keys(http: &Client, jwks_uri: &Url) -> Result<JwkSet> {
    Ok(http
        .get(jwks_uri.clone())
        .send()
        .await?
        .error_for_status()?
        .json::<JwkSet>()
        .await?)
}

#[async_trait]
impl IdentityProvider for OidcProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn authorization_url(
        &self,
        redirect_uri: &str,
        state: &str,
        nonce: &str,
        params: &BTreeMap<String, String>,
    ) -> Url {
        let mut url = self.metadata.authorization_endpoint.clone();
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("scope", &self.scopes)
            .append_pair("state", state)
            .append_pair("nonce", nonce)
            .extend_pairs(params);
        url
    }

    async fn exchange(&self, code: &str, redirect_uri: &str) -> Result<IdTokenClaims> {
        let response = self
            .http
            .post(self.metadata.token_endpoint.clone())
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json::<TokenResponse>()
            .await?;

        let id_token = response.id_token.ok_or(OpenIdError::MissingIdToken)?;
        self.verify(&id_token).await
    }
}
