//! HTTP API.
pub mod identity;
pub mod openid;
pub mod status;
pub mod tokens;

use axum::Json;
use axum::extract::{FromRequest, Request};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::error::ServerError;
use crate::user::User;

/// Longest accepted domain name.
const MAX_DOMAIN_LENGTH: u64 = 255;
/// Longest accepted email address.
const MAX_EMAIL_LENGTH: u64 = 320;

/// JSON body checked with [`Validate`] before reaching the handler.
#[derive(Debug, Clone, Copy, Default)]
pub struct Valid<T>(pub T);

impl<S, T> FromRequest<S> for Valid<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
{
    type Rejection = ServerError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        value.validate()?;
        Ok(Valid(value))
    }
}

/// User returned to the calling domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserResponse {
    pub domain: String,
    #[serde(flatten)]
    pub user: User,
}

impl UserResponse {
    pub fn new(domain: String, user: User) -> Self {
        Self { domain, user }
    }
}

/// Parse the user identifier of a route.
fn parse_uid(uid: &str) -> Result<Uuid, ServerError> {
    Uuid::parse_str(uid)
        .map_err(|_| ServerError::InvalidArgument(format!("malformed user identifier {uid:?}")))
}
