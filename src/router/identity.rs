//! Password accounts and user administration.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use super::{MAX_DOMAIN_LENGTH, MAX_EMAIL_LENGTH, UserResponse, Valid, parse_uid};
use crate::AppState;
use crate::error::{Result, ServerError};
use crate::user::{RegInfo, UserLookup};

#[derive(Debug, Deserialize, Validate)]
pub struct Register {
    #[validate(length(min = 1, max = MAX_DOMAIN_LENGTH))]
    pub domain: String,
    #[validate(length(max = MAX_EMAIL_LENGTH))]
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub reginfo: RegInfo,
}

/// Handler to register a password account.
pub async fn register(
    State(state): State<AppState>,
    Valid(body): Valid<Register>,
) -> Result<(StatusCode, Json<UserResponse>)> {
    let user = state.users.register(&body.email, &body.password).await?;
    state
        .users
        .try_reg_info(&body.domain, &user, None, &body.reginfo)
        .await;

    Ok((StatusCode::CREATED, Json(UserResponse::new(body.domain, user))))
}

#[derive(Debug, Deserialize, Validate)]
pub struct Authorize {
    #[validate(length(min = 1, max = MAX_DOMAIN_LENGTH))]
    pub domain: String,
    #[validate(length(max = MAX_EMAIL_LENGTH))]
    pub email: String,
    pub password: String,
}

/// Handler to check a password.
pub async fn authorize(
    State(state): State<AppState>,
    Valid(body): Valid<Authorize>,
) -> Result<Json<UserResponse>> {
    let user = state.users.authorize(&body.email, &body.password).await?;
    Ok(Json(UserResponse::new(body.domain, user)))
}

#[derive(Debug, Deserialize, Validate)]
pub struct SetPassword {
    pub password: String,
}

pub async fn set_password(
    State(state): State<AppState>,
    Path(uid): Path<String>,
    Valid(body): Valid<SetPassword>,
) -> Result<StatusCode> {
    let uid = parse_uid(&uid)?;
    state.users.set_password(uid, &body.password).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize, Validate)]
pub struct Update {
    #[validate(length(max = MAX_EMAIL_LENGTH))]
    pub email: String,
    /// Replaces the stored document, `null` or `""` clears it.
    #[serde(default)]
    pub properties: Option<serde_json::Value>,
}

pub async fn update(
    State(state): State<AppState>,
    Path(uid): Path<String>,
    Valid(body): Valid<Update>,
) -> Result<StatusCode> {
    let uid = parse_uid(&uid)?;
    state.users.update(uid, &body.email, body.properties).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize, Validate)]
pub struct Block {
    pub blocked: bool,
}

pub async fn block(
    State(state): State<AppState>,
    Path(uid): Path<String>,
    Valid(body): Valid<Block>,
) -> Result<StatusCode> {
    let uid = parse_uid(&uid)?;
    state.users.block(uid, body.blocked).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Lookup of a single user, by identifier, email or both.
#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct Lookup {
    #[validate(length(min = 1, max = MAX_DOMAIN_LENGTH))]
    pub domain: String,
    #[serde(default)]
    pub uid: Option<Uuid>,
    #[serde(default)]
    #[validate(length(max = MAX_EMAIL_LENGTH))]
    pub email: Option<String>,
}

impl Lookup {
    async fn resolve(self, state: &AppState) -> Result<UserResponse> {
        let lookup = UserLookup::new(self.uid, self.email)
            .ok_or_else(|| ServerError::InvalidArgument("missing uid or email".into()))?;
        let user = state.users.get(&lookup).await?;
        Ok(UserResponse::new(self.domain, user))
    }
}

/// Handler to get a user.
pub async fn get(
    State(state): State<AppState>,
    Valid(body): Valid<Lookup>,
) -> Result<Json<UserResponse>> {
    Ok(Json(body.resolve(&state).await?))
}

/// Outcome of one lookup of a list.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ListItem {
    Found(UserResponse),
    Failed { error: ItemError },
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct ItemError {
    pub status: u16,
    pub detail: String,
}

impl From<ServerError> for ItemError {
    fn from(err: ServerError) -> Self {
        if err.status().is_server_error() {
            tracing::error!(error = %err, "user lookup failed");
        }
        Self {
            status: err.status().as_u16(),
            detail: err.to_string(),
        }
    }
}

/// Handler to get many users. Each lookup fails on its own.
pub async fn list(
    State(state): State<AppState>,
    Json(body): Json<Vec<Lookup>>,
) -> Json<Vec<ListItem>> {
    let mut items = Vec::with_capacity(body.len());
    for lookup in body {
        let result = match lookup.validate() {
            Ok(()) => lookup.resolve(&state).await,
            Err(err) => Err(err.into()),
        };
        items.push(match result {
            Ok(user) => ListItem::Found(user),
            Err(err) => ListItem::Failed { error: err.into() },
        });
    }

    Json(items)
}
