//! One-time tokens for email verification and password reset.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::{MAX_DOMAIN_LENGTH, MAX_EMAIL_LENGTH, UserResponse, Valid};
use crate::AppState;
use crate::error::Result;
use crate::token::TokenPurpose;

#[derive(Debug, Deserialize, Validate)]
pub struct Generate {
    #[validate(length(min = 1, max = MAX_DOMAIN_LENGTH))]
    pub domain: String,
    #[validate(length(max = MAX_EMAIL_LENGTH))]
    pub email: String,
    pub r#type: TokenPurpose,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct Generated {
    pub domain: String,
    pub token: String,
    pub r#type: TokenPurpose,
}

/// Handler to issue a token. Mail delivery happens later, in background.
pub async fn generate(
    State(state): State<AppState>,
    Valid(body): Valid<Generate>,
) -> Result<(StatusCode, Json<Generated>)> {
    let token = state
        .tokens
        .generate(&body.domain, &body.email, body.r#type)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(Generated {
            domain: body.domain,
            token: token.to_string(),
            r#type: body.r#type,
        }),
    ))
}

#[derive(Debug, Deserialize, Validate)]
pub struct Verify {
    #[validate(length(min = 1, max = MAX_DOMAIN_LENGTH))]
    pub domain: String,
    pub token: String,
}

/// Handler to consume a token.
pub async fn verify(
    State(state): State<AppState>,
    Valid(body): Valid<Verify>,
) -> Result<Json<UserResponse>> {
    let user = state.tokens.verify(&body.token).await?;
    Ok(Json(UserResponse::new(body.domain, user)))
}
