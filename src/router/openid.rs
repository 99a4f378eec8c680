//! OpenID Connect login round-trip.

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::State;
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::{MAX_DOMAIN_LENGTH, UserResponse, Valid};
use crate::AppState;
use crate::error::Result;
use crate::user::RegInfo;

#[derive(Debug, Deserialize, Validate)]
pub struct Login {
    #[validate(length(min = 1, max = MAX_DOMAIN_LENGTH))]
    pub domain: String,
    pub provider: String,
    #[validate(url(message = "Redirect URI must be an absolute URL."))]
    pub redirect_uri: String,
    /// Extra query parameters of the authorization URL.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub reginfo: RegInfo,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct LoginUrl {
    pub domain: String,
    pub url: String,
}

/// Handler returning where to send the user agent.
pub async fn login(
    State(state): State<AppState>,
    Valid(body): Valid<Login>,
) -> Result<Json<LoginUrl>> {
    let url = state.openid.login_url(
        &body.provider,
        &body.redirect_uri,
        &body.params,
        body.reginfo,
    )?;

    Ok(Json(LoginUrl {
        domain: body.domain,
        url: url.into(),
    }))
}

#[derive(Debug, Deserialize, Validate)]
pub struct Authorize {
    #[validate(length(min = 1, max = MAX_DOMAIN_LENGTH))]
    pub domain: String,
    pub provider: String,
    pub state: String,
    pub code: String,
}

/// Handler called once the provider redirected back.
pub async fn authorize(
    State(state): State<AppState>,
    Valid(body): Valid<Authorize>,
) -> Result<Json<UserResponse>> {
    let login = state
        .openid
        .complete_login(&body.provider, &body.state, &body.code)
        .await?;

    if login.registered {
        state
            .users
            .try_reg_info(&body.domain, &login.user, Some(&body.provider), &login.data)
            .await;
    }

    Ok(Json(UserResponse::new(body.domain, login.user)))
}
