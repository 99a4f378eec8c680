//! Public instance status.

use axum::Json;
use axum::extract::State;
use serde::{Deserialize, Serialize};

use crate::AppState;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    name: String,
    version: String,
    /// OpenID providers users can log in with.
    providers: Vec<String>,
}

pub async fn status(State(state): State<AppState>) -> Json<Status> {
    Json(Status {
        name: state.config.name.clone(),
        version: env!("CARGO_PKG_VERSION").into(),
        providers: state
            .openid
            .providers()
            .into_iter()
            .map(str::to_owned)
            .collect(),
    })
}
