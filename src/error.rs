//! Error handler for warden.

use axum::extract::rejection::JsonRejection;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use sqlx::Error as SQLxError;
use thiserror::Error;
use validator::ValidationErrors;

use crate::crypto::CryptoError;
use crate::mail::MailError;
use crate::openid::OpenIdError;

pub type Result<T> = std::result::Result<T, ServerError>;

/// Enum representing server-side errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("user not found")]
    NotFound,

    /// Never leaves the process as is, blocked users look missing.
    #[error("user not found")]
    Blocked,

    #[error("user already registered")]
    AlreadyRegistered,

    #[error("invalid password")]
    InvalidPassword,

    #[error("invalid or already used token")]
    BadToken,

    #[error("invalid or expired state")]
    BadState,

    #[error("empty email")]
    EmptyEmail,

    #[error("{0}")]
    InvalidArgument(String),

    #[error("validation error occurred")]
    Validation(#[from] ValidationErrors),

    #[error(transparent)]
    Axum(#[from] JsonRejection),

    #[error("openid connect failure: {0}")]
    OpenId(OpenIdError),

    #[error("mail delivery failure: {0}")]
    Mail(#[from] MailError),

    #[error("SQL request failed: {0}")]
    Sql(#[from] SQLxError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("internal server error, {details}")]
    Internal {
        details: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl From<OpenIdError> for ServerError {
    fn from(err: OpenIdError) -> Self {
        match err {
            OpenIdError::UnknownProvider(name) => {
                ServerError::InvalidArgument(format!("unknown provider {name:?}"))
            },
            OpenIdError::BadState => ServerError::BadState,
            err => ServerError::OpenId(err),
        }
    }
}

impl ServerError {
    /// HTTP status matching the error kind.
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::NotFound | ServerError::Blocked => StatusCode::NOT_FOUND,
            ServerError::AlreadyRegistered => StatusCode::CONFLICT,
            ServerError::InvalidPassword
            | ServerError::BadToken
            | ServerError::BadState
            | ServerError::EmptyEmail
            | ServerError::InvalidArgument(_)
            | ServerError::Validation(_)
            | ServerError::Axum(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Map a unique constraint violation to [`ServerError::AlreadyRegistered`].
pub(crate) fn unique_violation(err: SQLxError) -> ServerError {
    match err.as_database_error() {
        Some(db) if db.is_unique_violation() => ServerError::AlreadyRegistered,
        _ => err.into(),
    }
}

/// Map a foreign key violation to [`ServerError::NotFound`].
pub(crate) fn foreign_key_violation(err: SQLxError) -> ServerError {
    match err.as_database_error() {
        Some(db) if db.is_foreign_key_violation() => ServerError::NotFound,
        _ => err.into(),
    }
}

/// Structure for detailed error responses.
#[derive(Debug, Serialize)]
pub struct ResponseError {
    r#type: Option<String>,
    title: String,
    status: u16,
    detail: String,
    instance: Option<String>,
    errors: Option<Vec<FieldError>>,
}

impl ResponseError {
    /// Update error status code.
    pub fn status(mut self, code: StatusCode) -> Self {
        self.status = code.as_u16();
        self
    }

    /// Update `title` field.
    pub fn title(mut self, title: &str) -> Self {
        self.title = title.into();
        self
    }

    /// Add detailed error.
    pub fn details(mut self, description: &str) -> Self {
        self.detail = description.into();
        self
    }

    /// Automatically add errors field.
    pub fn errors(mut self, errors: &ValidationErrors) -> Self {
        self.errors = Some(parse_validation_errors(errors));
        self
    }

    /// Transform [`ResponseError`] into axum [`Response`].
    pub fn into_response(self) -> std::result::Result<Response, axum::http::Error> {
        if let Ok(body) = serde_json::to_string(&self) {
            Response::builder()
                .status(self.status)
                .header(header::CONTENT_TYPE, "application/json")
                .body(body.into())
        } else {
            Ok(internal_server_error())
        }
    }
}

impl Default for ResponseError {
    fn default() -> Self {
        Self {
            r#type: None,
            title: "Internal server error.".to_owned(),
            status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            detail: String::default(),
            instance: None,
            errors: None,
        }
    }
}

impl From<&ServerError> for ResponseError {
    fn from(err: &ServerError) -> Self {
        let status = err.status();
        let response = ResponseError::default().status(status);

        match err {
            ServerError::Validation(errors) => response
                .title("There were validation errors with your request.")
                .details(&err.to_string())
                .errors(errors),
            ServerError::NotFound | ServerError::Blocked => response
                .title("User not found.")
                .details(&err.to_string()),
            ServerError::AlreadyRegistered => response
                .title("Email already registered.")
                .details(&err.to_string()),
            _ if status == StatusCode::BAD_REQUEST => response
                .title("Invalid request.")
                .details(&err.to_string()),
            ServerError::Internal { details, source } => {
                tracing::error!(err = ?source, %details, "server returned 500 status");
                response
            },
            _ => {
                tracing::error!(error = %err, "server returned 500 status");
                response
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct FieldError {
    field: String,
    message: String,
}

fn parse_validation_errors(errors: &ValidationErrors) -> Vec<FieldError> {
    errors
        .field_errors()
        .iter()
        .flat_map(|(field, issues)| {
            issues.iter().map(move |issue| FieldError {
                field: field.to_string(),
                message: issue.to_string(),
            })
        })
        .collect()
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        ResponseError::from(&self)
            .into_response()
            .unwrap_or_else(|_| internal_server_error())
    }
}

fn internal_server_error() -> Response {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(header::CONTENT_TYPE, "application/json")
        .body(
            serde_json::json!({
                "type": null,
                "title": "Internal server error.",
                "status": StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                "detail": null,
                "instance": null,
                "errors": null,
            })
            .to_string()
            .into(),
        )
        .unwrap_or_else(|_| Response::new("Internal server error".into()))
}
