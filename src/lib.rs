//! Warden issues and checks user identities for many client domains.

#![forbid(unsafe_code)]
pub mod crypto;
mod database;
pub mod error;
pub mod mail;
pub mod openid;
mod router;
pub mod telemetry;
pub mod token;
pub mod user;

pub mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::http::{Method, StatusCode, header};
use axum::routing::{get, post, put};
use sqlx::{Pool, Postgres};
use tower::ServiceBuilder;
use tower_http::LatencyUnit;
use tower_http::cors::{Any, CorsLayer};
use tower_http::sensitive_headers::SetSensitiveHeadersLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{
    DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer,
};

use crate::crypto::{CryptoError, PasswordManager};
use crate::openid::{IdentityProvider, OidcProvider, OpenIdFlow, StateCache};
use crate::token::TokenLedger;
use crate::user::UserRepository;

/// Environment variable overriding the configuration file location.
const CONFIG_PATH_ENV: &str = "CONFIG_PATH";

/// MUST NEVER be used in production.
#[cfg(test)]
pub async fn make_request(
    app: Router,
    method: Method,
    path: &str,
    body: String,
) -> axum::http::Response<axum::body::Body> {
    use axum::extract::Request;
    use tower::util::ServiceExt;

    app.oneshot(
        Request::builder()
            .method(method)
            .uri(path)
            .header(header::CONTENT_TYPE, "application/json")
            .body(axum::body::Body::from(body))
            .unwrap(),
    )
    .await
    .unwrap()
}

/// State sharing between routes.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::Configuration>,
    pub users: UserRepository,
    pub tokens: TokenLedger,
    pub openid: Arc<OpenIdFlow>,
}

impl AppState {
    /// Wire the services on top of `pool`.
    pub fn new(
        config: Arc<config::Configuration>,
        pool: Pool<Postgres>,
        states: Arc<StateCache>,
        providers: Vec<Arc<dyn IdentityProvider>>,
    ) -> Result<Self, CryptoError> {
        let pwd = Arc::new(PasswordManager::new(config.argon2.clone())?);
        let users = UserRepository::new(pool.clone(), pwd);
        let tokens = TokenLedger::new(pool, users.clone());
        let openid = providers
            .into_iter()
            .fold(OpenIdFlow::new(users.clone(), states), OpenIdFlow::with_provider);

        Ok(Self {
            config,
            users,
            tokens,
            openid: Arc::new(openid),
        })
    }
}

/// Create router.
pub fn app(state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        // Add high level tracing/logging to all requests.
        .layer(
            TraceLayer::new_for_http()
                .on_body_chunk(|chunk: &Bytes, latency: Duration, _span: &tracing::Span| {
                    tracing::trace!(size_bytes = chunk.len(), latency = ?latency, "sending body chunk")
                })
                .make_span_with(DefaultMakeSpan::new().include_headers(true).level(tracing::Level::INFO))
                .on_request(DefaultOnRequest::new())
                .on_response(DefaultOnResponse::new().include_headers(true).latency_unit(LatencyUnit::Micros)),
        )
        // Set a timeout.
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, Duration::from_secs(10)))
        // Remove senstive headers from trace.
        .layer(SetSensitiveHeadersLayer::new([header::AUTHORIZATION, header::COOKIE]))
        // Add CORS preflight support.
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
                .allow_headers(Any),
        );

    let users = Router::new()
        .route("/get", post(router::identity::get))
        .route("/list", post(router::identity::list))
        .route("/{uid}", put(router::identity::update))
        .route("/{uid}/password", post(router::identity::set_password))
        .route("/{uid}/block", post(router::identity::block));

    let openid = Router::new()
        .route("/login", post(router::openid::login))
        .route("/authorize", post(router::openid::authorize));

    let tokens = Router::new()
        .route("/", post(router::tokens::generate))
        .route("/verify", post(router::tokens::verify));

    Router::new()
        // `GET /status.json` goes to `status`.
        .route("/status.json", get(router::status::status))
        .route("/register", post(router::identity::register))
        .route("/authorize", post(router::identity::authorize))
        .nest("/users", users)
        .nest("/openid", openid)
        .nest("/tokens", tokens)
        .with_state(state)
        .layer(middleware)
}

/// Initialize the application state.
pub async fn initialize_state() -> Result<AppState, Box<dyn std::error::Error>> {
    // `CONFIG_PATH` wins over `config.yaml` of the working directory.
    let path = std::env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_default();
    let config = config::Configuration::default().path(path).read()?;

    let Some(postgres) = &config.postgres else {
        return Err("missing `postgres` entry on configuration file".into());
    };
    let db = database::Database::from_config(postgres).await?;

    let openid = config.openid.clone().unwrap_or_default();
    let states = Arc::new(StateCache::new(openid.state_ttl()));
    let mut providers: Vec<Arc<dyn IdentityProvider>> = Vec::with_capacity(openid.providers.len());
    for provider in &openid.providers {
        providers.push(Arc::new(OidcProvider::discover(provider).await?));
    }

    Ok(AppState::new(config, db.postgres, states, providers)?)
}
