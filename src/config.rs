//! Configuration manager for warden.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

const DEFAULT_CONFIG_PATH: &str = "config.yaml";
const VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_PORT: u16 = 8080;
/// Pending OpenID logins are forgotten after 30 minutes.
const DEFAULT_STATE_TTL: u64 = 30 * 60;
/// Undelivered tokens are mailed every 5 minutes.
const DEFAULT_MAIL_INTERVAL: u64 = 5 * 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    /// Instance name.
    pub name: String,
    /// Public URL of current instance.
    pub url: String,
    /// TCP port the HTTP server listens on.
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    version: String,
    #[serde(skip)]
    path: PathBuf,
    /// Related to PostgreSQL configuration.
    #[serde(skip_serializing)]
    pub postgres: Option<Postgres>,
    /// Related to Argon2 configuration.
    #[serde(skip_serializing)]
    pub argon2: Option<Argon2>,
    /// Related to OpenID Connect providers.
    #[serde(skip_serializing)]
    pub openid: Option<OpenId>,
    /// Related to token mail delivery.
    #[serde(skip_serializing)]
    pub mail: Option<Mail>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            name: env!("CARGO_CRATE_NAME").to_owned(),
            url: String::default(),
            port: DEFAULT_PORT,
            version: String::default(),
            path: PathBuf::default(),
            postgres: None,
            argon2: None,
            openid: None,
            mail: None,
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

/// PostgreSQL configuration.
#[derive(Debug, Default, PartialEq, Clone, Serialize, Deserialize)]
pub struct Postgres {
    /// Hostname:(?port) for PostgreSQL instance.
    pub address: String,
    /// Database name.
    pub database: Option<String>,
    /// Username credential to connect.
    pub username: Option<String>,
    /// Password credential to connect.
    pub password: Option<String>,
    /// Maximum pool connections.
    pub pool_size: Option<u32>,
}

/// Argon2 configuration.
///
/// Defaults to the cheapest parameters accepted by Argon2id. Callers are
/// trusted services, raise them when passwords come from the open internet.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Argon2 {
    /// Memory used while hashing, in KiB.
    pub memory_cost: u32,
    /// Iterations of hash.
    pub iterations: u32,
    /// Parallelism degree.
    pub parallelism: u32,
    /// Output hash length.
    pub hash_length: usize,
}

impl Default for Argon2 {
    fn default() -> Self {
        Self {
            memory_cost: 8,
            iterations: 1,
            parallelism: 1,
            hash_length: 32,
        }
    }
}

/// OpenID Connect configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenId {
    /// Seconds a login `state` stays valid.
    #[serde(default = "default_state_ttl")]
    pub state_ttl: u64,
    #[serde(default)]
    pub providers: Vec<Provider>,
}

impl Default for OpenId {
    fn default() -> Self {
        Self {
            state_ttl: DEFAULT_STATE_TTL,
            providers: Vec::new(),
        }
    }
}

impl OpenId {
    /// Zero falls back to the default.
    pub fn state_ttl(&self) -> Duration {
        match self.state_ttl {
            0 => Duration::from_secs(DEFAULT_STATE_TTL),
            secs => Duration::from_secs(secs),
        }
    }
}

fn default_state_ttl() -> u64 {
    DEFAULT_STATE_TTL
}

/// A single OpenID Connect identity provider.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    /// Name used by clients, e.g. `google`.
    pub name: String,
    /// Issuer URL, discovery document is fetched from it.
    pub issuer: String,
    pub client_id: String,
    pub client_secret: String,
    /// Extra scopes requested on top of `openid profile email`.
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Token mail delivery configuration.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mail {
    /// YAML file holding per-domain templates.
    pub templates: PathBuf,
    /// Seconds between two delivery batches.
    pub interval: Option<u64>,
    /// RabbitMQ transport. Messages are only logged when absent.
    pub rabbitmq: Option<RabbitMq>,
}

impl Mail {
    /// Missing or zero falls back to the default.
    pub fn interval(&self) -> Duration {
        match self.interval {
            None | Some(0) => Duration::from_secs(DEFAULT_MAIL_INTERVAL),
            Some(secs) => Duration::from_secs(secs),
        }
    }
}

/// RabbitMQ configuration.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct RabbitMq {
    /// Hostname:(?port) for RabbitMQ instance.
    pub address: String,
    /// RabbitMQ default vhost.
    pub vhost: Option<String>,
    /// RabbitMQ username to access queue.
    pub username: String,
    /// RabbitMQ password to access queue.
    pub password: String,
    /// Max channel connections.
    pub pool: Option<u16>,
    /// Queue name to send mailing events.
    pub queue: String,
}

impl Configuration {
    pub fn path(mut self, path: PathBuf) -> Self {
        self.path = path;
        self
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Normalizes a URL string by ensuring it starts with a valid scheme
    /// (`http` or `https`).
    fn normalize_url(&self, url: &str) -> Result<String, url::ParseError> {
        let url_with_scheme =
            if url.starts_with("http://") || url.starts_with("https://") {
                url.to_string()
            } else {
                format!("https://{url}")
            };

        let parsed_url = Url::parse(&url_with_scheme)?;
        Ok(parsed_url.to_string())
    }

    /// Reads the `config.yaml` file from the specified path or the default
    /// location.
    pub fn read(self) -> Result<Arc<Self>, url::ParseError> {
        let file_path = if self.path.is_file() {
            &self.path
        } else {
            &Path::new(DEFAULT_CONFIG_PATH).to_path_buf()
        };

        match File::open(file_path) {
            Ok(file) => {
                let mut config: Configuration =
                    match serde_yaml::from_reader(file) {
                        Ok(config) => config,
                        Err(err) => {
                            return Ok(Arc::new(self.error(err)));
                        },
                    };

                config.version = VERSION.to_owned();
                if !config.url.is_empty() {
                    config.url = self.normalize_url(&config.url)?;
                }
                for provider in config
                    .openid
                    .iter_mut()
                    .flat_map(|openid| openid.providers.iter_mut())
                {
                    provider.issuer = self.normalize_url(&provider.issuer)?;
                }

                Ok(Arc::new(config))
            },
            Err(err) => Ok(Arc::new(self.error(err))),
        }
    }

    /// Return a default configuration as fallback.
    fn error(&self, err: impl std::error::Error) -> Self {
        tracing::error!(error = %err, path = %self.path.display(), "configuration file unreadable, using defaults");
        Self {
            version: VERSION.to_owned(),
            ..Default::default()
        }
    }
}
