use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use lapin::options::{BasicPublishOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use serde::Serialize;
use url::Url;

use crate::config::RabbitMq;
use crate::crypto::random_token;
use crate::mail::{Email, MailError, MailSession, Mailer};

const DEFAULT_AMPQ_HOST: &str = "localhost";
const DEFAULT_AMPQ_PORT: u16 = 5672;
const DEFAULT_AMPQ_VHOST: &str = "/";

const CONTENT_ENCODING: &str = "utf8";
const CONTENT_TYPE: &str = "application/cloudevents+json";
const DATA_CONTENT_TYPE: &str = "application/json";
const CLOUDEVENT_VERSION: &str = "1.0";
const EVENT_TYPE: &str = "warden.email";
const EVENT_SOURCE: &str = "warden";
const ID_LENGTH: usize = 12;
const REPLY_SUCCESS: u16 = 200;

#[derive(Debug, Serialize)]
struct Cloudevent<'a> {
    specversion: &'static str,
    r#type: &'static str,
    source: &'static str,
    id: String,
    time: String,
    datacontenttype: &'static str,
    data: &'a Email,
}

impl<'a> Cloudevent<'a> {
    fn new(data: &'a Email) -> Self {
        Self {
            specversion: CLOUDEVENT_VERSION,
            r#type: EVENT_TYPE,
            source: EVENT_SOURCE,
            id: random_token(ID_LENGTH),
            time: Utc::now().to_rfc3339(),
            datacontenttype: DATA_CONTENT_TYPE,
            data,
        }
    }
}

/// Publish messages as CloudEvents on a durable RabbitMQ queue, a mail
/// worker consumes them.
#[derive(Clone)]
pub struct RabbitMqMailer {
    queue: String,
    conn: Arc<Connection>,
}

impl RabbitMqMailer {
    /// Connect to the broker.
    pub async fn connect(config: &RabbitMq) -> Result<Self, MailError> {
        let addr = Url::parse(&config.address)
            .map_err(|err| MailError::Address(err.to_string()))?;
        let uri = AMQPUri {
            scheme: AMQPScheme::from_str(addr.scheme()).map_err(|_| {
                MailError::Address(format!("unsupported scheme {:?}", addr.scheme()))
            })?,
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: config.username.clone(),
                    password: config.password.clone(),
                },
                host: addr.host_str().unwrap_or(DEFAULT_AMPQ_HOST).into(),
                port: addr.port().unwrap_or(DEFAULT_AMPQ_PORT),
            },
            vhost: config
                .vhost
                .clone()
                .unwrap_or(DEFAULT_AMPQ_VHOST.to_string()),
            query: AMQPQueryString {
                channel_max: config.pool,
                ..Default::default()
            },
        };

        let conn_config =
            ConnectionProperties::default().with_connection_name("warden_mail_client".into());
        let conn = Connection::connect_uri(uri, conn_config).await?;

        tracing::info!(%addr, queue = %config.queue, "rabbitmq connected");

        Ok(Self {
            queue: config.queue.clone(),
            conn: Arc::new(conn),
        })
    }
}

#[async_trait]
impl Mailer for RabbitMqMailer {
    async fn open(&self) -> Result<Box<dyn MailSession>, MailError> {
        let channel = self.conn.create_channel().await?;
        channel
            .queue_declare(
                &self.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        Ok(Box::new(RabbitMqSession {
            channel,
            queue: self.queue.clone(),
        }))
    }
}

struct RabbitMqSession {
    channel: Channel,
    queue: String,
}

#[async_trait]
impl MailSession for RabbitMqSession {
    async fn send(&mut self, email: &Email) -> Result<(), MailError> {
        let payload = serde_json::to_vec(&Cloudevent::new(email))?;

        self.channel
            .basic_publish(
                "",
                &self.queue,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default()
                    .with_content_encoding(CONTENT_ENCODING.into())
                    .with_content_type(CONTENT_TYPE.into()),
            )
            .await?;

        tracing::trace!(queue = %self.queue, "email event published");
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), MailError> {
        self.channel.close(REPLY_SUCCESS, "OK").await?;
        Ok(())
    }
}
