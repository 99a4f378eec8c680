//! Deliver one-time tokens by email.
//!
//! [`Dispatcher`] periodically renders pending tokens with the template of
//! their domain and hands messages to a [`Mailer`].
mod dispatch;
mod rabbitmq;
mod template;

pub use dispatch::*;
pub use rabbitmq::*;
pub use template::*;

use async_trait::async_trait;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("templates file unreadable: {0}")]
    Io(#[from] std::io::Error),
    #[error("templates file malformed: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("email template has neither text nor html body")]
    EmptyBody,
    #[error("invalid broker address: {0}")]
    Address(String),
    #[error(transparent)]
    Amqp(#[from] lapin::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// A rendered message ready to be sent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Email {
    pub from: String,
    pub to: String,
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
}

/// Opens delivery sessions.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Open a session used for one batch of messages.
    async fn open(&self) -> Result<Box<dyn MailSession>, MailError>;
}

/// A delivery session, closed once the batch is over.
#[async_trait]
pub trait MailSession: Send {
    async fn send(&mut self, email: &Email) -> Result<(), MailError>;

    async fn close(self: Box<Self>) -> Result<(), MailError>;
}

/// Mailer used when no transport is configured, messages are only logged.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMailer;

struct LogSession;

#[async_trait]
impl Mailer for LogMailer {
    async fn open(&self) -> Result<Box<dyn MailSession>, MailError> {
        Ok(Box::new(LogSession))
    }
}

#[async_trait]
impl MailSession for LogSession {
    async fn send(&mut self, email: &Email) -> Result<(), MailError> {
        tracing::info!(
            from = %email.from,
            to = %email.to,
            subject = %email.subject,
            "no mail transport configured, message dropped"
        );
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), MailError> {
        Ok(())
    }
}
