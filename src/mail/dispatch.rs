use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::Mail;
use crate::error::Result;
use crate::mail::{LogMailer, MailError, MailSession, Mailer, RabbitMqMailer, Templates};
use crate::token::{PendingToken, TokenLedger};

/// Shortest delay between two batches.
const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Mail undelivered tokens.
#[derive(Clone)]
pub struct Dispatcher {
    tokens: TokenLedger,
    templates: Arc<Templates>,
    mailer: Arc<dyn Mailer>,
}

impl Dispatcher {
    pub fn new(tokens: TokenLedger, templates: Arc<Templates>, mailer: Arc<dyn Mailer>) -> Self {
        Self {
            tokens,
            templates,
            mailer,
        }
    }

    /// Load templates and connect the transport of `config`. Without a
    /// RabbitMQ section messages are only logged.
    pub async fn from_config(config: &Mail, tokens: TokenLedger) -> std::result::Result<Self, MailError> {
        let templates = Templates::load(&config.templates)?;
        tracing::info!(domains = ?templates.domains(), "mail templates loaded");

        let mailer: Arc<dyn Mailer> = match &config.rabbitmq {
            Some(rabbitmq) => Arc::new(RabbitMqMailer::connect(rabbitmq).await?),
            None => {
                tracing::warn!("no mail transport configured, token emails are only logged");
                Arc::new(LogMailer)
            },
        };

        Ok(Self::new(tokens, Arc::new(templates), mailer))
    }

    /// Deliver one batch, return how many messages were sent.
    ///
    /// Tokens without a usable template are skipped and stay pending. The
    /// first delivery failure ends the batch.
    pub async fn run_once(&self) -> Result<usize> {
        let pending = self.tokens.list_undelivered().await?;
        if pending.is_empty() {
            return Ok(0);
        }

        let mut session = self.mailer.open().await?;
        let result = self.deliver(session.as_mut(), &pending).await;
        if let Err(err) = session.close().await {
            tracing::warn!(error = %err, "mail session not closed cleanly");
        }
        result
    }

    async fn deliver(&self, session: &mut dyn MailSession, pending: &[PendingToken]) -> Result<usize> {
        let mut sent = 0;
        for token in pending {
            let Some(domain) = self.templates.domain(&token.domain) else {
                tracing::warn!(domain = %token.domain, "no templates for domain, token ignored");
                continue;
            };
            let Some(template) = domain.email(token.purpose) else {
                tracing::warn!(
                    domain = %token.domain,
                    purpose = %token.purpose,
                    "no template for token type, token ignored"
                );
                continue;
            };
            let email = match template
                .with_token(&token.token.to_string())
                .apply(&domain.from, &token.email)
            {
                Ok(email) => email,
                Err(err) => {
                    tracing::warn!(
                        domain = %token.domain,
                        purpose = %token.purpose,
                        error = %err,
                        "email template ignored"
                    );
                    continue;
                },
            };

            session.send(&email).await?;
            self.tokens.mark_sent(&token.token).await?;
            sent += 1;
        }

        metrics::counter!("warden_mails_sent_total").increment(sent as u64);
        Ok(sent)
    }

    /// Deliver a batch every `every` until `shutdown` flips. The first batch
    /// runs after one full interval, never shorter than a second.
    pub fn spawn(self, every: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let every = every.max(MIN_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => match self.run_once().await {
                        Ok(0) => {},
                        Ok(sent) => tracing::info!(sent, "token emails delivered"),
                        Err(err) => tracing::error!(error = %err, "token email delivery failed"),
                    },
                    _ = shutdown.changed() => break,
                }
            }
            tracing::debug!("mail dispatcher stopped");
        })
    }
}
