use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};
use url::Url;

use loyalty_core::notify::render_message;
use loyalty_mailer::{OutboundEmail, RelayClient};
use loyalty_storage::{QueuedNotification, StorageError};
use loyalty_util::{ConfigError, NotifyConfig};

use crate::context::LoyaltyContext;

const NO_RECIPIENT: &str = "no recipient email";

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid relay url: {0}")]
    Url(#[from] url::ParseError),
    #[error("failed to build http client: {0}")]
    Http(#[from] reqwest::Error),
}

/// Where rendered messages go.
#[derive(Clone)]
pub enum Mailer {
    Relay(RelayClient),
    /// Logs the rendered message and marks the row sent.
    DryRun,
}

impl Mailer {
    pub fn from_config(config: &NotifyConfig) -> Result<Self, WorkerError> {
        let Some(relay_url) = config.require_relay()? else {
            return Ok(Self::DryRun);
        };
        let http = Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self::Relay(RelayClient::new(
            Url::parse(relay_url)?,
            config.relay_token.clone(),
            config.mail_from.clone(),
            http,
        )))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub processed: u64,
    pub sent: u64,
    pub failed: u64,
}

/// Consumer that renders queued notifications and hands them to the mailer.
///
/// Rows are marked `Sent` after a successful hand-off, so a crash in between
/// can deliver a message twice. `Failed` rows are never picked up again.
#[derive(Clone)]
pub struct NotificationWorker {
    context: LoyaltyContext,
    mailer: Mailer,
    interval: Duration,
    batch: u32,
}

impl NotificationWorker {
    pub fn new(context: LoyaltyContext, mailer: Mailer, config: &NotifyConfig) -> Self {
        Self {
            context,
            mailer,
            interval: config.interval,
            batch: config.batch,
        }
    }

    /// Polls forever on the configured interval.
    pub async fn run_loop(self) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.process_batch(self.batch).await {
                error!(stage = "notify", error = %err, "notification batch failed");
            }
        }
    }

    /// Processes up to `limit` queued rows once.
    pub async fn process_batch(&self, limit: u32) -> Result<BatchReport, StorageError> {
        let started = Instant::now();
        let queued = self
            .context
            .database()
            .notifications()
            .fetch_queued(i64::from(limit))
            .await?;

        let mut report = BatchReport::default();
        for item in &queued {
            report.processed += 1;
            let result = match self.deliver(item).await {
                Ok(true) => {
                    report.sent += 1;
                    "sent"
                }
                Ok(false) => {
                    report.failed += 1;
                    "failed"
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(stage = "notify", id = item.id, error = %err, "failed to record delivery outcome");
                    "failed"
                }
            };
            counter!("notifications_processed_total", "result" => result).increment(1);
        }

        histogram!("notification_batch_seconds").record(started.elapsed().as_secs_f64());
        if report.processed > 0 {
            info!(
                stage = "notify",
                processed = report.processed,
                sent = report.sent,
                failed = report.failed,
                "notification batch processed"
            );
        }
        Ok(report)
    }

    /// Returns whether the row ended up `Sent`.
    async fn deliver(&self, item: &QueuedNotification) -> Result<bool, StorageError> {
        let notifications = self.context.database().notifications();
        let Some(recipient) = item.recipient.as_deref() else {
            notifications.mark_failed(item.id, NO_RECIPIENT).await?;
            warn!(stage = "notify", id = item.id, kind = %item.kind, "notification has no recipient");
            return Ok(false);
        };

        let template = item
            .template
            .as_ref()
            .map(|(subject, html)| (subject.as_str(), html.as_str()));
        let message = render_message(&item.kind, template, &item.payload);

        match &self.mailer {
            Mailer::DryRun => {
                info!(
                    stage = "notify",
                    id = item.id,
                    to = recipient,
                    subject = %message.subject,
                    html = %message.html,
                    "dry run, message not sent"
                );
            }
            Mailer::Relay(client) => {
                let email = OutboundEmail {
                    to: recipient,
                    subject: &message.subject,
                    html: &message.html,
                };
                if let Err(err) = client.send(&email).await {
                    warn!(stage = "notify", id = item.id, error = %err, "mail relay refused message");
                    notifications.mark_failed(item.id, &err.to_string()).await?;
                    return Ok(false);
                }
            }
        }

        notifications.mark_sent(item.id, self.context.now()).await?;
        Ok(true)
    }
}
