use metrics::counter;
use tracing::{debug, warn};

use loyalty_core::notify::{LoyaltyEvent, NewNotification};
use loyalty_storage::{EnqueueOutcome, StorageError};

use crate::context::LoyaltyContext;

/// Publishes committed state changes onto the notification queue.
#[derive(Clone)]
pub struct EventPublisher {
    context: LoyaltyContext,
}

impl EventPublisher {
    pub fn new(context: LoyaltyContext) -> Self {
        Self { context }
    }

    /// Enqueues a notification, deduplicating on its resolved key.
    pub async fn enqueue(
        &self,
        notification: &NewNotification,
    ) -> Result<EnqueueOutcome, StorageError> {
        let outcome = self
            .context
            .database()
            .notifications()
            .enqueue(notification, self.context.now())
            .await?;
        let result = match &outcome {
            EnqueueOutcome::Queued { .. } => "queued",
            EnqueueOutcome::Duplicate { .. } => "duplicate",
        };
        counter!("notifications_enqueued_total", "result" => result).increment(1);
        Ok(outcome)
    }

    /// Publishes an event after its transaction committed.
    ///
    /// Failures are logged and counted; the triggering operation has already succeeded.
    pub async fn publish(&self, event: LoyaltyEvent) {
        let notification = event.into_notification();
        match self.enqueue(&notification).await {
            Ok(EnqueueOutcome::Queued { id, dedupe_key }) => {
                debug!(stage = "notify", id, %dedupe_key, kind = %notification.kind, "notification queued");
            }
            Ok(EnqueueOutcome::Duplicate { dedupe_key }) => {
                debug!(stage = "notify", %dedupe_key, kind = %notification.kind, "notification already queued");
            }
            Err(err) => {
                counter!("notifications_enqueued_total", "result" => "error").increment(1);
                warn!(
                    stage = "notify",
                    kind = %notification.kind,
                    error = %err,
                    "failed to enqueue notification"
                );
            }
        }
    }
}
