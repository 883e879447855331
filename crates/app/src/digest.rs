use chrono::Duration;
use metrics::counter;
use serde::Serialize;
use tracing::{info, warn};

use loyalty_core::{calendar::iso_week_key, notify::LoyaltyEvent, types::Account};
use loyalty_storage::{EnqueueOutcome, StorageError};

use crate::{context::LoyaltyContext, error::ServiceError, events::EventPublisher};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DigestReport {
    pub enqueued: u64,
    pub skipped: u64,
    pub errors: u64,
}

/// Queues one summary per active account and ISO week.
#[derive(Clone)]
pub struct WeeklyDigestJob {
    context: LoyaltyContext,
    events: EventPublisher,
}

impl WeeklyDigestJob {
    pub fn new(context: LoyaltyContext, events: EventPublisher) -> Self {
        Self { context, events }
    }

    pub async fn run(&self) -> Result<DigestReport, ServiceError> {
        let program = self.context.program().await?;
        let week = iso_week_key(self.context.today());
        let accounts = self
            .context
            .database()
            .accounts()
            .list_active(program.id)
            .await?;

        let mut report = DigestReport::default();
        for account in &accounts {
            let result = match self.enqueue_for(account, &week).await {
                Ok(true) => {
                    report.enqueued += 1;
                    "enqueued"
                }
                Ok(false) => {
                    report.skipped += 1;
                    "skipped"
                }
                Err(err) => {
                    report.errors += 1;
                    warn!(
                        stage = "digest",
                        account_id = account.id,
                        %week,
                        error = %err,
                        "weekly digest failed"
                    );
                    "error"
                }
            };
            counter!("digest_results_total", "result" => result).increment(1);
        }

        info!(
            stage = "digest",
            %week,
            enqueued = report.enqueued,
            skipped = report.skipped,
            errors = report.errors,
            "weekly digest finished"
        );
        Ok(report)
    }

    /// Returns `false` when this week's digest is already queued.
    async fn enqueue_for(&self, account: &Account, week: &str) -> Result<bool, StorageError> {
        let ledger = self.context.database().ledger();
        let since = self.context.now() - Duration::days(7);
        let week_points = ledger.net_since(account.id, since).await?;
        let balance = ledger.totals(account.id).await?.balance();

        let event = LoyaltyEvent::WeeklyDigest {
            user_id: account.user_id,
            account_id: account.id,
            week: week.to_string(),
            week_points,
            balance,
        };
        let notification = event.into_notification();
        let outcome = self.events.enqueue(&notification).await?;
        Ok(matches!(outcome, EnqueueOutcome::Queued { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        accounts::AccountManager,
        accrual::DailyAccrualJob,
        test_support::{member, setup_db, TestClock},
    };

    #[tokio::test]
    async fn digest_reports_last_seven_days_once_per_week() {
        let db = setup_db().await;
        let clock = TestClock::at(2025, 1, 1);
        let context = clock.context(&db);
        let events = EventPublisher::new(context.clone());
        let account = AccountManager::new(context.clone(), events.clone())
            .enroll(&member(7))
            .await
            .unwrap()
            .account
            .unwrap();
        let accrual = DailyAccrualJob::new(context.clone());
        for day in 10..=14 {
            clock.set(2025, 1, day);
            accrual.run().await.unwrap();
        }

        // Wednesday of ISO week 3; the bonus from 2025-01-01 is outside the window.
        clock.set(2025, 1, 15);
        let job = WeeklyDigestJob::new(context, events);
        let report = job.run().await.unwrap();
        assert_eq!(
            report,
            DigestReport {
                enqueued: 1,
                skipped: 0,
                errors: 0
            }
        );

        let key = format!("weekly_digest:7:{}:2025-W03", account.id);
        let item = db
            .notifications()
            .find_by_dedupe_key(&key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.payload["weekPoints"], 5);
        assert_eq!(item.payload["balance"], 105);

        clock.set(2025, 1, 17);
        let again = job.run().await.unwrap();
        assert_eq!(again.enqueued, 0);
        assert_eq!(again.skipped, 1);

        clock.set(2025, 1, 20);
        let next_week = job.run().await.unwrap();
        assert_eq!(next_week.enqueued, 1);
    }

    #[tokio::test]
    async fn inactive_accounts_get_no_digest() {
        let db = setup_db().await;
        let clock = TestClock::at(2025, 1, 1);
        let context = clock.context(&db);
        let events = EventPublisher::new(context.clone());
        let accounts = AccountManager::new(context.clone(), events.clone());
        let account = accounts.enroll(&member(7)).await.unwrap().account.unwrap();
        accounts
            .set_status(1, account.id, loyalty_core::types::AccountStatus::Closed, None)
            .await
            .unwrap();

        let report = WeeklyDigestJob::new(context, events).run().await.unwrap();
        assert_eq!(report, DigestReport::default());
    }
}
