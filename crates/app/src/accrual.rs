use chrono::NaiveDate;
use metrics::counter;
use serde::Serialize;
use tracing::{info, warn};

use loyalty_core::{
    calendar::window_contains,
    types::{Account, LedgerKind},
};
use loyalty_storage::{AppendOutcome, NewLedgerEntry, StorageError};

use crate::{
    context::{record_append, LoyaltyContext},
    error::ServiceError,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AccrualReport {
    pub inserted: u64,
    pub skipped: u64,
    pub errors: u64,
}

/// Credits every active account in its window once per calendar day.
///
/// Safe to run repeatedly and from several processes; the store's
/// `(account, daily, day)` uniqueness turns repeats into skips.
#[derive(Clone)]
pub struct DailyAccrualJob {
    context: LoyaltyContext,
}

impl DailyAccrualJob {
    pub fn new(context: LoyaltyContext) -> Self {
        Self { context }
    }

    pub async fn run(&self) -> Result<AccrualReport, ServiceError> {
        let program = self.context.program().await?;
        let today = self.context.today();
        let accounts = self
            .context
            .database()
            .accounts()
            .list_active(program.id)
            .await?;

        let mut report = AccrualReport::default();
        for account in accounts
            .iter()
            .filter(|account| window_contains(account.start_date, account.end_date, today))
        {
            let result = match self.accrue(account, today, program.daily_accrual_points).await {
                Ok(true) => {
                    report.inserted += 1;
                    "inserted"
                }
                Ok(false) => {
                    report.skipped += 1;
                    "skipped"
                }
                Err(err) => {
                    report.errors += 1;
                    warn!(
                        stage = "accrual",
                        account_id = account.id,
                        %today,
                        error = %err,
                        "daily accrual failed"
                    );
                    "error"
                }
            };
            counter!("accrual_results_total", "result" => result).increment(1);
        }

        info!(
            stage = "accrual",
            %today,
            points = program.daily_accrual_points,
            inserted = report.inserted,
            skipped = report.skipped,
            errors = report.errors,
            "daily accrual finished"
        );
        Ok(report)
    }

    /// Returns `false` when the account was already credited today.
    async fn accrue(
        &self,
        account: &Account,
        day: NaiveDate,
        points: i64,
    ) -> Result<bool, StorageError> {
        let database = self.context.database();
        let mut tx = database.begin().await?;
        let outcome = database
            .ledger()
            .append(
                &mut tx,
                &NewLedgerEntry {
                    account_id: account.id,
                    kind: LedgerKind::Daily,
                    points_delta: points,
                    note: None,
                    admin_user_id: None,
                    accrual_day: Some(day),
                    created_at: self.context.now(),
                },
            )
            .await?;
        match outcome {
            AppendOutcome::Inserted(entry) => {
                tx.commit().await?;
                record_append(&entry);
                Ok(true)
            }
            AppendOutcome::Duplicate => {
                tx.rollback().await?;
                Ok(false)
            }
        }
    }
}
