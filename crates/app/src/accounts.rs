use serde::Serialize;
use tracing::info;

use loyalty_core::{
    calendar::{add_months, enrollment_dates},
    notify::LoyaltyEvent,
    program::ProgramConfig,
    projector::BalanceProjection,
    types::{Account, AccountStatus, Caller, LedgerEntry, LedgerKind, MAX_POINTS},
};
use loyalty_storage::{InsertAccountOutcome, NewAccount, NewLedgerEntry};

use crate::{
    context::{appended, LoyaltyContext},
    error::ServiceError,
    events::EventPublisher,
};

const RECENT_LEDGER_LIMIT: i64 = 20;
const MAX_EXTEND_MONTHS: i64 = 120;

/// Snapshot returned to members: the account with projected figures, recent history and rank.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountView {
    pub account: Option<Account>,
    pub program: ProgramConfig,
    pub recent_ledger: Vec<LedgerEntry>,
    pub projection: Option<BalanceProjection>,
    pub rank: Option<i64>,
}

/// One row of the admin account listing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSummary {
    pub account: Account,
    pub projection: BalanceProjection,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PenaltyReceipt {
    pub entry: LedgerEntry,
    pub projection: BalanceProjection,
}

/// Enrollment and admin lifecycle operations on accounts.
#[derive(Clone)]
pub struct AccountManager {
    context: LoyaltyContext,
    events: EventPublisher,
}

impl AccountManager {
    pub fn new(context: LoyaltyContext, events: EventPublisher) -> Self {
        Self { context, events }
    }

    /// Enrolls the caller, or returns their existing account untouched.
    pub async fn enroll(&self, caller: &Caller) -> Result<AccountView, ServiceError> {
        let program = self.context.program().await?;
        if !program.active {
            return Err(ServiceError::conflict(
                "PROGRAM_INACTIVE",
                "the loyalty program is not active",
            ));
        }
        if !program.is_role_eligible(&caller.role) {
            return Err(ServiceError::Authorization {
                code: "NOT_ELIGIBLE",
                message: format!("role {} is not eligible for the program", caller.role),
            });
        }

        let database = self.context.database();
        let now = self.context.now();
        database
            .users()
            .upsert(
                caller.user_id,
                caller.name.as_deref(),
                caller.email.as_deref(),
                now,
            )
            .await?;

        if let Some(existing) = database
            .accounts()
            .find_by_user(program.id, caller.user_id)
            .await?
        {
            return self.view(program, existing).await;
        }

        let dates = enrollment_dates(
            self.context.today(),
            program.duration_months,
            u64::from(program.withdraw_wait_days),
        )?;

        let mut tx = database.begin().await?;
        let outcome = database
            .accounts()
            .insert(
                &mut tx,
                &NewAccount {
                    program_id: program.id,
                    user_id: caller.user_id,
                    start_date: Some(dates.start_date),
                    end_date: Some(dates.end_date),
                    eligible_from: Some(dates.eligible_from),
                    created_at: now,
                },
            )
            .await?;
        let account = match outcome {
            InsertAccountOutcome::Inserted(account) => account,
            InsertAccountOutcome::Duplicate => {
                tx.rollback().await.map_err(loyalty_storage::StorageError::from)?;
                let existing = database
                    .accounts()
                    .find_by_user(program.id, caller.user_id)
                    .await?
                    .ok_or_else(|| ServiceError::not_found("account vanished during enrollment"))?;
                return self.view(program, existing).await;
            }
        };

        if program.signup_bonus > 0 {
            let outcome = database
                .ledger()
                .append(
                    &mut tx,
                    &NewLedgerEntry {
                        account_id: account.id,
                        kind: LedgerKind::Enroll,
                        points_delta: program.signup_bonus,
                        note: Some("Signup bonus".into()),
                        admin_user_id: None,
                        accrual_day: None,
                        created_at: now,
                    },
                )
                .await?;
            appended(outcome)?;
        }
        tx.commit().await.map_err(loyalty_storage::StorageError::from)?;

        info!(
            stage = "ledger",
            user_id = caller.user_id,
            account_id = account.id,
            bonus = program.signup_bonus,
            "member enrolled"
        );

        self.events
            .publish(LoyaltyEvent::Enrolled {
                user_id: caller.user_id,
                email: caller.email.clone(),
                name: caller.name.clone(),
                account_id: account.id,
                duration_months: program.duration_months,
                withdraw_wait_days: program.withdraw_wait_days,
                signup_bonus: program.signup_bonus,
            })
            .await;

        self.view(program, account).await
    }

    /// The caller's account, or `account: None` with the program when not enrolled.
    pub async fn my_account(&self, caller: &Caller) -> Result<AccountView, ServiceError> {
        let program = self.context.program().await?;
        match self
            .context
            .database()
            .accounts()
            .find_by_user(program.id, caller.user_id)
            .await?
        {
            Some(account) => self.view(program, account).await,
            None => Ok(AccountView {
                account: None,
                program,
                recent_ledger: Vec::new(),
                projection: None,
                rank: None,
            }),
        }
    }

    /// Projected balance and rank of one account.
    pub async fn projection(&self, account: &Account) -> Result<BalanceProjection, ServiceError> {
        let ledger = self.context.database().ledger();
        let totals = ledger.totals(account.id).await?;
        let rank = ledger.rank(account.program_id, totals.earned).await?;
        Ok(totals.with_rank(rank))
    }

    async fn view(
        &self,
        program: ProgramConfig,
        mut account: Account,
    ) -> Result<AccountView, ServiceError> {
        let projection = self.projection(&account).await?;
        let recent_ledger = self
            .context
            .database()
            .ledger()
            .recent(account.id, RECENT_LEDGER_LIMIT)
            .await?;

        // Callers see projected figures, never the cached mirror.
        account.points_balance = projection.balance;
        account.total_earned = projection.earned;
        account.total_penalty = projection.penalty;
        account.total_paid = projection.paid;

        Ok(AccountView {
            account: Some(account),
            program,
            recent_ledger,
            projection: Some(projection),
            rank: Some(projection.rank),
        })
    }

    pub async fn list_accounts(&self) -> Result<Vec<AccountSummary>, ServiceError> {
        let program = self.context.program().await?;
        let rows = self
            .context
            .database()
            .accounts()
            .list_with_projection(program.id)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(account, projection)| AccountSummary {
                account,
                projection,
            })
            .collect())
    }

    /// Deducts `points` and notifies the member with the resulting balance.
    pub async fn penalize(
        &self,
        admin_user_id: i64,
        account_id: i64,
        points: i64,
        note: Option<String>,
    ) -> Result<PenaltyReceipt, ServiceError> {
        if !(1..=MAX_POINTS).contains(&points) {
            return Err(ServiceError::invalid_input(format!(
                "penalty points must be a positive integer no greater than {MAX_POINTS}"
            )));
        }
        let note = note
            .map(|note| note.trim().to_string())
            .filter(|note| !note.is_empty())
            .unwrap_or_else(|| "Admin penalty".to_string());

        let database = self.context.database();
        let now = self.context.now();
        let mut tx = database.begin().await?;
        if !database.accounts().touch(&mut tx, account_id, now).await? {
            return Err(ServiceError::not_found(format!("account {account_id} not found")));
        }
        let account = database
            .accounts()
            .find_in(&mut tx, account_id)
            .await?
            .ok_or_else(|| ServiceError::not_found(format!("account {account_id} not found")))?;
        let outcome = database
            .ledger()
            .append(
                &mut tx,
                &NewLedgerEntry {
                    account_id,
                    kind: LedgerKind::Penalty,
                    points_delta: -points,
                    note: Some(note.clone()),
                    admin_user_id: Some(admin_user_id),
                    accrual_day: None,
                    created_at: now,
                },
            )
            .await?;
        let entry = appended(outcome)?;
        tx.commit().await.map_err(loyalty_storage::StorageError::from)?;

        let projection = self.projection(&account).await?;
        info!(
            stage = "ledger",
            account_id,
            admin_user_id,
            points,
            balance = projection.balance,
            "penalty applied"
        );

        self.events
            .publish(LoyaltyEvent::Penalized {
                user_id: account.user_id,
                account_id,
                entry_id: entry.id,
                points,
                note: Some(note),
                balance: projection.balance,
            })
            .await;

        Ok(PenaltyReceipt { entry, projection })
    }

    /// Changes the account status, recording a zero-delta audit entry.
    ///
    /// Setting the current status again is a no-op.
    pub async fn set_status(
        &self,
        admin_user_id: i64,
        account_id: i64,
        status: AccountStatus,
        note: Option<String>,
    ) -> Result<Account, ServiceError> {
        let database = self.context.database();
        let now = self.context.now();
        let mut tx = database.begin().await?;
        if !database.accounts().touch(&mut tx, account_id, now).await? {
            return Err(ServiceError::not_found(format!("account {account_id} not found")));
        }
        let account = database
            .accounts()
            .find_in(&mut tx, account_id)
            .await?
            .ok_or_else(|| ServiceError::not_found(format!("account {account_id} not found")))?;
        if account.status == status {
            tx.rollback().await.map_err(loyalty_storage::StorageError::from)?;
            return Ok(account);
        }

        database
            .accounts()
            .set_status(&mut tx, account_id, status, now)
            .await?;
        let audit = match note.as_deref().map(str::trim).filter(|note| !note.is_empty()) {
            Some(note) => format!("Admin change: {} -> {status}. {note}", account.status),
            None => format!("Admin change: {} -> {status}", account.status),
        };
        let outcome = database
            .ledger()
            .append(
                &mut tx,
                &NewLedgerEntry {
                    account_id,
                    kind: LedgerKind::Status,
                    points_delta: 0,
                    note: Some(audit),
                    admin_user_id: Some(admin_user_id),
                    accrual_day: None,
                    created_at: now,
                },
            )
            .await?;
        let entry = appended(outcome)?;
        let updated = database
            .accounts()
            .find_in(&mut tx, account_id)
            .await?
            .ok_or_else(|| ServiceError::not_found(format!("account {account_id} not found")))?;
        tx.commit().await.map_err(loyalty_storage::StorageError::from)?;

        info!(
            stage = "ledger",
            account_id,
            admin_user_id,
            from = %account.status,
            to = %status,
            "account status changed"
        );
        self.events
            .publish(LoyaltyEvent::StatusChanged {
                user_id: account.user_id,
                account_id,
                entry_id: entry.id,
                status,
            })
            .await;

        Ok(updated)
    }

    /// Pushes the end date forward by whole months, counting from the start date
    /// when the account has no end date.
    pub async fn extend(
        &self,
        admin_user_id: i64,
        account_id: i64,
        months: i64,
        note: Option<String>,
    ) -> Result<Account, ServiceError> {
        if !(1..=MAX_EXTEND_MONTHS).contains(&months) {
            return Err(ServiceError::invalid_input(format!(
                "months must be an integer between 1 and {MAX_EXTEND_MONTHS}"
            )));
        }

        let database = self.context.database();
        let now = self.context.now();
        let mut tx = database.begin().await?;
        if !database.accounts().touch(&mut tx, account_id, now).await? {
            return Err(ServiceError::not_found(format!("account {account_id} not found")));
        }
        let account = database
            .accounts()
            .find_in(&mut tx, account_id)
            .await?
            .ok_or_else(|| ServiceError::not_found(format!("account {account_id} not found")))?;

        let base = account
            .end_date
            .or(account.start_date)
            .unwrap_or_else(|| self.context.today());
        // Range checked above.
        let end_date = add_months(base, months as u32)?;
        database
            .accounts()
            .set_end_date(&mut tx, account_id, end_date, now)
            .await?;

        let audit = match note.as_deref().map(str::trim).filter(|note| !note.is_empty()) {
            Some(note) => format!("Extended by {months} month(s) to {end_date}. {note}"),
            None => format!("Extended by {months} month(s) to {end_date}"),
        };
        let outcome = database
            .ledger()
            .append(
                &mut tx,
                &NewLedgerEntry {
                    account_id,
                    kind: LedgerKind::Extend,
                    points_delta: 0,
                    note: Some(audit),
                    admin_user_id: Some(admin_user_id),
                    accrual_day: None,
                    created_at: now,
                },
            )
            .await?;
        appended(outcome)?;
        let updated = database
            .accounts()
            .find_in(&mut tx, account_id)
            .await?
            .ok_or_else(|| ServiceError::not_found(format!("account {account_id} not found")))?;
        tx.commit().await.map_err(loyalty_storage::StorageError::from)?;

        info!(stage = "ledger", account_id, admin_user_id, months, %end_date, "account extended");
        Ok(updated)
    }
}
