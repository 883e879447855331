use metrics::counter;
use serde::Serialize;
use tracing::info;

use loyalty_core::{
    notify::LoyaltyEvent,
    types::{Caller, LedgerKind, Withdrawal, WithdrawalOrigin, MAX_POINTS},
    workflow::{
        check_admin_request, check_member_request, payout_eur, transition, RequestContext,
        RequestRejection, StatusFilter, StatusLabel, TransitionError, WithdrawalAction,
    },
};
use loyalty_storage::{
    NewLedgerEntry, NewWithdrawal, StorageError, TransitionOutcome, TransitionUpdate,
    WithdrawalQuery,
};

use crate::{
    context::{appended, LoyaltyContext},
    error::ServiceError,
    events::EventPublisher,
};

pub const DEFAULT_PER_PAGE: i64 = 20;
pub const MAX_PER_PAGE: i64 = 100;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalReceipt {
    pub withdrawal: Withdrawal,
    pub withdrawals: Vec<Withdrawal>,
}

/// Withdrawal as shown in list views, with its display label.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalListItem {
    #[serde(flatten)]
    pub withdrawal: Withdrawal,
    pub status_label: StatusLabel,
}

impl From<Withdrawal> for WithdrawalListItem {
    fn from(withdrawal: Withdrawal) -> Self {
        let status_label = withdrawal.status.label();
        Self {
            withdrawal,
            status_label,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalList {
    pub items: Vec<WithdrawalListItem>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
}

#[derive(Debug, Clone, Default)]
pub struct ListParams {
    pub status: Option<StatusFilter>,
    pub account_id: Option<i64>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

/// Optional fields an admin may attach to a decision.
#[derive(Debug, Clone, Default)]
pub struct Decision {
    pub payout_ref: Option<String>,
    pub note: Option<String>,
}

/// Member requests and admin decisions on withdrawals.
#[derive(Clone)]
pub struct WithdrawalWorkflow {
    context: LoyaltyContext,
    events: EventPublisher,
}

impl WithdrawalWorkflow {
    pub fn new(context: LoyaltyContext, events: EventPublisher) -> Self {
        Self { context, events }
    }

    /// Creates a `Pending` withdrawal for the caller.
    ///
    /// Checks run in order: pending request, account status, eligibility date,
    /// minimum, projected balance. A repeated `idempotency_key` returns the
    /// withdrawal created by the first call.
    pub async fn request(
        &self,
        caller: &Caller,
        points: i64,
        note: Option<String>,
        idempotency_key: Option<String>,
    ) -> Result<WithdrawalReceipt, ServiceError> {
        if !(1..=MAX_POINTS).contains(&points) {
            return Err(RequestRejection::InvalidPoints.into());
        }
        let program = self.context.program().await?;
        let database = self.context.database();
        let account = database
            .accounts()
            .find_by_user(program.id, caller.user_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("not enrolled in the loyalty program"))?;
        let note = non_blank(note);
        let idempotency_key = non_blank(idempotency_key);
        let now = self.context.now();

        let mut tx = database.begin().await?;
        database.accounts().touch(&mut tx, account.id, now).await?;

        if let Some(key) = idempotency_key.as_deref() {
            if let Some(existing) = database
                .withdrawals()
                .find_by_idempotency_key_in(&mut tx, account.id, key)
                .await?
            {
                tx.rollback().await.map_err(StorageError::from)?;
                info!(
                    stage = "withdrawal",
                    withdrawal_id = existing.id,
                    "idempotent withdrawal replayed"
                );
                return self.receipt(existing).await;
            }
        }

        if database
            .withdrawals()
            .has_pending_in(&mut tx, account.id)
            .await?
        {
            return Err(ServiceError::conflict(
                "PENDING_EXISTS",
                "a withdrawal request is already pending",
            ));
        }

        let account = database
            .accounts()
            .find_in(&mut tx, account.id)
            .await?
            .ok_or_else(|| ServiceError::not_found("account not found"))?;
        let totals = database.ledger().totals_in(&mut tx, account.id).await?;
        check_member_request(
            &RequestContext {
                status: account.status,
                eligible_from: account.eligible_from,
                today: self.context.today(),
                min_points: program.min_withdraw_points,
                balance: totals.balance(),
            },
            points,
        )?;

        let entry = appended(
            database
                .ledger()
                .append(
                    &mut tx,
                    &NewLedgerEntry {
                        account_id: account.id,
                        kind: LedgerKind::Withdraw,
                        points_delta: -points,
                        note: note.clone(),
                        admin_user_id: None,
                        accrual_day: None,
                        created_at: now,
                    },
                )
                .await?,
        )?;
        let withdrawal = database
            .withdrawals()
            .insert(
                &mut tx,
                &NewWithdrawal {
                    ledger_entry_id: entry.id,
                    account_id: account.id,
                    points,
                    eur: payout_eur(points, program.eur_per_point),
                    origin: WithdrawalOrigin::Member,
                    requested_at: now,
                    decided_by: None,
                    note,
                    idempotency_key,
                },
            )
            .await?;
        tx.commit().await.map_err(StorageError::from)?;

        counter!("withdrawal_transitions_total", "to" => withdrawal.status.as_str()).increment(1);
        info!(
            stage = "withdrawal",
            withdrawal_id = withdrawal.id,
            account_id = account.id,
            points,
            eur = %withdrawal.eur,
            "withdrawal requested"
        );

        self.receipt(withdrawal).await
    }

    async fn receipt(&self, withdrawal: Withdrawal) -> Result<WithdrawalReceipt, ServiceError> {
        let withdrawals = self
            .context
            .database()
            .withdrawals()
            .list_for_account(withdrawal.account_id)
            .await?;
        Ok(WithdrawalReceipt {
            withdrawal,
            withdrawals,
        })
    }

    /// The caller's withdrawals, newest first. Empty when not enrolled.
    pub async fn list_mine(&self, caller: &Caller) -> Result<Vec<Withdrawal>, ServiceError> {
        let program = self.context.program().await?;
        let database = self.context.database();
        match database
            .accounts()
            .find_by_user(program.id, caller.user_id)
            .await?
        {
            Some(account) => Ok(database.withdrawals().list_for_account(account.id).await?),
            None => Ok(Vec::new()),
        }
    }

    /// Creates an already `Approved` withdrawal on behalf of a member.
    pub async fn admin_create(
        &self,
        admin_user_id: i64,
        account_id: i64,
        points: i64,
        note: Option<String>,
    ) -> Result<Withdrawal, ServiceError> {
        if !(1..=MAX_POINTS).contains(&points) {
            return Err(RequestRejection::InvalidPoints.into());
        }
        let program = self.context.program().await?;
        let database = self.context.database();
        let note = non_blank(note);
        let now = self.context.now();

        let mut tx = database.begin().await?;
        if !database.accounts().touch(&mut tx, account_id, now).await? {
            return Err(ServiceError::not_found(format!(
                "account {account_id} not found"
            )));
        }
        let account = database
            .accounts()
            .find_in(&mut tx, account_id)
            .await?
            .ok_or_else(|| ServiceError::not_found(format!("account {account_id} not found")))?;
        let totals = database.ledger().totals_in(&mut tx, account_id).await?;
        check_admin_request(
            &RequestContext {
                status: account.status,
                eligible_from: account.eligible_from,
                today: self.context.today(),
                min_points: program.min_withdraw_points,
                balance: totals.balance(),
            },
            points,
        )?;

        let entry = appended(
            database
                .ledger()
                .append(
                    &mut tx,
                    &NewLedgerEntry {
                        account_id,
                        kind: LedgerKind::Withdraw,
                        points_delta: -points,
                        note: note.clone(),
                        admin_user_id: Some(admin_user_id),
                        accrual_day: None,
                        created_at: now,
                    },
                )
                .await?,
        )?;
        let withdrawal = database
            .withdrawals()
            .insert(
                &mut tx,
                &NewWithdrawal {
                    ledger_entry_id: entry.id,
                    account_id,
                    points,
                    eur: payout_eur(points, program.eur_per_point),
                    origin: WithdrawalOrigin::Admin,
                    requested_at: now,
                    decided_by: Some(admin_user_id),
                    note,
                    idempotency_key: None,
                },
            )
            .await?;
        tx.commit().await.map_err(StorageError::from)?;

        counter!("withdrawal_transitions_total", "to" => withdrawal.status.as_str()).increment(1);
        info!(
            stage = "withdrawal",
            withdrawal_id = withdrawal.id,
            account_id,
            admin_user_id,
            points,
            "withdrawal created by admin"
        );
        self.publish_decision(&withdrawal, WithdrawalAction::Approve).await;

        Ok(withdrawal)
    }

    pub async fn approve(
        &self,
        admin_user_id: i64,
        id: i64,
        note: Option<String>,
    ) -> Result<Withdrawal, ServiceError> {
        self.decide(
            admin_user_id,
            id,
            WithdrawalAction::Approve,
            Decision {
                payout_ref: None,
                note,
            },
        )
        .await
    }

    pub async fn reject(
        &self,
        admin_user_id: i64,
        id: i64,
        note: Option<String>,
    ) -> Result<Withdrawal, ServiceError> {
        self.decide(
            admin_user_id,
            id,
            WithdrawalAction::Reject,
            Decision {
                payout_ref: None,
                note,
            },
        )
        .await
    }

    /// Settles an approved withdrawal. The approval's `decided_at` is kept.
    pub async fn mark_paid(
        &self,
        admin_user_id: i64,
        id: i64,
        decision: Decision,
    ) -> Result<Withdrawal, ServiceError> {
        self.decide(admin_user_id, id, WithdrawalAction::MarkPaid, decision)
            .await
    }

    async fn decide(
        &self,
        admin_user_id: i64,
        id: i64,
        action: WithdrawalAction,
        decision: Decision,
    ) -> Result<Withdrawal, ServiceError> {
        let withdrawals = self.context.database().withdrawals();
        let current = withdrawals
            .find(id)
            .await?
            .ok_or_else(|| ServiceError::not_found(format!("withdrawal {id} not found")))?;
        let to = transition(current.status, action)?;

        let now = self.context.now();
        let settles = action == WithdrawalAction::MarkPaid;
        let update = TransitionUpdate {
            to,
            decided_by: (!settles).then_some(admin_user_id),
            decided_at: (!settles).then_some(now),
            paid_at: settles.then_some(now),
            payout_ref: non_blank(decision.payout_ref).filter(|_| settles),
            note: non_blank(decision.note),
        };

        let withdrawal = match withdrawals.transition(id, current.status, &update).await? {
            TransitionOutcome::Applied(withdrawal) => withdrawal,
            TransitionOutcome::Conflict(from) => {
                return Err(TransitionError { from, action }.into());
            }
            TransitionOutcome::NotFound => {
                return Err(ServiceError::not_found(format!("withdrawal {id} not found")));
            }
        };

        counter!("withdrawal_transitions_total", "to" => to.as_str()).increment(1);
        info!(
            stage = "withdrawal",
            withdrawal_id = id,
            admin_user_id,
            action = action.as_str(),
            from = %current.status,
            to = %to,
            "withdrawal decided"
        );
        self.publish_decision(&withdrawal, action).await;

        Ok(withdrawal)
    }

    async fn publish_decision(&self, withdrawal: &Withdrawal, action: WithdrawalAction) {
        self.events
            .publish(LoyaltyEvent::WithdrawalDecided {
                user_id: withdrawal.user_id,
                account_id: withdrawal.account_id,
                withdrawal_id: withdrawal.id,
                action,
                points: withdrawal.points,
                eur: withdrawal.eur,
                payout_ref: withdrawal.payout_ref.clone(),
                note: withdrawal.note.clone(),
            })
            .await;
    }

    /// Admin listing across the program, newest first.
    pub async fn list(&self, params: &ListParams) -> Result<WithdrawalList, ServiceError> {
        let page = params.page.unwrap_or(1);
        if page < 1 {
            return Err(ServiceError::invalid_input("page must be at least 1"));
        }
        let per_page = params.per_page.unwrap_or(DEFAULT_PER_PAGE);
        if !(1..=MAX_PER_PAGE).contains(&per_page) {
            return Err(ServiceError::invalid_input(format!(
                "perPage must be between 1 and {MAX_PER_PAGE}"
            )));
        }

        let offset = (page - 1)
            .checked_mul(per_page)
            .ok_or_else(|| ServiceError::invalid_input("page is out of range"))?;

        let program = self.context.program().await?;
        let result = self
            .context
            .database()
            .withdrawals()
            .list(&WithdrawalQuery {
                program_id: program.id,
                statuses: params.status.map(|filter| filter.statuses().to_vec()),
                account_id: params.account_id,
                limit: per_page,
                offset,
            })
            .await?;

        Ok(WithdrawalList {
            items: result.items.into_iter().map(Into::into).collect(),
            total: result.total,
            page,
            per_page,
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
