use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{QueryBuilder, Sqlite, SqlitePool, Transaction};

use loyalty_core::{
    types::{Withdrawal, WithdrawalOrigin},
    workflow::WithdrawalStatus,
};

use crate::{to_rfc3339, StorageError};

const WITHDRAWAL_SELECT: &str = "SELECT w.ledger_entry_id AS id, w.account_id, a.user_id, w.points, \
     w.eur, w.status, w.origin, w.requested_at, w.decided_by, w.decided_at, w.paid_at, \
     w.payout_ref, w.note \
     FROM loyalty_withdrawals AS w \
     JOIN loyalty_accounts AS a ON a.id = w.account_id";

/// Repository for the workflow overlay on `withdraw` ledger entries.
#[derive(Clone)]
pub struct WithdrawalRepository {
    pub(crate) pool: SqlitePool,
}

impl WithdrawalRepository {
    /// Records the overlay for an already appended `withdraw` entry.
    pub async fn insert(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        withdrawal: &NewWithdrawal,
    ) -> Result<Withdrawal, StorageError> {
        let status = withdrawal.origin.initial_status();
        let requested_at = to_rfc3339(withdrawal.requested_at);
        let decided_at = (status == WithdrawalStatus::Approved).then(|| requested_at.clone());
        let decided_by = decided_at.as_ref().and(withdrawal.decided_by);

        sqlx::query(
            "INSERT INTO loyalty_withdrawals \
             (ledger_entry_id, account_id, points, eur, status, origin, requested_at, \
              decided_by, decided_at, note, idempotency_key) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(withdrawal.ledger_entry_id)
        .bind(withdrawal.account_id)
        .bind(withdrawal.points)
        .bind(withdrawal.eur.to_string())
        .bind(status.as_str())
        .bind(withdrawal.origin.as_str())
        .bind(&requested_at)
        .bind(decided_by)
        .bind(decided_at)
        .bind(&withdrawal.note)
        .bind(&withdrawal.idempotency_key)
        .execute(&mut **tx)
        .await?;

        self.find_in(tx, withdrawal.ledger_entry_id)
            .await?
            .ok_or_else(|| StorageError::Decode("inserted withdrawal not readable".into()))
    }

    pub async fn find(&self, id: i64) -> Result<Option<Withdrawal>, StorageError> {
        let row = sqlx::query_as::<_, WithdrawalRow>(&format!(
            "{WITHDRAWAL_SELECT} WHERE w.ledger_entry_id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(WithdrawalRow::into_domain).transpose()
    }

    pub async fn find_in(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        id: i64,
    ) -> Result<Option<Withdrawal>, StorageError> {
        let row = sqlx::query_as::<_, WithdrawalRow>(&format!(
            "{WITHDRAWAL_SELECT} WHERE w.ledger_entry_id = ?"
        ))
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;
        row.map(WithdrawalRow::into_domain).transpose()
    }

    /// Looks up the withdrawal a client already created with `key`.
    pub async fn find_by_idempotency_key_in(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        account_id: i64,
        key: &str,
    ) -> Result<Option<Withdrawal>, StorageError> {
        let row = sqlx::query_as::<_, WithdrawalRow>(&format!(
            "{WITHDRAWAL_SELECT} WHERE w.account_id = ? AND w.idempotency_key = ?"
        ))
        .bind(account_id)
        .bind(key)
        .fetch_optional(&mut **tx)
        .await?;
        row.map(WithdrawalRow::into_domain).transpose()
    }

    pub async fn has_pending_in(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        account_id: i64,
    ) -> Result<bool, StorageError> {
        let (pending,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM loyalty_withdrawals WHERE account_id = ? AND status = ?",
        )
        .bind(account_id)
        .bind(WithdrawalStatus::Pending.as_str())
        .fetch_one(&mut **tx)
        .await?;
        Ok(pending > 0)
    }

    /// Withdrawals of one account, newest first.
    pub async fn list_for_account(&self, account_id: i64) -> Result<Vec<Withdrawal>, StorageError> {
        let rows = sqlx::query_as::<_, WithdrawalRow>(&format!(
            "{WITHDRAWAL_SELECT} WHERE w.account_id = ? \
             ORDER BY w.requested_at DESC, w.ledger_entry_id DESC"
        ))
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(WithdrawalRow::into_domain).collect()
    }

    /// Filtered, paginated listing across a program, newest first.
    pub async fn list(&self, query: &WithdrawalQuery) -> Result<WithdrawalPage, StorageError> {
        let mut count = QueryBuilder::<Sqlite>::new(
            "SELECT COUNT(*) FROM loyalty_withdrawals AS w \
             JOIN loyalty_accounts AS a ON a.id = w.account_id",
        );
        push_filters(&mut count, query);
        let (total,): (i64,) = count.build_query_as().fetch_one(&self.pool).await?;

        let mut select = QueryBuilder::<Sqlite>::new(WITHDRAWAL_SELECT);
        push_filters(&mut select, query);
        select.push(" ORDER BY w.requested_at DESC, w.ledger_entry_id DESC LIMIT ");
        select.push_bind(query.limit);
        select.push(" OFFSET ");
        select.push_bind(query.offset);

        let rows: Vec<WithdrawalRow> = select.build_query_as().fetch_all(&self.pool).await?;
        let items = rows
            .into_iter()
            .map(WithdrawalRow::into_domain)
            .collect::<Result<_, _>>()?;

        Ok(WithdrawalPage { items, total })
    }

    /// Moves a withdrawal out of `expected` only if it is still there.
    ///
    /// Unset fields in `update` keep their stored value.
    pub async fn transition(
        &self,
        id: i64,
        expected: WithdrawalStatus,
        update: &TransitionUpdate,
    ) -> Result<TransitionOutcome, StorageError> {
        let result = sqlx::query(
            "UPDATE loyalty_withdrawals \
             SET status = ?, \
                 decided_by = COALESCE(?, decided_by), \
                 decided_at = COALESCE(?, decided_at), \
                 paid_at = COALESCE(?, paid_at), \
                 payout_ref = COALESCE(?, payout_ref), \
                 note = COALESCE(?, note) \
             WHERE ledger_entry_id = ? AND status = ?",
        )
        .bind(update.to.as_str())
        .bind(update.decided_by)
        .bind(update.decided_at.map(to_rfc3339))
        .bind(update.paid_at.map(to_rfc3339))
        .bind(&update.payout_ref)
        .bind(&update.note)
        .bind(id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        let current = self.find(id).await?;
        Ok(match current {
            None => TransitionOutcome::NotFound,
            Some(withdrawal) if result.rows_affected() > 0 => TransitionOutcome::Applied(withdrawal),
            Some(withdrawal) => TransitionOutcome::Conflict(withdrawal.status),
        })
    }
}

fn push_filters(builder: &mut QueryBuilder<'_, Sqlite>, query: &WithdrawalQuery) {
    builder.push(" WHERE a.program_id = ");
    builder.push_bind(query.program_id);

    if let Some(statuses) = &query.statuses {
        builder.push(" AND w.status IN (");
        let mut separated = builder.separated(", ");
        for status in statuses {
            separated.push_bind(status.as_str());
        }
        separated.push_unseparated(")");
    }

    if let Some(account_id) = query.account_id {
        builder.push(" AND w.account_id = ");
        builder.push_bind(account_id);
    }
}

/// Data required to attach workflow metadata to a `withdraw` entry.
#[derive(Debug, Clone)]
pub struct NewWithdrawal {
    pub ledger_entry_id: i64,
    pub account_id: i64,
    pub points: i64,
    pub eur: Decimal,
    pub origin: WithdrawalOrigin,
    pub requested_at: DateTime<Utc>,
    /// Admin who created the request; recorded as the approver for admin-origin rows.
    pub decided_by: Option<i64>,
    pub note: Option<String>,
    pub idempotency_key: Option<String>,
}

/// Filters for the admin listing. `statuses: None` means every status.
#[derive(Debug, Clone)]
pub struct WithdrawalQuery {
    pub program_id: i64,
    pub statuses: Option<Vec<WithdrawalStatus>>,
    pub account_id: Option<i64>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WithdrawalPage {
    pub items: Vec<Withdrawal>,
    pub total: i64,
}

/// Field changes applied together with a status move.
#[derive(Debug, Clone)]
pub struct TransitionUpdate {
    pub to: WithdrawalStatus,
    pub decided_by: Option<i64>,
    pub decided_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub payout_ref: Option<String>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Applied(Withdrawal),
    /// The row was no longer in the expected status; carries what it holds now.
    Conflict(WithdrawalStatus),
    NotFound,
}

#[derive(Debug, sqlx::FromRow)]
struct WithdrawalRow {
    id: i64,
    account_id: i64,
    user_id: i64,
    points: i64,
    eur: String,
    status: String,
    origin: String,
    requested_at: DateTime<Utc>,
    decided_by: Option<i64>,
    decided_at: Option<DateTime<Utc>>,
    paid_at: Option<DateTime<Utc>>,
    payout_ref: Option<String>,
    note: Option<String>,
}

impl WithdrawalRow {
    fn into_domain(self) -> Result<Withdrawal, StorageError> {
        let eur = Decimal::from_str(&self.eur)
            .map_err(|err| StorageError::Decode(format!("withdrawal eur {}: {err}", self.eur)))?;
        Ok(Withdrawal {
            id: self.id,
            account_id: self.account_id,
            user_id: self.user_id,
            points: self.points,
            eur,
            status: self.status.parse()?,
            origin: self.origin.parse()?,
            requested_at: self.requested_at,
            decided_by: self.decided_by,
            decided_at: self.decided_at,
            paid_at: self.paid_at,
            payout_ref: self.payout_ref,
            note: self.note,
        })
    }
}
