use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};

use loyalty_core::{
    projector::{BalanceProjection, LedgerTotals},
    types::{Account, AccountStatus},
};

use crate::{is_unique_violation, to_rfc3339, StorageError};

const ACCOUNT_COLUMNS: &str = "id, program_id, user_id, status, start_date, end_date, eligible_from, \
     points_balance, total_earned, total_penalty, total_paid, created_at, updated_at";

/// Repository for loyalty accounts and their mirror columns.
#[derive(Clone)]
pub struct AccountRepository {
    pub(crate) pool: SqlitePool,
}

impl AccountRepository {
    pub async fn find(&self, account_id: i64) -> Result<Option<Account>, StorageError> {
        let row = sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM loyalty_accounts WHERE id = ?"
        ))
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(AccountRow::into_domain).transpose()
    }

    /// Loads an account inside an open transaction.
    pub async fn find_in(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        account_id: i64,
    ) -> Result<Option<Account>, StorageError> {
        let row = sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM loyalty_accounts WHERE id = ?"
        ))
        .bind(account_id)
        .fetch_optional(&mut **tx)
        .await?;
        row.map(AccountRow::into_domain).transpose()
    }

    pub async fn find_by_user(
        &self,
        program_id: i64,
        user_id: i64,
    ) -> Result<Option<Account>, StorageError> {
        let row = sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM loyalty_accounts WHERE program_id = ? AND user_id = ?"
        ))
        .bind(program_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(AccountRow::into_domain).transpose()
    }

    /// Creates an `Active` account. A second account for the same (program, user) is reported as
    /// [`InsertAccountOutcome::Duplicate`].
    pub async fn insert(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        account: &NewAccount,
    ) -> Result<InsertAccountOutcome, StorageError> {
        let created_at = to_rfc3339(account.created_at);
        let result = sqlx::query_as::<_, AccountRow>(&format!(
            "INSERT INTO loyalty_accounts \
             (program_id, user_id, status, start_date, end_date, eligible_from, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(account.program_id)
        .bind(account.user_id)
        .bind(AccountStatus::Active.as_str())
        .bind(account.start_date)
        .bind(account.end_date)
        .bind(account.eligible_from)
        .bind(&created_at)
        .bind(&created_at)
        .fetch_one(&mut **tx)
        .await;

        match result {
            Ok(row) => Ok(InsertAccountOutcome::Inserted(row.into_domain()?)),
            Err(err) if is_unique_violation(&err) => Ok(InsertAccountOutcome::Duplicate),
            Err(err) => Err(err.into()),
        }
    }

    /// Bumps `updated_at`, taking the write lock for the rest of the transaction.
    pub async fn touch(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        account_id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query("UPDATE loyalty_accounts SET updated_at = ? WHERE id = ?")
            .bind(to_rfc3339(now))
            .bind(account_id)
            .execute(&mut **tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_status(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        account_id: i64,
        status: AccountStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query("UPDATE loyalty_accounts SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(to_rfc3339(now))
            .bind(account_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    pub async fn set_end_date(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        account_id: i64,
        end_date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query("UPDATE loyalty_accounts SET end_date = ?, updated_at = ? WHERE id = ?")
            .bind(end_date)
            .bind(to_rfc3339(now))
            .bind(account_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Accounts with status `Active` in the program, oldest first.
    pub async fn list_active(&self, program_id: i64) -> Result<Vec<Account>, StorageError> {
        let rows = sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM loyalty_accounts \
             WHERE program_id = ? AND status = ? ORDER BY id"
        ))
        .bind(program_id)
        .bind(AccountStatus::Active.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(AccountRow::into_domain).collect()
    }

    /// Every account of the program with its ledger projection and rank, best rank first.
    pub async fn list_with_projection(
        &self,
        program_id: i64,
    ) -> Result<Vec<(Account, BalanceProjection)>, StorageError> {
        let rows = sqlx::query_as::<_, AccountProjectionRow>(
            r#"
WITH totals AS (
    SELECT a.id AS account_id,
           COALESCE(SUM(CASE WHEN l.points_delta > 0 THEN l.points_delta ELSE 0 END), 0) AS earned,
           COALESCE(SUM(CASE WHEN l.kind = 'penalty' THEN ABS(l.points_delta) ELSE 0 END), 0) AS penalty,
           COALESCE(SUM(CASE WHEN l.kind = 'withdraw' THEN ABS(l.points_delta) ELSE 0 END), 0) AS paid
      FROM loyalty_accounts AS a
      LEFT JOIN loyalty_ledger AS l ON l.account_id = a.id
     WHERE a.program_id = ?
     GROUP BY a.id
)
SELECT a.id, a.program_id, a.user_id, a.status, a.start_date, a.end_date, a.eligible_from,
       a.points_balance, a.total_earned, a.total_penalty, a.total_paid, a.created_at, a.updated_at,
       t.earned, t.penalty, t.paid,
       1 + (SELECT COUNT(*) FROM totals AS o WHERE o.earned > t.earned) AS rank
  FROM loyalty_accounts AS a
  JOIN totals AS t ON t.account_id = a.id
 ORDER BY rank ASC, a.id ASC
            "#,
        )
        .bind(program_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let totals = LedgerTotals {
                    earned: row.earned,
                    penalty: row.penalty,
                    paid: row.paid,
                };
                let projection = totals.with_rank(row.rank);
                Ok((row.account.into_domain()?, projection))
            })
            .collect()
    }
}

/// Data required to open an account.
pub struct NewAccount {
    pub program_id: i64,
    pub user_id: i64,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub eligible_from: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum InsertAccountOutcome {
    Inserted(Account),
    Duplicate,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct AccountRow {
    id: i64,
    program_id: i64,
    user_id: i64,
    status: String,
    start_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
    eligible_from: Option<NaiveDate>,
    points_balance: i64,
    total_earned: i64,
    total_penalty: i64,
    total_paid: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl AccountRow {
    pub(crate) fn into_domain(self) -> Result<Account, StorageError> {
        Ok(Account {
            id: self.id,
            program_id: self.program_id,
            user_id: self.user_id,
            status: self.status.parse()?,
            start_date: self.start_date,
            end_date: self.end_date,
            eligible_from: self.eligible_from,
            points_balance: self.points_balance,
            total_earned: self.total_earned,
            total_penalty: self.total_penalty,
            total_paid: self.total_paid,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AccountProjectionRow {
    #[sqlx(flatten)]
    account: AccountRow,
    earned: i64,
    penalty: i64,
    paid: i64,
    rank: i64,
}
