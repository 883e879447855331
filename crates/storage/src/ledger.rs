use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};

use loyalty_core::{
    projector::{LedgerTotals, MirrorDelta},
    types::{LedgerEntry, LedgerKind},
};

use crate::{is_unique_violation, to_rfc3339, StorageError};

const TOTALS_SQL: &str = "SELECT \
     COALESCE(SUM(CASE WHEN points_delta > 0 THEN points_delta ELSE 0 END), 0) AS earned, \
     COALESCE(SUM(CASE WHEN kind = ? THEN ABS(points_delta) ELSE 0 END), 0) AS penalty, \
     COALESCE(SUM(CASE WHEN kind = ? THEN ABS(points_delta) ELSE 0 END), 0) AS paid \
     FROM loyalty_ledger WHERE account_id = ?";

/// Repository for the append-only points ledger.
///
/// There is intentionally no update or delete; the schema rejects both with triggers.
#[derive(Clone)]
pub struct LedgerRepository {
    pub(crate) pool: SqlitePool,
}

impl LedgerRepository {
    /// Appends an entry and moves the account's mirror columns in the same transaction.
    ///
    /// Entries carrying an `accrual_day` are unique per `(account, kind, day)`; a second append
    /// for the same day yields [`AppendOutcome::Duplicate`] and writes nothing.
    pub async fn append(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        entry: &NewLedgerEntry,
    ) -> Result<AppendOutcome, StorageError> {
        if !entry.kind.accepts_delta(entry.points_delta) {
            return Err(StorageError::InvalidDelta {
                kind: entry.kind,
                delta: entry.points_delta,
            });
        }

        let created_at = to_rfc3339(entry.created_at);
        let result = sqlx::query_as::<_, LedgerRow>(
            "INSERT INTO loyalty_ledger \
             (account_id, kind, points_delta, note, admin_user_id, accrual_day, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             RETURNING id, account_id, kind, points_delta, note, admin_user_id, created_at",
        )
        .bind(entry.account_id)
        .bind(entry.kind.as_str())
        .bind(entry.points_delta)
        .bind(&entry.note)
        .bind(entry.admin_user_id)
        .bind(entry.accrual_day)
        .bind(&created_at)
        .fetch_one(&mut **tx)
        .await;

        let row = match result {
            Ok(row) => row,
            Err(err) if is_unique_violation(&err) => return Ok(AppendOutcome::Duplicate),
            Err(err) => return Err(err.into()),
        };

        let mirror = MirrorDelta::for_entry(entry.kind, entry.points_delta);
        if !mirror.is_zero() {
            sqlx::query(
                "UPDATE loyalty_accounts \
                 SET points_balance = MAX(points_balance + ?, 0), \
                     total_earned = total_earned + ?, \
                     total_penalty = total_penalty + ?, \
                     total_paid = total_paid + ?, \
                     updated_at = ? \
                 WHERE id = ?",
            )
            .bind(mirror.balance)
            .bind(mirror.earned)
            .bind(mirror.penalty)
            .bind(mirror.paid)
            .bind(&created_at)
            .bind(entry.account_id)
            .execute(&mut **tx)
            .await?;
        }

        Ok(AppendOutcome::Inserted(row.into_domain()?))
    }

    /// Most recent entries first.
    pub async fn recent(
        &self,
        account_id: i64,
        limit: i64,
    ) -> Result<Vec<LedgerEntry>, StorageError> {
        let rows = sqlx::query_as::<_, LedgerRow>(
            "SELECT id, account_id, kind, points_delta, note, admin_user_id, created_at \
             FROM loyalty_ledger WHERE account_id = ? \
             ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(account_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(LedgerRow::into_domain).collect()
    }

    /// Entries of `kind` in chronological order.
    pub async fn by_kind(
        &self,
        account_id: i64,
        kind: LedgerKind,
    ) -> Result<Vec<LedgerEntry>, StorageError> {
        let rows = sqlx::query_as::<_, LedgerRow>(
            "SELECT id, account_id, kind, points_delta, note, admin_user_id, created_at \
             FROM loyalty_ledger WHERE account_id = ? AND kind = ? ORDER BY id",
        )
        .bind(account_id)
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(LedgerRow::into_domain).collect()
    }

    /// Net points delta recorded at or after `since`.
    pub async fn net_since(
        &self,
        account_id: i64,
        since: DateTime<Utc>,
    ) -> Result<i64, StorageError> {
        let (net,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(SUM(points_delta), 0) FROM loyalty_ledger \
             WHERE account_id = ? AND created_at >= ?",
        )
        .bind(account_id)
        .bind(to_rfc3339(since))
        .fetch_one(&self.pool)
        .await?;
        Ok(net)
    }

    pub async fn totals(&self, account_id: i64) -> Result<LedgerTotals, StorageError> {
        let row: (i64, i64, i64) = sqlx::query_as(TOTALS_SQL)
            .bind(LedgerKind::Penalty.as_str())
            .bind(LedgerKind::Withdraw.as_str())
            .bind(account_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(totals_from(row))
    }

    /// Same as [`Self::totals`], read through an open transaction.
    pub async fn totals_in(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        account_id: i64,
    ) -> Result<LedgerTotals, StorageError> {
        let row: (i64, i64, i64) = sqlx::query_as(TOTALS_SQL)
            .bind(LedgerKind::Penalty.as_str())
            .bind(LedgerKind::Withdraw.as_str())
            .bind(account_id)
            .fetch_one(&mut **tx)
            .await?;
        Ok(totals_from(row))
    }

    /// `1 + count(accounts in the program whose earned total is strictly greater)`.
    pub async fn rank(&self, program_id: i64, earned: i64) -> Result<i64, StorageError> {
        let (above,): (i64,) = sqlx::query_as(
            r#"
SELECT COUNT(*) FROM (
    SELECT a.id,
           COALESCE(SUM(CASE WHEN l.points_delta > 0 THEN l.points_delta ELSE 0 END), 0) AS earned
      FROM loyalty_accounts AS a
      LEFT JOIN loyalty_ledger AS l ON l.account_id = a.id
     WHERE a.program_id = ?
     GROUP BY a.id
) WHERE earned > ?
            "#,
        )
        .bind(program_id)
        .bind(earned)
        .fetch_one(&self.pool)
        .await?;
        Ok(1 + above)
    }
}

fn totals_from((earned, penalty, paid): (i64, i64, i64)) -> LedgerTotals {
    LedgerTotals {
        earned,
        penalty,
        paid,
    }
}

/// Data required to append a ledger entry.
#[derive(Debug, Clone)]
pub struct NewLedgerEntry {
    pub account_id: i64,
    pub kind: LedgerKind,
    pub points_delta: i64,
    pub note: Option<String>,
    pub admin_user_id: Option<i64>,
    /// Set for once-per-day entries; scopes the uniqueness guard.
    pub accrual_day: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
}

/// Result of attempting to append to the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted(LedgerEntry),
    Duplicate,
}

impl AppendOutcome {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct LedgerRow {
    id: i64,
    account_id: i64,
    kind: String,
    points_delta: i64,
    note: Option<String>,
    admin_user_id: Option<i64>,
    created_at: DateTime<Utc>,
}

impl LedgerRow {
    fn into_domain(self) -> Result<LedgerEntry, StorageError> {
        Ok(LedgerEntry {
            id: self.id,
            account_id: self.account_id,
            kind: self.kind.parse()?,
            points_delta: self.points_delta,
            note: self.note,
            created_at: self.created_at,
            admin_user_id: self.admin_user_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{at, seed_account, setup_db};

    fn entry(account_id: i64, kind: LedgerKind, delta: i64) -> NewLedgerEntry {
        NewLedgerEntry {
            account_id,
            kind,
            points_delta: delta,
            note: None,
            admin_user_id: None,
            accrual_day: None,
            created_at: at(2025, 1, 1),
        }
    }

    async fn append(db: &crate::Database, entry: &NewLedgerEntry) -> AppendOutcome {
        let mut tx = db.begin().await.unwrap();
        let outcome = db.ledger().append(&mut tx, entry).await.unwrap();
        tx.commit().await.unwrap();
        outcome
    }

    #[tokio::test]
    async fn totals_follow_the_projection_rules() {
        let db = setup_db().await;
        let (_, account_id) = seed_account(&db, 1).await;
        append(&db, &entry(account_id, LedgerKind::Enroll, 100)).await;
        append(&db, &entry(account_id, LedgerKind::Penalty, -30)).await;
        append(&db, &entry(account_id, LedgerKind::Withdraw, -50)).await;
        append(&db, &entry(account_id, LedgerKind::Status, 0)).await;

        let totals = db.ledger().totals(account_id).await.unwrap();
        assert_eq!(
            totals,
            LedgerTotals {
                earned: 100,
                penalty: 30,
                paid: 50
            }
        );
        assert_eq!(totals.balance(), 20);

        let account = db.accounts().find(account_id).await.unwrap().unwrap();
        assert_eq!(account.points_balance, 20);
        assert_eq!(account.total_earned, 100);
        assert_eq!(account.total_penalty, 30);
        assert_eq!(account.total_paid, 50);
    }

    #[tokio::test]
    async fn daily_entry_is_unique_per_day() {
        let db = setup_db().await;
        let (_, account_id) = seed_account(&db, 1).await;
        let daily = NewLedgerEntry {
            accrual_day: NaiveDate::from_ymd_opt(2025, 1, 2),
            ..entry(account_id, LedgerKind::Daily, 1)
        };

        assert!(!append(&db, &daily).await.is_duplicate());
        assert!(append(&db, &daily).await.is_duplicate());

        let next_day = NewLedgerEntry {
            accrual_day: NaiveDate::from_ymd_opt(2025, 1, 3),
            ..daily.clone()
        };
        assert!(!append(&db, &next_day).await.is_duplicate());
        assert_eq!(
            db.ledger()
                .by_kind(account_id, LedgerKind::Daily)
                .await
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn wrong_sign_is_rejected_before_writing() {
        let db = setup_db().await;
        let (_, account_id) = seed_account(&db, 1).await;
        let mut tx = db.begin().await.unwrap();
        let err = db
            .ledger()
            .append(&mut tx, &entry(account_id, LedgerKind::Penalty, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidDelta { .. }));
    }

    #[tokio::test]
    async fn ledger_rows_cannot_be_updated_or_deleted() {
        let db = setup_db().await;
        let (_, account_id) = seed_account(&db, 1).await;
        append(&db, &entry(account_id, LedgerKind::Enroll, 100)).await;

        let update = sqlx::query("UPDATE loyalty_ledger SET points_delta = 500")
            .execute(db.pool())
            .await;
        assert!(update.is_err());
        let delete = sqlx::query("DELETE FROM loyalty_ledger").execute(db.pool()).await;
        assert!(delete.is_err());
        assert_eq!(db.ledger().totals(account_id).await.unwrap().earned, 100);
    }

    #[tokio::test]
    async fn rank_counts_strictly_higher_earners() {
        let db = setup_db().await;
        let (program_id, first) = seed_account(&db, 1).await;
        let (_, second) = seed_account(&db, 2).await;
        let (_, third) = seed_account(&db, 3).await;
        append(&db, &entry(first, LedgerKind::Enroll, 100)).await;
        append(&db, &entry(second, LedgerKind::Enroll, 150)).await;
        append(&db, &entry(third, LedgerKind::Enroll, 100)).await;

        let ledger = db.ledger();
        assert_eq!(ledger.rank(program_id, 150).await.unwrap(), 1);
        assert_eq!(ledger.rank(program_id, 100).await.unwrap(), 2);

        let listed = db.accounts().list_with_projection(program_id).await.unwrap();
        let ranks: Vec<(i64, i64)> = listed
            .iter()
            .map(|(account, projection)| (account.id, projection.rank))
            .collect();
        assert_eq!(ranks, vec![(second, 1), (first, 2), (third, 2)]);
    }

    #[tokio::test]
    async fn net_since_only_counts_recent_entries() {
        let db = setup_db().await;
        let (_, account_id) = seed_account(&db, 1).await;
        append(&db, &entry(account_id, LedgerKind::Enroll, 100)).await;
        let recent = NewLedgerEntry {
            created_at: at(2025, 1, 10),
            ..entry(account_id, LedgerKind::Penalty, -4)
        };
        append(&db, &recent).await;

        let net = db.ledger().net_since(account_id, at(2025, 1, 5)).await.unwrap();
        assert_eq!(net, -4);
    }
}
