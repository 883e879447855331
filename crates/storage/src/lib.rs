mod accounts;
mod ledger;
mod notifications;
mod program;
mod users;
mod withdrawals;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{migrate::MigrateError, sqlite::SqlitePoolOptions, Sqlite, SqlitePool, Transaction};
use thiserror::Error;

use loyalty_core::{
    program::SettingDecodeError,
    types::{LedgerKind, UnknownVariant},
};

pub use accounts::{AccountRepository, InsertAccountOutcome, NewAccount};
pub use ledger::{AppendOutcome, LedgerRepository, NewLedgerEntry};
pub use notifications::{EnqueueOutcome, NotificationRepository, QueuedNotification};
pub use program::ProgramRepository;
pub use users::UserRepository;
pub use withdrawals::{
    NewWithdrawal, TransitionOutcome, TransitionUpdate, WithdrawalPage, WithdrawalQuery,
    WithdrawalRepository,
};

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(StorageError::Connect)?;

        apply_pragmas(&pool).await?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Begins a SQLite transaction.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, StorageError> {
        Ok(self.pool.begin().await?)
    }

    /// Returns a handle for program rows and their tagged settings.
    pub fn programs(&self) -> ProgramRepository {
        ProgramRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for loyalty accounts.
    pub fn accounts(&self) -> AccountRepository {
        AccountRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for the append-only points ledger.
    pub fn ledger(&self) -> LedgerRepository {
        LedgerRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for withdrawal metadata.
    pub fn withdrawals(&self) -> WithdrawalRepository {
        WithdrawalRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for the notification dispatch queue.
    pub fn notifications(&self) -> NotificationRepository {
        NotificationRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for the contact directory.
    pub fn users(&self) -> UserRepository {
        UserRepository {
            pool: self.pool.clone(),
        }
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn apply_pragmas(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA journal_mode = WAL;")
        .fetch_one(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA synchronous = NORMAL;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    Ok(())
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to apply pragma: {0}")]
    Pragma(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to decode stored row: {0}")]
    Decode(String),
    #[error("{kind} entries cannot carry a delta of {delta}")]
    InvalidDelta { kind: LedgerKind, delta: i64 },
}

impl From<UnknownVariant> for StorageError {
    fn from(err: UnknownVariant) -> Self {
        Self::Decode(err.to_string())
    }
}

impl From<SettingDecodeError> for StorageError {
    fn from(err: SettingDecodeError) -> Self {
        Self::Decode(err.to_string())
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("2067"),
        _ => false,
    }
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{TimeZone, Utc};

    use super::*;

    pub async fn setup_db() -> Database {
        let db = Database::connect("sqlite::memory:?cache=shared")
            .await
            .expect("connect");
        db.run_migrations().await.expect("migrations");
        db
    }

    pub fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 9, 0, 0).unwrap()
    }

    /// Creates the default program and one account for `user_id`, returning `(program_id, account_id)`.
    pub async fn seed_account(db: &Database, user_id: i64) -> (i64, i64) {
        let program = db
            .programs()
            .get_or_create("STAFF", at(2025, 1, 1))
            .await
            .expect("program");
        let mut tx = db.begin().await.expect("begin");
        let outcome = db
            .accounts()
            .insert(
                &mut tx,
                &NewAccount {
                    program_id: program.id,
                    user_id,
                    start_date: Some(at(2025, 1, 1).date_naive()),
                    end_date: Some(at(2025, 7, 1).date_naive()),
                    eligible_from: Some(at(2025, 4, 1).date_naive()),
                    created_at: at(2025, 1, 1),
                },
            )
            .await
            .expect("insert account");
        tx.commit().await.expect("commit");
        match outcome {
            InsertAccountOutcome::Inserted(account) => (program.id, account.id),
            InsertAccountOutcome::Duplicate => panic!("account already exists"),
        }
    }
}
