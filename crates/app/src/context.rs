use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use metrics::counter;

use loyalty_core::{calendar::local_day, program::ProgramConfig, types::LedgerEntry};
use loyalty_storage::{AppendOutcome, Database, StorageError};

use crate::error::ServiceError;

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Everything a loyalty component needs: the store, the clock and the program it operates on.
#[derive(Clone)]
pub struct LoyaltyContext {
    database: Database,
    clock: Clock,
    program_code: Arc<str>,
    timezone: Tz,
}

impl LoyaltyContext {
    pub fn new(database: Database, program_code: &str, timezone: Tz) -> Self {
        Self {
            database,
            clock: Arc::new(Utc::now),
            program_code: Arc::from(program_code),
            timezone,
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Today's date in the program zone.
    pub fn today(&self) -> NaiveDate {
        local_day(self.now(), self.timezone)
    }

    pub fn program_code(&self) -> &str {
        &self.program_code
    }

    /// Loads the program, creating it with defaults on first access.
    pub async fn program(&self) -> Result<ProgramConfig, ServiceError> {
        Ok(self
            .database
            .programs()
            .get_or_create(&self.program_code, self.now())
            .await?)
    }
}

/// Counts one ledger append by kind.
pub(crate) fn record_append(entry: &LedgerEntry) {
    counter!("ledger_appends_total", "kind" => entry.kind.as_str()).increment(1);
}

/// Unwraps an append that carries no accrual day and therefore cannot collide.
pub(crate) fn appended(outcome: AppendOutcome) -> Result<LedgerEntry, ServiceError> {
    match outcome {
        AppendOutcome::Inserted(entry) => {
            record_append(&entry);
            Ok(entry)
        }
        AppendOutcome::Duplicate => Err(ServiceError::Dependency(StorageError::Decode(
            "ledger rejected a non-accrual entry as duplicate".into(),
        ))),
    }
}
