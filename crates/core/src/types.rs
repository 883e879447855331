use std::{fmt, str::FromStr};

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::workflow::WithdrawalStatus;

/// Raised when a persisted or user supplied string does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} value: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Identity resolved by the upstream session layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: i64,
    pub role: String,
    pub email: Option<String>,
    pub name: Option<String>,
}

impl Caller {
    pub fn is_admin(&self) -> bool {
        self.role.trim().eq_ignore_ascii_case("admin")
    }
}

/// Lifecycle status of a loyalty account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccountStatus {
    Active,
    Paused,
    Closed,
}

impl AccountStatus {
    /// Returns the canonical database representation for the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "Active",
            Self::Paused => "Paused",
            Self::Closed => "Closed",
        }
    }
}

impl FromStr for AccountStatus {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "Active" => Ok(Self::Active),
            "Paused" => Ok(Self::Paused),
            "Closed" => Ok(Self::Closed),
            other => Err(UnknownVariant::new("account status", other)),
        }
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Largest point amount a single ledger entry, request or program setting may carry.
///
/// Keeps every per-account `SUM` over the ledger well inside `i64`.
pub const MAX_POINTS: i64 = 1_000_000_000;

/// Canonical set of ledger entry kinds shared by every producer and by the projector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerKind {
    Enroll,
    Daily,
    Penalty,
    Withdraw,
    Status,
    Extend,
}

impl LedgerKind {
    pub const ALL: [LedgerKind; 6] = [
        Self::Enroll,
        Self::Daily,
        Self::Penalty,
        Self::Withdraw,
        Self::Status,
        Self::Extend,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Enroll => "enroll",
            Self::Daily => "daily",
            Self::Penalty => "penalty",
            Self::Withdraw => "withdraw",
            Self::Status => "status",
            Self::Extend => "extend",
        }
    }

    /// Returns `true` when `delta` has the sign this kind is allowed to carry
    /// and its magnitude is at most [`MAX_POINTS`].
    ///
    /// Credits are strictly positive, debits strictly negative and audit
    /// entries (status changes, extensions) never move points.
    pub fn accepts_delta(self, delta: i64) -> bool {
        let within = delta.unsigned_abs() <= MAX_POINTS as u64;
        match self {
            Self::Enroll | Self::Daily => delta > 0 && within,
            Self::Penalty | Self::Withdraw => delta < 0 && within,
            Self::Status | Self::Extend => delta == 0,
        }
    }
}

impl FromStr for LedgerKind {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| UnknownVariant::new("ledger kind", value))
    }
}

impl fmt::Display for LedgerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Loyalty account persisted per (program, member).
///
/// The `points_balance`/`total_*` fields mirror the ledger on a best-effort
/// basis only; read the projector for authoritative figures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: i64,
    pub program_id: i64,
    pub user_id: i64,
    pub status: AccountStatus,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub eligible_from: Option<NaiveDate>,
    pub points_balance: i64,
    pub total_earned: i64,
    pub total_penalty: i64,
    pub total_paid: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable point-changing event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub id: i64,
    pub account_id: i64,
    pub kind: LedgerKind,
    pub points_delta: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_user_id: Option<i64>,
}

/// Who created a withdrawal request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WithdrawalOrigin {
    Member,
    Admin,
}

impl WithdrawalOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Member => "member",
            Self::Admin => "admin",
        }
    }

    /// Status a freshly created withdrawal starts in.
    pub fn initial_status(self) -> WithdrawalStatus {
        match self {
            Self::Member => WithdrawalStatus::Pending,
            Self::Admin => WithdrawalStatus::Approved,
        }
    }
}

impl FromStr for WithdrawalOrigin {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "member" => Ok(Self::Member),
            "admin" => Ok(Self::Admin),
            other => Err(UnknownVariant::new("withdrawal origin", other)),
        }
    }
}

/// Workflow metadata overlaying a `withdraw` ledger entry.
///
/// `id` is the id of the decorated ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Withdrawal {
    pub id: i64,
    pub account_id: i64,
    pub user_id: i64,
    pub points: i64,
    pub eur: Decimal,
    pub status: WithdrawalStatus,
    pub origin: WithdrawalOrigin,
    pub requested_at: DateTime<Utc>,
    pub decided_by: Option<i64>,
    pub decided_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub payout_ref: Option<String>,
    pub note: Option<String>,
}

/// Delivery status of a queued notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationStatus {
    Queued,
    Sent,
    Failed,
}

impl NotificationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "Queued",
            Self::Sent => "Sent",
            Self::Failed => "Failed",
        }
    }
}

impl FromStr for NotificationStatus {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "Queued" => Ok(Self::Queued),
            "Sent" => Ok(Self::Sent),
            "Failed" => Ok(Self::Failed),
            other => Err(UnknownVariant::new("notification status", other)),
        }
    }
}

/// Row of the notification dispatch queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationItem {
    pub id: i64,
    pub kind: String,
    pub user_id: Option<i64>,
    pub email: Option<String>,
    pub payload: Value,
    pub status: NotificationStatus,
    pub dedupe_key: String,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}
