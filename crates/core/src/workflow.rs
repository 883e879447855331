use std::{fmt, str::FromStr};

use chrono::NaiveDate;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{AccountStatus, UnknownVariant, MAX_POINTS};

/// Persisted lifecycle status of a withdrawal request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WithdrawalStatus {
    Pending,
    Approved,
    Paid,
    Rejected,
}

impl WithdrawalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Approved => "Approved",
            Self::Paid => "Paid",
            Self::Rejected => "Rejected",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Paid | Self::Rejected)
    }

    /// Label used by list views. Both terminal outcomes collapse into `No Action`.
    pub fn label(self) -> StatusLabel {
        match self {
            Self::Pending => StatusLabel::Pending,
            Self::Approved => StatusLabel::Approved,
            Self::Paid | Self::Rejected => StatusLabel::NoAction,
        }
    }
}

impl FromStr for WithdrawalStatus {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "Pending" => Ok(Self::Pending),
            "Approved" => Ok(Self::Approved),
            "Paid" => Ok(Self::Paid),
            "Rejected" => Ok(Self::Rejected),
            other => Err(UnknownVariant::new("withdrawal status", other)),
        }
    }
}

impl fmt::Display for WithdrawalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Presentation label for withdrawal list views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusLabel {
    Pending,
    Approved,
    #[serde(rename = "No Action")]
    NoAction,
}

impl StatusLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Approved => "Approved",
            Self::NoAction => "No Action",
        }
    }

    /// Stored statuses that surface under this label.
    pub fn statuses(self) -> &'static [WithdrawalStatus] {
        match self {
            Self::Pending => &[WithdrawalStatus::Pending],
            Self::Approved => &[WithdrawalStatus::Approved],
            Self::NoAction => &[WithdrawalStatus::Paid, WithdrawalStatus::Rejected],
        }
    }
}

/// Filter accepted by the admin list: either a display label or a concrete stored status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    Label(StatusLabel),
    Stored(WithdrawalStatus),
}

impl StatusFilter {
    pub fn statuses(self) -> &'static [WithdrawalStatus] {
        match self {
            Self::Label(label) => label.statuses(),
            Self::Stored(WithdrawalStatus::Pending) => &[WithdrawalStatus::Pending],
            Self::Stored(WithdrawalStatus::Approved) => &[WithdrawalStatus::Approved],
            Self::Stored(WithdrawalStatus::Paid) => &[WithdrawalStatus::Paid],
            Self::Stored(WithdrawalStatus::Rejected) => &[WithdrawalStatus::Rejected],
        }
    }
}

impl FromStr for StatusFilter {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.eq_ignore_ascii_case("no action") || trimmed.eq_ignore_ascii_case("noaction") {
            return Ok(Self::Label(StatusLabel::NoAction));
        }
        match trimmed.to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Label(StatusLabel::Pending)),
            "approved" => Ok(Self::Label(StatusLabel::Approved)),
            "paid" => Ok(Self::Stored(WithdrawalStatus::Paid)),
            "rejected" => Ok(Self::Stored(WithdrawalStatus::Rejected)),
            _ => Err(UnknownVariant::new("withdrawal status filter", value)),
        }
    }
}

/// Admin decision applied to a withdrawal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WithdrawalAction {
    Approve,
    MarkPaid,
    Reject,
}

impl WithdrawalAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::MarkPaid => "mark_paid",
            Self::Reject => "reject",
        }
    }
}

/// Raised when an action is not legal from the current status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot {} a withdrawal that is {}", action.as_str(), from.as_str())]
pub struct TransitionError {
    pub from: WithdrawalStatus,
    pub action: WithdrawalAction,
}

/// Resolves the status produced by `action`.
///
/// Only `Pending -> Approved`, `Approved -> Paid` and `Pending -> Rejected` are legal.
pub fn transition(
    current: WithdrawalStatus,
    action: WithdrawalAction,
) -> Result<WithdrawalStatus, TransitionError> {
    use WithdrawalAction as A;
    use WithdrawalStatus as S;

    match (current, action) {
        (S::Pending, A::Approve) => Ok(S::Approved),
        (S::Approved, A::MarkPaid) => Ok(S::Paid),
        (S::Pending, A::Reject) => Ok(S::Rejected),
        (from, action) => Err(TransitionError { from, action }),
    }
}

/// Reasons a withdrawal request is refused before anything is written.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestRejection {
    #[error("points must be a positive integer no greater than {}", MAX_POINTS)]
    InvalidPoints,
    #[error("account is {0}, withdrawals require an active account")]
    AccountNotActive(AccountStatus),
    #[error("withdrawals open on {eligible_from}")]
    NotEligibleYet { eligible_from: NaiveDate },
    #[error("minimum withdrawal is {minimum} points")]
    BelowMinimum { minimum: i64 },
    #[error("requested {requested} points but only {available} are available")]
    InsufficientPoints { requested: i64, available: i64 },
}

impl RequestRejection {
    /// Stable machine code surfaced to callers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidPoints => "INVALID_INPUT",
            Self::AccountNotActive(_) => "ACCOUNT_NOT_ACTIVE",
            Self::NotEligibleYet { .. } => "NOT_ELIGIBLE_YET",
            Self::BelowMinimum { .. } => "BELOW_MINIMUM",
            Self::InsufficientPoints { .. } => "INSUFFICIENT_POINTS",
        }
    }
}

/// Inputs shared by member and admin request checks.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext {
    pub status: AccountStatus,
    pub eligible_from: Option<NaiveDate>,
    pub today: NaiveDate,
    pub min_points: i64,
    pub balance: i64,
}

/// Validates a member-initiated request in order: status, eligibility date, minimum, balance.
pub fn check_member_request(ctx: &RequestContext, points: i64) -> Result<(), RequestRejection> {
    if !(1..=MAX_POINTS).contains(&points) {
        return Err(RequestRejection::InvalidPoints);
    }
    if ctx.status != AccountStatus::Active {
        return Err(RequestRejection::AccountNotActive(ctx.status));
    }
    if let Some(eligible_from) = ctx.eligible_from {
        if ctx.today < eligible_from {
            return Err(RequestRejection::NotEligibleYet { eligible_from });
        }
    }
    if points < ctx.min_points {
        return Err(RequestRejection::BelowMinimum {
            minimum: ctx.min_points,
        });
    }
    check_balance(ctx.balance, points)
}

/// Admin-created withdrawals skip the eligibility date and minimum but never overdraw.
pub fn check_admin_request(ctx: &RequestContext, points: i64) -> Result<(), RequestRejection> {
    if !(1..=MAX_POINTS).contains(&points) {
        return Err(RequestRejection::InvalidPoints);
    }
    if ctx.status != AccountStatus::Active {
        return Err(RequestRejection::AccountNotActive(ctx.status));
    }
    check_balance(ctx.balance, points)
}

fn check_balance(balance: i64, points: i64) -> Result<(), RequestRejection> {
    if points > balance {
        return Err(RequestRejection::InsufficientPoints {
            requested: points,
            available: balance,
        });
    }
    Ok(())
}

/// Payable amount for `points`, rounded half away from zero to cents.
pub fn payout_eur(points: i64, eur_per_point: Decimal) -> Decimal {
    (Decimal::from(points) * eur_per_point)
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ctx(today: NaiveDate) -> RequestContext {
        RequestContext {
            status: AccountStatus::Active,
            eligible_from: NaiveDate::from_ymd_opt(2025, 4, 1),
            today,
            min_points: 100,
            balance: 130,
        }
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn legal_transitions_resolve() {
        use WithdrawalAction as A;
        use WithdrawalStatus as S;
        assert_eq!(transition(S::Pending, A::Approve), Ok(S::Approved));
        assert_eq!(transition(S::Approved, A::MarkPaid), Ok(S::Paid));
        assert_eq!(transition(S::Pending, A::Reject), Ok(S::Rejected));
    }

    #[test]
    fn every_other_transition_is_rejected() {
        use WithdrawalAction as A;
        use WithdrawalStatus as S;
        let legal = [
            (S::Pending, A::Approve),
            (S::Approved, A::MarkPaid),
            (S::Pending, A::Reject),
        ];
        for from in [S::Pending, S::Approved, S::Paid, S::Rejected] {
            for action in [A::Approve, A::MarkPaid, A::Reject] {
                if legal.contains(&(from, action)) {
                    continue;
                }
                assert_eq!(
                    transition(from, action),
                    Err(TransitionError { from, action }),
                    "{from} + {action:?}"
                );
            }
        }
    }

    #[test]
    fn terminal_statuses_share_a_label_but_not_a_status() {
        assert_eq!(WithdrawalStatus::Paid.label(), StatusLabel::NoAction);
        assert_eq!(WithdrawalStatus::Rejected.label(), StatusLabel::NoAction);
        assert_ne!(WithdrawalStatus::Paid, WithdrawalStatus::Rejected);
        assert_eq!(StatusLabel::NoAction.as_str(), "No Action");
    }

    #[test]
    fn status_filter_accepts_labels_and_stored_values() {
        assert_eq!(
            "No Action".parse::<StatusFilter>().unwrap().statuses(),
            &[WithdrawalStatus::Paid, WithdrawalStatus::Rejected]
        );
        assert_eq!(
            "paid".parse::<StatusFilter>().unwrap().statuses(),
            &[WithdrawalStatus::Paid]
        );
        assert_eq!(
            "Pending".parse::<StatusFilter>().unwrap(),
            StatusFilter::Label(StatusLabel::Pending)
        );
        assert!("cancelled".parse::<StatusFilter>().is_err());
    }

    #[test]
    fn member_request_is_blocked_before_eligibility() {
        let err = check_member_request(&ctx(day(2025, 2, 1)), 50).unwrap_err();
        assert_eq!(err.code(), "NOT_ELIGIBLE_YET");
    }

    #[test]
    fn member_request_checks_minimum_then_balance() {
        let today = day(2025, 4, 2);
        assert_eq!(
            check_member_request(&ctx(today), 50).unwrap_err().code(),
            "BELOW_MINIMUM"
        );
        assert_eq!(
            check_member_request(&ctx(today), 131).unwrap_err().code(),
            "INSUFFICIENT_POINTS"
        );
        assert!(check_member_request(&ctx(today), 130).is_ok());
    }

    #[test]
    fn paused_account_fails_before_other_checks() {
        let context = RequestContext {
            status: AccountStatus::Paused,
            ..ctx(day(2025, 2, 1))
        };
        assert_eq!(
            check_member_request(&context, 10).unwrap_err().code(),
            "ACCOUNT_NOT_ACTIVE"
        );
    }

    #[test]
    fn non_positive_points_are_invalid_input() {
        assert_eq!(
            check_member_request(&ctx(day(2025, 5, 1)), 0)
                .unwrap_err()
                .code(),
            "INVALID_INPUT"
        );
        assert_eq!(
            check_admin_request(&ctx(day(2025, 5, 1)), -3)
                .unwrap_err()
                .code(),
            "INVALID_INPUT"
        );
    }

    #[test]
    fn points_above_ceiling_are_invalid_input() {
        let context = RequestContext {
            balance: i64::MAX,
            min_points: 0,
            ..ctx(day(2025, 5, 1))
        };
        assert!(check_admin_request(&context, MAX_POINTS).is_ok());
        assert_eq!(
            check_admin_request(&context, MAX_POINTS + 1),
            Err(RequestRejection::InvalidPoints)
        );
        assert_eq!(
            check_member_request(&context, i64::MAX),
            Err(RequestRejection::InvalidPoints)
        );
    }

    #[test]
    fn admin_request_skips_date_and_minimum() {
        let context = ctx(day(2025, 1, 15));
        assert!(check_admin_request(&context, 10).is_ok());
        assert_eq!(
            check_admin_request(&context, 500).unwrap_err().code(),
            "INSUFFICIENT_POINTS"
        );
    }

    #[test]
    fn payout_rounds_to_cents() {
        assert_eq!(payout_eur(50, dec!(1)), dec!(50.00));
        assert_eq!(payout_eur(3, dec!(0.335)), dec!(1.01));
        assert_eq!(payout_eur(7, dec!(0.125)), dec!(0.88));
    }
}
