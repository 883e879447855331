use serde::Serialize;

use crate::types::{LedgerEntry, LedgerKind};

/// Aggregates folded from the ledger of a single account.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerTotals {
    pub earned: i64,
    pub penalty: i64,
    pub paid: i64,
}

impl LedgerTotals {
    /// Folds a ledger slice into totals.
    ///
    /// `paid` counts every `withdraw` entry regardless of the withdrawal's
    /// lifecycle status, since the entry is written when the request is made.
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a LedgerEntry>) -> Self {
        entries.into_iter().fold(Self::default(), |totals, entry| {
            totals.apply(entry.kind, entry.points_delta)
        })
    }

    /// Returns the totals after one more entry. Sums saturate at `i64::MAX`.
    pub fn apply(self, kind: LedgerKind, delta: i64) -> Self {
        let mut next = self;
        if delta > 0 {
            next.earned = next.earned.saturating_add(delta);
        }
        let magnitude = i64::try_from(delta.unsigned_abs()).unwrap_or(i64::MAX);
        match kind {
            LedgerKind::Penalty => next.penalty = next.penalty.saturating_add(magnitude),
            LedgerKind::Withdraw => next.paid = next.paid.saturating_add(magnitude),
            _ => {}
        }
        next
    }

    /// Live balance, floored at zero.
    pub fn balance(&self) -> i64 {
        self.earned
            .saturating_sub(self.penalty)
            .saturating_sub(self.paid)
            .max(0)
    }

    pub fn with_rank(self, rank: i64) -> BalanceProjection {
        BalanceProjection {
            earned: self.earned,
            penalty: self.penalty,
            paid: self.paid,
            balance: self.balance(),
            rank,
        }
    }
}

/// Read-time projection returned to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BalanceProjection {
    pub earned: i64,
    pub penalty: i64,
    pub paid: i64,
    pub balance: i64,
    pub rank: i64,
}

/// `rank = 1 + count(accounts whose earned is strictly greater)`.
pub fn rank_for(earned: i64, others: impl IntoIterator<Item = i64>) -> i64 {
    1 + others.into_iter().filter(|other| *other > earned).count() as i64
}

/// Increment applied to the cached mirror columns of an account.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MirrorDelta {
    pub balance: i64,
    pub earned: i64,
    pub penalty: i64,
    pub paid: i64,
}

impl MirrorDelta {
    pub fn for_entry(kind: LedgerKind, delta: i64) -> Self {
        let totals = LedgerTotals::default().apply(kind, delta);
        Self {
            balance: delta,
            earned: totals.earned,
            penalty: totals.penalty,
            paid: totals.paid,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn entry(kind: LedgerKind, delta: i64) -> LedgerEntry {
        LedgerEntry {
            id: 0,
            account_id: 1,
            kind,
            points_delta: delta,
            note: None,
            created_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            admin_user_id: None,
        }
    }

    #[test]
    fn balance_is_earned_minus_penalty_minus_paid() {
        let entries = vec![
            entry(LedgerKind::Enroll, 100),
            entry(LedgerKind::Daily, 1),
            entry(LedgerKind::Daily, 1),
            entry(LedgerKind::Penalty, -12),
            entry(LedgerKind::Withdraw, -50),
            entry(LedgerKind::Status, 0),
        ];
        let totals = LedgerTotals::from_entries(&entries);
        assert_eq!(
            totals,
            LedgerTotals {
                earned: 102,
                penalty: 12,
                paid: 50
            }
        );
        assert_eq!(totals.balance(), 40);
    }

    #[test]
    fn balance_is_floored_at_zero() {
        let entries = vec![
            entry(LedgerKind::Enroll, 10),
            entry(LedgerKind::Penalty, -25),
        ];
        assert_eq!(LedgerTotals::from_entries(&entries).balance(), 0);
    }

    #[test]
    fn totals_saturate_instead_of_overflowing() {
        let totals = LedgerTotals::default()
            .apply(LedgerKind::Enroll, i64::MAX)
            .apply(LedgerKind::Daily, 1)
            .apply(LedgerKind::Penalty, i64::MIN)
            .apply(LedgerKind::Penalty, -1);
        assert_eq!(totals.earned, i64::MAX);
        assert_eq!(totals.penalty, i64::MAX);
        assert_eq!(totals.balance(), 0);

        let overdrawn = LedgerTotals {
            earned: 0,
            penalty: i64::MAX,
            paid: i64::MAX,
        };
        assert_eq!(overdrawn.balance(), 0);
    }

    #[test]
    fn rank_counts_strictly_greater_earners() {
        assert_eq!(rank_for(100, [50, 100, 150, 200]), 3);
        assert_eq!(rank_for(300, [50, 100]), 1);
        assert_eq!(rank_for(0, []), 1);
    }

    #[test]
    fn mirror_delta_tracks_kind() {
        assert_eq!(
            MirrorDelta::for_entry(LedgerKind::Withdraw, -40),
            MirrorDelta {
                balance: -40,
                earned: 0,
                penalty: 0,
                paid: 40
            }
        );
        assert!(MirrorDelta::for_entry(LedgerKind::Extend, 0).is_zero());
    }
}
