use std::{fmt, str::FromStr};

use rust_decimal::Decimal;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::{
    types::{AccountStatus, UnknownVariant},
    workflow::WithdrawalAction,
};

/// Notification kinds produced by the loyalty engine. Each has a seeded template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    LoyaltyWelcome,
    Penalty,
    StatusChange,
    WithdrawalApproved,
    WithdrawalRejected,
    WithdrawalPaid,
    WeeklyDigest,
}

impl NotificationKind {
    pub const ALL: [NotificationKind; 7] = [
        Self::LoyaltyWelcome,
        Self::Penalty,
        Self::StatusChange,
        Self::WithdrawalApproved,
        Self::WithdrawalRejected,
        Self::WithdrawalPaid,
        Self::WeeklyDigest,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::LoyaltyWelcome => "loyalty_welcome",
            Self::Penalty => "penalty",
            Self::StatusChange => "status_change",
            Self::WithdrawalApproved => "withdrawal_approved",
            Self::WithdrawalRejected => "withdrawal_rejected",
            Self::WithdrawalPaid => "withdrawal_paid",
            Self::WeeklyDigest => "weekly_digest",
        }
    }
}

impl FromStr for NotificationKind {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| UnknownVariant::new("notification kind", value))
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request to enqueue a notification.
#[derive(Debug, Clone, PartialEq)]
pub struct NewNotification {
    pub kind: NotificationKind,
    pub user_id: Option<i64>,
    pub email: Option<String>,
    pub payload: Value,
    pub dedupe_key: Option<String>,
    pub account_id: Option<i64>,
}

impl NewNotification {
    pub fn new(kind: NotificationKind, user_id: Option<i64>, payload: Value) -> Self {
        Self {
            kind,
            user_id,
            email: None,
            payload,
            dedupe_key: None,
            account_id: None,
        }
    }

    pub fn with_email(mut self, email: Option<String>) -> Self {
        self.email = email.filter(|email| !email.trim().is_empty());
        self
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    pub fn with_account(mut self, account_id: i64) -> Self {
        self.account_id = Some(account_id);
        self
    }

    /// The explicit key when supplied, otherwise one derived from the payload.
    pub fn resolved_dedupe_key(&self) -> String {
        match &self.dedupe_key {
            Some(key) if !key.trim().is_empty() => key.clone(),
            _ => derive_dedupe_key(
                self.kind.as_str(),
                self.user_id,
                self.account_id,
                &self.payload,
            ),
        }
    }
}

/// Derives `kind:userId:ref`, preferring a withdrawal id, then the account id,
/// then a generic ref id. Falls back to a SHA-256 digest of the payload.
pub fn derive_dedupe_key(
    kind: &str,
    user_id: Option<i64>,
    account_id: Option<i64>,
    payload: &Value,
) -> String {
    let user = user_id.map_or_else(|| "anon".to_string(), |id| id.to_string());
    let reference = payload_ref(payload, "withdrawalId")
        .or_else(|| account_id.map(|id| id.to_string()))
        .or_else(|| payload_ref(payload, "accountId"))
        .or_else(|| payload_ref(payload, "refId"))
        .or_else(|| payload_ref(payload, "ref_id"));

    match reference {
        Some(reference) => format!("{kind}:{user}:{reference}"),
        None => {
            let digest = Sha256::digest(payload.to_string().as_bytes());
            format!("{kind}:{user}:sha256:{}", hex::encode(digest))
        }
    }
}

fn payload_ref(payload: &Value, key: &str) -> Option<String> {
    match payload.get(key)? {
        Value::Number(number) => Some(number.to_string()),
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        _ => None,
    }
}

/// Message ready to hand to the mail transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub subject: String,
    pub html: String,
}

/// Renders a stored template, or a generic message when no template exists for `kind`.
pub fn render_message(
    kind: &str,
    template: Option<(&str, &str)>,
    payload: &Value,
) -> RenderedMessage {
    match template {
        Some((subject, html)) => RenderedMessage {
            subject: render_template(subject, payload, false),
            html: render_template(html, payload, true),
        },
        None => {
            let pretty =
                serde_json::to_string_pretty(payload).unwrap_or_else(|_| payload.to_string());
            RenderedMessage {
                subject: format!("Loyalty: {kind}"),
                html: format!(
                    "<p>{}</p><pre>{}</pre>",
                    escape_html(kind),
                    escape_html(&pretty)
                ),
            }
        }
    }
}

/// Substitutes `{{ key }}` placeholders from `payload`. Missing keys render empty.
pub fn render_template(template: &str, payload: &Value, escape: bool) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let key = after[..end].trim();
        if is_placeholder_key(key) {
            let value = placeholder_value(payload, key);
            if escape {
                out.push_str(&escape_html(&value));
            } else {
                out.push_str(&value);
            }
        } else {
            out.push_str(&rest[start..start + 2 + end + 2]);
        }
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    out
}

fn is_placeholder_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

fn placeholder_value(payload: &Value, key: &str) -> String {
    match payload.get(key) {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}

pub fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

/// Outbound event published after a state change has been committed.
#[derive(Debug, Clone, PartialEq)]
pub enum LoyaltyEvent {
    Enrolled {
        user_id: i64,
        email: Option<String>,
        name: Option<String>,
        account_id: i64,
        duration_months: u32,
        withdraw_wait_days: u32,
        signup_bonus: i64,
    },
    Penalized {
        user_id: i64,
        account_id: i64,
        entry_id: i64,
        points: i64,
        note: Option<String>,
        balance: i64,
    },
    StatusChanged {
        user_id: i64,
        account_id: i64,
        entry_id: i64,
        status: AccountStatus,
    },
    WithdrawalDecided {
        user_id: i64,
        account_id: i64,
        withdrawal_id: i64,
        action: WithdrawalAction,
        points: i64,
        eur: Decimal,
        payout_ref: Option<String>,
        note: Option<String>,
    },
    WeeklyDigest {
        user_id: i64,
        account_id: i64,
        week: String,
        week_points: i64,
        balance: i64,
    },
}

impl LoyaltyEvent {
    /// Maps the event onto a queue request.
    pub fn into_notification(self) -> NewNotification {
        match self {
            Self::Enrolled {
                user_id,
                email,
                name,
                account_id,
                duration_months,
                withdraw_wait_days,
                signup_bonus,
            } => {
                let message = format!(
                    "Hi {}, welcome to the loyalty program. {signup_bonus} points have been credited.",
                    name.as_deref().unwrap_or("there")
                );
                NewNotification::new(
                    NotificationKind::LoyaltyWelcome,
                    Some(user_id),
                    json!({
                        "accountId": account_id,
                        "name": name,
                        "durationMonths": duration_months,
                        "withdrawWaitDays": withdraw_wait_days,
                        "signupBonus": signup_bonus,
                        "message": message,
                    }),
                )
                .with_email(email)
                .with_account(account_id)
            }
            Self::Penalized {
                user_id,
                account_id,
                entry_id,
                points,
                note,
                balance,
            } => NewNotification::new(
                NotificationKind::Penalty,
                Some(user_id),
                json!({
                    "accountId": account_id,
                    "refId": entry_id,
                    "points": points,
                    "note": note.unwrap_or_default(),
                    "balance": balance,
                }),
            )
            .with_account(account_id)
            .with_dedupe_key(format!("penalty:{user_id}:{account_id}:{entry_id}")),
            Self::StatusChanged {
                user_id,
                account_id,
                entry_id,
                status,
            } => NewNotification::new(
                NotificationKind::StatusChange,
                Some(user_id),
                json!({
                    "accountId": account_id,
                    "refId": entry_id,
                    "status": status.as_str(),
                    "message": format!("Your loyalty account is now {status}."),
                }),
            )
            .with_account(account_id)
            .with_dedupe_key(format!("status_change:{user_id}:{account_id}:{entry_id}")),
            Self::WithdrawalDecided {
                user_id,
                account_id,
                withdrawal_id,
                action,
                points,
                eur,
                payout_ref,
                note,
            } => {
                let (kind, message) = match action {
                    WithdrawalAction::Approve => (
                        NotificationKind::WithdrawalApproved,
                        format!("Your withdrawal of {points} points (EUR {eur}) was approved."),
                    ),
                    WithdrawalAction::MarkPaid => (
                        NotificationKind::WithdrawalPaid,
                        format!("Your withdrawal of {points} points (EUR {eur}) has been paid."),
                    ),
                    WithdrawalAction::Reject => (
                        NotificationKind::WithdrawalRejected,
                        format!(
                        "Your withdrawal of {points} points was rejected.{}",
                        note.as_deref()
                            .map(|note| format!(" Note: {note}"))
                            .unwrap_or_default()
                        ),
                    ),
                };
                NewNotification::new(
                    kind,
                    Some(user_id),
                    json!({
                        "withdrawalId": withdrawal_id,
                        "accountId": account_id,
                        "points": points,
                        "eur": eur.to_string(),
                        "payoutRef": payout_ref,
                        "note": note,
                        "message": message,
                    }),
                )
                .with_account(account_id)
            }
            Self::WeeklyDigest {
                user_id,
                account_id,
                week,
                week_points,
                balance,
            } => NewNotification::new(
                NotificationKind::WeeklyDigest,
                Some(user_id),
                json!({
                    "accountId": account_id,
                    "week": week,
                    "weekPoints": week_points,
                    "balance": balance,
                    "message": format!("You earned {week_points} points this week. Balance: {balance}."),
                }),
            )
            .with_account(account_id)
            .with_dedupe_key(format!("weekly_digest:{user_id}:{account_id}:{week}")),
        }
    }
}
