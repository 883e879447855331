//! Program configuration: typed settings values and their coercion rules.

use std::{fmt, str::FromStr};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::{UnknownVariant, MAX_POINTS};

pub const DEFAULT_PROGRAM_CODE: &str = "STAFF";
pub const DEFAULT_PROGRAM_NAME: &str = "Staff Loyalty";

const DEFAULT_DURATION_MONTHS: u32 = 6;
const DEFAULT_WITHDRAW_WAIT_DAYS: u32 = 90;
const DEFAULT_MIN_WITHDRAW_POINTS: i64 = 100;
const DEFAULT_SIGNUP_BONUS: i64 = 100;
const DEFAULT_DAILY_ACCRUAL_POINTS: i64 = 1;

/// Upper bounds keeping enrollment and eligibility dates inside chrono's range.
pub const MAX_DURATION_MONTHS: i64 = 1200;
pub const MAX_WITHDRAW_WAIT_DAYS: i64 = 36_500;
/// Keeps `points * eurPerPoint` well inside `Decimal`'s range.
pub const MAX_EUR_PER_POINT: Decimal = Decimal::ONE_THOUSAND;

/// Physical shape of a stored setting.
#[derive(Debug, Clone, PartialEq)]
pub enum SettingValue {
    Int(i64),
    Real(f64),
    Text(String),
    Json(Value),
}

/// Raised when a stored `(kind, value)` pair cannot be decoded.
#[derive(Debug, Error)]
pub enum SettingDecodeError {
    #[error(transparent)]
    UnknownKind(#[from] UnknownVariant),
    #[error("stored {kind} setting is malformed: {raw}")]
    Malformed { kind: &'static str, raw: String },
}

impl SettingValue {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Int(_) => "int",
            Self::Real(_) => "real",
            Self::Text(_) => "text",
            Self::Json(_) => "json",
        }
    }

    /// Serializes the value into the single text slot of a settings row.
    pub fn encode(&self) -> String {
        match self {
            Self::Int(value) => value.to_string(),
            Self::Real(value) => value.to_string(),
            Self::Text(value) => value.clone(),
            Self::Json(value) => value.to_string(),
        }
    }

    pub fn decode(kind: &str, raw: &str) -> Result<Self, SettingDecodeError> {
        let malformed = |kind: &'static str| SettingDecodeError::Malformed {
            kind,
            raw: raw.to_string(),
        };
        match kind {
            "int" => raw.parse().map(Self::Int).map_err(|_| malformed("int")),
            "real" => raw.parse().map(Self::Real).map_err(|_| malformed("real")),
            "text" => Ok(Self::Text(raw.to_string())),
            "json" => serde_json::from_str(raw)
                .map(Self::Json)
                .map_err(|_| malformed("json")),
            other => Err(UnknownVariant::new("setting kind", other).into()),
        }
    }

    /// Converts a row of the old multi-column layout, preferring JSON, then the
    /// integer column, then text.
    pub fn from_legacy(
        value_json: Option<&str>,
        value_int: Option<i64>,
        value_text: Option<&str>,
    ) -> Option<Self> {
        if let Some(raw) = value_json.filter(|raw| !raw.trim().is_empty()) {
            if let Ok(json) = serde_json::from_str(raw) {
                return Some(Self::Json(json));
            }
        }
        if let Some(value) = value_int {
            return Some(Self::Int(value));
        }
        value_text.map(|text| Self::Text(text.to_string()))
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            Self::Real(value) => real_to_i64(*value),
            Self::Text(text) => text_to_i64(text),
            Self::Json(Value::Number(number)) => number
                .as_i64()
                .or_else(|| number.as_f64().and_then(real_to_i64)),
            Self::Json(Value::String(text)) => text_to_i64(text),
            Self::Json(_) => None,
        }
    }

    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Self::Int(value) => Some(Decimal::from(*value)),
            Self::Real(value) => Decimal::try_from(*value).ok(),
            Self::Text(text) => Decimal::from_str(text.trim()).ok(),
            Self::Json(Value::Number(number)) => Decimal::from_str(&number.to_string()).ok(),
            Self::Json(Value::String(text)) => Decimal::from_str(text.trim()).ok(),
            Self::Json(_) => None,
        }
    }

    /// Reads a role list from a JSON array, a JSON-encoded string or a comma separated string.
    pub fn as_roles(&self) -> Option<Vec<String>> {
        let roles: Option<Vec<String>> = match self {
            Self::Json(Value::Array(items)) => Some(
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::trim)
                    .filter(|role| !role.is_empty())
                    .map(str::to_string)
                    .collect(),
            ),
            Self::Json(Value::String(text)) | Self::Text(text) => {
                if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(text) {
                    return Self::Json(Value::Array(items)).as_roles();
                }
                Some(
                    text.split(',')
                        .map(str::trim)
                        .filter(|role| !role.is_empty())
                        .map(str::to_string)
                        .collect(),
                )
            }
            _ => None,
        };
        roles.filter(|roles| !roles.is_empty())
    }
}

fn real_to_i64(value: f64) -> Option<i64> {
    (value.is_finite() && value.fract() == 0.0 && value.abs() < i64::MAX as f64)
        .then_some(value as i64)
}

fn text_to_i64(text: &str) -> Option<i64> {
    let trimmed = text.trim();
    trimmed
        .parse::<i64>()
        .ok()
        .or_else(|| trimmed.parse::<f64>().ok().and_then(real_to_i64))
}

/// Known program setting keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingKey {
    EligibleRoles,
    DurationMonths,
    WithdrawWaitDays,
    MinWithdrawPoints,
    EurPerPoint,
    SignupBonus,
    DailyAccrualPoints,
}

impl SettingKey {
    pub const ALL: [SettingKey; 7] = [
        Self::EligibleRoles,
        Self::DurationMonths,
        Self::WithdrawWaitDays,
        Self::MinWithdrawPoints,
        Self::EurPerPoint,
        Self::SignupBonus,
        Self::DailyAccrualPoints,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::EligibleRoles => "eligibleRoles",
            Self::DurationMonths => "durationMonths",
            Self::WithdrawWaitDays => "withdrawWaitDays",
            Self::MinWithdrawPoints => "minWithdrawPoints",
            Self::EurPerPoint => "eurPerPoint",
            Self::SignupBonus => "signupBonus",
            Self::DailyAccrualPoints => "dailyAccrualPoints",
        }
    }
}

impl FromStr for SettingKey {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value == "eligibleUserTypes" {
            return Ok(Self::EligibleRoles);
        }
        Self::ALL
            .into_iter()
            .find(|key| key.as_str() == value)
            .ok_or_else(|| UnknownVariant::new("setting key", value))
    }
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved configuration of a loyalty program.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramConfig {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub active: bool,
    pub eligible_roles: Vec<String>,
    pub duration_months: u32,
    pub withdraw_wait_days: u32,
    pub min_withdraw_points: i64,
    pub eur_per_point: Decimal,
    pub signup_bonus: i64,
    pub daily_accrual_points: i64,
}

impl ProgramConfig {
    /// Builds a configuration from stored settings. Missing, uncoercible or
    /// out-of-range values fall back to the defaults.
    pub fn from_settings(
        id: i64,
        code: impl Into<String>,
        name: impl Into<String>,
        active: bool,
        settings: impl IntoIterator<Item = (SettingKey, SettingValue)>,
    ) -> Self {
        let mut config = Self {
            id,
            code: code.into(),
            name: name.into(),
            active,
            eligible_roles: default_roles(),
            duration_months: DEFAULT_DURATION_MONTHS,
            withdraw_wait_days: DEFAULT_WITHDRAW_WAIT_DAYS,
            min_withdraw_points: DEFAULT_MIN_WITHDRAW_POINTS,
            eur_per_point: Decimal::ONE,
            signup_bonus: DEFAULT_SIGNUP_BONUS,
            daily_accrual_points: DEFAULT_DAILY_ACCRUAL_POINTS,
        };

        for (key, value) in settings {
            match key {
                SettingKey::EligibleRoles => {
                    if let Some(roles) = value.as_roles() {
                        config.eligible_roles = roles;
                    }
                }
                SettingKey::DurationMonths => {
                    if let Some(months) = value
                        .as_i64()
                        .and_then(|v| bounded_u32(v, MAX_DURATION_MONTHS))
                    {
                        config.duration_months = months;
                    }
                }
                SettingKey::WithdrawWaitDays => {
                    if let Some(days) = value
                        .as_i64()
                        .and_then(|v| bounded_u32(v, MAX_WITHDRAW_WAIT_DAYS))
                    {
                        config.withdraw_wait_days = days;
                    }
                }
                SettingKey::MinWithdrawPoints => {
                    if let Some(points) = value
                        .as_i64()
                        .filter(|v| (0..=MAX_POINTS).contains(v))
                    {
                        config.min_withdraw_points = points;
                    }
                }
                SettingKey::EurPerPoint => {
                    if let Some(rate) = value
                        .as_decimal()
                        .filter(|v| *v > Decimal::ZERO && *v <= MAX_EUR_PER_POINT)
                    {
                        config.eur_per_point = rate;
                    }
                }
                SettingKey::SignupBonus => {
                    if let Some(bonus) = value
                        .as_i64()
                        .filter(|v| (0..=MAX_POINTS).contains(v))
                    {
                        config.signup_bonus = bonus;
                    }
                }
                SettingKey::DailyAccrualPoints => {
                    if let Some(points) = value
                        .as_i64()
                        .filter(|v| (1..=MAX_POINTS).contains(v))
                    {
                        config.daily_accrual_points = points;
                    }
                }
            }
        }

        config
    }

    pub fn is_role_eligible(&self, role: &str) -> bool {
        let role = role.trim();
        !role.is_empty()
            && self
                .eligible_roles
                .iter()
                .any(|eligible| eligible.eq_ignore_ascii_case(role))
    }
}

fn default_roles() -> Vec<String> {
    vec!["Staff".to_string()]
}

fn bounded_u32(value: i64, max: i64) -> Option<u32> {
    if (0..=max).contains(&value) {
        u32::try_from(value).ok()
    } else {
        None
    }
}

/// Partial update accepted by the admin settings operation.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramPatch {
    pub name: Option<String>,
    pub active: Option<bool>,
    #[serde(alias = "eligibleUserTypes")]
    pub eligible_roles: Option<Vec<String>>,
    pub duration_months: Option<i64>,
    pub withdraw_wait_days: Option<i64>,
    pub min_withdraw_points: Option<i64>,
    pub eur_per_point: Option<Decimal>,
    pub signup_bonus: Option<i64>,
    pub daily_accrual_points: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    #[error("{0} must be a non-negative integer")]
    Negative(SettingKey),
    #[error("{0} is out of range")]
    OutOfRange(SettingKey),
    #[error("{0} must be greater than zero")]
    NotPositive(SettingKey),
    #[error("eligibleRoles must contain non-empty role names")]
    EmptyRole,
    #[error("program name must not be empty")]
    EmptyName,
}

impl ProgramPatch {
    pub fn validate(&self) -> Result<(), PatchError> {
        if let Some(name) = &self.name {
            if name.trim().is_empty() {
                return Err(PatchError::EmptyName);
            }
        }
        if let Some(roles) = &self.eligible_roles {
            if roles.is_empty() || roles.iter().any(|role| role.trim().is_empty()) {
                return Err(PatchError::EmptyRole);
            }
        }
        for (key, value, max) in [
            (SettingKey::DurationMonths, self.duration_months, MAX_DURATION_MONTHS),
            (SettingKey::WithdrawWaitDays, self.withdraw_wait_days, MAX_WITHDRAW_WAIT_DAYS),
            (SettingKey::MinWithdrawPoints, self.min_withdraw_points, MAX_POINTS),
            (SettingKey::SignupBonus, self.signup_bonus, MAX_POINTS),
        ] {
            if let Some(value) = value {
                if value < 0 {
                    return Err(PatchError::Negative(key));
                }
                if value > max {
                    return Err(PatchError::OutOfRange(key));
                }
            }
        }
        if let Some(points) = self.daily_accrual_points {
            if points <= 0 {
                return Err(PatchError::NotPositive(SettingKey::DailyAccrualPoints));
            }
            if points > MAX_POINTS {
                return Err(PatchError::OutOfRange(SettingKey::DailyAccrualPoints));
            }
        }
        if let Some(rate) = self.eur_per_point {
            if rate <= Decimal::ZERO {
                return Err(PatchError::NotPositive(SettingKey::EurPerPoint));
            }
            if rate > MAX_EUR_PER_POINT {
                return Err(PatchError::OutOfRange(SettingKey::EurPerPoint));
            }
        }
        Ok(())
    }

    /// Settings rows to upsert, in tagged form.
    pub fn settings(&self) -> Vec<(SettingKey, SettingValue)> {
        let mut out = Vec::new();
        if let Some(roles) = &self.eligible_roles {
            let roles = roles
                .iter()
                .map(|role| Value::String(role.trim().to_string()))
                .collect();
            out.push((SettingKey::EligibleRoles, SettingValue::Json(Value::Array(roles))));
        }
        let ints = [
            (SettingKey::DurationMonths, self.duration_months),
            (SettingKey::WithdrawWaitDays, self.withdraw_wait_days),
            (SettingKey::MinWithdrawPoints, self.min_withdraw_points),
            (SettingKey::SignupBonus, self.signup_bonus),
            (SettingKey::DailyAccrualPoints, self.daily_accrual_points),
        ];
        for (key, value) in ints {
            if let Some(value) = value {
                out.push((key, SettingValue::Int(value)));
            }
        }
        if let Some(rate) = self.eur_per_point {
            out.push((
                SettingKey::EurPerPoint,
                SettingValue::Text(rate.normalize().to_string()),
            ));
        }
        out
    }
}
