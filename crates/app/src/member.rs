use axum::{
    extract::{rejection::JsonRejection, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use loyalty_core::types::Withdrawal;

use crate::{
    accounts::AccountView, error::ServiceError, identity::Member, router::AppState,
    withdrawal::WithdrawalReceipt,
};

const IDEMPOTENCY_HEADER: &str = "idempotency-key";

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/enroll", post(enroll))
        .route("/me", get(me))
        .route("/withdraw", post(withdraw))
        .route("/withdrawals", get(withdrawals))
}

async fn enroll(
    State(state): State<AppState>,
    Member(caller): Member,
) -> Result<Json<AccountView>, ServiceError> {
    Ok(Json(state.accounts().enroll(&caller).await?))
}

async fn me(
    State(state): State<AppState>,
    Member(caller): Member,
) -> Result<Json<AccountView>, ServiceError> {
    Ok(Json(state.accounts().my_account(&caller).await?))
}

#[derive(Debug, Deserialize)]
struct WithdrawBody {
    #[serde(default)]
    points: Value,
    #[serde(default)]
    note: Option<String>,
}

async fn withdraw(
    State(state): State<AppState>,
    Member(caller): Member,
    headers: HeaderMap,
    body: Result<Json<WithdrawBody>, JsonRejection>,
) -> Result<(StatusCode, Json<WithdrawalReceipt>), ServiceError> {
    let Json(body) = body?;
    let points = integer_field(&body.points, "points")?;
    let idempotency_key = headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let receipt = state
        .withdrawals()
        .request(&caller, points, body.note, idempotency_key)
        .await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

#[derive(Debug, Serialize)]
struct WithdrawalsResponse {
    withdrawals: Vec<Withdrawal>,
}

async fn withdrawals(
    State(state): State<AppState>,
    Member(caller): Member,
) -> Result<Json<WithdrawalsResponse>, ServiceError> {
    let withdrawals = state.withdrawals().list_mine(&caller).await?;
    Ok(Json(WithdrawalsResponse { withdrawals }))
}

/// Accepts a JSON integer or an integer string; fractions and other types are refused.
pub(crate) fn integer_field(value: &Value, name: &str) -> Result<i64, ServiceError> {
    let parsed = match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse::<i64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| ServiceError::invalid_input(format!("{name} must be an integer")))
}
