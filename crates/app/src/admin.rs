use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    routing::{get, patch, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use loyalty_core::{
    program::{ProgramConfig, ProgramPatch},
    types::{Account, AccountStatus, Withdrawal},
    workflow::StatusFilter,
};

use crate::{
    accounts::{AccountSummary, PenaltyReceipt},
    error::ServiceError,
    identity::Admin,
    member::integer_field,
    router::AppState,
    withdrawal::{Decision, ListParams, WithdrawalList},
};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/program", get(get_program).put(put_program))
        .route("/program/import-legacy", post(import_legacy))
        .route("/accounts", get(list_accounts))
        .route("/accounts/:id/penalize", post(penalize))
        .route("/accounts/:id/status", patch(set_status))
        .route("/accounts/:id/extend", post(extend))
        .route("/withdrawals", get(list_withdrawals).post(create_withdrawal))
        .route("/withdrawals/:id/approve", patch(approve))
        .route("/withdrawals/:id/reject", patch(reject))
        .route("/withdrawals/:id/mark-paid", patch(mark_paid))
}

async fn get_program(
    State(state): State<AppState>,
    Admin(_): Admin,
) -> Result<Json<ProgramConfig>, ServiceError> {
    Ok(Json(state.program().get().await?))
}

async fn put_program(
    State(state): State<AppState>,
    Admin(admin): Admin,
    body: Result<Json<ProgramPatch>, JsonRejection>,
) -> Result<Json<ProgramConfig>, ServiceError> {
    let Json(patch) = body?;
    let program = state.program().put(&patch).await?;
    info!(stage = "program", admin_user_id = admin.user_id, "program updated over http");
    Ok(Json(program))
}

#[derive(Debug, Serialize)]
struct ImportResponse {
    imported: u64,
}

async fn import_legacy(
    State(state): State<AppState>,
    Admin(_): Admin,
) -> Result<Json<ImportResponse>, ServiceError> {
    let imported = state.program().import_legacy().await?;
    Ok(Json(ImportResponse { imported }))
}

#[derive(Debug, Serialize)]
struct AccountsResponse {
    accounts: Vec<AccountSummary>,
}

async fn list_accounts(
    State(state): State<AppState>,
    Admin(_): Admin,
) -> Result<Json<AccountsResponse>, ServiceError> {
    let accounts = state.accounts().list_accounts().await?;
    Ok(Json(AccountsResponse { accounts }))
}

#[derive(Debug, Deserialize)]
struct PointsBody {
    #[serde(default)]
    points: Value,
    #[serde(default)]
    note: Option<String>,
}

async fn penalize(
    State(state): State<AppState>,
    Admin(admin): Admin,
    id: Result<Path<i64>, PathRejection>,
    body: Result<Json<PointsBody>, JsonRejection>,
) -> Result<Json<PenaltyReceipt>, ServiceError> {
    let Path(account_id) = id?;
    let Json(body) = body?;
    let points = integer_field(&body.points, "points")?;
    let receipt = state
        .accounts()
        .penalize(admin.user_id, account_id, points, body.note)
        .await?;
    Ok(Json(receipt))
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    status: String,
    #[serde(default)]
    note: Option<String>,
}

async fn set_status(
    State(state): State<AppState>,
    Admin(admin): Admin,
    id: Result<Path<i64>, PathRejection>,
    body: Result<Json<StatusBody>, JsonRejection>,
) -> Result<Json<Account>, ServiceError> {
    let Path(account_id) = id?;
    let Json(body) = body?;
    let status = parse_account_status(&body.status)?;
    let account = state
        .accounts()
        .set_status(admin.user_id, account_id, status, body.note)
        .await?;
    Ok(Json(account))
}

fn parse_account_status(raw: &str) -> Result<AccountStatus, ServiceError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "active" => Ok(AccountStatus::Active),
        "paused" => Ok(AccountStatus::Paused),
        "closed" => Ok(AccountStatus::Closed),
        _ => Err(ServiceError::invalid_input(format!(
            "status must be Active, Paused or Closed (got {raw})"
        ))),
    }
}

#[derive(Debug, Deserialize)]
struct ExtendBody {
    #[serde(default)]
    months: Value,
    #[serde(default)]
    note: Option<String>,
}

async fn extend(
    State(state): State<AppState>,
    Admin(admin): Admin,
    id: Result<Path<i64>, PathRejection>,
    body: Result<Json<ExtendBody>, JsonRejection>,
) -> Result<Json<Account>, ServiceError> {
    let Path(account_id) = id?;
    let Json(body) = body?;
    let months = integer_field(&body.months, "months")?;
    let account = state
        .accounts()
        .extend(admin.user_id, account_id, months, body.note)
        .await?;
    Ok(Json(account))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WithdrawalListQuery {
    status: Option<String>,
    account_id: Option<String>,
    page: Option<String>,
    per_page: Option<String>,
}

impl WithdrawalListQuery {
    fn into_params(self) -> Result<ListParams, ServiceError> {
        let status = match non_empty(self.status) {
            Some(raw) => Some(raw.parse::<StatusFilter>().map_err(|_| {
                ServiceError::invalid_input(format!("unknown status filter {raw}"))
            })?),
            None => None,
        };
        Ok(ListParams {
            status,
            account_id: optional_integer(self.account_id, "accountId")?,
            page: optional_integer(self.page, "page")?,
            per_page: optional_integer(self.per_page, "perPage")?,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

fn optional_integer(value: Option<String>, name: &str) -> Result<Option<i64>, ServiceError> {
    non_empty(value)
        .map(|raw| integer_field(&Value::String(raw), name))
        .transpose()
}

async fn list_withdrawals(
    State(state): State<AppState>,
    Admin(_): Admin,
    query: Result<Query<WithdrawalListQuery>, QueryRejection>,
) -> Result<Json<WithdrawalList>, ServiceError> {
    let Query(query) = query?;
    let params = query.into_params()?;
    Ok(Json(state.withdrawals().list(&params).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateWithdrawalBody {
    #[serde(default)]
    account_id: Value,
    #[serde(default)]
    points: Value,
    #[serde(default)]
    note: Option<String>,
}

async fn create_withdrawal(
    State(state): State<AppState>,
    Admin(admin): Admin,
    body: Result<Json<CreateWithdrawalBody>, JsonRejection>,
) -> Result<(StatusCode, Json<Withdrawal>), ServiceError> {
    let Json(body) = body?;
    let account_id = integer_field(&body.account_id, "accountId")?;
    let points = integer_field(&body.points, "points")?;
    let withdrawal = state
        .withdrawals()
        .admin_create(admin.user_id, account_id, points, body.note)
        .await?;
    Ok((StatusCode::CREATED, Json(withdrawal)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DecisionBody {
    #[serde(default)]
    payout_ref: Option<String>,
    #[serde(default)]
    note: Option<String>,
}

async fn approve(
    State(state): State<AppState>,
    Admin(admin): Admin,
    id: Result<Path<i64>, PathRejection>,
    body: Option<Json<DecisionBody>>,
) -> Result<Json<Withdrawal>, ServiceError> {
    let Path(id) = id?;
    let body = body.map(|Json(body)| body).unwrap_or_default();
    Ok(Json(
        state
            .withdrawals()
            .approve(admin.user_id, id, body.note)
            .await?,
    ))
}

async fn reject(
    State(state): State<AppState>,
    Admin(admin): Admin,
    id: Result<Path<i64>, PathRejection>,
    body: Option<Json<DecisionBody>>,
) -> Result<Json<Withdrawal>, ServiceError> {
    let Path(id) = id?;
    let body = body.map(|Json(body)| body).unwrap_or_default();
    Ok(Json(
        state
            .withdrawals()
            .reject(admin.user_id, id, body.note)
            .await?,
    ))
}

async fn mark_paid(
    State(state): State<AppState>,
    Admin(admin): Admin,
    id: Result<Path<i64>, PathRejection>,
    body: Option<Json<DecisionBody>>,
) -> Result<Json<Withdrawal>, ServiceError> {
    let Path(id) = id?;
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let decision = Decision {
        payout_ref: body.payout_ref,
        note: body.note,
    };
    Ok(Json(
        state
            .withdrawals()
            .mark_paid(admin.user_id, id, decision)
            .await?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request, response::Response};
    use http_body_util::BodyExt;
    use serde_json::json;
    use tower::ServiceExt;

    use crate::{
        router::{app_router, test_state},
        test_support::TestClock,
    };

    fn request(role: &str, method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("x-user-id", if role.eq_ignore_ascii_case("admin") { "1" } else { "7" })
            .header("x-user-role", role)
            .header("x-user-email", "someone@example.com");
        match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    fn admin_request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
        request("admin", method, uri, body)
    }

    async fn json_body(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn enrolled_app(clock: &TestClock) -> (Router, i64) {
        let app = app_router(test_state(clock).await);
        let response = app
            .clone()
            .oneshot(request("Staff", "POST", "/api/loyalty/enroll", None))
            .await
            .unwrap();
        let account_id = json_body(response).await["account"]["id"].as_i64().unwrap();
        (app, account_id)
    }

    #[test]
    fn status_parsing_is_case_insensitive() {
        assert_eq!(parse_account_status("paused").unwrap(), AccountStatus::Paused);
        assert_eq!(parse_account_status(" Closed ").unwrap(), AccountStatus::Closed);
        assert_eq!(parse_account_status("gone").unwrap_err().code(), "INVALID_INPUT");
    }

    #[tokio::test]
    async fn non_admin_is_forbidden() {
        let clock = TestClock::at(2025, 1, 1);
        let app = app_router(test_state(&clock).await);
        let response = app
            .oneshot(request("Staff", "GET", "/api/admin/loyalty/program", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(json_body(response).await["type"], "FORBIDDEN");
    }

    #[tokio::test]
    async fn program_round_trip_over_http() {
        let clock = TestClock::at(2025, 1, 1);
        let app = app_router(test_state(&clock).await);

        let response = app
            .clone()
            .oneshot(admin_request(
                "PUT",
                "/api/admin/loyalty/program",
                Some(json!({ "signupBonus": 25, "eligibleUserTypes": ["Staff", "Manager"] })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["signupBonus"], 25);
        assert_eq!(body["eligibleRoles"], json!(["Staff", "Manager"]));

        let response = app
            .clone()
            .oneshot(admin_request(
                "PUT",
                "/api/admin/loyalty/program",
                Some(json!({ "durationMonths": -1 })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(admin_request("GET", "/api/admin/loyalty/program", None))
            .await
            .unwrap();
        assert_eq!(json_body(response).await["signupBonus"], 25);
    }

    #[tokio::test]
    async fn account_admin_endpoints() {
        let clock = TestClock::at(2025, 1, 1);
        let (app, account_id) = enrolled_app(&clock).await;

        let response = app
            .clone()
            .oneshot(admin_request(
                "POST",
                &format!("/api/admin/loyalty/accounts/{account_id}/penalize"),
                Some(json!({ "points": 15, "note": "late" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["projection"]["balance"], 85);

        let response = app
            .clone()
            .oneshot(admin_request(
                "PATCH",
                &format!("/api/admin/loyalty/accounts/{account_id}/status"),
                Some(json!({ "status": "Paused" })),
            ))
            .await
            .unwrap();
        assert_eq!(json_body(response).await["status"], "Paused");

        let response = app
            .clone()
            .oneshot(admin_request(
                "POST",
                &format!("/api/admin/loyalty/accounts/{account_id}/extend"),
                Some(json!({ "months": 1 })),
            ))
            .await
            .unwrap();
        assert_eq!(json_body(response).await["endDate"], "2025-08-01");

        let response = app
            .clone()
            .oneshot(admin_request(
                "POST",
                "/api/admin/loyalty/accounts/abc/extend",
                Some(json!({ "months": 1 })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(admin_request("GET", "/api/admin/loyalty/accounts", None))
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["accounts"].as_array().unwrap().len(), 1);
        assert_eq!(body["accounts"][0]["projection"]["rank"], 1);
    }

    #[tokio::test]
    async fn oversized_numbers_are_bad_requests() {
        let clock = TestClock::at(2025, 1, 1);
        let (app, account_id) = enrolled_app(&clock).await;

        let requests = [
            admin_request(
                "POST",
                &format!("/api/admin/loyalty/accounts/{account_id}/penalize"),
                Some(json!({ "points": i64::MAX })),
            ),
            admin_request(
                "POST",
                "/api/admin/loyalty/withdrawals",
                Some(json!({ "accountId": account_id, "points": i64::MAX })),
            ),
            admin_request(
                "PUT",
                "/api/admin/loyalty/program",
                Some(json!({ "signupBonus": i64::MAX })),
            ),
            admin_request(
                "GET",
                "/api/admin/loyalty/withdrawals?page=9223372036854775807",
                None,
            ),
        ];
        for request in requests {
            let response = app.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            assert_eq!(json_body(response).await["type"], "INVALID_INPUT");
        }

        let response = app
            .oneshot(admin_request("GET", "/api/admin/loyalty/accounts", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["accounts"][0]["projection"]["balance"], 100);
    }

    #[tokio::test]
    async fn withdrawal_decisions_over_http() {
        let clock = TestClock::at(2025, 1, 1);
        let (app, account_id) = enrolled_app(&clock).await;

        let response = app
            .clone()
            .oneshot(admin_request(
                "POST",
                "/api/admin/loyalty/withdrawals",
                Some(json!({ "accountId": account_id, "points": 40 })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = json_body(response).await;
        assert_eq!(created["status"], "Approved");
        let id = created["id"].as_i64().unwrap();

        let response = app
            .clone()
            .oneshot(admin_request(
                "PATCH",
                &format!("/api/admin/loyalty/withdrawals/{id}/approve"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(response).await["type"], "BAD_TRANSITION");

        let response = app
            .clone()
            .oneshot(admin_request(
                "PATCH",
                &format!("/api/admin/loyalty/withdrawals/{id}/mark-paid"),
                Some(json!({ "payoutRef": "TX9" })),
            ))
            .await
            .unwrap();
        let paid = json_body(response).await;
        assert_eq!(paid["status"], "Paid");
        assert_eq!(paid["payoutRef"], "TX9");

        let response = app
            .clone()
            .oneshot(admin_request(
                "GET",
                "/api/admin/loyalty/withdrawals?status=No%20Action&perPage=5",
                None,
            ))
            .await
            .unwrap();
        let list = json_body(response).await;
        assert_eq!(list["total"], 1);
        assert_eq!(list["items"][0]["statusLabel"], "No Action");

        let response = app
            .oneshot(admin_request(
                "GET",
                "/api/admin/loyalty/withdrawals?status=archived",
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
