use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;

use crate::{
    accounts::AccountManager, admin, context::LoyaltyContext, events::EventPublisher, member,
    program::ProgramService, telemetry, withdrawal::WithdrawalWorkflow,
};

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    context: LoyaltyContext,
    program: ProgramService,
    accounts: AccountManager,
    withdrawals: WithdrawalWorkflow,
}

impl AppState {
    pub fn new(metrics: PrometheusHandle, context: LoyaltyContext) -> Self {
        let events = EventPublisher::new(context.clone());
        Self {
            metrics,
            program: ProgramService::new(context.clone()),
            accounts: AccountManager::new(context.clone(), events.clone()),
            withdrawals: WithdrawalWorkflow::new(context.clone(), events),
            context,
        }
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn context(&self) -> &LoyaltyContext {
        &self.context
    }

    pub fn program(&self) -> &ProgramService {
        &self.program
    }

    pub fn accounts(&self) -> &AccountManager {
        &self.accounts
    }

    pub fn withdrawals(&self) -> &WithdrawalWorkflow {
        &self.withdrawals
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .nest("/api/loyalty", member::routes())
        .nest("/api/admin/loyalty", admin::routes())
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> StatusCode {
    match sqlx::query("SELECT 1")
        .execute(state.context().database().pool())
        .await
    {
        Ok(_) => StatusCode::OK,
        Err(err) => {
            tracing::warn!(stage = "app", error = %err, "health check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

#[cfg(test)]
pub(crate) async fn test_state(clock: &crate::test_support::TestClock) -> AppState {
    let metrics = telemetry::init_metrics().expect("metrics init");
    let database = crate::test_support::setup_db().await;
    AppState::new(metrics, clock.context(&database))
}
