use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use loyalty_core::{
    calendar::CalendarError,
    program::PatchError,
    workflow::{RequestRejection, TransitionError},
};
use loyalty_storage::StorageError;

/// Failure of a request-path operation, carrying a stable machine code.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{message}")]
    Validation { code: &'static str, message: String },
    #[error("{message}")]
    Authorization { code: &'static str, message: String },
    #[error("{message}")]
    StateConflict { code: &'static str, message: String },
    #[error("{message}")]
    NotFound { code: &'static str, message: String },
    #[error("store unavailable: {0}")]
    Dependency(StorageError),
}

impl ServiceError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::Validation {
            code: "INVALID_INPUT",
            message: message.into(),
        }
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::Authorization {
            code: "UNAUTHENTICATED",
            message: message.into(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Authorization {
            code: "FORBIDDEN",
            message: message.into(),
        }
    }

    pub fn conflict(code: &'static str, message: impl Into<String>) -> Self {
        Self::StateConflict {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            code: "NOT_FOUND",
            message: message.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { code, .. }
            | Self::Authorization { code, .. }
            | Self::StateConflict { code, .. }
            | Self::NotFound { code, .. } => code,
            Self::Dependency(_) => "STORE_UNAVAILABLE",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::Authorization { code, .. } if *code == "UNAUTHENTICATED" => {
                StatusCode::UNAUTHORIZED
            }
            Self::Authorization { .. } => StatusCode::FORBIDDEN,
            Self::StateConflict { .. } => StatusCode::CONFLICT,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Dependency(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl From<StorageError> for ServiceError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::InvalidDelta { .. } => Self::invalid_input(err.to_string()),
            other => Self::Dependency(other),
        }
    }
}

impl From<RequestRejection> for ServiceError {
    fn from(rejection: RequestRejection) -> Self {
        match rejection {
            RequestRejection::InvalidPoints => Self::invalid_input(rejection.to_string()),
            other => Self::conflict(other.code(), other.to_string()),
        }
    }
}

impl From<TransitionError> for ServiceError {
    fn from(err: TransitionError) -> Self {
        Self::conflict("BAD_TRANSITION", err.to_string())
    }
}

impl From<PatchError> for ServiceError {
    fn from(err: PatchError) -> Self {
        Self::invalid_input(err.to_string())
    }
}

impl From<CalendarError> for ServiceError {
    fn from(err: CalendarError) -> Self {
        Self::invalid_input(err.to_string())
    }
}

impl From<JsonRejection> for ServiceError {
    fn from(rejection: JsonRejection) -> Self {
        Self::invalid_input(rejection.body_text())
    }
}

impl From<PathRejection> for ServiceError {
    fn from(rejection: PathRejection) -> Self {
        Self::invalid_input(rejection.body_text())
    }
}

impl From<QueryRejection> for ServiceError {
    fn from(rejection: QueryRejection) -> Self {
        Self::invalid_input(rejection.body_text())
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let code = self.code();
        counter!("api_errors_total", "code" => code).increment(1);
        if let Self::Dependency(err) = &self {
            error!(stage = "app", error = %err, "request failed on the store");
        }
        ProblemResponse::new(self.status(), code, self.to_string()).into_response()
    }
}

#[derive(Debug, Serialize)]
struct ProblemDetails {
    #[serde(rename = "type")]
    problem_type: &'static str,
    title: &'static str,
    detail: String,
}

/// `application/problem+json` body whose `type` is the stable error code.
pub struct ProblemResponse {
    status: StatusCode,
    body: ProblemDetails,
}

impl ProblemResponse {
    pub fn new<S: Into<String>>(status: StatusCode, problem_type: &'static str, detail: S) -> Self {
        Self {
            status,
            body: ProblemDetails {
                problem_type,
                title: status.canonical_reason().unwrap_or("error"),
                detail: detail.into(),
            },
        }
    }
}

impl IntoResponse for ProblemResponse {
    fn into_response(self) -> Response {
        let mut response = Json(self.body).into_response();
        *response.status_mut() = self.status;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use http_body_util::BodyExt;
    use loyalty_core::workflow::{WithdrawalAction, WithdrawalStatus};

    #[test]
    fn rejections_map_to_taxonomy() {
        let err = ServiceError::from(RequestRejection::NotEligibleYet {
            eligible_from: NaiveDate::from_ymd_opt(2025, 4, 1).unwrap(),
        });
        assert_eq!(err.code(), "NOT_ELIGIBLE_YET");
        assert_eq!(err.status(), StatusCode::CONFLICT);

        let err = ServiceError::from(RequestRejection::InvalidPoints);
        assert_eq!(err.code(), "INVALID_INPUT");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let err = ServiceError::from(TransitionError {
            from: WithdrawalStatus::Paid,
            action: WithdrawalAction::MarkPaid,
        });
        assert_eq!(err.code(), "BAD_TRANSITION");
        assert_eq!(err.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn missing_identity_is_unauthorized_not_forbidden() {
        assert_eq!(
            ServiceError::unauthenticated("no identity").status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ServiceError::forbidden("admin only").status(),
            StatusCode::FORBIDDEN
        );
    }

    #[tokio::test]
    async fn renders_problem_json() {
        let response =
            ServiceError::conflict("PENDING_EXISTS", "a request is pending").into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/problem+json"
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["type"], "PENDING_EXISTS");
        assert_eq!(value["title"], "Conflict");
        assert_eq!(value["detail"], "a request is pending");
    }
}
