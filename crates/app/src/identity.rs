use axum::{
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap},
};

use loyalty_core::types::Caller;

use crate::error::ServiceError;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";
pub const USER_EMAIL_HEADER: &str = "x-user-email";
pub const USER_NAME_HEADER: &str = "x-user-name";

/// Any caller with a resolved identity.
#[derive(Debug, Clone)]
pub struct Member(pub Caller);

/// A caller whose role is `Admin`.
#[derive(Debug, Clone)]
pub struct Admin(pub Caller);

#[axum::async_trait]
impl<S> FromRequestParts<S> for Member
where
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        caller_from_headers(&parts.headers).map(Self)
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for Admin
where
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let caller = caller_from_headers(&parts.headers)?;
        if !caller.is_admin() {
            return Err(ServiceError::forbidden("admin role required"));
        }
        Ok(Self(caller))
    }
}

/// Reads the identity forwarded by the upstream session layer.
pub fn caller_from_headers(headers: &HeaderMap) -> Result<Caller, ServiceError> {
    let user_id = header_text(headers, USER_ID_HEADER)
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|id| *id > 0)
        .ok_or_else(|| ServiceError::unauthenticated("missing or invalid X-User-Id"))?;
    let role = header_text(headers, USER_ROLE_HEADER)
        .ok_or_else(|| ServiceError::unauthenticated("missing X-User-Role"))?;

    Ok(Caller {
        user_id,
        role,
        email: header_text(headers, USER_EMAIL_HEADER),
        name: header_text(headers, USER_NAME_HEADER),
    })
}

fn header_text(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
