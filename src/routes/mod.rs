pub mod extract;
pub mod health;
pub mod jobs;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::str::FromStr;
use uuid::Uuid;

use crate::models::job::ErrorCode;
use crate::services::orchestrator::AdmissionError;
use crate::services::quota::{Caller, Tier};

/// Set by the gateway after authenticating the user.
pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_TIER_HEADER: &str = "x-user-tier";

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// JSON error response: `{code, message}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: String,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl ToString, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorCode::Validation, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::InternalError, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                code: self.code,
                message: self.message,
            }),
        )
            .into_response()
    }
}

impl From<AdmissionError> for ApiError {
    fn from(e: AdmissionError) -> Self {
        match e {
            AdmissionError::Validation(message) => ApiError::validation(message),
            AdmissionError::QuotaExceeded { .. } => {
                ApiError::new(StatusCode::TOO_MANY_REQUESTS, ErrorCode::QuotaExceeded, e.to_string())
            }
            AdmissionError::NotFound => ApiError::new(StatusCode::NOT_FOUND, "NOT_FOUND", "Not found"),
            AdmissionError::Store(e) => {
                tracing::error!(error = %e, "Job store failure");
                ApiError::internal("Job store unavailable")
            }
        }
    }
}

impl From<garde::Report> for ApiError {
    fn from(report: garde::Report) -> Self {
        ApiError::validation(report.to_string())
    }
}

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let owner_id = parts
            .headers
            .get(USER_ID_HEADER)
            .ok_or_else(|| ApiError::unauthorized("Missing X-User-Id header"))?
            .to_str()
            .ok()
            .and_then(|v| Uuid::parse_str(v.trim()).ok())
            .ok_or_else(|| ApiError::unauthorized("Invalid X-User-Id header"))?;

        let tier = match parts.headers.get(USER_TIER_HEADER) {
            None => Tier::default(),
            Some(value) => value
                .to_str()
                .ok()
                .and_then(|v| Tier::from_str(v.trim()).ok())
                .ok_or_else(|| ApiError::unauthorized("Invalid X-User-Tier header"))?,
        };

        Ok(Caller { owner_id, tier })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn caller_from(headers: &[(&str, &str)]) -> Result<Caller, ApiError> {
        let mut builder = Request::builder().uri("/");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        Caller::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn caller_defaults_to_free_tier() {
        let id = Uuid::new_v4();
        let caller = caller_from(&[("X-User-Id", &id.to_string())]).await.unwrap();
        assert_eq!(caller.owner_id, id);
        assert_eq!(caller.tier, Tier::Free);
    }

    #[tokio::test]
    async fn caller_reads_tier() {
        let id = Uuid::new_v4().to_string();
        let caller = caller_from(&[("x-user-id", &id), ("x-user-tier", "premium")])
            .await
            .unwrap();
        assert_eq!(caller.tier, Tier::Premium);
    }

    #[tokio::test]
    async fn missing_or_bad_identity_is_unauthorized() {
        let err = caller_from(&[]).await.unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);

        let err = caller_from(&[("x-user-id", "bob")]).await.unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn quota_errors_map_to_429() {
        let err: ApiError = AdmissionError::QuotaExceeded { used: 10, limit: 10 }.into();
        assert_eq!(err.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.code, "QUOTA_EXCEEDED");
    }
}
