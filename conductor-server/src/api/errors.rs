use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use conductor_core::StoreError;
use serde::Serialize;
use thiserror::Error;

/// Worker-visible failure surface. Every call resolves to success, a
/// retryable 503, or a definitive 4xx; workers never see partial success.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("unknown instance: {0}")]
    UnknownInstance(String),

    #[error("{detail}")]
    Conflict { code: &'static str, detail: String },

    #[error("service unavailable")]
    Unavailable { retry_after_s: u64 },

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    detail: String,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::UnknownInstance(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict { .. } => StatusCode::CONFLICT,
            ApiError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::UnknownInstance(_) => "unknown_instance",
            ApiError::Conflict { code, .. } => code,
            ApiError::Unavailable { .. } => "unavailable",
            ApiError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            code: self.code().to_string(),
            detail: self.to_string(),
        };
        let mut response = (status, Json(body)).into_response();
        if let ApiError::Unavailable { retry_after_s } = self {
            if let Ok(value) = HeaderValue::from_str(&retry_after_s.max(1).to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable { retry_after } => ApiError::Unavailable {
                retry_after_s: retry_after.as_secs().max(1),
            },
            // Retries are exhausted by the time a transient error reaches
            // the API; tell the worker to come back shortly.
            StoreError::Timeout | StoreError::Transient(_) => {
                ApiError::Unavailable { retry_after_s: 1 }
            }
            StoreError::UnknownInstance(id) => ApiError::UnknownInstance(id),
            StoreError::NotEligible { .. } => ApiError::Conflict {
                code: "not_eligible",
                detail: e.to_string(),
            },
            StoreError::CapacityExceeded { .. } => ApiError::Conflict {
                code: "capacity_exceeded",
                detail: e.to_string(),
            },
            StoreError::AlreadyAssigned { .. } => ApiError::Conflict {
                code: "already_assigned",
                detail: e.to_string(),
            },
            StoreError::StaleHeartbeat(_) => ApiError::Conflict {
                code: "stale_heartbeat",
                detail: e.to_string(),
            },
            StoreError::Database(_) | StoreError::Fatal(_) => ApiError::Internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn store_errors_map_to_documented_statuses() {
        let cases: Vec<(StoreError, StatusCode)> = vec![
            (
                StoreError::Unavailable {
                    retry_after: Duration::from_secs(30),
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (StoreError::Timeout, StatusCode::SERVICE_UNAVAILABLE),
            (
                StoreError::UnknownInstance("w1".into()),
                StatusCode::NOT_FOUND,
            ),
            (
                StoreError::CapacityExceeded {
                    instance_id: "w1".into(),
                    capacity: 5,
                    requested: 6,
                },
                StatusCode::CONFLICT,
            ),
            (
                StoreError::AlreadyAssigned {
                    stream_id: 1,
                    owner: "w2".into(),
                },
                StatusCode::CONFLICT,
            ),
            (
                StoreError::StaleHeartbeat("w1".into()),
                StatusCode::CONFLICT,
            ),
            (
                StoreError::Fatal("schema mismatch".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, expected) in cases {
            let api: ApiError = err.into();
            assert_eq!(api.into_response().status(), expected);
        }
    }

    #[test]
    fn unavailable_carries_retry_after() {
        let api: ApiError = StoreError::Unavailable {
            retry_after: Duration::from_secs(42),
        }
        .into();
        let response = api.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            &HeaderValue::from_static("42")
        );
    }
}
