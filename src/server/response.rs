use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::error::Error;
use crate::storage::StorageTokenError;

const AUTH_CHALLENGE: &str = "Bearer realm=\"railyard\"";

/// API error that converts to a proper HTTP response
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub retry_after_secs: Option<u64>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            retry_after_secs: None,
        }
    }

    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    #[must_use]
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        match e {
            Error::Unauthenticated => Self::unauthorized("authentication required"),
            Error::Unauthorized(msg) => Self::forbidden(msg),
            Error::Validation(msg) => Self::bad_request(msg),
            Error::InvalidTokenFormat => Self::bad_request("invalid token format"),
            Error::NotFound(msg) => Self::not_found(msg),
            Error::NoDownloadableBuild => Self::not_found("no downloadable build"),
            Error::Conflict(msg) => Self::new(StatusCode::CONFLICT, msg),
            e @ (Error::ProviderUnavailable(_) | Error::NoProviderEnabled) => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
            }
            Error::Upstream(msg) => {
                tracing::warn!("Upstream failure: {msg}");
                Self::new(StatusCode::BAD_GATEWAY, "upstream service unavailable")
            }
            Error::RateLimited { retry_after_secs } => Self {
                retry_after_secs: Some(retry_after_secs),
                ..Self::new(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded")
            },
            e @ (Error::Database(_)
            | Error::Io(_)
            | Error::Config(_)
            | Error::Internal(_)) => {
                tracing::error!("Request failed: {e}");
                Self::internal("internal server error")
            }
        }
    }
}

impl From<StorageTokenError> for ApiError {
    fn from(e: StorageTokenError) -> Self {
        match e {
            StorageTokenError::Expired => Self::new(StatusCode::GONE, e.to_string()),
            StorageTokenError::Malformed => Self::bad_request(e.to_string()),
            StorageTokenError::BadSignature | StorageTokenError::WrongAction(_) => {
                Self::forbidden(e.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({ "error": self.message });
        let mut response = (self.status, Json(body)).into_response();

        if self.status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static(AUTH_CHALLENGE),
            );
        }
        if let Some(secs) = self.retry_after_secs {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }

        response
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        ApiError::from(self).into_response()
    }
}
