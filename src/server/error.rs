//! Mapping of service errors onto HTTP responses

use crate::error::FuseError;
use crate::tracing_config::events;
use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        rejection::JsonRejection,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;

const GENERIC_MESSAGE: &str = "Internal server error";

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    PayloadTooLarge(String),
    BadGateway(String),
    GatewayTimeout(String),
    /// Message is safe to show to clients
    Internal(String),
    /// Details are logged, clients get a generic message
    Unexpected(FuseError),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Internal(_) | ApiError::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            ApiError::BadRequest(msg)
            | ApiError::PayloadTooLarge(msg)
            | ApiError::BadGateway(msg)
            | ApiError::GatewayTimeout(msg)
            | ApiError::Internal(msg) => msg,
            ApiError::Unexpected(err) => {
                events::error_with_context(&err, "request handling");
                GENERIC_MESSAGE.to_string()
            },
        };

        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), error = %message, "Request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %message, "Request rejected");
        }

        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<FuseError> for ApiError {
    fn from(err: FuseError) -> Self {
        match err {
            FuseError::InvalidRequest(msg) => ApiError::BadRequest(msg),
            e @ (FuseError::Upstream { .. } | FuseError::Network(_)) => {
                ApiError::BadGateway(e.to_string())
            },
            e @ FuseError::Timeout(_) => ApiError::GatewayTimeout(e.to_string()),
            e @ (FuseError::Storage(_) | FuseError::Processing(_) | FuseError::Image(_)) => {
                ApiError::Internal(e.to_string())
            },
            e @ (FuseError::Io(_) | FuseError::Config(_) | FuseError::Internal(_)) => {
                ApiError::Unexpected(e)
            },
        }
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::PayloadTooLarge(format!("Upload too large: {}", err.body_text()))
        } else {
            ApiError::BadRequest(format!("Invalid multipart body: {}", err.body_text()))
        }
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(rejection: MultipartRejection) -> Self {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::PayloadTooLarge(format!("Upload too large: {}", rejection.body_text()))
        } else {
            ApiError::BadRequest(format!("Expected a multipart upload: {}", rejection.body_text()))
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::PayloadTooLarge(format!("Request body too large: {}", rejection.body_text()))
        } else {
            ApiError::BadRequest(rejection.body_text())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (FuseError::invalid_request("no prompt"), StatusCode::BAD_REQUEST),
            (FuseError::upstream("Stability AI", 500, "boom"), StatusCode::BAD_GATEWAY),
            (FuseError::Network("reset".into()), StatusCode::BAD_GATEWAY),
            (FuseError::timeout("poll budget exhausted"), StatusCode::GATEWAY_TIMEOUT),
            (FuseError::storage("bucket missing"), StatusCode::INTERNAL_SERVER_ERROR),
            (FuseError::internal("join failed"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status(), expected);
        }
    }

    #[test]
    fn test_internal_details_are_hidden() {
        let err = ApiError::from(FuseError::config("SUPABASE_SERVICE_ROLE_KEY missing"));
        assert!(matches!(err, ApiError::Unexpected(_)));

        let err = ApiError::from(FuseError::storage("Upload of 'a.png' rejected"));
        match err {
            ApiError::Internal(msg) => assert!(msg.contains("a.png")),
            other => panic!("unexpected mapping: {other:?}"),
        }
    }
}
