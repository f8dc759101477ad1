use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::application::error::ErrorReport;
use crate::cache::{InvalidationError, KeyError, StoreError, WarmError};

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorMessage,
}

pub mod codes {
    pub const BAD_REQUEST: &str = "bad_request";
    pub const INVALID_INPUT: &str = "invalid_input";
    pub const STORE: &str = "store_error";
    pub const UPSTREAM: &str = "upstream_error";
    pub const INTERNAL: &str = "internal_error";
}

#[derive(Debug, Serialize)]
pub struct ApiErrorMessage {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: &'static str,
    hint: Option<String>,
}

impl ApiError {
    pub fn new(
        status: StatusCode,
        code: &'static str,
        message: &'static str,
        hint: Option<String>,
    ) -> Self {
        Self {
            status,
            code,
            message,
            hint,
        }
    }

    pub fn bad_request(message: &'static str, hint: Option<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, codes::BAD_REQUEST, message, hint)
    }

    /// A missing or malformed request parameter.
    pub fn invalid_input(detail: impl Into<String>) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            codes::INVALID_INPUT,
            "Request could not be processed",
            Some(detail.into()),
        )
    }

    pub fn store(detail: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            codes::STORE,
            "Cache store operation failed",
            Some(detail.into()),
        )
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            codes::INTERNAL,
            "Unexpected error occurred",
            Some(detail.into()),
        )
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<InvalidationError> for ApiError {
    fn from(err: InvalidationError) -> Self {
        match err {
            InvalidationError::Validation(message) => Self::invalid_input(message),
            InvalidationError::Store(err) => Self::from(err),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::store(err.to_string())
    }
}

impl From<KeyError> for ApiError {
    fn from(err: KeyError) -> Self {
        Self::invalid_input(err.to_string())
    }
}

impl From<WarmError> for ApiError {
    fn from(err: WarmError) -> Self {
        match err {
            WarmError::Validation(message) => Self::invalid_input(message),
            other @ WarmError::UnsafePath { .. } => Self::invalid_input(other.to_string()),
            WarmError::Store(err) => Self::from(err),
            other @ (WarmError::Url { .. }
            | WarmError::Request { .. }
            | WarmError::Upstream { .. }
            | WarmError::Timeout { .. }) => Self::new(
                StatusCode::BAD_GATEWAY,
                codes::UPSTREAM,
                "Warming origin request failed",
                Some(other.to_string()),
            ),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            codes::BAD_REQUEST,
            "Malformed request body",
            Some(rejection.body_text()),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let hint = self.hint.clone();
        let body = ApiErrorBody {
            error: ApiErrorMessage {
                code: self.code.to_string(),
                message: self.message.to_string(),
                hint: self.hint,
            },
        };
        let mut response = (self.status, Json(body)).into_response();
        // Attach a structured report so shared logging middleware can emit rich diagnostics.
        ErrorReport::from_message(
            "infra::http::api",
            self.status,
            format!("{}: {}", self.code, hint.as_deref().unwrap_or(self.message)),
        )
        .attach(&mut response);
        response
    }
}
