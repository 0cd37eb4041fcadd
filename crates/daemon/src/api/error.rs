use std::future::Future;

use axum::{
    http::{header::HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use trisync_common::types::{ErrorInfo, ErrorKind};
use uuid::Uuid;

use crate::error::SyncError;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

tokio::task_local! {
    static REQUEST_ID: String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ValidationFailed,
    Unauthorized,
    Forbidden,
    NotFound,
    ConflictResolution,
    Reauthenticate,
    Unavailable,
    InternalError,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::Unauthorized => "AUTH_INVALID_TOKEN",
            Self::Forbidden => "AUTH_FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::ConflictResolution => "CONFLICT_RESOLUTION_FAILED",
            Self::Reauthenticate => "REMOTE_REAUTHENTICATE",
            Self::Unavailable => "UNAVAILABLE",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    pub const fn status(self) -> StatusCode {
        match self {
            Self::ValidationFailed => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::ConflictResolution => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Reauthenticate => StatusCode::FAILED_DEPENDENCY,
            Self::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub const fn retryable(self) -> bool {
        matches!(self, Self::Unavailable | Self::InternalError)
    }

    pub const fn default_message(self) -> &'static str {
        match self {
            Self::ValidationFailed => "request validation failed",
            Self::Unauthorized => "invalid authentication token",
            Self::Forbidden => "caller does not own this project",
            Self::NotFound => "requested resource not found",
            Self::ConflictResolution => "conflict could not be resolved as requested",
            Self::Reauthenticate => "remote store credentials must be renewed",
            Self::Unavailable => "a dependency is temporarily unavailable",
            Self::InternalError => "internal server error",
        }
    }

    /// Code for an error kind carried by the sync machinery.
    pub const fn for_kind(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::TransientIo | ErrorKind::WatcherDisconnected => Self::Unavailable,
            ErrorKind::Auth => Self::Reauthenticate,
            ErrorKind::ConflictResolution => Self::ConflictResolution,
            ErrorKind::NotFound => Self::NotFound,
            ErrorKind::Forbidden => Self::Forbidden,
            ErrorKind::MergeFailure | ErrorKind::Storage | ErrorKind::Internal => {
                Self::InternalError
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiError {
    code: ErrorCode,
    message: String,
    details: Value,
    request_id: Option<String>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), details: json!({}), request_id: None }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationFailed, message)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }
}

impl From<&ErrorInfo> for ApiError {
    fn from(info: &ErrorInfo) -> Self {
        Self::new(ErrorCode::for_kind(info.kind), info.message.clone())
            .with_details(json!({ "kind": info.kind.as_str() }))
    }
}

impl From<SyncError> for ApiError {
    fn from(error: SyncError) -> Self {
        Self::from(&error.info())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let request_id = self.request_id.or_else(current_request_id);

        let mut response = (
            self.code.status(),
            Json(json!({
                "success": false,
                "error": {
                    "code": self.code.as_str(),
                    "message": self.message,
                    "retryable": self.code.retryable(),
                    "request_id": request_id.clone(),
                    "details": self.details,
                }
            })),
        )
            .into_response();

        if let Some(request_id) = request_id {
            attach_request_id_header(&mut response, &request_id);
        }

        response
    }
}

pub async fn with_request_id_scope<F>(request_id: String, future: F) -> F::Output
where
    F: Future,
{
    REQUEST_ID.scope(request_id, future).await
}

pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(Clone::clone).ok()
}

pub fn request_id_from_headers_or_generate(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

pub fn attach_request_id_header(response: &mut Response, request_id: &str) {
    if let Ok(header) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, header);
    }
}

#[cfg(test)]
mod tests {
    use axum::{body::to_bytes, http::StatusCode, response::IntoResponse};
    use serde_json::Value;

    use super::*;
    use crate::error::{RemoteError, ResolutionError};

    async fn body_json(response: Response) -> Value {
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("error response body should be readable");
        serde_json::from_slice(&body).expect("error response body should be valid json")
    }

    #[tokio::test]
    async fn api_error_uses_scoped_request_id() {
        let response = with_request_id_scope("req-scoped-123".to_owned(), async {
            ApiError::from_code(ErrorCode::InternalError).into_response()
        })
        .await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers().get(REQUEST_ID_HEADER).unwrap(), "req-scoped-123");
        let parsed = body_json(response).await;
        assert_eq!(parsed["success"], false);
        assert_eq!(parsed["error"]["code"], "INTERNAL_ERROR");
        assert_eq!(parsed["error"]["retryable"], true);
        assert_eq!(parsed["error"]["request_id"], "req-scoped-123");
        assert_eq!(parsed["error"]["details"], serde_json::json!({}));
    }

    #[tokio::test]
    async fn remote_auth_failure_asks_for_reauthentication() {
        let error = SyncError::from(RemoteError::Auth("token expired".into()));
        let response = ApiError::from(error).into_response();

        assert_eq!(response.status(), StatusCode::FAILED_DEPENDENCY);
        let parsed = body_json(response).await;
        assert_eq!(parsed["error"]["code"], "REMOTE_REAUTHENTICATE");
        assert_eq!(parsed["error"]["retryable"], false);
        assert_eq!(parsed["error"]["details"]["kind"], "auth");
    }

    #[tokio::test]
    async fn resolution_errors_are_unprocessable() {
        let error = SyncError::from(ResolutionError::MissingContent);
        let response = ApiError::from(error).into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let parsed = body_json(response).await;
        assert_eq!(parsed["error"]["message"], "manual resolution requires content");
    }

    #[tokio::test]
    async fn explicit_request_id_overrides_scope() {
        let response = with_request_id_scope("req-scoped-123".to_owned(), async {
            ApiError::from_code(ErrorCode::Forbidden)
                .with_request_id("req-explicit-456")
                .into_response()
        })
        .await;

        let parsed = body_json(response).await;
        assert_eq!(parsed["error"]["request_id"], "req-explicit-456");
    }

    #[test]
    fn kinds_map_to_codes() {
        assert_eq!(ErrorCode::for_kind(ErrorKind::TransientIo), ErrorCode::Unavailable);
        assert_eq!(ErrorCode::for_kind(ErrorKind::NotFound).status(), StatusCode::NOT_FOUND);
        assert!(!ErrorCode::for_kind(ErrorKind::ConflictResolution).retryable());
    }
}
