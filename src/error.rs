use std::time::Duration;

use axum::http::header::{HeaderValue, RETRY_AFTER, WWW_AUTHENTICATE};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::middleware::rate_limit::write_rate_limit_headers;
use crate::ratelimit::{Decision, StoreError};
use crate::validation::ValidationError;

/// Application-wide error types with appropriate HTTP status codes.
///
/// # Counter Store Errors
///
/// Store failures are dependency errors and never look like a rate-limit
/// denial: `StoreUnavailable` maps to `503`, `StoreTimeout` to `504`, and
/// neither carries `X-RateLimit-*` headers.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Rate limit exceeded ({} of {} remaining)", .0.remaining, .0.limit)]
    RateLimited(Decision),

    #[error("Client address is missing or not a valid IP address")]
    InvalidClientAddress,

    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Counter store timed out after {0:?}")]
    StoreTimeout(Duration),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Too many failed authentication attempts, retry after {retry_after}s")]
    AuthThrottled { retry_after: u64 },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Missing argument: {0}")]
    MissingArgument(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Timeout(after) => AppError::StoreTimeout(after),
            other => AppError::StoreUnavailable(other.to_string()),
        }
    }
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::RateLimited(_) => StatusCode::FORBIDDEN,
            AppError::InvalidClientAddress
            | AppError::Validation(_)
            | AppError::MissingArgument(_)
            | AppError::SerializationError(_)
            | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::AuthThrottled { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::StoreTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error response body for API endpoints.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Fields that failed validation.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<String>,
}

impl ErrorResponse {
    fn new(error: &str, message: impl Into<String>) -> Self {
        Self {
            error: error.to_string(),
            message: message.into(),
            details: None,
            context: Vec::new(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Full details stay server-side; 5xx bodies carry a fixed message.
        if status.is_server_error() {
            tracing::error!(error = %self, status = status.as_u16(), "Request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "Request rejected");
        }

        let body = match &self {
            AppError::RateLimited(_) => {
                ErrorResponse::new("rate_limited", "Rate limit exceeded. Please retry later.")
            }
            AppError::InvalidClientAddress => ErrorResponse::new(
                "invalid_client_address",
                "Could not determine a valid client IP address.",
            ),
            AppError::StoreUnavailable(_) => ErrorResponse::new(
                "store_unavailable",
                "Rate limit store is temporarily unavailable. Please try again later.",
            ),
            AppError::StoreTimeout(_) => ErrorResponse::new(
                "store_timeout",
                "Rate limit store did not respond in time. Please try again.",
            ),
            AppError::Unauthorized(msg) => ErrorResponse::new("unauthorized", msg.as_str()),
            AppError::AuthThrottled { .. } => ErrorResponse::new(
                "too_many_requests",
                "Too many failed authentication attempts. Please wait before retrying.",
            ),
            AppError::Validation(e) => ErrorResponse {
                details: Some(e.message.clone()),
                context: e.context.clone(),
                ..ErrorResponse::new("validation_error", e.for_human())
            },
            AppError::MissingArgument(name) => ErrorResponse {
                context: vec![name.clone()],
                ..ErrorResponse::new(
                    "missing_argument",
                    format!("Missing required argument `{name}`"),
                )
            },
            // Serde messages help clients fix payloads, minus internal type names.
            AppError::SerializationError(e) => {
                ErrorResponse::new("serialization_error", sanitize_serde_error(e))
            }
            AppError::NotFound(msg) => ErrorResponse::new("not_found", msg.as_str()),
            AppError::BadRequest(msg) => ErrorResponse::new("bad_request", msg.as_str()),
            AppError::ConfigError(_) => ErrorResponse::new(
                "config_error",
                "Service configuration error. Please contact support.",
            ),
        };

        let mut response = (status, axum::Json(body)).into_response();
        let headers = response.headers_mut();
        match &self {
            AppError::RateLimited(decision) => write_rate_limit_headers(headers, decision),
            AppError::Unauthorized(_) => {
                headers.insert(WWW_AUTHENTICATE, HeaderValue::from_static("API-Key"));
            }
            AppError::AuthThrottled { retry_after } => {
                headers.insert(RETRY_AFTER, HeaderValue::from(*retry_after));
            }
            _ => {}
        }
        response
    }
}

/// Sanitize serde error messages to avoid leaking internal type information.
fn sanitize_serde_error(e: &serde_json::Error) -> String {
    let msg = e.to_string();

    if let Some(field) = backticked(&msg) {
        if msg.contains("missing field") {
            return format!("Missing required field: {field}");
        }
        if msg.contains("unknown field") {
            return format!("Unknown field: {field}");
        }
    }

    if msg.contains("invalid type") || msg.contains("invalid value") {
        return "Invalid data type in request body".to_string();
    }

    if msg.contains("EOF while parsing") || msg.contains("expected") {
        return "Malformed JSON in request body".to_string();
    }

    "Invalid request format".to_string()
}

/// First `` `quoted` `` segment of a serde or extractor message.
pub(crate) fn backticked(msg: &str) -> Option<&str> {
    let (_, rest) = msg.split_once('`')?;
    let (field, _) = rest.split_once('`')?;
    Some(field)
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use chrono::Utc;
    use serde_json::Value;

    use super::*;

    async fn json_body(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_rate_limited_is_403_with_headers() {
        let decision = Decision {
            limit: 5,
            remaining: 0,
            reset_at: Utc::now(),
            allowed: false,
        };
        let response = AppError::RateLimited(decision).into_response();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.headers()["x-ratelimit-limit"], "5");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
        assert_eq!(
            response.headers()["x-ratelimit-reset"],
            decision.reset_timestamp().to_string().as_str()
        );
        assert_eq!(json_body(response).await["error"], "rate_limited");
    }

    #[test]
    fn test_store_errors_map_to_dependency_statuses() {
        let unavailable: AppError = StoreError::Unavailable("refused".into()).into();
        assert_eq!(unavailable.status(), StatusCode::SERVICE_UNAVAILABLE);

        let timeout: AppError = StoreError::Timeout(Duration::from_millis(500)).into();
        assert_eq!(timeout.status(), StatusCode::GATEWAY_TIMEOUT);

        let contended: AppError = StoreError::Contended("k".into()).into();
        assert_eq!(contended.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_store_error_body_hides_details() {
        let response = AppError::StoreUnavailable("redis://secret-host".into()).into_response();
        assert!(!response.headers().contains_key("x-ratelimit-limit"));
        let body = json_body(response).await;
        assert_eq!(body["error"], "store_unavailable");
        assert!(!body.to_string().contains("secret-host"));
    }

    #[tokio::test]
    async fn test_unauthorized_sets_www_authenticate() {
        let response = AppError::Unauthorized("API key required".into()).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[WWW_AUTHENTICATE], "API-Key");
    }

    #[tokio::test]
    async fn test_validation_error_lists_fields() {
        let err = ValidationError::field("name", "must not be empty")
            .merge(ValidationError::field("shout", "expected a boolean"));
        let response = AppError::Validation(err).into_response();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["error"], "validation_error");
        assert_eq!(body["context"], serde_json::json!(["name", "shout"]));
        assert!(body["message"].as_str().unwrap().contains("name, shout"));
    }

    #[tokio::test]
    async fn test_not_found() {
        let response = AppError::NotFound("No route for /nope".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = json_body(response).await;
        assert_eq!(body["error"], "not_found");
        assert_eq!(body["message"], "No route for /nope");
    }

    #[tokio::test]
    async fn test_missing_argument() {
        let response = AppError::MissingArgument("name".into()).into_response();
        let body = json_body(response).await;
        assert_eq!(body["error"], "missing_argument");
        assert_eq!(body["message"], "Missing required argument `name`");
    }

    #[test]
    fn test_sanitize_serde_error() {
        #[derive(Debug, serde::Deserialize)]
        #[serde(deny_unknown_fields)]
        #[allow(dead_code)]
        struct Payload {
            name: String,
        }

        let missing = serde_json::from_str::<Payload>("{}").unwrap_err();
        assert_eq!(sanitize_serde_error(&missing), "Missing required field: name");

        let unknown = serde_json::from_str::<Payload>(r#"{"name":"a","x":1}"#).unwrap_err();
        assert_eq!(sanitize_serde_error(&unknown), "Unknown field: x");

        let wrong_type = serde_json::from_str::<Payload>(r#"{"name":1}"#).unwrap_err();
        assert_eq!(
            sanitize_serde_error(&wrong_type),
            "Invalid data type in request body"
        );

        let truncated = serde_json::from_str::<Payload>(r#"{"name":"#).unwrap_err();
        assert_eq!(
            sanitize_serde_error(&truncated),
            "Malformed JSON in request body"
        );
    }
}
