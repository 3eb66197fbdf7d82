//! Request validation.
//!
//! [`Validated<T>`] deserializes `T` from the request and then runs its
//! [`Validate`] checks:
//!
//! - `GET`, `HEAD` and `DELETE`: the query string
//! - other methods with `Content-Type: application/x-www-form-urlencoded`: the
//!   form body
//! - other methods: the JSON body (an empty body is treated as `{}`)
//!
//! A required field that is absent becomes `400 missing_argument`; a failed
//! check becomes `400 validation_error` listing the offending fields.

use std::fmt;

use axum::body::Bytes;
use axum::extract::{Form, FromRequest, Query, Request};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, Method};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::error::{AppError, backticked};

/// Maximum length for names accepted by [`validate_name`].
pub const MAX_NAME_LENGTH: usize = 64;

/// One or more fields failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ValidationError {
    /// Names of the offending fields, in the order they were checked.
    pub context: Vec<String>,
    /// Detail for logs and API clients, e.g. `"name: must not be empty"`.
    pub message: String,
}

impl ValidationError {
    pub fn field(field: impl Into<String>, message: impl fmt::Display) -> Self {
        let field = field.into();
        Self {
            message: format!("{field}: {message}"),
            context: vec![field],
        }
    }

    /// Combine two errors, keeping both field lists.
    #[must_use]
    pub fn merge(mut self, other: ValidationError) -> Self {
        self.context.extend(other.context);
        self.message = format!("{}; {}", self.message, other.message);
        self
    }

    /// Message for people: which fields to look at.
    pub fn for_human(&self) -> String {
        format!(
            "Please review the following fields: {}",
            self.context.join(", ")
        )
    }
}

/// Gather several checks, reporting every failure rather than the first.
pub fn collect(
    checks: impl IntoIterator<Item = Result<(), ValidationError>>,
) -> Result<(), ValidationError> {
    checks
        .into_iter()
        .filter_map(Result::err)
        .reduce(ValidationError::merge)
        .map_or(Ok(()), Err)
}

/// Checks that run after deserialization.
pub trait Validate {
    fn validate(&self) -> Result<(), ValidationError> {
        Ok(())
    }
}

/// Extractor for a deserialized and validated request payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct Validated<T>(pub T);

impl<S, T> FromRequest<S> for Validated<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Validate,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let value: T = if reads_query(req.method()) {
            let Query(value) =
                Query::try_from_uri(req.uri()).map_err(|e| rejection_error(&e.body_text()))?;
            value
        } else if is_form(req.headers()) {
            let Form(value) = Form::from_request(req, state)
                .await
                .map_err(|e| rejection_error(&e.body_text()))?;
            value
        } else {
            let body = Bytes::from_request(req, state)
                .await
                .map_err(|e| AppError::BadRequest(e.body_text()))?;
            let body: &[u8] = if body.is_empty() { b"{}" } else { &body };
            serde_json::from_slice(body).map_err(json_error)?
        };

        value.validate()?;
        Ok(Validated(value))
    }
}

fn reads_query(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::DELETE)
}

fn is_form(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"))
}

/// Map a query/form rejection, singling out absent required fields.
fn rejection_error(text: &str) -> AppError {
    if text.contains("missing field")
        && let Some(field) = backticked(text)
    {
        return AppError::MissingArgument(field.to_string());
    }
    AppError::BadRequest(text.to_string())
}

fn json_error(e: serde_json::Error) -> AppError {
    let text = e.to_string();
    if text.contains("missing field")
        && let Some(field) = backticked(&text)
    {
        return AppError::MissingArgument(field.to_string());
    }
    AppError::SerializationError(e)
}

/// Validate a display name.
///
/// Rules:
/// - between 1 and [`MAX_NAME_LENGTH`] characters
/// - starts and ends with an alphanumeric character
/// - otherwise alphanumerics, spaces, dots, underscores and hyphens
pub fn validate_name(field: &str, name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::field(field, "must not be empty"));
    }

    if name.chars().count() > MAX_NAME_LENGTH {
        return Err(ValidationError::field(
            field,
            format_args!("must not exceed {MAX_NAME_LENGTH} characters"),
        ));
    }

    let starts_ok = name.chars().next().is_some_and(char::is_alphanumeric);
    let ends_ok = name.chars().next_back().is_some_and(char::is_alphanumeric);
    if !starts_ok || !ends_ok {
        return Err(ValidationError::field(
            field,
            "must start and end with a letter or digit",
        ));
    }

    if let Some((i, c)) = name
        .char_indices()
        .find(|&(_, c)| !(c.is_alphanumeric() || matches!(c, ' ' | '.' | '_' | '-')))
    {
        return Err(ValidationError::field(
            field,
            format_args!("contains invalid character '{c}' at position {i}"),
        ));
    }

    Ok(())
}
