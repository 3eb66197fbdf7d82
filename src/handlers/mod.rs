mod greeting;
mod health;

pub use greeting::{SlowDown, hello, me};
pub use health::{health_check, readiness_check};

use axum::http::Uri;

use crate::error::AppError;

/// Router fallback for paths with no handler.
pub async fn not_found(uri: Uri) -> AppError {
    AppError::NotFound(format!("No route for {}", uri.path()))
}
