use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::validation::{Validate, ValidationError, collect, validate_name};
use crate::validators::{lenient_bool, validate_uuid};

/// Greeting parameters, read from the query string (`GET`) or the body
/// (`POST`, JSON or form).
#[derive(Debug, Deserialize)]
pub struct GreetingRequest {
    /// Who to greet
    pub name: String,
    /// Upper-case the greeting. Accepts `yes`/`no`, `1`/`0`, `on`/`off` and
    /// friends as well as JSON booleans.
    #[serde(default, deserialize_with = "lenient_bool::deserialize")]
    pub shout: bool,
    /// Echoed back so callers can match responses to requests
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl GreetingRequest {
    /// The validated correlation id, if one was sent.
    pub fn correlation_id(&self) -> Option<Uuid> {
        self.correlation_id
            .as_deref()
            .and_then(|id| validate_uuid("correlation_id", id).ok())
    }
}

impl Validate for GreetingRequest {
    fn validate(&self) -> Result<(), ValidationError> {
        collect([
            validate_name("name", &self.name),
            self.correlation_id
                .as_deref()
                .map_or(Ok(()), |id| validate_uuid("correlation_id", id).map(|_| ())),
        ])
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GreetingResponse {
    pub message: String,
    /// Name of the authenticated caller, absent for anonymous callers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
}

/// The authenticated caller.
#[derive(Debug, Serialize, Deserialize)]
pub struct MeResponse {
    pub user: String,
}

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// `healthy` or `degraded`
    pub status: String,
    /// Counter store backend (`redis` or `memory`)
    pub store: String,
    /// Whether the counter store answered a ping
    pub store_connected: bool,
    /// Service version
    pub version: String,
    pub uptime_seconds: u64,
    /// Current timestamp
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn request(json: &str) -> GreetingRequest {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_greeting_request_defaults() {
        let req = request(r#"{"name":"steve"}"#);
        assert!(!req.shout);
        assert!(req.correlation_id.is_none());
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_greeting_request_reports_all_bad_fields() {
        let req = request(r#"{"name":"-x","correlation_id":"nope"}"#);
        let err = req.validate().unwrap_err();
        assert_eq!(err.context, vec!["name", "correlation_id"]);
    }

    #[test]
    fn test_greeting_request_correlation_id() {
        let req = request(r#"{"name":"a","correlation_id":"f47ac10b-58cc-4372-a567-0e02b2c3d479"}"#);
        assert!(req.validate().is_ok());
        assert_eq!(
            req.correlation_id().unwrap().to_string(),
            "f47ac10b-58cc-4372-a567-0e02b2c3d479"
        );
    }

    #[test]
    fn test_greeting_response_omits_empty_fields() {
        let response = GreetingResponse {
            message: "Hello, steve!".to_string(),
            user: None,
            correlation_id: None,
        };
        let json = serde_json::to_string(&response).expect("Serialization should succeed");
        assert_eq!(json, r#"{"message":"Hello, steve!"}"#);
    }

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "healthy".to_string(),
            store: "redis".to_string(),
            store_connected: true,
            version: "0.1.0".to_string(),
            uptime_seconds: 3,
            timestamp: Utc::now(),
        };

        let json = serde_json::to_string(&response).expect("Serialization should succeed");
        assert!(json.contains("\"status\":\"healthy\""));
        assert!(json.contains("\"store_connected\":true"));
    }
}
