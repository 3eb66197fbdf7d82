//! Field validators for request payloads.
//!
//! Use with serde attributes on types extracted through
//! [`Validated`](crate::validation::Validated):
//!
//! ```rust,ignore
//! #[derive(Deserialize)]
//! struct Greeting {
//!     #[serde(default, deserialize_with = "lenient_bool::deserialize")]
//!     shout: bool,
//! }
//! ```

use uuid::Uuid;

use crate::validation::ValidationError;

/// Interpret common spellings of a boolean, ignoring ASCII case and
/// surrounding whitespace.
///
/// Accepts `y`, `yes`, `1`, `t`, `true`, `on` and `n`, `no`, `0`, `f`,
/// `false`, `off`.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" | "1" | "t" | "true" | "on" => Some(true),
        "n" | "no" | "0" | "f" | "false" | "off" => Some(false),
        _ => None,
    }
}

/// Serde support for booleans sent as strings, numbers or JSON booleans.
pub mod lenient_bool {
    use serde::Deserialize;
    use serde::de::{self, Deserializer};

    use super::parse_bool;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bool(bool),
        Int(i64),
        Str(String),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<bool, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Bool(b) => Ok(b),
            Raw::Int(1) => Ok(true),
            Raw::Int(0) => Ok(false),
            Raw::Int(n) => Err(de::Error::custom(format!("expected a boolean, got {n}"))),
            Raw::Str(s) => parse_bool(&s)
                .ok_or_else(|| de::Error::custom(format!("expected a boolean, got '{s}'"))),
        }
    }
}

/// Parse `value` as a UUID, reporting failures against `field`.
///
/// Accepts the hyphenated and simple (32 hex digits) forms, in any case.
pub fn validate_uuid(field: &str, value: &str) -> Result<Uuid, ValidationError> {
    Uuid::try_parse(value.trim()).map_err(|_| ValidationError::field(field, "must be a UUID"))
}
