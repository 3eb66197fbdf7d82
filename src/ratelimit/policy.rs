//! Per-role quotas for a protected operation.
//!
//! A [`Quota`] is validated when it is built, so a request path never has to
//! re-check `tokens > 0` or `window > 0`. A [`RateLimitPolicy`] carries an
//! optional quota for each [`Role`].
//!
//! # Formats
//!
//! - Environment / CLI: `"<tokens>/<seconds>"`, e.g. `"60/3600"`
//! - JSON: `[tokens, seconds]`, and a policy is
//!   `{"authenticated": [8, 2], "anonymous": [1, 2]}`

use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Errors produced when building a [`Quota`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuotaError {
    #[error("quota token count must be greater than 0")]
    ZeroTokens,

    #[error("quota window must be at least 1 second")]
    ZeroWindow,

    #[error("invalid quota '{0}': expected '<tokens>/<seconds>'")]
    Malformed(String),
}

/// Token allowance per fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "(u32, u32)")]
pub struct Quota {
    tokens: NonZeroU32,
    window_secs: NonZeroU32,
}

impl Quota {
    /// Build a quota of `tokens` requests per `window_secs` seconds.
    ///
    /// # Errors
    ///
    /// Returns [`QuotaError::ZeroTokens`] or [`QuotaError::ZeroWindow`] when
    /// either value is zero.
    pub fn new(tokens: u32, window_secs: u32) -> Result<Self, QuotaError> {
        let tokens = NonZeroU32::new(tokens).ok_or(QuotaError::ZeroTokens)?;
        let window_secs = NonZeroU32::new(window_secs).ok_or(QuotaError::ZeroWindow)?;
        Ok(Self::from_nonzero(tokens, window_secs))
    }

    /// Infallible constructor for values already known to be non-zero.
    pub const fn from_nonzero(tokens: NonZeroU32, window_secs: NonZeroU32) -> Self {
        Self {
            tokens,
            window_secs,
        }
    }

    #[inline]
    pub fn tokens(&self) -> u32 {
        self.tokens.get()
    }

    #[inline]
    pub fn window_secs(&self) -> u32 {
        self.window_secs.get()
    }

    #[inline]
    pub fn window(&self) -> Duration {
        Duration::from_secs(u64::from(self.window_secs.get()))
    }
}

impl TryFrom<(u32, u32)> for Quota {
    type Error = QuotaError;

    fn try_from((tokens, window_secs): (u32, u32)) -> Result<Self, Self::Error> {
        Self::new(tokens, window_secs)
    }
}

impl FromStr for Quota {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || QuotaError::Malformed(s.to_string());

        let (tokens, window) = s.trim().split_once('/').ok_or_else(malformed)?;
        let tokens: u32 = tokens.trim().parse().map_err(|_| malformed())?;
        let window: u32 = window.trim().parse().map_err(|_| malformed())?;

        Self::new(tokens, window)
    }
}

impl fmt::Display for Quota {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tokens, self.window_secs)
    }
}

/// Caller classification used to pick a quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Authenticated,
    Anonymous,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Authenticated => "authenticated",
            Role::Anonymous => "anonymous",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quotas for one protected operation (route + method).
///
/// A role without a quota is not limited on that operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitPolicy {
    #[serde(default)]
    authenticated: Option<Quota>,
    #[serde(default)]
    anonymous: Option<Quota>,
}

impl RateLimitPolicy {
    pub fn new(authenticated: Option<Quota>, anonymous: Option<Quota>) -> Self {
        Self {
            authenticated,
            anonymous,
        }
    }

    /// Policy that limits authenticated callers only.
    pub fn authenticated(quota: Quota) -> Self {
        Self::new(Some(quota), None)
    }

    /// Policy that limits anonymous callers only.
    pub fn anonymous(quota: Quota) -> Self {
        Self::new(None, Some(quota))
    }

    #[must_use]
    pub fn with_authenticated(mut self, quota: Quota) -> Self {
        self.authenticated = Some(quota);
        self
    }

    #[must_use]
    pub fn with_anonymous(mut self, quota: Quota) -> Self {
        self.anonymous = Some(quota);
        self
    }

    /// True when neither role has a quota.
    pub fn is_empty(&self) -> bool {
        self.authenticated.is_none() && self.anonymous.is_none()
    }

    pub fn quota(&self, role: Role) -> Option<Quota> {
        match role {
            Role::Authenticated => self.authenticated,
            Role::Anonymous => self.anonymous,
        }
    }

    /// Pick the quota slot that applies to a caller.
    ///
    /// Authenticated callers use the authenticated quota when one is
    /// configured and fall back to the anonymous slot otherwise. Returns the
    /// slot actually used, so counters for the two slots never mix.
    pub fn select(&self, authenticated: bool) -> Option<(Role, Quota)> {
        if authenticated && let Some(quota) = self.authenticated {
            return Some((Role::Authenticated, quota));
        }
        self.anonymous.map(|quota| (Role::Anonymous, quota))
    }
}
