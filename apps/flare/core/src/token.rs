use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::Identity;

/// Claims behind an opaque session token handed out at login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    pub token: Uuid,
    pub identity: Identity,
    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

impl SessionClaims {
    /// Mints claims for `identity` valid for `ttl` from now.
    pub fn issue(identity: Identity, ttl: Duration) -> Self {
        let issued_at = OffsetDateTime::now_utc();
        Self {
            token: Uuid::new_v4(),
            identity,
            issued_at,
            expires_at: issued_at + ttl,
        }
    }

    /// Returns `Ok(())` if the token has not yet expired.
    pub fn ensure_not_expired(&self, now: OffsetDateTime) -> Result<(), TokenValidationError> {
        if now > self.expires_at {
            Err(TokenValidationError::Expired)
        } else {
            Ok(())
        }
    }

    /// Whole seconds until expiry, floored at zero.
    pub fn remaining_secs(&self, now: OffsetDateTime) -> u64 {
        (self.expires_at - now).whole_seconds().max(0) as u64
    }
}

/// Errors returned while validating a session token.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenValidationError {
    #[error("session token has expired")]
    Expired,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn fresh_claims_are_valid() {
        let claims = SessionClaims::issue(Identity::new("alice").unwrap(), Duration::hours(1));
        assert!(claims.ensure_not_expired(OffsetDateTime::now_utc()).is_ok());
        assert!(claims.remaining_secs(claims.issued_at) >= 3599);
    }

    #[test_timeout::timeout]
    fn expired_claims_are_rejected() {
        let claims = SessionClaims::issue(Identity::new("alice").unwrap(), Duration::seconds(30));
        let later = claims.expires_at + Duration::seconds(1);
        assert_eq!(
            claims.ensure_not_expired(later),
            Err(TokenValidationError::Expired)
        );
        assert_eq!(claims.remaining_secs(later), 0);
    }

    #[test_timeout::timeout]
    fn claims_survive_json() {
        let claims = SessionClaims::issue(Identity::new("carol").unwrap(), Duration::minutes(5));
        let encoded = serde_json::to_string(&claims).unwrap();
        let decoded: SessionClaims = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.token, claims.token);
        assert_eq!(decoded.identity, claims.identity);
        assert_eq!(
            decoded.expires_at.unix_timestamp(),
            claims.expires_at.unix_timestamp()
        );
    }
}
