//! Bearer token verification

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, encode, errors::ErrorKind, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::{
    config::TokenSettings,
    error::{AdmissionError, Result},
    utils::TimeSource,
};

/// Role asserted by a credential, lowest privilege first
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    #[serde(alias = "user")]
    Standard,
    Moderator,
    #[serde(alias = "admin")]
    Administrator,
}

/// Verified identity carried by a bearer token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub sub: String,
    #[serde(default)]
    pub role: Role,
    /// Issued-at, Unix seconds
    pub iat: i64,
    /// Expires-at, Unix seconds
    pub exp: i64,
}

impl Claim {
    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.iat, 0).single()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.exp, 0).single()
    }
}

/// Why a credential did not yield a claim
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialFailure {
    #[error("authentication token is required")]
    Missing,
    #[error("invalid authentication token")]
    Malformed,
    #[error("authentication token has expired")]
    Expired,
    #[error("token verification failed: {0}")]
    Internal(String),
}

impl CredentialFailure {
    pub fn kind(&self) -> &'static str {
        match self {
            CredentialFailure::Missing => "missing",
            CredentialFailure::Malformed => "malformed",
            CredentialFailure::Expired => "expired",
            CredentialFailure::Internal(_) => "internal",
        }
    }
}

/// Extract the token from an `Authorization: Bearer <token>` value
pub fn extract_bearer(header: Option<&str>) -> Option<&str> {
    header?.strip_prefix("Bearer ")
}

pub struct TokenVerifier {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    header: Header,
    validation: Validation,
    clock_skew_ms: u64,
    token_ttl: Duration,
    time_source: TimeSource,
}

impl TokenVerifier {
    pub fn new(settings: &TokenSettings) -> Self {
        Self::with_time_source(settings, TimeSource::new())
    }

    pub fn with_time_source(settings: &TokenSettings, time_source: TimeSource) -> Self {
        let mut validation = Validation::new(settings.algorithm);
        // Expiry is checked against our own clock after the signature passes,
        // so an expired token is only reported as such when it is authentic.
        validation.validate_exp = false;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Self {
            encoding_key: EncodingKey::from_secret(settings.secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(settings.secret.as_bytes()),
            header: Header::new(settings.algorithm),
            validation,
            clock_skew_ms: settings.clock_skew_tolerance_ms,
            token_ttl: Duration::from_secs(settings.token_ttl_secs),
            time_source,
        }
    }

    /// Verify the raw `Authorization` header value.
    pub fn verify(
        &self,
        authorization: Option<&str>,
    ) -> std::result::Result<Claim, CredentialFailure> {
        let token = extract_bearer(authorization).ok_or(CredentialFailure::Missing)?;

        let claim = decode::<Claim>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                debug!(error = %e, "Token validation failed");
                match e.kind() {
                    ErrorKind::InvalidKeyFormat | ErrorKind::Crypto(_) => {
                        CredentialFailure::Internal(e.to_string())
                    }
                    _ => CredentialFailure::Malformed,
                }
            })?;

        if claim.exp <= claim.iat {
            debug!(sub = %claim.sub, "Token expires before it was issued");
            return Err(CredentialFailure::Malformed);
        }

        let expires_ms = claim.exp.saturating_mul(1000).max(0) as u64;
        if self.time_source.now_ms() > expires_ms.saturating_add(self.clock_skew_ms) {
            debug!(sub = %claim.sub, exp = claim.exp, "Token expired");
            return Err(CredentialFailure::Expired);
        }

        Ok(claim)
    }

    /// Optional mode: any failure is treated as an anonymous caller.
    pub fn verify_optional(&self, authorization: Option<&str>) -> Option<Claim> {
        match self.verify(authorization) {
            Ok(claim) => Some(claim),
            Err(CredentialFailure::Missing) => None,
            Err(failure) => {
                debug!(kind = failure.kind(), "Ignoring credential failure in optional mode");
                None
            }
        }
    }

    /// Mint a token for `subject` valid for the configured lifetime
    pub fn issue(&self, subject: &str, role: Role) -> Result<String> {
        let iat = (self.time_source.now_ms() / 1000) as i64;
        self.sign(&Claim {
            sub: subject.to_string(),
            role,
            iat,
            exp: iat + self.token_ttl.as_secs() as i64,
        })
    }

    pub fn sign(&self, claim: &Claim) -> Result<String> {
        encode(&self.header, claim, &self.encoding_key).map_err(|e| {
            tracing::error!("Failed to encode token: {}", e);
            AdmissionError::Token(e.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::Algorithm;

    const NOW_MS: u64 = 1_700_000_000_000;
    const NOW: i64 = (NOW_MS / 1000) as i64;

    fn settings(secret: &str) -> TokenSettings {
        TokenSettings {
            secret: secret.to_string(),
            ..TokenSettings::default()
        }
    }

    fn verifier(secret: &str) -> TokenVerifier {
        TokenVerifier::with_time_source(&settings(secret), TimeSource::manual(NOW_MS))
    }

    fn bearer(token: &str) -> String {
        format!("Bearer {}", token)
    }

    fn claim(iat: i64, exp: i64) -> Claim {
        Claim {
            sub: "user-1".to_string(),
            role: Role::Moderator,
            iat,
            exp,
        }
    }

    #[test]
    fn test_valid_token_round_trip() {
        let v = verifier("secret");
        let token = v.issue("user-1", Role::Administrator).unwrap();

        let claim = v.verify(Some(&bearer(&token))).unwrap();
        assert_eq!(claim.sub, "user-1");
        assert_eq!(claim.role, Role::Administrator);
        assert!(claim.expires_at().unwrap() > claim.issued_at().unwrap());
    }

    #[test]
    fn test_missing_header_or_scheme() {
        let v = verifier("secret");
        assert_eq!(v.verify(None), Err(CredentialFailure::Missing));
        assert_eq!(v.verify(Some("Basic dXNlcjpwYXNz")), Err(CredentialFailure::Missing));
        assert_eq!(v.verify(Some("bearer abc")), Err(CredentialFailure::Missing));
    }

    #[test]
    fn test_garbage_is_malformed() {
        let v = verifier("secret");
        assert_eq!(v.verify(Some("Bearer ")), Err(CredentialFailure::Malformed));
        assert_eq!(v.verify(Some("Bearer not.a.jwt")), Err(CredentialFailure::Malformed));
    }

    #[test]
    fn test_wrong_secret_is_malformed_even_when_expired() {
        let other = verifier("other-secret");
        let fresh = other.sign(&claim(NOW - 10, NOW + 3600)).unwrap();
        let stale = other.sign(&claim(NOW - 7200, NOW - 3600)).unwrap();

        let v = verifier("secret");
        assert_eq!(v.verify(Some(&bearer(&fresh))), Err(CredentialFailure::Malformed));
        assert_eq!(v.verify(Some(&bearer(&stale))), Err(CredentialFailure::Malformed));
    }

    #[test]
    fn test_expired_is_never_invalid() {
        let v = verifier("secret");
        let token = v.sign(&claim(NOW - 7200, NOW - 3600)).unwrap();
        assert_eq!(v.verify(Some(&bearer(&token))), Err(CredentialFailure::Expired));
    }

    #[test]
    fn test_clock_skew_tolerance() {
        let mut s = settings("secret");
        s.clock_skew_tolerance_ms = 5_000;
        let v = TokenVerifier::with_time_source(&s, TimeSource::manual(NOW_MS));

        let just_expired = v.sign(&claim(NOW - 600, NOW - 2)).unwrap();
        assert!(v.verify(Some(&bearer(&just_expired))).is_ok());

        let long_expired = v.sign(&claim(NOW - 600, NOW - 60)).unwrap();
        assert_eq!(v.verify(Some(&bearer(&long_expired))), Err(CredentialFailure::Expired));
    }

    #[test]
    fn test_expiry_before_issue_is_malformed() {
        let v = verifier("secret");
        let token = v.sign(&claim(NOW + 100, NOW + 50)).unwrap();
        assert_eq!(v.verify(Some(&bearer(&token))), Err(CredentialFailure::Malformed));
    }

    #[test]
    fn test_algorithm_mismatch_is_malformed() {
        let mut s = settings("secret");
        s.algorithm = Algorithm::HS512;
        let hs512 = TokenVerifier::with_time_source(&s, TimeSource::manual(NOW_MS));
        let token = hs512.issue("user-1", Role::Standard).unwrap();

        let verified = verifier("secret").verify(Some(&bearer(&token)));
        assert_eq!(verified, Err(CredentialFailure::Malformed));
    }

    #[test]
    fn test_optional_mode_suppresses_failures() {
        let v = verifier("secret");
        let expired = v.sign(&claim(NOW - 7200, NOW - 3600)).unwrap();
        let valid = v.issue("user-9", Role::Standard).unwrap();

        assert_eq!(v.verify_optional(None), None);
        assert_eq!(v.verify_optional(Some("Bearer junk")), None);
        assert_eq!(v.verify_optional(Some(&bearer(&expired))), None);
        assert_eq!(v.verify_optional(Some(&bearer(&valid))).unwrap().sub, "user-9");
    }

    #[test]
    fn test_role_aliases_and_default() {
        let admin: Claim =
            serde_json::from_str(r#"{"sub":"a","role":"admin","iat":1,"exp":2}"#).unwrap();
        let user: Claim =
            serde_json::from_str(r#"{"sub":"b","role":"user","iat":1,"exp":2}"#).unwrap();
        let bare: Claim = serde_json::from_str(r#"{"sub":"c","iat":1,"exp":2}"#).unwrap();

        assert_eq!(admin.role, Role::Administrator);
        assert_eq!(user.role, Role::Standard);
        assert_eq!(bare.role, Role::Standard);
        assert!(Role::Administrator > Role::Moderator);
    }
}
