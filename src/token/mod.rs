//! Signed, bounded-lifetime credentials.
//!
//! Tokens are HS256 JWTs over the poster identity (`username`, `userId`,
//! `name`) plus `iat`/`exp`. The signing key is the raw bytes of whichever
//! secret the issuance mode selected.

use anyhow::{Context, Result};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::source::RawMessage;

/// Identity claims carried inside an issued token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub username: String,
    #[serde(rename = "userId")]
    pub user_id: Option<u64>,
    pub name: String,
}

impl From<&RawMessage> for Claims {
    fn from(message: &RawMessage) -> Self {
        Self {
            username: message.poster_handle.clone(),
            user_id: message.poster_id,
            name: message.display_name.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SignedClaims {
    #[serde(flatten)]
    identity: Claims,
    iat: i64,
    exp: i64,
}

/// Why a token failed verification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationError {
    #[error("token has expired")]
    Expired,
    #[error("token signature does not match the secret")]
    BadSignature,
    #[error("token is malformed: {0}")]
    Malformed(String),
}

impl VerificationError {
    /// Stable machine-readable tag for wire responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::BadSignature => "bad_signature",
            Self::Malformed(_) => "malformed",
        }
    }
}

/// A minted token together with the identity it was bound to.
///
/// Field names on the wire follow what realtime clients already consume
/// (`token`, `to`, `userId`, `username`, `name`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedToken {
    #[serde(rename = "token")]
    pub signed_value: String,
    #[serde(rename = "to")]
    pub correlation_id: String,
    #[serde(rename = "userId")]
    pub poster_id: Option<u64>,
    #[serde(rename = "username")]
    pub poster_handle: String,
    #[serde(rename = "name")]
    pub display_name: String,
    #[serde(rename = "expiresIn")]
    pub expires_in_seconds: u64,
}

/// Sign `claims` with `secret`, expiring `ttl` from now.
pub fn mint(claims: &Claims, secret: &str, ttl: Duration) -> Result<String> {
    mint_at(claims, secret, ttl, chrono::Utc::now().timestamp())
}

/// Sign `claims` as if issued at `issued_at` (unix seconds).
pub fn mint_at(claims: &Claims, secret: &str, ttl: Duration, issued_at: i64) -> Result<String> {
    let ttl_secs = i64::try_from(ttl.as_secs()).context("token lifetime out of range")?;
    let payload = SignedClaims {
        identity: claims.clone(),
        iat: issued_at,
        exp: issued_at.saturating_add(ttl_secs),
    };
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &payload,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .context("Failed to sign token")
}

/// Check signature and expiry of `token` against `secret`.
pub fn verify(token: &str, secret: &str) -> Result<Claims, VerificationError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;
    validation.set_required_spec_claims(&["exp"]);

    jsonwebtoken::decode::<SignedClaims>(
        token.trim(),
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims.identity)
    .map_err(|e| match e.kind() {
        ErrorKind::ExpiredSignature => VerificationError::Expired,
        ErrorKind::InvalidSignature => VerificationError::BadSignature,
        _ => VerificationError::Malformed(e.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims() -> Claims {
        Claims {
            username: "jdoe".into(),
            user_id: Some(42),
            name: "Jane Doe".into(),
        }
    }

    #[test]
    fn verify_returns_minted_claims_before_expiry() {
        let token = mint(&claims(), "secret-a", Duration::from_secs(300)).unwrap();
        assert_eq!(verify(&token, "secret-a").unwrap(), claims());
    }

    #[test]
    fn verify_reports_expired_after_ttl() {
        let issued_at = chrono::Utc::now().timestamp() - 600;
        let token = mint_at(&claims(), "secret-a", Duration::from_secs(300), issued_at).unwrap();
        assert_eq!(verify(&token, "secret-a"), Err(VerificationError::Expired));
    }

    #[test]
    fn verify_reports_bad_signature_for_other_secret() {
        let token = mint(&claims(), "secret-a", Duration::from_secs(300)).unwrap();
        assert_eq!(
            verify(&token, "secret-b"),
            Err(VerificationError::BadSignature)
        );
    }

    #[test]
    fn bad_signature_wins_over_expiry() {
        let issued_at = chrono::Utc::now().timestamp() - 600;
        let token = mint_at(&claims(), "secret-a", Duration::from_secs(1), issued_at).unwrap();
        assert_eq!(
            verify(&token, "secret-b"),
            Err(VerificationError::BadSignature)
        );
    }

    #[test]
    fn garbage_is_malformed() {
        for input in ["", "not-a-token", "a.b.c"] {
            let err = verify(input, "secret-a").unwrap_err();
            assert_eq!(err.kind(), "malformed", "input {input:?}");
        }
    }

    #[test]
    fn anonymous_poster_round_trips_without_user_id() {
        let anonymous = Claims {
            user_id: None,
            ..claims()
        };
        let token = mint(&anonymous, "secret-a", Duration::from_secs(60)).unwrap();
        assert_eq!(verify(&token, "secret-a").unwrap().user_id, None);
    }

    #[test]
    fn issued_token_uses_client_field_names() {
        let issued = IssuedToken {
            signed_value: "t".into(),
            correlation_id: "abc".into(),
            poster_id: Some(7),
            poster_handle: "jdoe".into(),
            display_name: "Jane".into(),
            expires_in_seconds: 300,
        };
        let json = serde_json::to_value(&issued).unwrap();
        assert_eq!(json["token"], "t");
        assert_eq!(json["to"], "abc");
        assert_eq!(json["userId"], 7);
        assert_eq!(json["username"], "jdoe");
        assert_eq!(json["expiresIn"], 300);
    }
}
