//! HS256 JSON Web Tokens.
//!
//! Tokens are `base64url(header) . base64url(claims) . base64url(hmac)` where
//! the MAC is HMAC-SHA256 over the first two segments keyed by a shared
//! secret. Only `HS256` is accepted on verification.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "HS256";

/// Reasons a token failed verification.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token must have three dot-separated segments")]
    Malformed,

    #[error("token segment is not valid base64url: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("token segment is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported token algorithm {0:?}")]
    UnsupportedAlgorithm(String),

    #[error("token signature does not match")]
    BadSignature,

    #[error("token expired")]
    Expired,

    #[error("token not yet valid")]
    NotYetValid,

    #[error("signing key rejected")]
    InvalidKey,
}

/// The decoded claim set of a token.
///
/// Arbitrary JSON members are kept as-is; `exp`, `nbf` and `iat` are read as
/// seconds since the Unix epoch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Claims(Map<String, Value>);

impl Claims {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn expires_at(&self) -> Option<u64> {
        self.0.get("exp").and_then(Value::as_u64)
    }

    pub fn not_before(&self) -> Option<u64> {
        self.0.get("nbf").and_then(Value::as_u64)
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

#[derive(Serialize, Deserialize)]
struct Header {
    alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    typ: Option<String>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn mac(secret: &[u8]) -> Result<HmacSha256, TokenError> {
    HmacSha256::new_from_slice(secret).map_err(|_| TokenError::InvalidKey)
}

/// Issues a token for `claims`, stamping `iat` and, when `ttl` is given, `exp`.
pub fn sign(claims: &Claims, secret: &[u8], ttl: Option<Duration>) -> Result<String, TokenError> {
    sign_at(claims, secret, ttl, now_secs())
}

fn sign_at(claims: &Claims, secret: &[u8], ttl: Option<Duration>, now: u64) -> Result<String, TokenError> {
    let mut claims = claims.clone().with("iat", now);
    if let Some(ttl) = ttl {
        claims = claims.with("exp", now.saturating_add(ttl.as_secs()));
    }

    let header = Header {
        alg: ALGORITHM.to_owned(),
        typ: Some("JWT".to_owned()),
    };
    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?),
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?)
    );

    let mut mac = mac(secret)?;
    mac.update(signing_input.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    Ok(format!("{signing_input}.{signature}"))
}

/// Verifies `token` against `secret` and returns its claims.
///
/// Checks, in order: shape, header algorithm, signature (constant time),
/// then `exp` and `nbf` against the current time. A token without `exp`
/// never expires.
pub fn verify(token: &str, secret: &[u8]) -> Result<Claims, TokenError> {
    verify_at(token, secret, now_secs())
}

fn verify_at(token: &str, secret: &[u8], now: u64) -> Result<Claims, TokenError> {
    let mut parts = token.split('.');
    let (Some(header_b64), Some(claims_b64), Some(signature_b64), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(TokenError::Malformed);
    };

    let header: Header = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(header_b64)?)?;
    if header.alg != ALGORITHM {
        return Err(TokenError::UnsupportedAlgorithm(header.alg));
    }

    let signature = URL_SAFE_NO_PAD.decode(signature_b64)?;
    let mut mac = mac(secret)?;
    mac.update(header_b64.as_bytes());
    mac.update(b".");
    mac.update(claims_b64.as_bytes());
    mac.verify_slice(&signature)
        .map_err(|_| TokenError::BadSignature)?;

    let claims: Claims = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(claims_b64)?)?;
    if claims.expires_at().is_some_and(|exp| now >= exp) {
        return Err(TokenError::Expired);
    }
    if claims.not_before().is_some_and(|nbf| now < nbf) {
        return Err(TokenError::NotYetValid);
    }
    Ok(claims)
}
