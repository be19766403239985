//! Short-lived HS256 bearer tokens for providers that sign requests.

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64_URL;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Pinned signing algorithm. Written into every header explicitly.
pub const TOKEN_ALGORITHM: &str = "HS256";
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("{0} is missing")]
    MissingKey(&'static str),
    #[error("token is malformed: {0}")]
    Malformed(String),
    #[error("token algorithm '{0}' is not {TOKEN_ALGORITHM}")]
    UnsupportedAlgorithm(String),
    #[error("token signature does not match")]
    BadSignature,
    #[error("token is not valid before {not_before}")]
    NotYetValid { not_before: i64 },
    #[error("token expired at {expires_at}")]
    Expired { expires_at: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub iss: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedToken {
    pub token: String,
    pub claims: TokenClaims,
}

#[derive(Clone)]
pub struct TokenIssuer {
    access_key: String,
    secret_key: String,
    ttl: Duration,
    skew: Duration,
}

impl TokenIssuer {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into().trim().to_string(),
            secret_key: secret_key.into().trim().to_string(),
            ttl: DEFAULT_TOKEN_TTL,
            skew: DEFAULT_CLOCK_SKEW,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_skew(mut self, skew: Duration) -> Self {
        self.skew = skew;
        self
    }

    /// Issues a token for one request. Callers must not cache the result.
    pub fn issue(&self) -> Result<SignedToken, TokenError> {
        self.issue_at(Utc::now())
    }

    pub fn issue_at(&self, now: DateTime<Utc>) -> Result<SignedToken, TokenError> {
        if self.access_key.is_empty() {
            return Err(TokenError::MissingKey("access key"));
        }
        if self.secret_key.is_empty() {
            return Err(TokenError::MissingKey("secret key"));
        }
        let iat = now.timestamp();
        let claims = TokenClaims {
            iss: self.access_key.clone(),
            iat,
            nbf: iat - self.skew.as_secs() as i64,
            exp: iat + self.ttl.as_secs() as i64,
        };
        let header = json!({ "alg": TOKEN_ALGORITHM, "typ": "JWT" });
        let claims_json = serde_json::to_vec(&claims)
            .map_err(|err| TokenError::Malformed(format!("claims encode failed: {err}")))?;
        let signing_input = format!(
            "{}.{}",
            BASE64_URL.encode(header.to_string()),
            BASE64_URL.encode(claims_json)
        );
        let signature = sign(&self.secret_key, &signing_input)?;
        Ok(SignedToken {
            token: format!("{signing_input}.{}", BASE64_URL.encode(signature)),
            claims,
        })
    }
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("access_key", &self.access_key)
            .field("ttl", &self.ttl)
            .field("skew", &self.skew)
            .finish_non_exhaustive()
    }
}

/// Checks signature, pinned algorithm, and `nbf <= at <= exp`.
pub fn verify_at(token: &str, secret_key: &str, at: DateTime<Utc>) -> Result<TokenClaims, TokenError> {
    let secret_key = secret_key.trim();
    if secret_key.is_empty() {
        return Err(TokenError::MissingKey("secret key"));
    }
    let mut segments = token.split('.');
    let (Some(header_b64), Some(claims_b64), Some(signature_b64), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(TokenError::Malformed("expected three segments".to_string()));
    };

    let header: Value = decode_segment(header_b64)?;
    let algorithm = header.get("alg").and_then(Value::as_str).unwrap_or_default();
    if algorithm != TOKEN_ALGORITHM {
        return Err(TokenError::UnsupportedAlgorithm(algorithm.to_string()));
    }

    let signature = BASE64_URL
        .decode(signature_b64)
        .map_err(|err| TokenError::Malformed(format!("signature: {err}")))?;
    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .map_err(|err| TokenError::Malformed(format!("secret key: {err}")))?;
    mac.update(format!("{header_b64}.{claims_b64}").as_bytes());
    mac.verify_slice(&signature)
        .map_err(|_| TokenError::BadSignature)?;

    let claims: TokenClaims = decode_segment(claims_b64)?;
    let at = at.timestamp();
    if at < claims.nbf {
        return Err(TokenError::NotYetValid {
            not_before: claims.nbf,
        });
    }
    if at > claims.exp {
        return Err(TokenError::Expired {
            expires_at: claims.exp,
        });
    }
    Ok(claims)
}

fn sign(secret_key: &str, signing_input: &str) -> Result<Vec<u8>, TokenError> {
    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .map_err(|err| TokenError::Malformed(format!("secret key: {err}")))?;
    mac.update(signing_input.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

fn decode_segment<T: serde::de::DeserializeOwned>(segment: &str) -> Result<T, TokenError> {
    let bytes = BASE64_URL
        .decode(segment)
        .map_err(|err| TokenError::Malformed(format!("base64: {err}")))?;
    serde_json::from_slice(&bytes).map_err(|err| TokenError::Malformed(format!("json: {err}")))
}
