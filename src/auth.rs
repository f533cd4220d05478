//! Bearer-token verification shared by the trigger API and the session gateway.
//!
//! Tokens are issued by the portal and carry the caller's identity claims:
//!
//! ```text
//! base64url(claims_json) "." base64url(HMAC-SHA256(secret, base64url(claims_json)))
//! ```
//!
//! The verifier is a trait so that deployments can plug in whatever the rest
//! of the portal uses; [`HmacTokenVerifier`] is the built-in implementation.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::Next;
use axum::response::Response;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::AuthError;

type HmacSha256 = Hmac<Sha256>;

/// Identity claims carried by a verified token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Portal user id.
    pub sub: i64,
    #[serde(default)]
    pub role: String,
    /// Expiry as a unix timestamp (seconds).
    pub exp: i64,
}

impl Claims {
    pub fn new(user_id: i64, role: impl Into<String>, ttl: std::time::Duration) -> Self {
        Self {
            sub: user_id,
            role: role.into(),
            exp: Utc::now()
                .timestamp()
                .saturating_add(i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX)),
        }
    }

    pub fn user_id(&self) -> i64 {
        self.sub
    }

    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }
}

/// Validates bearer tokens and returns their identity claims.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Claims, AuthError>;
}

/// HMAC-SHA256 signed tokens.
pub struct HmacTokenVerifier {
    secret: SecretString,
}

impl HmacTokenVerifier {
    pub fn new(secret: SecretString) -> Self {
        Self { secret }
    }

    fn mac(&self) -> Result<HmacSha256, AuthError> {
        HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .map_err(|_| AuthError::InvalidToken)
    }

    /// Sign a set of claims. Used by tooling and tests; the portal normally
    /// issues tokens itself.
    pub fn issue(&self, claims: &Claims) -> Result<String, AuthError> {
        let json = serde_json::to_vec(claims).map_err(|_| AuthError::InvalidToken)?;
        let payload = URL_SAFE_NO_PAD.encode(json);
        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        Ok(format!("{payload}.{signature}"))
    }
}

impl TokenVerifier for HmacTokenVerifier {
    fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let (payload, signature) = token.trim().split_once('.').ok_or(AuthError::InvalidToken)?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| AuthError::InvalidToken)?;

        // verify_slice compares in constant time.
        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| AuthError::InvalidToken)?;

        let json = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| AuthError::InvalidToken)?;
        let claims: Claims = serde_json::from_slice(&json).map_err(|_| AuthError::InvalidToken)?;

        if claims.exp <= Utc::now().timestamp() {
            return Err(AuthError::Expired);
        }
        Ok(claims)
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Route layer that rejects requests without a valid bearer token and
/// attaches the verified [`Claims`] as a request extension.
pub async fn bearer_auth_middleware(
    State(verifier): State<Arc<dyn TokenVerifier>>,
    mut request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = bearer_token(request.headers()).ok_or(StatusCode::UNAUTHORIZED)?;
    let claims = verifier.verify(token).map_err(|e| {
        tracing::debug!(error = %e, "Rejected bearer token");
        StatusCode::UNAUTHORIZED
    })?;
    request.extensions_mut().insert(claims);
    Ok(next.run(request).await)
}
