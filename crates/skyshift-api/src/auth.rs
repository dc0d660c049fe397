//! Tokens and credentials
//!
//! Session and invite tokens are HS512 JWTs signed with the server's
//! current key; tokens remain valid within their own `exp` across key
//! rotations because previous keys are kept for verification until
//! their tokens can no longer be live. Passwords are stored as salted
//! PBKDF2-HMAC-SHA256 hashes. Invite revocation works on the SHA-256
//! hash of the token, never the token itself.

use std::num::NonZeroU32;
use std::time::Duration;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use skyshift_common::{Error, Result};

use crate::error::ApiError;
use crate::server::AppState;

const PBKDF2_ITERATIONS: u32 = 100_000;
const PBKDF2_OUTPUT_LEN: usize = 32;

/// Claims of a session token
#[derive(Debug, Deserialize, Serialize)]
pub struct SessionClaims {
    /// Username
    pub sub: String,
    /// Issued-at, seconds since the epoch
    pub iat: i64,
    /// Expiry, seconds since the epoch
    pub exp: i64,
}

/// Claims of an invite token
#[derive(Debug, Deserialize, Serialize)]
pub struct InviteClaims {
    /// Random invite id
    pub sub: String,
    /// Username of the issuer
    pub iss: String,
    /// Roles granted on registration
    #[serde(default)]
    pub roles: Vec<String>,
    /// Expiry, seconds since the epoch
    pub exp: i64,
}

/// Signing configuration for session and invite tokens
pub struct AuthConfig {
    signing_key: Vec<u8>,
    /// Previous keys kept for verification across rotations
    previous_keys: Vec<Vec<u8>>,
    session_ttl: Duration,
    invite_ttl: Duration,
}

impl AuthConfig {
    /// Create a config around an existing secret
    pub fn new(signing_key: Vec<u8>, session_ttl: Duration) -> Self {
        Self {
            signing_key,
            previous_keys: Vec::new(),
            session_ttl,
            invite_ttl: Duration::from_secs(24 * 3600),
        }
    }

    /// Create a config with a freshly generated random key
    pub fn generate(session_ttl: Duration) -> Result<Self> {
        let mut key = vec![0u8; 64];
        aws_lc_rs::rand::fill(&mut key)
            .map_err(|_| Error::fatal("auth", "random key generation failed"))?;
        Ok(Self::new(key, session_ttl))
    }

    /// Rotate the signing key; tokens signed with the old key remain
    /// verifiable until their own expiry.
    pub fn rotate(&mut self) -> Result<()> {
        let mut key = vec![0u8; 64];
        aws_lc_rs::rand::fill(&mut key)
            .map_err(|_| Error::fatal("auth", "random key generation failed"))?;
        let old = std::mem::replace(&mut self.signing_key, key);
        self.previous_keys.push(old);
        Ok(())
    }

    fn validation() -> Validation {
        let mut validation = Validation::new(Algorithm::HS512);
        validation.validate_exp = true;
        validation.required_spec_claims.clear();
        validation
    }

    fn decode_with_any_key<C: serde::de::DeserializeOwned>(&self, token: &str) -> Result<C> {
        let validation = Self::validation();
        let mut keys = vec![&self.signing_key];
        keys.extend(self.previous_keys.iter());
        for key in keys {
            if let Ok(data) = decode::<C>(token, &DecodingKey::from_secret(key), &validation) {
                return Ok(data.claims);
            }
        }
        Err(Error::unauthorized("could not validate credentials"))
    }

    /// Issue a session token for `username`
    pub fn create_session_token(&self, username: &str) -> Result<String> {
        let now = chrono::Utc::now().timestamp();
        let claims = SessionClaims {
            sub: username.to_string(),
            iat: now,
            exp: now + self.session_ttl.as_secs() as i64,
        };
        encode(
            &Header::new(Algorithm::HS512),
            &claims,
            &EncodingKey::from_secret(&self.signing_key),
        )
        .map_err(|e| Error::fatal("auth", e.to_string()))
    }

    /// Verify a session token, returning the username
    pub fn verify_session_token(&self, token: &str) -> Result<String> {
        let claims: SessionClaims = self.decode_with_any_key(token)?;
        Ok(claims.sub)
    }

    /// Issue an invite token granting `roles`
    pub fn create_invite_token(&self, issuer: &str, roles: Vec<String>) -> Result<String> {
        let mut id = [0u8; 16];
        aws_lc_rs::rand::fill(&mut id)
            .map_err(|_| Error::fatal("auth", "random invite id generation failed"))?;
        let claims = InviteClaims {
            sub: URL_SAFE_NO_PAD.encode(id),
            iss: issuer.to_string(),
            roles,
            exp: chrono::Utc::now().timestamp() + self.invite_ttl.as_secs() as i64,
        };
        encode(
            &Header::new(Algorithm::HS512),
            &claims,
            &EncodingKey::from_secret(&self.signing_key),
        )
        .map_err(|e| Error::fatal("auth", e.to_string()))
    }

    /// Verify an invite token's signature and expiry
    pub fn verify_invite_token(&self, token: &str) -> Result<InviteClaims> {
        self.decode_with_any_key(token)
    }
}

/// SHA-256 hash of a token, URL-safe encoded. The store keys invites by
/// this hash so a leaked store never leaks usable tokens.
pub fn token_hash(token: &str) -> String {
    let digest = aws_lc_rs::digest::digest(&aws_lc_rs::digest::SHA256, token.as_bytes());
    URL_SAFE_NO_PAD.encode(digest.as_ref())
}

/// Hash a password with a fresh random salt.
///
/// Format: `pbkdf2-sha256$<iterations>$<salt>$<hash>`.
pub fn hash_password(password: &str) -> Result<String> {
    let mut salt = [0u8; 16];
    aws_lc_rs::rand::fill(&mut salt)
        .map_err(|_| Error::fatal("auth", "random salt generation failed"))?;
    let mut out = [0u8; PBKDF2_OUTPUT_LEN];
    aws_lc_rs::pbkdf2::derive(
        aws_lc_rs::pbkdf2::PBKDF2_HMAC_SHA256,
        NonZeroU32::new(PBKDF2_ITERATIONS).expect("nonzero iterations"),
        &salt,
        password.as_bytes(),
        &mut out,
    );
    Ok(format!(
        "pbkdf2-sha256${PBKDF2_ITERATIONS}${}${}",
        URL_SAFE_NO_PAD.encode(salt),
        URL_SAFE_NO_PAD.encode(out)
    ))
}

/// Verify a password against a stored hash
pub fn verify_password(password: &str, stored: &str) -> bool {
    let mut parts = stored.split('$');
    let (Some(scheme), Some(iterations), Some(salt), Some(hash)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    if scheme != "pbkdf2-sha256" {
        return false;
    }
    let Ok(iterations) = iterations.parse::<u32>() else {
        return false;
    };
    let Some(iterations) = NonZeroU32::new(iterations) else {
        return false;
    };
    let (Ok(salt), Ok(hash)) = (URL_SAFE_NO_PAD.decode(salt), URL_SAFE_NO_PAD.decode(hash))
    else {
        return false;
    };
    aws_lc_rs::pbkdf2::verify(
        aws_lc_rs::pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        &salt,
        password.as_bytes(),
        &hash,
    )
    .is_ok()
}

/// Shared, rotating handle over [`AuthConfig`]
#[derive(Clone)]
pub struct AuthHandle {
    inner: std::sync::Arc<std::sync::RwLock<AuthConfig>>,
}

impl AuthHandle {
    /// Wrap a config for shared use
    pub fn new(config: AuthConfig) -> Self {
        Self {
            inner: std::sync::Arc::new(std::sync::RwLock::new(config)),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, AuthConfig> {
        self.inner.read().expect("auth lock poisoned")
    }

    /// Issue a session token for `username`
    pub fn create_session_token(&self, username: &str) -> Result<String> {
        self.read().create_session_token(username)
    }

    /// Verify a session token, returning the username
    pub fn verify_session_token(&self, token: &str) -> Result<String> {
        self.read().verify_session_token(token)
    }

    /// Issue an invite token granting `roles`
    pub fn create_invite_token(&self, issuer: &str, roles: Vec<String>) -> Result<String> {
        self.read().create_invite_token(issuer, roles)
    }

    /// Verify an invite token's signature and expiry
    pub fn verify_invite_token(&self, token: &str) -> Result<InviteClaims> {
        self.read().verify_invite_token(token)
    }

    /// Rotate the signing key
    pub fn rotate(&self) -> Result<()> {
        self.inner.write().expect("auth lock poisoned").rotate()
    }

    /// Rotate the signing key every `ttl` until cancelled
    pub fn spawn_rotation(
        &self,
        ttl: Duration,
        cancel: tokio_util::sync::CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let handle = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(ttl);
            interval.tick().await; // the first tick fires immediately
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = interval.tick() => {
                        if let Err(err) = handle.rotate() {
                            tracing::error!(error = %err, "signing key rotation failed");
                        } else {
                            tracing::info!("rotated token signing key");
                        }
                    }
                }
            }
        })
    }
}

/// The authenticated caller, extracted from the bearer token
#[derive(Clone, Debug)]
pub struct AuthUser {
    /// Verified username
    pub username: String,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> std::result::Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| ApiError(Error::unauthorized("missing bearer token")))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| ApiError(Error::unauthorized("malformed authorization header")))?;
        let username = state.auth.verify_session_token(token)?;
        Ok(AuthUser { username })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AuthConfig {
        AuthConfig::new(b"test-signing-key".to_vec(), Duration::from_secs(3600))
    }

    #[test]
    fn test_session_token_round_trip() {
        let config = config();
        let token = config.create_session_token("alice").unwrap();
        assert_eq!(config.verify_session_token(&token).unwrap(), "alice");
    }

    #[test]
    fn test_session_token_rejects_wrong_key() {
        let token = config().create_session_token("alice").unwrap();
        let other = AuthConfig::new(b"other-key".to_vec(), Duration::from_secs(3600));
        assert!(other.verify_session_token(&token).is_err());
    }

    #[test]
    fn test_tokens_survive_key_rotation() {
        let mut config = config();
        let token = config.create_session_token("alice").unwrap();
        config.rotate().unwrap();
        // Old tokens verify against the retained key...
        assert_eq!(config.verify_session_token(&token).unwrap(), "alice");
        // ...and new tokens use the fresh key.
        let fresh = config.create_session_token("bob").unwrap();
        assert_eq!(config.verify_session_token(&fresh).unwrap(), "bob");
    }

    #[test]
    fn test_invite_round_trip() {
        let config = config();
        let token = config
            .create_invite_token("admin", vec!["reader-role".to_string()])
            .unwrap();
        let claims = config.verify_invite_token(&token).unwrap();
        assert_eq!(claims.iss, "admin");
        assert_eq!(claims.roles, vec!["reader-role"]);
        assert!(!claims.sub.is_empty());
    }

    #[test]
    fn test_password_hashing() {
        let stored = hash_password("hunter22").unwrap();
        assert!(stored.starts_with("pbkdf2-sha256$"));
        assert!(verify_password("hunter22", &stored));
        assert!(!verify_password("hunter23", &stored));
        // Same password twice gets distinct salts.
        let again = hash_password("hunter22").unwrap();
        assert_ne!(stored, again);
    }

    #[test]
    fn test_verify_password_rejects_malformed_hash() {
        assert!(!verify_password("x", "not-a-hash"));
        assert!(!verify_password("x", "pbkdf2-sha256$zero$salt$hash"));
    }

    #[test]
    fn test_token_hash_is_stable_and_urlsafe() {
        let h1 = token_hash("some-token");
        let h2 = token_hash("some-token");
        assert_eq!(h1, h2);
        assert!(!h1.contains('/') && !h1.contains('+'));
        assert_ne!(h1, token_hash("other-token"));
    }
}
